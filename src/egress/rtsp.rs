//! RTSP play egress (spec §4.4.2): DESCRIBE/SETUP/PLAY over the same
//! `rtsp::Handler` control-connection mechanics `ingest::rtsp` uses for
//! ANNOUNCE/SETUP/RECORD, with TCP-interleaved or UDP unicast media
//! transport back out to the player.
//!
//! The DESCRIBE SDP is synthesised directly from the channel's
//! `CodecCatalog` (the teacher has no SDP-offer-building code to draw on for
//! a non-WebRTC answer; `libs/rtsp` only ever serves whatever SDP bytes the
//! publisher's own ANNOUNCE supplied, via `Handler::set_sdp`/`handle_describe`).
//! Per-track RTP packetisation reuses `bridge::rtp_h264`/`bridge::rtp_h265`/
//! `bridge::aac`, the same packetisers `ingest::webrtc` uses for the reverse
//! direction.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use rtsp_types::{headers, Method, Request, Response, StatusCode, Version};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tracing::{info, warn};
use webrtc::rtp::header::Header as RtpHeader;
use webrtc::rtp::packet::Packet as RtpPacket;
use webrtc::util::Marshal;

use crate::bridge::{aac, rtp_h264, rtp_h265};
use crate::ingest::rtsp::extract_path;
use crate::packet::{CodecCatalog, CodecDescriptor, Packet};
use crate::queue::{Cursor, ReadOutcome};
use crate::registry::{Channel, Registry};
use crate::rtsp_wire::{self, Frame, RtspReader, RtspWriter};

const PT_H264: u8 = 96;
const PT_H265: u8 = 98;
const PT_AAC: u8 = 97;
const PT_OPUS: u8 = 111;
const PT_PCMU: u8 = 0;
const PT_PCMA: u8 = 8;

enum EgressKind {
    H264,
    H265,
    Aac,
    Raw,
}

enum TrackTransport {
    Tcp { rtp_channel: u8 },
    Udp { socket: UdpSocket, dest: SocketAddr },
}

struct EgressTrack {
    stream_index: u8,
    kind: EgressKind,
    payload_type: u8,
    clock_rate: u32,
    control: String,
    ssrc: u32,
    next_seq: u16,
    transport: Option<TrackTransport>,
}

#[derive(Default)]
struct EgressSession {
    path: Option<String>,
    channel: Option<Arc<Channel>>,
    tracks: Vec<EgressTrack>,
    subscribed: bool,
    playback_task: Option<tokio::task::JoinHandle<()>>,
}

/// Handles one accepted RTSP TCP connection end to end, reading the first
/// request itself. Only correct for a connection already known to be a play
/// session; the shared listener uses [`handle_connection_with_first`].
pub async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, registry: Arc<Registry>) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = RtspReader::new(read_half);
    let mut writer = RtspWriter::new(write_half);
    let first = loop {
        match reader.read_frame().await {
            Ok(Frame::Rtsp(request)) => break request,
            Ok(Frame::Interleaved { .. }) => continue,
            Err(e) => {
                warn!(%peer_addr, error = %e, "rtsp egress session ended before first request");
                return;
            }
        }
    };
    if let Err(e) = run(reader, writer, peer_addr, registry, first).await {
        warn!(%peer_addr, error = %e, "rtsp egress session ended");
    }
}

/// Same as [`handle_connection`], for a connection whose first request (a
/// DESCRIBE, per [`crate::rtsp_wire::sniff_role`]) has already been read off
/// an already-split reader/writer pair.
pub async fn handle_connection_with_first(
    reader: RtspReader,
    writer: RtspWriter,
    peer_addr: SocketAddr,
    registry: Arc<Registry>,
    first: Request<Vec<u8>>,
) {
    if let Err(e) = run(reader, writer, peer_addr, registry, first).await {
        warn!(%peer_addr, error = %e, "rtsp egress session ended");
    }
}

async fn run(
    mut reader: RtspReader,
    writer: RtspWriter,
    peer_addr: SocketAddr,
    registry: Arc<Registry>,
    first: Request<Vec<u8>>,
) -> anyhow::Result<()> {
    let mut handler = rtsp::Handler::new(
        peer_addr,
        Arc::new(tokio::sync::RwLock::new(HashMap::new())),
        rtsp::ServerConfig::default(),
    );
    let mut session = EgressSession::default();
    let writer = Arc::new(Mutex::new(writer));

    handler.update_cseq(&first);
    let outcome = match handle_request(&first, &mut handler, &mut session, &registry, peer_addr, &writer).await {
        Ok(true) => loop {
            match reader.read_frame().await {
                Ok(Frame::Rtsp(request)) => {
                    handler.update_cseq(&request);
                    match handle_request(&request, &mut handler, &mut session, &registry, peer_addr, &writer).await {
                        Ok(true) => continue,
                        Ok(false) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
                Ok(Frame::Interleaved { .. }) => continue,
                Err(e) => break Err(e),
            }
        },
        Ok(false) => Ok(()),
        Err(e) => Err(e),
    };

    if let Some(task) = session.playback_task.take() {
        task.abort();
    }
    if session.subscribed {
        if let Some(channel) = &session.channel {
            channel.unsubscribe();
        }
    }
    outcome
}

async fn handle_request(
    request: &Request<Vec<u8>>,
    handler: &mut rtsp::Handler,
    session: &mut EgressSession,
    registry: &Arc<Registry>,
    peer_addr: SocketAddr,
    writer: &Arc<Mutex<RtspWriter>>,
) -> anyhow::Result<bool> {
    match request.method() {
        Method::Options => {
            let response = handler.handle_options(request).await?;
            writer.lock().await.send_response(&response).await?;
        }
        Method::Describe => {
            let path = extract_path(request);
            let Some(channel) = registry.get(&path).await else {
                writer.lock().await.send_response(&simple_response(handler, StatusCode::NotFound)).await?;
                return Ok(true);
            };
            let Some(catalog) = channel.streams().await else {
                writer.lock().await.send_response(&simple_response(handler, StatusCode::NotFound)).await?;
                return Ok(true);
            };
            handler.set_sdp(build_sdp(&catalog));
            info!(path, remote_addr = %peer_addr, "rtsp describe accepted");
            session.path = Some(path);
            session.tracks = build_tracks(&catalog);
            session.channel = Some(channel);
            let response = handler.handle_describe(request).await?;
            writer.lock().await.send_response(&response).await?;
        }
        Method::Setup => {
            let Some(transport_header) = request.header(&headers::TRANSPORT) else {
                writer.lock().await.send_response(&simple_response(handler, StatusCode::BadRequest)).await?;
                return Ok(true);
            };
            let transport = transport_header.as_str().to_string();
            let uri_tail = request.request_uri().map(|u| u.to_string()).unwrap_or_default();
            let Some(track_index) = match_track(&session.tracks, &uri_tail) else {
                writer.lock().await.send_response(&simple_response(handler, StatusCode::NotFound)).await?;
                return Ok(true);
            };
            if rtsp_wire::is_tcp_transport(&transport) {
                let (response, rtp_channel, _rtcp_channel) = handler.handle_setup_tcp(&transport).await?;
                session.tracks[track_index].transport = Some(TrackTransport::Tcp { rtp_channel });
                writer.lock().await.send_response(&response).await?;
            } else {
                let (response, client_rtp, _client_rtcp, _server_rtp, _server_rtcp) =
                    handler.handle_setup_udp(&transport).await?;
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                let dest = SocketAddr::new(peer_addr.ip(), client_rtp);
                session.tracks[track_index].transport = Some(TrackTransport::Udp { socket, dest });
                writer.lock().await.send_response(&response).await?;
            }
        }
        Method::Play => {
            let Some(channel) = session.channel.clone() else {
                writer
                    .lock()
                    .await
                    .send_response(&simple_response(handler, StatusCode::MethodNotValidInThisState))
                    .await?;
                return Ok(true);
            };
            if session.tracks.iter().all(|t| t.transport.is_none()) {
                writer
                    .lock()
                    .await
                    .send_response(&simple_response(handler, StatusCode::MethodNotValidInThisState))
                    .await?;
                return Ok(true);
            }
            let cursor = match channel.subscribe().await {
                Ok(c) => c,
                Err(_) => {
                    writer.lock().await.send_response(&simple_response(handler, StatusCode::NotFound)).await?;
                    return Ok(true);
                }
            };
            session.subscribed = true;
            let response = handler.handle_play(request).await?;
            writer.lock().await.send_response(&response).await?;
            info!(path = ?session.path, "rtsp play started");
            let tracks = std::mem::take(&mut session.tracks);
            session.playback_task = Some(tokio::spawn(pump(cursor, channel, tracks, writer.clone())));
        }
        Method::Pause => {
            writer.lock().await.send_response(&simple_response(handler, StatusCode::Ok)).await?;
        }
        Method::Teardown => {
            let response = handler.handle_teardown(request).await?;
            writer.lock().await.send_response(&response).await?;
            return Ok(false);
        }
        Method::GetParameter => {
            writer.lock().await.send_response(&simple_response(handler, StatusCode::Ok)).await?;
        }
        _ => {
            writer.lock().await.send_response(&simple_response(handler, StatusCode::NotImplemented)).await?;
        }
    }
    Ok(true)
}

async fn pump(mut cursor: Cursor, channel: Arc<Channel>, mut tracks: Vec<EgressTrack>, writer: Arc<Mutex<RtspWriter>>) {
    loop {
        match cursor.read_packet().await {
            ReadOutcome::Packet(packet) => {
                if let Some(track) = tracks.iter_mut().find(|t| t.stream_index == packet.stream_index) {
                    send_track_packet(track, &packet, &writer).await;
                }
            }
            ReadOutcome::EndOfStream => break,
        }
    }
    channel.unsubscribe();
}

async fn send_track_packet(track: &mut EgressTrack, packet: &Packet, writer: &Arc<Mutex<RtspWriter>>) {
    let ts = rtp_timestamp(packet.pts, track.clock_rate);
    let rtp_packets = match track.kind {
        EgressKind::H264 => rtp_h264::packetize(&packet.payload, track.payload_type, track.ssrc, &mut track.next_seq, ts),
        EgressKind::H265 => rtp_h265::packetize(&packet.payload, track.payload_type, track.ssrc, &mut track.next_seq, ts),
        EgressKind::Aac => {
            let p = aac::packetize(&packet.payload, track.payload_type, track.ssrc, track.next_seq, ts);
            track.next_seq = track.next_seq.wrapping_add(1);
            vec![p]
        }
        EgressKind::Raw => {
            let p = make_raw_packet(&packet.payload, track.payload_type, track.ssrc, track.next_seq, ts);
            track.next_seq = track.next_seq.wrapping_add(1);
            vec![p]
        }
    };
    for rtp in &rtp_packets {
        let Ok(bytes) = rtp.marshal() else { continue };
        match &track.transport {
            Some(TrackTransport::Tcp { rtp_channel }) => {
                if writer.lock().await.send_interleaved(*rtp_channel, &bytes).await.is_err() {
                    return;
                }
            }
            Some(TrackTransport::Udp { socket, dest }) => {
                let _ = socket.send_to(&bytes, *dest).await;
            }
            None => {}
        }
    }
}

fn rtp_timestamp(pts: Duration, clock_rate: u32) -> u32 {
    (pts.as_nanos() as u128 * clock_rate as u128 / 1_000_000_000) as u32
}

fn make_raw_packet(payload: &[u8], payload_type: u8, ssrc: u32, seq: u16, timestamp: u32) -> RtpPacket {
    RtpPacket {
        header: RtpHeader {
            version: 2,
            payload_type,
            sequence_number: seq,
            timestamp,
            ssrc,
            marker: true,
            ..Default::default()
        },
        payload: Bytes::copy_from_slice(payload),
    }
}

fn match_track(tracks: &[EgressTrack], uri_tail: &str) -> Option<usize> {
    tracks.iter().position(|t| uri_tail.ends_with(t.control.as_str()))
}

fn simple_response(handler: &rtsp::Handler, status: StatusCode) -> Response<Vec<u8>> {
    Response::builder(Version::V1_0, status)
        .header(headers::CSEQ, handler.cseq().to_string())
        .empty()
        .map_body(|_| vec![])
}

fn build_tracks(catalog: &CodecCatalog) -> Vec<EgressTrack> {
    let mut tracks = Vec::new();
    for (idx, descriptor) in catalog.iter().enumerate() {
        let (kind, payload_type, clock_rate) = match descriptor {
            CodecDescriptor::H264 { .. } => (EgressKind::H264, PT_H264, 90_000),
            CodecDescriptor::H265 { .. } => (EgressKind::H265, PT_H265, 90_000),
            CodecDescriptor::Aac { sample_rate, .. } => (EgressKind::Aac, PT_AAC, *sample_rate),
            CodecDescriptor::Opus { .. } => (EgressKind::Raw, PT_OPUS, 48_000),
            CodecDescriptor::PcmMulaw { sample_rate } => (EgressKind::Raw, PT_PCMU, *sample_rate),
            CodecDescriptor::PcmAlaw { sample_rate } => (EgressKind::Raw, PT_PCMA, *sample_rate),
            _ => continue,
        };
        tracks.push(EgressTrack {
            stream_index: idx as u8,
            kind,
            payload_type,
            clock_rate,
            control: format!("streamid={idx}"),
            ssrc: rand::random(),
            next_seq: rand::random(),
            transport: None,
        });
    }
    tracks
}

/// Synthesises a DESCRIBE answer directly from the channel's `CodecCatalog`
/// (spec §4.4.2). Tracks not eligible for RTSP egress (VP8/VP9/AV1/image
/// codecs) are omitted from the SDP entirely rather than advertised and then
/// rejected at SETUP.
fn build_sdp(catalog: &CodecCatalog) -> Vec<u8> {
    let mut sdp = String::new();
    sdp.push_str("v=0\r\n");
    sdp.push_str("o=- 0 0 IN IP4 0.0.0.0\r\n");
    sdp.push_str("s=relay\r\n");
    sdp.push_str("c=IN IP4 0.0.0.0\r\n");
    sdp.push_str("t=0 0\r\n");
    for (idx, descriptor) in catalog.iter().enumerate() {
        let control = format!("streamid={idx}");
        match descriptor {
            CodecDescriptor::H264 { sps, pps, .. } => {
                sdp.push_str(&format!("m=video 0 RTP/AVP {PT_H264}\r\n"));
                sdp.push_str(&format!("a=rtpmap:{PT_H264} H264/90000\r\n"));
                sdp.push_str(&format!(
                    "a=fmtp:{PT_H264} packetization-mode=1;sprop-parameter-sets={},{}\r\n",
                    STANDARD.encode(sps),
                    STANDARD.encode(pps)
                ));
                sdp.push_str(&format!("a=control:{control}\r\n"));
            }
            CodecDescriptor::H265 { vps, sps, pps, .. } => {
                sdp.push_str(&format!("m=video 0 RTP/AVP {PT_H265}\r\n"));
                sdp.push_str(&format!("a=rtpmap:{PT_H265} H265/90000\r\n"));
                sdp.push_str(&format!(
                    "a=fmtp:{PT_H265} sprop-vps={};sprop-sps={};sprop-pps={}\r\n",
                    STANDARD.encode(vps),
                    STANDARD.encode(sps),
                    STANDARD.encode(pps)
                ));
                sdp.push_str(&format!("a=control:{control}\r\n"));
            }
            CodecDescriptor::Aac { sample_rate, channel_count, config_bytes, .. } => {
                sdp.push_str(&format!("m=audio 0 RTP/AVP {PT_AAC}\r\n"));
                sdp.push_str(&format!("a=rtpmap:{PT_AAC} MPEG4-GENERIC/{sample_rate}/{channel_count}\r\n"));
                let config_hex = config_bytes.iter().map(|b| format!("{b:02x}")).collect::<String>();
                sdp.push_str(&format!(
                    "a=fmtp:{PT_AAC} streamtype=5;profile-level-id=1;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3;config={config_hex}\r\n"
                ));
                sdp.push_str(&format!("a=control:{control}\r\n"));
            }
            CodecDescriptor::Opus { channel_count } => {
                sdp.push_str(&format!("m=audio 0 RTP/AVP {PT_OPUS}\r\n"));
                sdp.push_str(&format!("a=rtpmap:{PT_OPUS} opus/48000/{channel_count}\r\n"));
                sdp.push_str(&format!("a=control:{control}\r\n"));
            }
            CodecDescriptor::PcmMulaw { sample_rate } => {
                sdp.push_str(&format!("m=audio 0 RTP/AVP {PT_PCMU}\r\n"));
                sdp.push_str(&format!("a=rtpmap:{PT_PCMU} PCMU/{sample_rate}\r\n"));
                sdp.push_str(&format!("a=control:{control}\r\n"));
            }
            CodecDescriptor::PcmAlaw { sample_rate } => {
                sdp.push_str(&format!("m=audio 0 RTP/AVP {PT_PCMA}\r\n"));
                sdp.push_str(&format!("a=rtpmap:{PT_PCMA} PCMA/{sample_rate}\r\n"));
                sdp.push_str(&format!("a=control:{control}\r\n"));
            }
            _ => {}
        }
    }
    sdp.into_bytes()
}

/// Used by the supervisor's accept loop to tag each connection's tracing
/// span with its remote address (spec §10.3).
pub fn span(peer: SocketAddr) -> tracing::Span {
    tracing::info_span!("rtsp_egress_session", remote_addr = %peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_sdp_includes_h264_and_aac_tracks() {
        let catalog = vec![
            CodecDescriptor::H264 {
                sps: Bytes::from_static(&[0x67, 0x42]),
                pps: Bytes::from_static(&[0x68, 0xCE]),
                width: 1280,
                height: 720,
                profile: 100,
                level: 31,
            },
            CodecDescriptor::Aac {
                object_type: 2,
                sample_rate: 44100,
                channel_count: 2,
                config_bytes: Bytes::from_static(&[0x12, 0x10]),
            },
        ];
        let sdp = String::from_utf8(build_sdp(&catalog)).unwrap();
        assert!(sdp.contains("m=video 0 RTP/AVP 96"));
        assert!(sdp.contains("a=control:streamid=0"));
        assert!(sdp.contains("m=audio 0 RTP/AVP 97"));
        assert!(sdp.contains("a=control:streamid=1"));
    }

    #[test]
    fn build_tracks_skips_unbridged_codecs() {
        let catalog = vec![CodecDescriptor::Vp8, CodecDescriptor::Opus { channel_count: 2 }];
        let tracks = build_tracks(&catalog);
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].stream_index, 1);
        assert_eq!(tracks[0].control, "streamid=1");
    }

    #[test]
    fn match_track_matches_control_suffix() {
        let tracks = build_tracks(&[CodecDescriptor::Opus { channel_count: 2 }]);
        assert_eq!(match_track(&tracks, "rtsp://host/live/a/streamid=0"), Some(0));
        assert_eq!(match_track(&tracks, "rtsp://host/live/a/streamid=9"), None);
    }
}
