//! RTSP publish ingest (spec §4.3.2): ANNOUNCE/SETUP/RECORD over one TCP
//! control connection, with either TCP-interleaved or UDP unicast media
//! transport.
//!
//! Reuses `rtsp::Handler` (`libs/rtsp/src/server/handler.rs`) for RTSP
//! request/response mechanics — CSeq tracking, session id, SETUP channel/port
//! allocation — and `rtsp::{extract_h264_params, extract_h265_params}` for
//! SDP parameter-set extraction. The wire framing (`crate::rtsp_wire`), the
//! ANNOUNCE-time `CodecCatalog` construction and the per-packet
//! depacketisation into the channel queue have no direct teacher analogue —
//! the library's own session types proxy WHIP/WHEP signalling, they never
//! touch a `Registry`/`PacketQueue` — so this glue is written fresh.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rtsp_types::{headers, Method, Request, Response, StatusCode, Version};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{info, warn};
use webrtc::rtp::packet::Packet as RtpPacket;
use webrtc::util::Unmarshal;

use crate::bridge::rtp_h264::H264Depacketizer;
use crate::bridge::rtp_h265::H265Depacketizer;
use crate::bridge::{aac, h264, h265, split_avcc};
use crate::packet::{CodecCatalog, CodecDescriptor, Packet};
use crate::registry::{Channel, Registry};
use crate::rtsp_wire::{self, Frame, RtspReader, RtspWriter};

struct TrackInfo {
    stream_index: u8,
    control: String,
    clock_rate: u32,
    first_timestamp: Option<u32>,
    state: TrackState,
}

enum TrackState {
    H264 {
        depacketizer: H264Depacketizer,
        sps: Bytes,
        pps: Bytes,
    },
    H265 {
        depacketizer: H265Depacketizer,
        vps: Bytes,
        sps: Bytes,
        pps: Bytes,
    },
    Aac,
    Raw,
}

impl TrackState {
    fn is_video(&self) -> bool {
        matches!(self, TrackState::H264 { .. } | TrackState::H265 { .. })
    }
}

#[derive(Default)]
struct IngestSession {
    path: Option<String>,
    channel: Option<Arc<Channel>>,
    tracks: Vec<TrackInfo>,
    announced: bool,
    channel_to_track: HashMap<u8, usize>,
    setups_done: usize,
}

/// Handles one accepted RTSP TCP connection end to end (spec §4.3.2 terminal
/// states: TEARDOWN, or the peer closing the socket).
///
/// Reads the first request itself, so this entry point is only correct when
/// the caller already knows the connection is a publish session (e.g. a
/// standalone RTSP-ingest-only listener, or tests). The shared listener that
/// fans ANNOUNCE and DESCRIBE to ingest/egress uses
/// [`handle_connection_with_first`] instead, since it has already consumed
/// the first request off the wire to decide which module to call.
pub async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, registry: Arc<Registry>) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = RtspReader::new(read_half);
    let mut writer = RtspWriter::new(write_half);
    let first = loop {
        match reader.read_frame().await {
            Ok(Frame::Rtsp(request)) => break request,
            Ok(Frame::Interleaved { .. }) => continue,
            Err(e) => {
                warn!(%peer_addr, error = %e, "rtsp ingest session ended before first request");
                return;
            }
        }
    };
    if let Err(e) = run(reader, writer, peer_addr, registry, first).await {
        warn!(%peer_addr, error = %e, "rtsp ingest session ended");
    }
}

/// Same as [`handle_connection`], but for a connection whose first request
/// (an ANNOUNCE, per [`crate::rtsp_wire::sniff_role`]) has already been read
/// off an already-split reader/writer pair, so no bytes are re-read or lost.
pub async fn handle_connection_with_first(
    reader: RtspReader,
    writer: RtspWriter,
    peer_addr: SocketAddr,
    registry: Arc<Registry>,
    first: Request<Vec<u8>>,
) {
    if let Err(e) = run(reader, writer, peer_addr, registry, first).await {
        warn!(%peer_addr, error = %e, "rtsp ingest session ended");
    }
}

async fn run(
    mut reader: RtspReader,
    mut writer: RtspWriter,
    peer_addr: SocketAddr,
    registry: Arc<Registry>,
    first: Request<Vec<u8>>,
) -> anyhow::Result<()> {
    let mut handler = rtsp::Handler::new(
        peer_addr,
        Arc::new(tokio::sync::RwLock::new(HashMap::new())),
        rtsp::ServerConfig::default(),
    );
    let mut session = IngestSession::default();
    let (media_tx, mut media_rx) = mpsc::unbounded_channel::<(usize, Vec<u8>)>();

    handler.update_cseq(&first);
    let outcome = match handle_request(&first, &mut handler, &mut session, &registry, peer_addr, &media_tx, &mut writer).await {
        Ok(true) => loop {
            tokio::select! {
                frame = reader.read_frame() => {
                    match frame {
                        Ok(Frame::Rtsp(request)) => {
                            handler.update_cseq(&request);
                            match handle_request(&request, &mut handler, &mut session, &registry, peer_addr, &media_tx, &mut writer).await {
                                Ok(true) => continue,
                                Ok(false) => break Ok(()),
                                Err(e) => break Err(e),
                            }
                        }
                        Ok(Frame::Interleaved { channel, data }) => {
                            if let (Some(&idx), Some(ch)) =
                                (session.channel_to_track.get(&channel), session.channel.clone())
                            {
                                on_media(&mut session.tracks, &ch, idx, &data).await;
                            }
                        }
                        Err(e) => break Err(e),
                    }
                }
                Some((track_index, data)) = media_rx.recv() => {
                    if let Some(ch) = session.channel.clone() {
                        on_media(&mut session.tracks, &ch, track_index, &data).await;
                    }
                }
            }
        },
        Ok(false) => Ok(()),
        Err(e) => Err(e),
    };

    if let Some(path) = session.path.take() {
        registry.remove(&path).await;
    }
    outcome
}

/// Returns `Ok(false)` once TEARDOWN (or an unrecoverable error) should end
/// the session's read loop.
async fn handle_request(
    request: &Request<Vec<u8>>,
    handler: &mut rtsp::Handler,
    session: &mut IngestSession,
    registry: &Arc<Registry>,
    peer_addr: SocketAddr,
    media_tx: &mpsc::UnboundedSender<(usize, Vec<u8>)>,
    writer: &mut RtspWriter,
) -> anyhow::Result<bool> {
    match request.method() {
        Method::Options => {
            let response = handler.handle_options(request).await?;
            writer.send_response(&response).await?;
        }
        Method::Announce => {
            if session.announced {
                writer
                    .send_response(&simple_response(handler, StatusCode::MethodNotValidInThisState))
                    .await?;
                return Ok(true);
            }
            let path = extract_path(request);
            let Ok(sdp) = sdp_types::Session::parse(request.body()) else {
                writer.send_response(&simple_response(handler, StatusCode::BadRequest)).await?;
                return Ok(true);
            };
            let mut catalog: CodecCatalog = Vec::new();
            let mut tracks = Vec::new();
            for media in &sdp.medias {
                if let Some((descriptor, track)) = build_track(media, catalog.len() as u8) {
                    catalog.push(descriptor);
                    tracks.push(track);
                }
            }
            if catalog.is_empty() {
                writer
                    .send_response(&simple_response(handler, StatusCode::UnsupportedMediaType))
                    .await?;
                return Ok(true);
            }
            let (channel, created) = registry.create(&path).await;
            if !created {
                warn!(path, "rtsp ingest: rejecting ANNOUNCE, path already live");
                writer.send_response(&simple_response(handler, StatusCode::Forbidden)).await?;
                return Ok(true);
            }
            if let Err(e) = channel.set_streams(catalog).await {
                warn!(path, error = %e, "rtsp ingest: failed to publish header");
                registry.remove(&path).await;
                writer
                    .send_response(&simple_response(handler, StatusCode::InternalServerError))
                    .await?;
                return Ok(true);
            }
            info!(path, remote_addr = %peer_addr, "rtsp announce accepted");
            session.path = Some(path);
            session.channel = Some(channel);
            session.tracks = tracks;
            session.announced = true;
            let response = handler.handle_announce(request).await?;
            writer.send_response(&response).await?;
        }
        Method::Setup => {
            let Some(transport_header) = request.header(&headers::TRANSPORT) else {
                writer.send_response(&simple_response(handler, StatusCode::BadRequest)).await?;
                return Ok(true);
            };
            let transport = transport_header.as_str().to_string();
            let uri_tail = request.request_uri().map(|u| u.to_string()).unwrap_or_default();
            let Some(track_index) = match_track(&session.tracks, &uri_tail, session.setups_done) else {
                writer.send_response(&simple_response(handler, StatusCode::NotFound)).await?;
                return Ok(true);
            };
            session.setups_done += 1;
            if rtsp_wire::is_tcp_transport(&transport) {
                let (response, rtp_channel, _rtcp_channel) = handler.handle_setup_tcp(&transport).await?;
                session.channel_to_track.insert(rtp_channel, track_index);
                writer.send_response(&response).await?;
            } else {
                let (response, _client_rtp, _client_rtcp, server_rtp, server_rtcp) =
                    handler.handle_setup_udp(&transport).await?;
                let rtp_socket = UdpSocket::bind(("0.0.0.0", server_rtp)).await?;
                let _rtcp_socket = UdpSocket::bind(("0.0.0.0", server_rtcp)).await?;
                let tx = media_tx.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 2048];
                    loop {
                        match rtp_socket.recv(&mut buf).await {
                            Ok(n) => {
                                if tx.send((track_index, buf[..n].to_vec())).is_err() {
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                });
                writer.send_response(&response).await?;
            }
        }
        Method::Record => {
            let response = handler.handle_record(request).await?;
            writer.send_response(&response).await?;
        }
        Method::Teardown => {
            let response = handler.handle_teardown(request).await?;
            writer.send_response(&response).await?;
            return Ok(false);
        }
        Method::GetParameter => {
            writer.send_response(&simple_response(handler, StatusCode::Ok)).await?;
        }
        _ => {
            writer.send_response(&simple_response(handler, StatusCode::NotImplemented)).await?;
        }
    }
    Ok(true)
}

fn simple_response(handler: &rtsp::Handler, status: StatusCode) -> Response<Vec<u8>> {
    Response::builder(Version::V1_0, status)
        .header(headers::CSEQ, handler.cseq().to_string())
        .empty()
        .map_body(|_| vec![])
}

pub(crate) fn extract_path(request: &Request<Vec<u8>>) -> String {
    let Some(uri) = request.request_uri() else {
        return "/".to_string();
    };
    let s = uri.to_string();
    match s.find("://") {
        Some(scheme_end) => match s[scheme_end + 3..].find('/') {
            Some(slash) => s[scheme_end + 3 + slash..].to_string(),
            None => "/".to_string(),
        },
        None => s,
    }
}

/// Matches a SETUP's request URI to the track it targets via the SDP's
/// `a=control:` attribute, falling back to SETUP arrival order when the
/// control attribute is absent or doesn't match (spec §4.3.2).
fn match_track(tracks: &[TrackInfo], uri_tail: &str, setups_done: usize) -> Option<usize> {
    for (i, t) in tracks.iter().enumerate() {
        if !t.control.is_empty() && uri_tail.ends_with(t.control.as_str()) {
            return Some(i);
        }
    }
    (setups_done < tracks.len()).then_some(setups_done)
}

fn build_track(media: &sdp_types::Media, stream_index: u8) -> Option<(CodecDescriptor, TrackInfo)> {
    let rtpmap = media.attributes.iter().find(|a| a.attribute == "rtpmap")?.value.as_ref()?;
    let mut parts = rtpmap.split_whitespace();
    parts.next()?; // payload type, not needed for depacketisation
    let codec_parts: Vec<&str> = parts.next()?.split('/').collect();
    let codec_name = codec_parts.first()?.to_uppercase();
    let clock_rate: u32 = codec_parts.get(1).and_then(|s| s.parse().ok()).unwrap_or(90000);
    let channels: u8 = codec_parts.get(2).and_then(|s| s.parse().ok()).unwrap_or(1);
    let control = media
        .attributes
        .iter()
        .find(|a| a.attribute == "control")
        .and_then(|a| a.value.clone())
        .unwrap_or_default();

    let (descriptor, state) = match codec_name.as_str() {
        "H264" => {
            let (sps, pps) = rtsp::extract_h264_params(media).unwrap_or_default();
            let sps = Bytes::from(sps);
            let pps = Bytes::from(pps);
            let descriptor = h264::descriptor_from_params(sps.clone(), pps.clone());
            (
                descriptor,
                TrackState::H264 {
                    depacketizer: H264Depacketizer::new(),
                    sps,
                    pps,
                },
            )
        }
        "H265" | "HEVC" => {
            let (vps, sps, pps) = rtsp::extract_h265_params(media).unwrap_or_default();
            let vps = Bytes::from(vps);
            let sps = Bytes::from(sps);
            let pps = Bytes::from(pps);
            let descriptor = h265::descriptor_from_params(vps.clone(), sps.clone(), pps.clone());
            (
                descriptor,
                TrackState::H265 {
                    depacketizer: H265Depacketizer::new(),
                    vps,
                    sps,
                    pps,
                },
            )
        }
        "MPEG4-GENERIC" => {
            let fmtp = media
                .attributes
                .iter()
                .find(|a| a.attribute == "fmtp")
                .and_then(|a| a.value.as_ref())?;
            let config = aac::parse_config_fmtp(fmtp)?;
            let descriptor = aac::descriptor_from_config(config)?;
            (descriptor, TrackState::Aac)
        }
        "OPUS" => (CodecDescriptor::Opus { channel_count: channels.max(1) }, TrackState::Raw),
        "PCMU" => (CodecDescriptor::PcmMulaw { sample_rate: clock_rate }, TrackState::Raw),
        "PCMA" => (CodecDescriptor::PcmAlaw { sample_rate: clock_rate }, TrackState::Raw),
        other => {
            warn!(codec = other, "rtsp ingest: unsupported codec in SDP, skipping track");
            return None;
        }
    };

    Some((
        descriptor,
        TrackInfo {
            stream_index,
            control,
            clock_rate,
            first_timestamp: None,
            state,
        },
    ))
}

async fn on_media(tracks: &mut [TrackInfo], channel: &Arc<Channel>, track_index: usize, data: &[u8]) {
    let mut buf = data;
    let rtp_packet = match RtpPacket::unmarshal(&mut buf) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "rtsp ingest: malformed RTP packet");
            return;
        }
    };
    let Some(track) = tracks.get_mut(track_index) else {
        return;
    };
    let first_ts = *track.first_timestamp.get_or_insert(rtp_packet.header.timestamp);
    let elapsed_ticks = rtp_packet.header.timestamp.wrapping_sub(first_ts) as u64;
    let pts = Duration::from_nanos(elapsed_ticks * 1_000_000_000 / track.clock_rate.max(1) as u64);
    let is_video = track.state.is_video();

    let (payload, is_key) = match &mut track.state {
        TrackState::H264 { depacketizer, sps, pps } => match depacketizer.push(&rtp_packet) {
            Ok(Some((avcc, is_key))) => {
                update_h264_params(sps, pps, &avcc);
                (h264::decorate_keyframe(&avcc, sps.as_ref(), pps.as_ref()), is_key)
            }
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "rtsp ingest: dropping malformed h264 access unit");
                return;
            }
        },
        TrackState::H265 { depacketizer, vps, sps, pps } => match depacketizer.push(&rtp_packet) {
            Ok(Some((avcc, is_key))) => {
                update_h265_params(vps, sps, pps, &avcc);
                (h265::decorate_keyframe(&avcc, vps.as_ref(), sps.as_ref(), pps.as_ref()), is_key)
            }
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "rtsp ingest: dropping malformed h265 access unit");
                return;
            }
        },
        TrackState::Aac => match aac::depacketize(&rtp_packet) {
            Ok(frame) => (frame, false),
            Err(e) => {
                warn!(error = %e, "rtsp ingest: dropping malformed aac packet");
                return;
            }
        },
        TrackState::Raw => (rtp_packet.payload.clone(), false),
    };

    let packet = if is_video {
        Packet::video(track.stream_index, pts, is_key, payload)
    } else {
        Packet::audio(track.stream_index, pts, payload)
    };
    if let Err(e) = channel.queue.write_packet(packet).await {
        warn!(error = %e, "rtsp ingest: failed to enqueue packet");
    }
}

fn update_h264_params(sps: &mut Bytes, pps: &mut Bytes, avcc: &[u8]) {
    for nalu in split_avcc(avcc) {
        match h264::nal_type(nalu) {
            Some(h264::NAL_SPS) => *sps = Bytes::copy_from_slice(nalu),
            Some(h264::NAL_PPS) => *pps = Bytes::copy_from_slice(nalu),
            _ => {}
        }
    }
}

fn update_h265_params(vps: &mut Bytes, sps: &mut Bytes, pps: &mut Bytes, avcc: &[u8]) {
    for nalu in split_avcc(avcc) {
        match h265::nal_type(nalu) {
            Some(h265::NAL_VPS) => *vps = Bytes::copy_from_slice(nalu),
            Some(h265::NAL_SPS) => *sps = Bytes::copy_from_slice(nalu),
            Some(h265::NAL_PPS) => *pps = Bytes::copy_from_slice(nalu),
            _ => {}
        }
    }
}

/// Used by the supervisor's accept loop to tag each connection's tracing
/// span with its remote address (spec §10.3).
pub fn span(peer: SocketAddr) -> tracing::Span {
    tracing::info_span!("rtsp_ingest_session", remote_addr = %peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media_with(rtpmap: &str, fmtp: Option<&str>, control: Option<&str>) -> sdp_types::Media {
        let mut attributes = vec![sdp_types::Attribute {
            attribute: "rtpmap".to_string(),
            value: Some(rtpmap.to_string()),
        }];
        if let Some(fmtp) = fmtp {
            attributes.push(sdp_types::Attribute {
                attribute: "fmtp".to_string(),
                value: Some(fmtp.to_string()),
            });
        }
        if let Some(control) = control {
            attributes.push(sdp_types::Attribute {
                attribute: "control".to_string(),
                value: Some(control.to_string()),
            });
        }
        sdp_types::Media {
            media: "video".to_string(),
            port: 0,
            num_ports: None,
            media_type: "RTP/AVP".to_string(),
            formats: vec!["96".to_string()],
            connections: vec![],
            bandwidths: vec![],
            attributes,
        }
    }

    #[test]
    fn build_track_opus_uses_rtpmap_clock_and_channels() {
        let media = media_with("111 opus/48000/2", None, Some("streamid=1"));
        let (descriptor, track) = build_track(&media, 1).expect("opus track");
        assert_eq!(descriptor, CodecDescriptor::Opus { channel_count: 2 });
        assert_eq!(track.clock_rate, 48000);
        assert_eq!(track.control, "streamid=1");
    }

    #[test]
    fn build_track_unsupported_codec_is_skipped() {
        let media = media_with("14 unknowncodec/8000", None, None);
        assert!(build_track(&media, 0).is_none());
    }

    #[test]
    fn match_track_prefers_control_attribute_over_order() {
        let tracks = vec![
            TrackInfo {
                stream_index: 0,
                control: "streamid=0".to_string(),
                clock_rate: 90000,
                first_timestamp: None,
                state: TrackState::Raw,
            },
            TrackInfo {
                stream_index: 1,
                control: "streamid=1".to_string(),
                clock_rate: 48000,
                first_timestamp: None,
                state: TrackState::Raw,
            },
        ];
        assert_eq!(match_track(&tracks, "rtsp://host/live/a/streamid=1", 0), Some(1));
        assert_eq!(match_track(&tracks, "rtsp://host/live/a/unmatched", 1), Some(1));
    }
}
