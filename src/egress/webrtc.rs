//! WebRTC play egress. Two distinct sources, both reached through the same
//! `/webrtc/player/:path` signalling loop:
//!
//! - **§4.4.4, routed channel.** The common case: packets come off the
//!   channel's `PacketQueue`, the same cursor RTSP/RTMP egress reads. Video
//!   (H.264/H.265) uses *sample mode* — `TrackLocalStaticSample` fed
//!   Annex-B access units with SPS/PPS (VPS first for H.265) decorated
//!   before every IDR, the same keyframe decoration `bridge::h264`/`h265`
//!   do for HTTP-FLV — letting the built-in payloader handle FU-A/STAP-A
//!   fragmentation. Audio (Opus/PCMU/PCMA) uses *RTP mode* —
//!   `TrackLocalStaticRTP` fed one RTP packet per already-framed payload,
//!   no re-fragmentation needed. AAC and the image/VP8/VP9/AV1 codecs have
//!   no packetiser in `bridge::` and are left out of the answer entirely
//!   (`capability_for` returns `None`), the same scope cut `egress::rtsp`
//!   makes for its SDP. Grounded on `examples/mofeng-git-One-KVM/src/webrtc/
//!   video_track.rs`'s `TrackLocalStaticSample`-for-H264/`TrackLocalStaticRTP`
//!   -for-the-rest split, and on `liveion/src/forward/subscribe.rs::
//!   sender_forward_rtp` for the RTP-mode forwarding shape.
//! - **§4.4.5, direct WebRTC-to-WebRTC.** When the channel's publisher is
//!   itself WebRTC, `Channel::webrtc_remote_tracks` is non-empty and takes
//!   priority: subscribers read the publisher's remote RTP directly off the
//!   per-track broadcast fan-out `ingest::webrtc` feeds, and re-emit it on
//!   matching local tracks — no FormatBridge round trip, no `PacketQueue`.
//!   Grounded on `liveion/src/forward/subscribe.rs::sender_forward_rtp`
//!   (`TrackLocalStaticRTP::new(remote.codec().capability, ..)`, a fresh
//!   per-subscriber monotonic `sequence_number`, everything else in the RTP
//!   header passed through) and `liveion/src/forward/track.rs::
//!   PublishTrackRemote::track_forward` (one broadcast channel per remote
//!   track, fed by one reader task).
//!
//! Both paths share the same `APIBuilder`/JSON-over-WebSocket signalling
//! idiom as `ingest::webrtc`, mirrored here for a sendonly peer connection.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_PCMA, MIME_TYPE_PCMU};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::media::Sample;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::bridge::{h264, h265};
use crate::error::{RelayError, Result};
use crate::packet::{CodecCatalog, CodecDescriptor, Packet};
use crate::queue::ReadOutcome;
use crate::registry::{Channel, Registry, WebrtcRemoteTrack};

#[derive(Deserialize)]
struct SignalRequest {
    method: String,
    data: Option<RequestData>,
}

#[derive(Deserialize)]
struct RequestData {
    offer: Option<String>,
    candidate: Option<RTCIceCandidateInit>,
}

#[derive(Serialize)]
struct SignalResponse {
    method: &'static str,
    code: i32,
    msg: String,
    data: ResponseData,
}

#[derive(Serialize, Default)]
struct ResponseData {
    #[serde(skip_serializing_if = "Option::is_none")]
    answer: Option<String>,
}

fn error_envelope(msg: impl ToString) -> String {
    serde_json::to_string(&SignalResponse {
        method: "answer",
        code: 1,
        msg: msg.to_string(),
        data: ResponseData::default(),
    })
    .unwrap_or_default()
}

/// Which packetisation strategy a routed-channel track uses (spec §4.4.4).
enum EgressKind {
    H264,
    H265,
    Raw,
}

fn capability_for(descriptor: &CodecDescriptor) -> Option<(RTCRtpCodecCapability, EgressKind, u32)> {
    match descriptor {
        CodecDescriptor::H264 { .. } => Some((
            RTCRtpCodecCapability {
                mime_type: "video/H264".to_owned(),
                clock_rate: 90_000,
                sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f".to_owned(),
                ..Default::default()
            },
            EgressKind::H264,
            90_000,
        )),
        CodecDescriptor::H265 { .. } => Some((
            RTCRtpCodecCapability {
                mime_type: "video/H265".to_owned(),
                clock_rate: 90_000,
                ..Default::default()
            },
            EgressKind::H265,
            90_000,
        )),
        CodecDescriptor::Opus { channel_count } => Some((
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: *channel_count as u16,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                ..Default::default()
            },
            EgressKind::Raw,
            48_000,
        )),
        CodecDescriptor::PcmMulaw { sample_rate } => Some((
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: *sample_rate,
                ..Default::default()
            },
            EgressKind::Raw,
            *sample_rate,
        )),
        CodecDescriptor::PcmAlaw { sample_rate } => Some((
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMA.to_owned(),
                clock_rate: *sample_rate,
                ..Default::default()
            },
            EgressKind::Raw,
            *sample_rate,
        )),
        _ => None,
    }
}

/// How one routed-channel stream's packets reach its local WebRTC track
/// (spec §4.4.4's dual path).
enum TrackHandle {
    SampleH264 {
        track: Arc<TrackLocalStaticSample>,
        sps: Bytes,
        pps: Bytes,
    },
    SampleH265 {
        track: Arc<TrackLocalStaticSample>,
        vps: Bytes,
        sps: Bytes,
        pps: Bytes,
    },
    Rtp {
        track: Arc<TrackLocalStaticRTP>,
        clock_rate: u32,
        next_seq: u16,
    },
}

struct EgressTrack {
    stream_index: u8,
    handle: TrackHandle,
}

/// Drains a sender's incoming RTCP so the remote side's receiver reports
/// don't back up unread (pion/webrtc-rs require this of every `add_track`
/// caller).
fn drain_rtcp(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
    });
}

/// Drives one `/webrtc/player/:path` WebSocket connection end to end: a
/// sendonly peer connection, then either the direct-forward path (spec
/// §4.4.5) if the publisher is itself WebRTC, or the routed-channel path
/// (spec §4.4.4) otherwise.
pub async fn handle_play(
    socket: WebSocket,
    path: String,
    registry: Arc<Registry>,
    api: Arc<webrtc::api::API>,
    ice_servers: Vec<RTCIceServer>,
) {
    let (ws_tx, mut ws_rx) = socket.split();
    let ws_tx = Arc::new(Mutex::new(ws_tx));

    let Some(channel) = registry.get(&path).await else {
        let _ = ws_tx.lock().await.send(Message::Text(error_envelope(format!("{path} not found")))).await;
        return;
    };

    let direct_sources = channel.webrtc_remote_tracks().await;
    let catalog = if direct_sources.is_empty() {
        match channel.streams().await {
            Some(c) => c,
            None => {
                let _ = ws_tx.lock().await.send(Message::Text(error_envelope(format!("{path} not live")))).await;
                return;
            }
        }
    } else {
        CodecCatalog::new()
    };

    let peer = match crate::ingest::webrtc::new_peer_connection(&api, ice_servers).await {
        Ok(p) => p,
        Err(e) => {
            let _ = ws_tx.lock().await.send(Message::Text(error_envelope(e))).await;
            return;
        }
    };

    let routed_tracks = if direct_sources.is_empty() {
        match add_tracks(&peer, &catalog).await {
            Ok(tracks) => tracks,
            Err(e) => {
                let _ = ws_tx.lock().await.send(Message::Text(error_envelope(e))).await;
                return;
            }
        }
    } else {
        Vec::new()
    };
    let direct_pairs = if direct_sources.is_empty() {
        Vec::new()
    } else {
        match add_direct_tracks(&peer, &direct_sources).await {
            Ok(pairs) => pairs,
            Err(e) => {
                let _ = ws_tx.lock().await.send(Message::Text(error_envelope(e))).await;
                return;
            }
        }
    };
    if routed_tracks.is_empty() && direct_pairs.is_empty() {
        let _ = ws_tx
            .lock()
            .await
            .send(Message::Text(error_envelope("no bridgeable tracks in this channel")))
            .await;
        return;
    }
    let mut routed_tracks = routed_tracks;

    let peer_for_state = peer.clone();
    let path_for_state = path.clone();
    peer.on_peer_connection_state_change(Box::new(move |state| {
        if matches!(
            state,
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed | RTCPeerConnectionState::Disconnected
        ) {
            info!(path = %path_for_state, "webrtc egress: peer connection ended");
        }
        let _ = &peer_for_state;
        Box::pin(async {})
    }));

    while let Some(Ok(msg)) = ws_rx.next().await {
        let Message::Text(text) = msg else { continue };
        let request: SignalRequest = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(e) => {
                let _ = ws_tx.lock().await.send(Message::Text(error_envelope(e))).await;
                continue;
            }
        };
        match request.method.as_str() {
            "offer" => {
                let Some(offer_sdp) = request.data.and_then(|d| d.offer) else {
                    continue;
                };
                match negotiate(&peer, offer_sdp).await {
                    Ok(answer) => {
                        let response = SignalResponse {
                            method: "answer",
                            code: 0,
                            msg: "ok".to_owned(),
                            data: ResponseData { answer: Some(answer) },
                        };
                        let _ = ws_tx
                            .lock()
                            .await
                            .send(Message::Text(serde_json::to_string(&response).unwrap_or_default()))
                            .await;

                        if !direct_pairs.is_empty() {
                            for (remote, local) in direct_pairs.iter().cloned() {
                                tokio::spawn(forward_direct(remote, local));
                            }
                        } else {
                            let cursor = match channel.subscribe().await {
                                Ok(c) => c,
                                Err(e) => {
                                    let _ = ws_tx.lock().await.send(Message::Text(error_envelope(e))).await;
                                    continue;
                                }
                            };
                            let tracks = std::mem::take(&mut routed_tracks);
                            let channel = channel.clone();
                            tokio::spawn(async move {
                                pump(cursor, channel, tracks).await;
                            });
                        }
                    }
                    Err(e) => {
                        let _ = ws_tx.lock().await.send(Message::Text(error_envelope(e))).await;
                    }
                }
            }
            "candidate" => {
                if let Some(candidate) = request.data.and_then(|d| d.candidate) {
                    if let Err(e) = peer.add_ice_candidate(candidate).await {
                        warn!(path, error = %e, "webrtc egress: failed to add remote ICE candidate");
                    }
                }
            }
            _ => {}
        }
    }

    let _ = peer.close().await;
}

/// Builds the routed-channel tracks (spec §4.4.4): sample-mode for video,
/// RTP-mode for audio.
async fn add_tracks(peer: &Arc<RTCPeerConnection>, catalog: &CodecCatalog) -> Result<Vec<EgressTrack>> {
    let mut tracks = Vec::new();
    for (idx, descriptor) in catalog.iter().enumerate() {
        let Some((capability, kind, clock_rate)) = capability_for(descriptor) else {
            continue;
        };
        let handle = match (kind, descriptor) {
            (EgressKind::H264, CodecDescriptor::H264 { sps, pps, .. }) => {
                let track = Arc::new(TrackLocalStaticSample::new(capability, "relay".to_owned(), format!("relay-{idx}")));
                let sender = peer
                    .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(|e| RelayError::protocol(1, e.to_string()))?;
                drain_rtcp(sender);
                TrackHandle::SampleH264 {
                    track,
                    sps: sps.clone(),
                    pps: pps.clone(),
                }
            }
            (EgressKind::H265, CodecDescriptor::H265 { vps, sps, pps, .. }) => {
                let track = Arc::new(TrackLocalStaticSample::new(capability, "relay".to_owned(), format!("relay-{idx}")));
                let sender = peer
                    .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(|e| RelayError::protocol(1, e.to_string()))?;
                drain_rtcp(sender);
                TrackHandle::SampleH265 {
                    track,
                    vps: vps.clone(),
                    sps: sps.clone(),
                    pps: pps.clone(),
                }
            }
            (EgressKind::Raw, _) => {
                let track = Arc::new(TrackLocalStaticRTP::new(capability, "relay".to_owned(), format!("relay-{idx}")));
                let sender = peer
                    .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(|e| RelayError::protocol(1, e.to_string()))?;
                drain_rtcp(sender);
                TrackHandle::Rtp {
                    track,
                    clock_rate,
                    next_seq: rand::random(),
                }
            }
            // capability_for's EgressKind always matches the descriptor variant it was derived from.
            _ => unreachable!("capability_for kind/descriptor mismatch"),
        };
        tracks.push(EgressTrack {
            stream_index: idx as u8,
            handle,
        });
    }
    Ok(tracks)
}

/// Builds one local `TrackLocalStaticRTP` per live WebRTC publisher track,
/// mirroring its negotiated capability exactly (spec §4.4.5: "preserving
/// packetisation").
async fn add_direct_tracks(
    peer: &Arc<RTCPeerConnection>,
    remote: &[WebrtcRemoteTrack],
) -> Result<Vec<(WebrtcRemoteTrack, Arc<TrackLocalStaticRTP>)>> {
    let mut pairs = Vec::new();
    for (idx, rt) in remote.iter().enumerate() {
        let track = Arc::new(TrackLocalStaticRTP::new(rt.capability.clone(), "relay".to_owned(), format!("relay-{idx}")));
        let sender = peer
            .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| RelayError::protocol(1, e.to_string()))?;
        drain_rtcp(sender);
        pairs.push((rt.clone(), track));
    }
    Ok(pairs)
}

async fn negotiate(peer: &Arc<RTCPeerConnection>, offer_sdp: String) -> Result<String> {
    let offer = RTCSessionDescription::offer(offer_sdp).map_err(|e| RelayError::protocol(1, e.to_string()))?;
    peer.set_remote_description(offer)
        .await
        .map_err(|e| RelayError::protocol(1, e.to_string()))?;
    let answer = peer
        .create_answer(None)
        .await
        .map_err(|e| RelayError::protocol(1, e.to_string()))?;
    let mut gather_complete = peer.gathering_complete_promise().await;
    peer.set_local_description(answer)
        .await
        .map_err(|e| RelayError::protocol(1, e.to_string()))?;
    let _ = gather_complete.recv().await;
    peer.local_description()
        .await
        .map(|d| d.sdp)
        .ok_or_else(|| RelayError::protocol(1, "no local description after gathering"))
}

/// Routed-channel path (spec §4.4.4): reads the channel's cursor and writes
/// each packet to its matching track until the viewer disconnects or the
/// channel closes.
async fn pump(mut cursor: crate::queue::Cursor, channel: Arc<Channel>, mut tracks: Vec<EgressTrack>) {
    loop {
        match cursor.read_packet().await {
            ReadOutcome::Packet(packet) => {
                if let Some(track) = tracks.iter_mut().find(|t| t.stream_index == packet.stream_index) {
                    write_track_packet(track, &packet).await;
                }
            }
            ReadOutcome::EndOfStream => break,
        }
    }
    channel.unsubscribe();
}

async fn write_track_packet(track: &mut EgressTrack, packet: &Packet) {
    match &mut track.handle {
        TrackHandle::SampleH264 { track, sps, pps } => {
            let decorated = h264::decorate_keyframe(&packet.payload, sps, pps);
            let sample = Sample {
                data: crate::bridge::avcc_to_annex_b(&decorated),
                duration: packet.duration,
                ..Default::default()
            };
            let _ = track.write_sample(&sample).await;
        }
        TrackHandle::SampleH265 { track, vps, sps, pps } => {
            let decorated = h265::decorate_keyframe(&packet.payload, vps, sps, pps);
            let sample = Sample {
                data: crate::bridge::avcc_to_annex_b(&decorated),
                duration: packet.duration,
                ..Default::default()
            };
            let _ = track.write_sample(&sample).await;
        }
        TrackHandle::Rtp { track, clock_rate, next_seq } => {
            let ts = rtp_timestamp(packet.pts, *clock_rate);
            let seq = *next_seq;
            *next_seq = next_seq.wrapping_add(1);
            let rtp = webrtc::rtp::packet::Packet {
                header: webrtc::rtp::header::Header {
                    version: 2,
                    payload_type: 0,
                    sequence_number: seq,
                    timestamp: ts,
                    ssrc: 0,
                    marker: true,
                    ..Default::default()
                },
                payload: packet.payload.clone(),
            };
            let _ = track.write_rtp(&rtp).await;
        }
    }
}

/// Direct-forward path (spec §4.4.5): one task per remote track, reading
/// its broadcast fan-out and re-emitting on the matching local track with a
/// fresh per-subscriber sequence number — everything else in the RTP header
/// (ssrc/payload type rewritten by the track binding, timestamp, payload)
/// passed through untouched. Grounded on `liveion/src/forward/
/// subscribe.rs::sender_forward_rtp`.
async fn forward_direct(remote: WebrtcRemoteTrack, local: Arc<TrackLocalStaticRTP>) {
    let mut rx = remote.subscribe();
    let mut sequence_number: u16 = rand::random();
    loop {
        match rx.recv().await {
            Ok(packet) => {
                let mut packet = (*packet).clone();
                packet.header.sequence_number = sequence_number;
                sequence_number = sequence_number.wrapping_add(1);
                if local.write_rtp(&packet).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn rtp_timestamp(pts: Duration, clock_rate: u32) -> u32 {
    (pts.as_nanos() as u128 * clock_rate as u128 / 1_000_000_000) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_for_skips_image_codecs() {
        assert!(capability_for(&CodecDescriptor::Vp8).is_none());
        assert!(capability_for(&CodecDescriptor::Jpeg).is_none());
    }

    #[test]
    fn capability_for_maps_h264_clock_rate() {
        let descriptor = CodecDescriptor::H264 {
            sps: bytes::Bytes::new(),
            pps: bytes::Bytes::new(),
            width: 0,
            height: 0,
            profile: 0,
            level: 0,
        };
        let (_, _, clock_rate) = capability_for(&descriptor).unwrap();
        assert_eq!(clock_rate, 90_000);
    }
}
