//! WebRTC publish ingest (spec §4.3.3). Grounded on
//! `liveion/src/forward/internal.rs::new_publish_peer` for the
//! `MediaEngine`/`SettingEngine`/`APIBuilder` construction shape and the
//! `RTCRtpTransceiverDirection::Recvonly` transceiver setup, and on
//! `examples/mofeng-git-One-KVM/src/web/ws.rs` for the JSON-over-WebSocket
//! signalling loop idiom (`socket.split()`, `SinkExt`/`StreamExt`).
//!
//! Unlike the teacher, the `MediaEngine` here registers the exact payload
//! types spec §6 pins (H.264 PT=96, Opus PT=111, PCMU PT=0, PCMA PT=8) plus
//! the VP8/VP9/H.264-high/AV1 entries spec §6 calls out as additional video
//! capabilities, rather than `register_default_codecs()`. All peer
//! connections share one UDP mux socket (spec §5), set up once by the
//! supervisor and passed in here.
//!
//! Each remote track also registers a `registry::WebrtcRemoteTrack` on the
//! channel (spec §4.4.5), fed straight from the RTP read loop below,
//! independent of the FormatBridge/PacketQueue path further down this same
//! function — grounded on `liveion/src/forward/track.rs::PublishTrackRemote::
//! track_forward`'s broadcast-per-track shape.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_PCMA, MIME_TYPE_PCMU};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice::udp_mux::UDPMux;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_network_type::NetworkType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry as InterceptorRegistry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCPFeedback, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use crate::bridge::rtp_h264::H264Depacketizer;
use crate::bridge::rtp_h265::H265Depacketizer;
use crate::bridge::{h264, h265};
use crate::error::{RelayError, Result};
use crate::packet::{CodecDescriptor, Packet};
use crate::registry::Registry;

const PT_VP8: u8 = 97;
const PT_VP9: u8 = 98;
const PT_H264_BASELINE: u8 = 96;
const PT_H264_HIGH: u8 = 104;
const PT_AV1: u8 = 41;
const PT_OPUS: u8 = 111;
const PT_PCMU: u8 = 0;
const PT_PCMA: u8 = 8;

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

/// Builds the shared `webrtc::api::API` used by both publish and play peer
/// connections: one `MediaEngine` registering the spec §6 payload-type
/// table, one UDP mux socket shared process-wide (spec §5).
pub fn build_api(
    udp_mux: Arc<dyn UDPMux + Send + Sync>,
) -> webrtc::error::Result<webrtc::api::API> {
    let mut m = MediaEngine::default();
    register_video_codecs(&mut m)?;
    register_audio_codecs(&mut m)?;

    let mut registry = InterceptorRegistry::new();
    registry = register_default_interceptors(registry, &mut m)?;

    let mut s = SettingEngine::default();
    s.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);
    s.set_network_types(vec![NetworkType::Udp4, NetworkType::Udp6]);
    s.set_udp_network(webrtc::ice::udp_network::UDPNetwork::Muxed(udp_mux));

    Ok(APIBuilder::new()
        .with_media_engine(m)
        .with_interceptor_registry(registry)
        .with_setting_engine(s)
        .build())
}

fn video_feedback() -> Vec<RTCPFeedback> {
    vec![
        RTCPFeedback { typ: "goog-remb".to_owned(), parameter: "".to_owned() },
        RTCPFeedback { typ: "ccm".to_owned(), parameter: "fir".to_owned() },
        RTCPFeedback { typ: "nack".to_owned(), parameter: "".to_owned() },
        RTCPFeedback { typ: "nack".to_owned(), parameter: "pli".to_owned() },
    ]
}

fn register_video_codecs(m: &mut MediaEngine) -> webrtc::error::Result<()> {
    let entries = [
        ("video/H264", "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f", PT_H264_BASELINE),
        ("video/H264", "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=4d0020", PT_H264_HIGH),
        ("video/VP8", "", PT_VP8),
        ("video/VP9", "profile-id=0", PT_VP9),
        ("video/AV1", "", PT_AV1),
    ];
    for (mime_type, fmtp, pt) in entries {
        m.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: fmtp.to_owned(),
                    rtcp_feedback: video_feedback(),
                },
                payload_type: pt,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;
    }
    Ok(())
}

fn register_audio_codecs(m: &mut MediaEngine) -> webrtc::error::Result<()> {
    m.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: PT_OPUS,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;
    m.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: 8000,
                channels: 0,
                sdp_fmtp_line: "".to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: PT_PCMU,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;
    m.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMA.to_owned(),
                clock_rate: 8000,
                channels: 0,
                sdp_fmtp_line: "".to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: PT_PCMA,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;
    Ok(())
}

pub async fn new_peer_connection(
    api: &webrtc::api::API,
    ice_servers: Vec<RTCIceServer>,
) -> webrtc::error::Result<Arc<RTCPeerConnection>> {
    let config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };
    Ok(Arc::new(api.new_peer_connection(config).await?))
}

/// Per-connection span (spec §10.3: `tracing::info_span!("webrtc_session", ...)`
/// alongside `rtmp_session`/`rtsp_ingest_session`), applied at the
/// `ws.on_upgrade` call site in `supervisor.rs` since the accepted
/// WebSocket has no peer `SocketAddr` of its own the way a raw TCP accept
/// does.
pub fn span(path: &str) -> tracing::Span {
    tracing::info_span!("webrtc_session", role = "ingest", path)
}

/// Drives one `/webrtc/pusher/:path` WebSocket connection end to end:
/// offer/answer, ICE, then per-track depacketisation into the channel's
/// queue (spec §4.3.3).
pub async fn handle_publish(
    socket: WebSocket,
    path: String,
    registry: Arc<Registry>,
    api: Arc<webrtc::api::API>,
    ice_servers: Vec<RTCIceServer>,
) {
    let (ws_tx, mut ws_rx) = socket.split();
    let ws_tx = Arc::new(Mutex::new(ws_tx));

    let peer = match new_peer_connection(&api, ice_servers).await {
        Ok(p) => p,
        Err(e) => {
            let _ = ws_tx.lock().await.send(Message::Text(error_envelope(e))).await;
            return;
        }
    };

    for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
        if let Err(e) = peer
            .add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: Vec::new(),
                }),
            )
            .await
        {
            warn!(path, error = %e, "failed to add recvonly transceiver");
            return;
        }
    }

    let (channel, created) = registry.create(&path).await;
    if !created {
        crate::metrics::PUBLISH_REJECTED_TOTAL.inc();
        let _ = ws_tx
            .lock()
            .await
            .send(Message::Text(error_envelope(format!("{path} already published"))))
            .await;
        return;
    }

    let catalog = Arc::new(Mutex::new(IngestCatalog::default()));
    let peer_for_track = peer.clone();
    let channel_for_track = channel.clone();
    let catalog_for_track = catalog.clone();
    peer.on_track(Box::new(move |track, _receiver, _transceiver| {
        let channel = channel_for_track.clone();
        let catalog = catalog_for_track.clone();
        let peer = peer_for_track.clone();
        Box::pin(async move {
            tokio::spawn(run_track(track, channel, catalog, peer));
        })
    }));

    let peer_for_state = peer.clone();
    let path_for_state = path.clone();
    let registry_for_state = registry.clone();
    peer.on_peer_connection_state_change(Box::new(move |state| {
        if matches!(
            state,
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed | RTCPeerConnectionState::Disconnected
        ) {
            let path = path_for_state.clone();
            let registry = registry_for_state.clone();
            tokio::spawn(async move {
                registry.remove(&path).await;
            });
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
                {
                    let (expects_video, expects_audio) = count_expected_tracks(&offer_sdp);
                    let mut cat = catalog.lock().await;
                    cat.expects_video = expects_video;
                    cat.expects_audio = expects_audio;
                }
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
                    }
                    Err(e) => {
                        let _ = ws_tx.lock().await.send(Message::Text(error_envelope(e))).await;
                    }
                }
            }
            "candidate" => {
                if let Some(candidate) = request.data.and_then(|d| d.candidate) {
                    if let Err(e) = peer.add_ice_candidate(candidate).await {
                        warn!(path, error = %e, "failed to add remote ICE candidate");
                    }
                }
            }
            _ => {}
        }
    }

    let _ = peer.close().await;
    registry.remove(&path).await;
}

/// Counts the non-rejected `m=video`/`m=audio` sections in a remote offer,
/// so the publish side knows how many `CodecDescriptor`s to wait for before
/// publishing the header (mirrors `ingest::rtmp`'s `onMetaData`-driven wait:
/// `write_header` only tolerates one call, so every expected track's
/// descriptor must be known before the first call).
fn count_expected_tracks(offer_sdp: &str) -> (bool, bool) {
    let mut video = false;
    let mut audio = false;
    for line in offer_sdp.lines() {
        if line.starts_with("m=video") && !line.trim_end().ends_with(" 0") {
            video = true;
        } else if line.starts_with("m=audio") && !line.trim_end().ends_with(" 0") {
            audio = true;
        }
    }
    (video, audio)
}

/// Per-publish-session catalog accumulator: tracks register themselves as
/// `on_track` fires (order and timing are not guaranteed to match the SDP's
/// media-section order), and the channel header is published exactly once,
/// as soon as every track `count_expected_tracks` predicted has registered.
#[derive(Default)]
struct IngestCatalog {
    catalog: Vec<CodecDescriptor>,
    expects_video: bool,
    expects_audio: bool,
    video_index: Option<u8>,
    audio_index: Option<u8>,
    published: bool,
    pending: Vec<Packet>,
}

impl IngestCatalog {
    fn ready(&self) -> bool {
        self.expects_video == self.video_index.is_some() && self.expects_audio == self.audio_index.is_some()
    }
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

/// Reads one remote track to completion, writing depacketised access units
/// into the channel. H.264/H.265 tracks carry no out-of-band parameter sets
/// here (unlike RTSP's `sprop-parameter-sets`), so the stream isn't
/// registered into the catalog until its first keyframe yields SPS/PPS; in
/// the meantime packets queue in `IngestCatalog::pending` (spec §4.3.3).
async fn run_track(
    track: Arc<TrackRemote>,
    channel: Arc<crate::registry::Channel>,
    catalog: Arc<Mutex<IngestCatalog>>,
    peer: Arc<RTCPeerConnection>,
) {
    let mime_type = track.codec().capability.mime_type.to_lowercase();
    let is_video = mime_type.starts_with("video/");

    if is_video {
        tokio::spawn(pli_ticker(peer, track.ssrc()));
    }

    // Fan this track's raw RTP out to any WebRTC subscriber that wants the
    // direct-forward path (spec §4.4.5), independent of — and started
    // before — the FormatBridge/PacketQueue registration below, since the
    // two paths don't share a stream-index namespace.
    let remote_track = crate::registry::WebrtcRemoteTrack::new(is_video, track.codec().capability, track.ssrc());
    let rtp_broadcast = remote_track.rtp_broadcast.clone();
    channel.add_webrtc_remote_track(remote_track).await;

    let mut h264 = H264Depacketizer::new();
    let mut h265 = H265Depacketizer::new();
    let mut stream_index: Option<u8> = None;

    loop {
        let (rtp_packet, _) = match track.read_rtp().await {
            Ok(v) => v,
            Err(_) => break,
        };
        // No receivers is the common case (no direct-forward subscriber);
        // `send` failing then is not an error.
        let _ = rtp_broadcast.send(Arc::new(rtp_packet.clone()));
        let pts = Duration::from_nanos(
            (rtp_packet.header.timestamp as u64).saturating_mul(1_000_000_000 / 90_000),
        );

        let result = if mime_type == "video/h264" {
            h264.push(&rtp_packet)
        } else if mime_type == "video/h265" {
            h265.push(&rtp_packet)
        } else {
            Ok(Some((rtp_packet.payload.clone(), rtp_packet.header.marker)))
        };

        let (payload, is_key) = match result {
            Ok(Some(v)) => v,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "webrtc ingest: dropping malformed access unit");
                continue;
            }
        };

        if stream_index.is_none() {
            let descriptor = match mime_type.as_str() {
                "video/h264" if is_key => extract_h264_params(&payload)
                    .map(|(sps, pps)| h264::descriptor_from_params(sps, pps)),
                "video/h265" if is_key => extract_h265_params(&payload)
                    .map(|(vps, sps, pps)| h265::descriptor_from_params(vps, sps, pps)),
                "video/vp8" => Some(CodecDescriptor::Vp8),
                "video/vp9" => Some(CodecDescriptor::Vp9),
                "video/av1" => Some(CodecDescriptor::Av1),
                "audio/opus" => Some(CodecDescriptor::Opus { channel_count: 2 }),
                "audio/pcmu" => Some(CodecDescriptor::PcmMulaw { sample_rate: 8000 }),
                "audio/pcma" => Some(CodecDescriptor::PcmAlaw { sample_rate: 8000 }),
                other if !is_video => {
                    warn!(mime_type = other, "webrtc ingest: unsupported audio codec");
                    break;
                }
                _ => None,
            };
            let Some(descriptor) = descriptor else {
                // H.264/H.265 waiting on its first keyframe; drop this
                // leading delta frame, there's nowhere to route it yet.
                continue;
            };
            match register_stream(&catalog, &channel, descriptor, is_video).await {
                Some(idx) => stream_index = Some(idx),
                None => break,
            }
        }
        let stream_index = stream_index.expect("set above");

        let packet = if is_video {
            Packet::video(stream_index, pts, is_key, payload)
        } else {
            Packet::audio(stream_index, pts, payload)
        };
        push_packet(&catalog, &channel, packet).await;
    }
}

fn extract_h264_params(avcc: &[u8]) -> Option<(Bytes, Bytes)> {
    let mut sps = None;
    let mut pps = None;
    for nalu in crate::bridge::split_avcc(avcc) {
        match h264::nal_type(nalu) {
            Some(h264::NAL_SPS) => sps = Some(Bytes::copy_from_slice(nalu)),
            Some(h264::NAL_PPS) => pps = Some(Bytes::copy_from_slice(nalu)),
            _ => {}
        }
    }
    Some((sps?, pps?))
}

fn extract_h265_params(avcc: &[u8]) -> Option<(Bytes, Bytes, Bytes)> {
    let mut vps = None;
    let mut sps = None;
    let mut pps = None;
    for nalu in crate::bridge::split_avcc(avcc) {
        match h265::nal_type(nalu) {
            Some(h265::NAL_VPS) => vps = Some(Bytes::copy_from_slice(nalu)),
            Some(h265::NAL_SPS) => sps = Some(Bytes::copy_from_slice(nalu)),
            Some(h265::NAL_PPS) => pps = Some(Bytes::copy_from_slice(nalu)),
            _ => {}
        }
    }
    Some((vps?, sps?, pps?))
}

/// Registers one track's descriptor and publishes the channel header once
/// every track `count_expected_tracks` predicted has registered (spec
/// §4.3.3; mirrors `ingest::rtmp::maybe_publish_header`'s single-call
/// discipline around `write_header`'s idempotent-only-for-identical-args
/// rule). Flushes every packet buffered by any track while the header was
/// still pending.
async fn register_stream(
    catalog: &Arc<Mutex<IngestCatalog>>,
    channel: &Arc<crate::registry::Channel>,
    descriptor: CodecDescriptor,
    is_video: bool,
) -> Option<u8> {
    let mut cat = catalog.lock().await;
    if is_video {
        if let Some(idx) = cat.video_index {
            return Some(idx);
        }
    } else if let Some(idx) = cat.audio_index {
        return Some(idx);
    }
    let index = cat.catalog.len() as u8;
    cat.catalog.push(descriptor);
    if is_video {
        cat.video_index = Some(index);
    } else {
        cat.audio_index = Some(index);
    }
    if !cat.published && cat.ready() {
        if channel.set_streams(cat.catalog.clone()).await.is_err() {
            return None;
        }
        cat.published = true;
        let pending = std::mem::take(&mut cat.pending);
        drop(cat);
        for packet in pending {
            let _ = channel.queue.write_packet(packet).await;
        }
    }
    Some(index)
}

async fn push_packet(catalog: &Arc<Mutex<IngestCatalog>>, channel: &Arc<crate::registry::Channel>, packet: Packet) {
    let mut cat = catalog.lock().await;
    if cat.published {
        drop(cat);
        let _ = channel.queue.write_packet(packet).await;
    } else {
        cat.pending.push(packet);
    }
}

/// Requests a keyframe from the remote publisher roughly every 5 s (spec
/// §4.3.3), until the peer connection or track goes away.
async fn pli_ticker(peer: Arc<RTCPeerConnection>, media_ssrc: u32) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        };
        if peer.write_rtcp(&[Box::new(pli)]).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_carries_nonzero_code() {
        let text = error_envelope("boom");
        assert!(text.contains("\"code\":1"));
        assert!(text.contains("boom"));
    }
}
