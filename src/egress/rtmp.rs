//! RTMP play egress (spec §4.4.1). Same handshake and
//! `ServerSession`/`ServerSessionEvent` event-loop shape `ingest::rtmp`
//! drives for the publish direction, extended here with the play-side
//! request/response pair (`PlayStreamRequested` → `accept_request`) and the
//! server-push methods (`send_video_data`/`send_audio_data`)
//! `rml_rtmp::sessions::ServerSession` exposes for feeding a connected
//! player, mirroring the *client*-side `publish_video_data`/
//! `publish_audio_data` pair `other_examples/.../zap-stream-core
//! egress/rtmp.rs` drives for the opposite role.
//!
//! Tag bodies reuse `bridge::flv`'s AVCDecoderConfigurationRecord /
//! HEVCDecoderConfigurationRecord builders directly (RTMP's
//! `send_video_data` wants the FLV VIDEODATA tag *body*, the same shape
//! `ingest::rtmp::on_video` parses, not a fully framed FLV tag). The
//! `Arc<Mutex<OwnedWriteHalf>>` split between the control read loop and the
//! spawned playback task mirrors `egress::rtsp`'s `Arc<Mutex<RtspWriter>>`.
//!
//! Like `ingest::rtmp`, this module only supplies the play-side event
//! handling; `crate::rtmp` owns the shared handshake, session, socket split
//! and read loop, dispatching into here once `PlayStreamRequested` decides
//! the connection's role.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rml_rtmp::sessions::{ServerSession, ServerSessionConfig, ServerSessionResult};
use rml_rtmp::time::RtmpTimestamp;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tracing::info;

use crate::bridge::flv::{avc_decoder_configuration_record, hevc_decoder_configuration_record, with_avc_packet_header};
use crate::error::{RelayError, Result};
use crate::ingest::rtmp_stream_path;
use crate::packet::{CodecCatalog, CodecDescriptor, Packet};
use crate::queue::{Cursor, ReadOutcome};
use crate::registry::{Channel, Registry};

const VIDEO_CODEC_AVC: u8 = 7;
const VIDEO_CODEC_HEVC: u8 = 12;
const SOUND_FORMAT_AAC: u8 = 10;

#[derive(Default)]
pub(crate) struct PlayState {
    pub(crate) channel: Option<Arc<Channel>>,
    stream_id: Option<u32>,
    video_index: Option<u8>,
    audio_index: Option<u8>,
    playback_task: Option<tokio::task::JoinHandle<()>>,
    pub(crate) subscribed: bool,
}

/// Looks up the play target, subscribes and spawns the packet-pump task
/// (spec §4.4.1: "PLAY attaches a cursor at the latest keyframe"). The
/// caller still owns `accept_request`; `stream_id` is the one `rml_rtmp`
/// assigned this connection's `createStream` call.
pub(crate) async fn begin_play(
    registry: &Arc<Registry>,
    app_name: &str,
    stream_key: &str,
    stream_id: u32,
    writer: Arc<Mutex<OwnedWriteHalf>>,
) -> Result<PlayState> {
    let path = rtmp_stream_path(app_name, stream_key);
    let Some(channel) = registry.get(&path).await else {
        return Err(RelayError::not_found(path));
    };
    let Some(catalog) = channel.streams().await else {
        return Err(RelayError::not_found(path));
    };
    let cursor = channel.subscribe().await?;
    info!(path, "rtmp play accepted");

    let video_index = catalog.iter().position(CodecDescriptor::is_video).map(|i| i as u8);
    let audio_index = catalog.iter().position(CodecDescriptor::is_audio).map(|i| i as u8);
    let playback_task = tokio::spawn(pump(
        cursor,
        channel.clone(),
        catalog,
        stream_id,
        video_index,
        audio_index,
        writer,
    ));

    Ok(PlayState {
        channel: Some(channel),
        stream_id: Some(stream_id),
        video_index,
        audio_index,
        playback_task: Some(playback_task),
        subscribed: true,
    })
}

/// Aborts the playback task and releases the subscriber slot, on teardown
/// or connection loss.
pub(crate) async fn finish_play(state: &mut PlayState) {
    if let Some(task) = state.playback_task.take() {
        task.abort();
    }
    if state.subscribed {
        if let Some(channel) = &state.channel {
            channel.unsubscribe();
        }
    }
}

/// Drains the subscriber's cursor and pushes each packet out as an RTMP
/// video/audio message, re-muxing the AVCC-framed payload into an FLV tag
/// body (the same shape `send_video_data`/`send_audio_data` expect) and
/// injecting the AVC/HEVC sequence header ahead of the first packet of each
/// kind (spec §4.4.1: "if the first packet is not a keyframe, silently
/// consume until one arrives" — the cursor is already anchored there by
/// `latest_cursor`, so the sequence header only needs to precede playback
/// once, not be re-sent per keyframe).
async fn pump(
    mut cursor: Cursor,
    channel: Arc<Channel>,
    catalog: CodecCatalog,
    stream_id: u32,
    video_index: Option<u8>,
    audio_index: Option<u8>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
) {
    let mut video_header_sent = false;
    let mut audio_header_sent = false;
    let mut session = match ServerSession::new(ServerSessionConfig::new()) {
        Ok((s, _)) => s,
        Err(_) => {
            channel.unsubscribe();
            return;
        }
    };

    loop {
        let packet = match cursor.read_packet().await {
            ReadOutcome::Packet(p) => p,
            ReadOutcome::EndOfStream => break,
        };
        let Some(descriptor) = catalog.get(packet.stream_index as usize) else {
            continue;
        };
        let is_video = Some(packet.stream_index) == video_index;
        let is_audio = Some(packet.stream_index) == audio_index;
        let ts = RtmpTimestamp::new(packet.pts.as_millis() as u32);

        let body = if is_video {
            if !video_header_sent {
                let header_body = sequence_header_body(descriptor);
                if let Some(header_body) = header_body {
                    if send_video(&mut session, &writer, stream_id, header_body, RtmpTimestamp::new(0)).await.is_err() {
                        break;
                    }
                }
                video_header_sent = true;
            }
            video_tag_body(descriptor, &packet)
        } else if is_audio {
            if !audio_header_sent {
                if let Some(header_body) = aac_sequence_header_body(descriptor) {
                    if send_audio(&mut session, &writer, stream_id, header_body, RtmpTimestamp::new(0)).await.is_err() {
                        break;
                    }
                }
                audio_header_sent = true;
            }
            audio_tag_body(descriptor, &packet)
        } else {
            None
        };

        let Some(body) = body else { continue };
        let result = if is_video {
            send_video(&mut session, &writer, stream_id, body, ts).await
        } else {
            send_audio(&mut session, &writer, stream_id, body, ts).await
        };
        if result.is_err() {
            break;
        }
    }
    channel.unsubscribe();
}

async fn send_video(
    session: &mut ServerSession,
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    stream_id: u32,
    body: Bytes,
    timestamp: RtmpTimestamp,
) -> Result<()> {
    let result = session
        .send_video_data(stream_id, body, timestamp, false)
        .map_err(|e| RelayError::transport(e.to_string()))?;
    if let ServerSessionResult::OutboundResponse(packet) = result {
        writer.lock().await.write_all(&packet.bytes).await?;
    }
    Ok(())
}

async fn send_audio(
    session: &mut ServerSession,
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    stream_id: u32,
    body: Bytes,
    timestamp: RtmpTimestamp,
) -> Result<()> {
    let result = session
        .send_audio_data(stream_id, body, timestamp, false)
        .map_err(|e| RelayError::transport(e.to_string()))?;
    if let ServerSessionResult::OutboundResponse(packet) = result {
        writer.lock().await.write_all(&packet.bytes).await?;
    }
    Ok(())
}

fn sequence_header_body(descriptor: &CodecDescriptor) -> Option<Bytes> {
    match descriptor {
        CodecDescriptor::H264 { sps, pps, .. } => {
            let config = avc_decoder_configuration_record(sps, pps);
            Some(video_frame(1, VIDEO_CODEC_AVC, &with_avc_packet_header(0, 0, &config)))
        }
        CodecDescriptor::H265 { vps, sps, pps, .. } => {
            let config = hevc_decoder_configuration_record(vps, sps, pps);
            Some(video_frame(1, VIDEO_CODEC_HEVC, &with_avc_packet_header(0, 0, &config)))
        }
        _ => None,
    }
}

fn video_tag_body(descriptor: &CodecDescriptor, packet: &Packet) -> Option<Bytes> {
    let codec_id = match descriptor {
        CodecDescriptor::H264 { .. } => VIDEO_CODEC_AVC,
        CodecDescriptor::H265 { .. } => VIDEO_CODEC_HEVC,
        _ => return None,
    };
    let frame_type = if packet.is_key { 1 } else { 2 };
    let cts = packet.composition_offset.as_millis() as i32;
    Some(video_frame(frame_type, codec_id, &with_avc_packet_header(1, cts, &packet.payload)))
}

fn aac_sequence_header_body(descriptor: &CodecDescriptor) -> Option<Bytes> {
    let CodecDescriptor::Aac { config_bytes, .. } = descriptor else {
        return None;
    };
    let mut out = bytes::BytesMut::with_capacity(2 + config_bytes.len());
    use bytes::BufMut;
    out.put_u8((SOUND_FORMAT_AAC << 4) | (3 << 2) | (1 << 1) | 1);
    out.put_u8(0); // AACPacketType=0 (sequence header)
    out.extend_from_slice(config_bytes);
    Some(out.freeze())
}

fn audio_tag_body(descriptor: &CodecDescriptor, packet: &Packet) -> Option<Bytes> {
    if !matches!(descriptor, CodecDescriptor::Aac { .. }) {
        return None;
    }
    let mut out = bytes::BytesMut::with_capacity(2 + packet.payload.len());
    use bytes::BufMut;
    out.put_u8((SOUND_FORMAT_AAC << 4) | (3 << 2) | (1 << 1) | 1);
    out.put_u8(1); // AACPacketType=1 (raw)
    out.extend_from_slice(&packet.payload);
    Some(out.freeze())
}

fn video_frame(frame_type: u8, codec_id: u8, body: &[u8]) -> Bytes {
    let mut out = bytes::BytesMut::with_capacity(1 + body.len());
    use bytes::BufMut;
    out.put_u8((frame_type << 4) | codec_id);
    out.extend_from_slice(body);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_header_body_none_for_audio_only_descriptor() {
        let descriptor = CodecDescriptor::Aac {
            object_type: 2,
            sample_rate: 44100,
            channel_count: 2,
            config_bytes: Bytes::new(),
        };
        assert!(sequence_header_body(&descriptor).is_none());
    }

    #[test]
    fn audio_tag_body_none_for_non_aac() {
        let descriptor = CodecDescriptor::Opus { channel_count: 2 };
        let packet = Packet::audio(0, Duration::from_millis(0), Bytes::from_static(b"x"));
        assert!(audio_tag_body(&descriptor, &packet).is_none());
    }
}
