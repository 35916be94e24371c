//! RTMP publish ingest (spec §4.3.1). Grounded on `rml_rtmp`'s server-side
//! session API — the handshake/`ServerSession`/`ServerSessionEvent` dance is
//! the same shape `other_examples/.../zap-stream-core egress/rtmp.rs` uses
//! for its *client* session, mirrored here for the server role (`rml_rtmp`
//! exposes both `ClientSession` and `ServerSession` from the same crate).
//!
//! RTMP publish and play share one TCP port (spec §6): a connection's role
//! isn't known until the `publish` or `play` AMF command arrives on the same
//! `ServerSession` the `connect` handshake opened, so this module only
//! supplies the publish-side event handling; `crate::rtmp` owns the shared
//! handshake, session and read loop and dispatches into here once a
//! `PublishStreamRequested` event decides the role.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::StreamMetadata;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::bridge::{aac, h264, h265};
use crate::error::{RelayError, Result};
use crate::ingest::rtmp_stream_path;
use crate::packet::{CodecCatalog, CodecDescriptor, Packet};
use crate::registry::{Channel, Registry};

const VIDEO_CODEC_AVC: u8 = 7;
const VIDEO_CODEC_HEVC: u8 = 12;
const AUDIO_CODEC_AAC: u8 = 10;

pub(crate) async fn perform_handshake(socket: &mut TcpStream) -> Result<()> {
    let mut handshake = Handshake::new(PeerType::Server);
    let c0_c1 = handshake
        .generate_outbound_p0_and_p1()
        .map_err(|e| RelayError::protocol(0, e.to_string()))?;
    socket.write_all(&c0_c1).await?;

    let mut buf = vec![0u8; 4096];
    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Err(RelayError::transport("peer closed during handshake"));
        }
        match handshake
            .process_bytes(&buf[..n])
            .map_err(|e| RelayError::protocol(0, e.to_string()))?
        {
            HandshakeProcessResult::InProgress { response_bytes } => {
                socket.write_all(&response_bytes).await?;
            }
            HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            } => {
                socket.write_all(&response_bytes).await?;
                debug_assert!(remaining_bytes.is_empty() || true);
                return Ok(());
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct PublishState {
    pub(crate) channel: Option<Arc<Channel>>,
    catalog: CodecCatalog,
    video_descriptor_index: Option<u8>,
    audio_descriptor_index: Option<u8>,
    /// Set from `onMetaData`'s `videocodecid`/`audiocodecid` keys so the
    /// header isn't published until every elementary stream the publisher
    /// announced has a sequence header (spec §4.3.1: "parse onMetaData + the
    /// first AVC/AAC sequence headers into a CodecCatalog, *then* stream
    /// inbound tags"). `write_header` only tolerates one call per channel, so
    /// publishing it before every descriptor is known would reject the
    /// second track as a header mismatch.
    metadata_seen: bool,
    expects_video: bool,
    expects_audio: bool,
    header_published: bool,
    pending: Vec<Packet>,
}

/// Claims `path` in the registry for a new publisher (spec §4.5:
/// "rejected if a live channel already occupies that path"). Called by
/// `crate::rtmp`'s dispatcher once `PublishStreamRequested` decides the
/// connection's role; the caller still owns `accept_request`.
pub(crate) async fn begin_publish(
    registry: &Arc<Registry>,
    app_name: &str,
    stream_key: &str,
) -> Result<PublishState> {
    let path = rtmp_stream_path(app_name, stream_key);
    let (channel, created) = registry.create(&path).await;
    if !created {
        warn!(path, "rejecting publish: path already live");
        return Err(RelayError::already_published(path));
    }
    info!(path, "rtmp publish accepted");
    Ok(PublishState {
        channel: Some(channel),
        ..PublishState::default()
    })
}

pub(crate) async fn on_metadata(state: &mut PublishState, metadata: &StreamMetadata) -> Result<()> {
    // onMetaData carries width/height/framerate, not parameter sets; codec
    // descriptors are still built from the first sequence-header tags, but
    // the presence of `videocodecid`/`audiocodecid` tells us how many
    // descriptors to wait for before publishing the header.
    state.metadata_seen = true;
    state.expects_video = metadata.video_codec_id.is_some();
    state.expects_audio = metadata.audio_codec_id.is_some();
    maybe_publish_header(state).await
}

/// Unlinks the publisher's channel on `PublishStreamFinished`/
/// `StreamKeyReleased` or on connection loss.
pub(crate) async fn finish_publish(state: &mut PublishState, registry: &Arc<Registry>) {
    if let Some(channel) = state.channel.take() {
        registry.remove(&channel.path).await;
    }
}

/// Parses one FLV-framed video tag body (spec §4.3.1: AVCC framing carried
/// verbatim into the queue). A `AVCPacketType=0` sequence-header tag builds
/// the `CodecDescriptor`; subsequent tags become `Packet`s.
pub(crate) async fn on_video(state: &mut PublishState, data: &Bytes, timestamp_ms: u32) -> Result<()> {
    if data.len() < 5 {
        return Ok(());
    }
    let frame_type = data[0] >> 4;
    let codec_id = data[0] & 0x0F;
    let packet_type = data[1];
    let cts_ms = i32::from_be_bytes([0, data[2], data[3], data[4]]) << 8 >> 8;
    let body = &data[5..];

    match (codec_id, packet_type) {
        (VIDEO_CODEC_AVC, 0) => {
            if let Some((sps, pps)) = parse_avc_decoder_config(body) {
                let descriptor = h264::descriptor_from_params(
                    Bytes::copy_from_slice(&sps),
                    Bytes::copy_from_slice(&pps),
                );
                register_video_descriptor(state, descriptor).await?;
            }
        }
        (VIDEO_CODEC_HEVC, 0) => {
            if let Some((vps, sps, pps)) = parse_hevc_decoder_config(body) {
                let descriptor = h265::descriptor_from_params(
                    Bytes::copy_from_slice(&vps),
                    Bytes::copy_from_slice(&sps),
                    Bytes::copy_from_slice(&pps),
                );
                register_video_descriptor(state, descriptor).await?;
            }
        }
        (VIDEO_CODEC_AVC, 1) | (VIDEO_CODEC_HEVC, 1) => {
            if let Some(index) = state.video_descriptor_index {
                let is_key = frame_type == 1;
                let mut packet = Packet::video(
                    index,
                    Duration::from_millis(timestamp_ms as u64),
                    is_key,
                    Bytes::copy_from_slice(body),
                );
                packet.composition_offset = Duration::from_millis(cts_ms.max(0) as u64);
                write_packet(state, packet).await?;
            }
        }
        _ => {}
    }
    Ok(())
}

pub(crate) async fn on_audio(state: &mut PublishState, data: &Bytes, timestamp_ms: u32) -> Result<()> {
    if data.len() < 2 {
        return Ok(());
    }
    let sound_format = data[0] >> 4;
    if sound_format != AUDIO_CODEC_AAC {
        return Ok(());
    }
    let aac_packet_type = data[1];
    let body = &data[2..];
    match aac_packet_type {
        0 => {
            if let Some(descriptor) = aac::descriptor_from_config(Bytes::copy_from_slice(body)) {
                register_audio_descriptor(state, descriptor).await?;
            }
        }
        1 => {
            if let Some(index) = state.audio_descriptor_index {
                let packet = Packet::audio(
                    index,
                    Duration::from_millis(timestamp_ms as u64),
                    Bytes::copy_from_slice(body),
                );
                write_packet(state, packet).await?;
            }
        }
        _ => {}
    }
    Ok(())
}

async fn register_video_descriptor(state: &mut PublishState, descriptor: CodecDescriptor) -> Result<()> {
    if state.video_descriptor_index.is_none() {
        state.video_descriptor_index = Some(state.catalog.len() as u8);
        state.catalog.push(descriptor);
        maybe_publish_header(state).await?;
    }
    Ok(())
}

async fn register_audio_descriptor(state: &mut PublishState, descriptor: CodecDescriptor) -> Result<()> {
    if state.audio_descriptor_index.is_none() {
        state.audio_descriptor_index = Some(state.catalog.len() as u8);
        state.catalog.push(descriptor);
        maybe_publish_header(state).await?;
    }
    Ok(())
}

/// Publishes the header exactly once, as soon as every descriptor the
/// publisher announced is known (or, absent `onMetaData`, as soon as the
/// first descriptor arrives — a single-track publisher with no metadata).
/// Flushes any packets buffered while waiting.
async fn maybe_publish_header(state: &mut PublishState) -> Result<()> {
    if state.header_published {
        return Ok(());
    }
    let ready = if state.metadata_seen {
        state.expects_video == state.video_descriptor_index.is_some()
            && state.expects_audio == state.audio_descriptor_index.is_some()
    } else {
        state.video_descriptor_index.is_some() || state.audio_descriptor_index.is_some()
    };
    if !ready {
        return Ok(());
    }
    if let Some(channel) = &state.channel {
        channel.set_streams(state.catalog.clone()).await?;
        state.header_published = true;
        for packet in state.pending.drain(..) {
            channel.queue.write_packet(packet).await?;
        }
    }
    Ok(())
}

async fn write_packet(state: &mut PublishState, packet: Packet) -> Result<()> {
    if state.header_published {
        if let Some(channel) = &state.channel {
            channel.queue.write_packet(packet).await?;
        }
    } else {
        state.pending.push(packet);
    }
    Ok(())
}

fn parse_avc_decoder_config(body: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    if body.len() < 8 {
        return None;
    }
    let mut offset = 5usize;
    let num_sps = body[offset] & 0x1F;
    offset += 1;
    if num_sps == 0 || offset + 2 > body.len() {
        return None;
    }
    let sps_len = u16::from_be_bytes([body[offset], body[offset + 1]]) as usize;
    offset += 2;
    if offset + sps_len > body.len() {
        return None;
    }
    let sps = body[offset..offset + sps_len].to_vec();
    offset += sps_len;

    if offset >= body.len() {
        return None;
    }
    let _num_pps = body[offset];
    offset += 1;
    if offset + 2 > body.len() {
        return None;
    }
    let pps_len = u16::from_be_bytes([body[offset], body[offset + 1]]) as usize;
    offset += 2;
    if offset + pps_len > body.len() {
        return None;
    }
    let pps = body[offset..offset + pps_len].to_vec();
    Some((sps, pps))
}

/// HEVCDecoderConfigurationRecord (ISO/IEC 14496-15 §8.3.3.1): a fixed
/// 22-byte header followed by `numOfArrays` NAL-unit arrays, each carrying
/// `numNalus` length-prefixed NAL units. We only need the first VPS/SPS/PPS.
fn parse_hevc_decoder_config(body: &[u8]) -> Option<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    if body.len() < 23 {
        return None;
    }
    let num_arrays = body[22];
    let mut offset = 23usize;
    let mut vps = None;
    let mut sps = None;
    let mut pps = None;
    for _ in 0..num_arrays {
        if offset + 3 > body.len() {
            break;
        }
        let nal_unit_type = body[offset] & 0x3F;
        let num_nalus = u16::from_be_bytes([body[offset + 1], body[offset + 2]]) as usize;
        offset += 3;
        for _ in 0..num_nalus {
            if offset + 2 > body.len() {
                return None;
            }
            let len = u16::from_be_bytes([body[offset], body[offset + 1]]) as usize;
            offset += 2;
            if offset + len > body.len() {
                return None;
            }
            let nalu = body[offset..offset + len].to_vec();
            offset += len;
            match nal_unit_type {
                32 => vps.get_or_insert(nalu),
                33 => sps.get_or_insert(nalu),
                34 => pps.get_or_insert(nalu),
                _ => continue,
            };
        }
    }
    Some((vps?, sps?, pps?))
}

