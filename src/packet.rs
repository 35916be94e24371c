//! Wire-agnostic media data model (spec §3): `Packet` and `CodecDescriptor`.
//!
//! These types never carry protocol framing (no RTP header, no FLV tag header,
//! no RTSP interleave marker) — only the canonical in-queue payload shape
//! documented in spec §6. `FormatBridge` (`crate::bridge`) converts to and
//! from this shape at the ingest/egress edges.

use std::time::Duration;

use bytes::Bytes;

/// One elementary-stream access unit, in canonical in-queue framing.
#[derive(Debug, Clone)]
pub struct Packet {
    pub stream_index: u8,
    pub pts: Duration,
    pub composition_offset: Duration,
    pub duration: Duration,
    pub is_key: bool,
    pub payload: Bytes,
}

impl Packet {
    pub fn video(stream_index: u8, pts: Duration, is_key: bool, payload: Bytes) -> Self {
        Packet {
            stream_index,
            pts,
            composition_offset: Duration::ZERO,
            duration: Duration::ZERO,
            is_key,
            payload,
        }
    }

    pub fn audio(stream_index: u8, pts: Duration, payload: Bytes) -> Self {
        Packet {
            stream_index,
            pts,
            composition_offset: Duration::ZERO,
            duration: Duration::ZERO,
            is_key: false,
            payload,
        }
    }
}

/// Per-stream header describing one elementary stream (spec §3). Immutable
/// once a `Channel` has been published.
#[derive(Debug, Clone, PartialEq)]
pub enum CodecDescriptor {
    H264 {
        sps: Bytes,
        pps: Bytes,
        width: u16,
        height: u16,
        profile: u8,
        level: u8,
    },
    H265 {
        vps: Bytes,
        sps: Bytes,
        pps: Bytes,
        width: u16,
        height: u16,
    },
    Aac {
        object_type: u8,
        sample_rate: u32,
        channel_count: u8,
        config_bytes: Bytes,
    },
    Opus {
        channel_count: u8,
    },
    PcmAlaw {
        sample_rate: u32,
    },
    PcmMulaw {
        sample_rate: u32,
    },
    Vp8,
    Vp9,
    Av1,
    Jpeg,
    Mjpeg,
    Nellymoser,
    Speex,
}

impl CodecDescriptor {
    /// True for the codecs eligible to be the "primary video stream" that
    /// drives PacketQueue keyframe catch-up (spec §4.1).
    pub fn is_video(&self) -> bool {
        matches!(
            self,
            CodecDescriptor::H264 { .. }
                | CodecDescriptor::H265 { .. }
                | CodecDescriptor::Vp8
                | CodecDescriptor::Vp9
                | CodecDescriptor::Av1
                | CodecDescriptor::Jpeg
                | CodecDescriptor::Mjpeg
        )
    }

    pub fn is_audio(&self) -> bool {
        !self.is_video()
    }

    /// Whether this video codec participates in catch-up keyframe scanning
    /// (spec §4.1: "first stream with H264|H265|VP8|VP9|AV1").
    pub fn is_catchup_video(&self) -> bool {
        matches!(
            self,
            CodecDescriptor::H264 { .. }
                | CodecDescriptor::H265 { .. }
                | CodecDescriptor::Vp8
                | CodecDescriptor::Vp9
                | CodecDescriptor::Av1
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            CodecDescriptor::H264 { .. } => "h264",
            CodecDescriptor::H265 { .. } => "h265",
            CodecDescriptor::Aac { .. } => "aac",
            CodecDescriptor::Opus { .. } => "opus",
            CodecDescriptor::PcmAlaw { .. } => "pcma",
            CodecDescriptor::PcmMulaw { .. } => "pcmu",
            CodecDescriptor::Vp8 => "vp8",
            CodecDescriptor::Vp9 => "vp9",
            CodecDescriptor::Av1 => "av1",
            CodecDescriptor::Jpeg => "jpeg",
            CodecDescriptor::Mjpeg => "mjpeg",
            CodecDescriptor::Nellymoser => "nellymoser",
            CodecDescriptor::Speex => "speex",
        }
    }
}

/// Per-stream header for a `Channel`, frozen at publish start (spec §3).
pub type CodecCatalog = Vec<CodecDescriptor>;

/// Returns the index of the first video-eligible stream, per the catch-up
/// rule in spec §4.1 ("primary video stream").
pub fn primary_video_index(streams: &[CodecDescriptor]) -> Option<usize> {
    streams.iter().position(CodecDescriptor::is_catchup_video)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_video_index_skips_audio() {
        let streams = vec![
            CodecDescriptor::Aac {
                object_type: 2,
                sample_rate: 44100,
                channel_count: 2,
                config_bytes: Bytes::new(),
            },
            CodecDescriptor::H264 {
                sps: Bytes::new(),
                pps: Bytes::new(),
                width: 1280,
                height: 720,
                profile: 100,
                level: 31,
            },
        ];
        assert_eq!(primary_video_index(&streams), Some(1));
    }

    #[test]
    fn primary_video_index_none_for_audio_only() {
        let streams = vec![CodecDescriptor::Opus { channel_count: 2 }];
        assert_eq!(primary_video_index(&streams), None);
    }
}
