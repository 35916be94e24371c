//! H.264 Annex-B/AVCC conversion, SPS/PPS extraction, keyframe decoration
//! (spec §4.2). Grounded on `liveion/src/recorder/codec/h264.rs`
//! (`H264Adapter::parse_dimensions`, SPS profile/level byte offsets).

use bytes::{Bytes, BytesMut};
use h264_reader::nal::sps::SeqParameterSet;
use h264_reader::rbsp::{decode_nal, BitReader};

use super::{nalus_to_avcc, split_annex_b, split_avcc};
use crate::packet::CodecDescriptor;

pub const NAL_TYPE_MASK: u8 = 0x1F;
pub const NAL_SLICE_IDR: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;

pub fn nal_type(nalu: &[u8]) -> Option<u8> {
    nalu.first().map(|b| b & NAL_TYPE_MASK)
}

pub fn is_idr_nalu(nalu: &[u8]) -> bool {
    nal_type(nalu) == Some(NAL_SLICE_IDR)
}

/// Parses width/height/profile/level out of an SPS NAL (without start code
/// or length prefix), per `liveion`'s `parse_dimensions`/`update_codec_string`.
pub fn parse_sps(sps: &[u8]) -> Option<(u16, u16, u8, u8)> {
    if sps.len() < 4 {
        return None;
    }
    let profile_idc = sps[1];
    let level_idc = sps[3];
    let rbsp = decode_nal(sps).ok()?;
    let parsed = SeqParameterSet::from_bits(BitReader::new(&rbsp[..])).ok()?;
    let (w, h) = parsed.pixel_dimensions().ok()?;
    Some((w as u16, h as u16, profile_idc, level_idc))
}

pub fn descriptor_from_params(sps: Bytes, pps: Bytes) -> CodecDescriptor {
    let (width, height, profile, level) = parse_sps(&sps).unwrap_or((0, 0, 0, 0));
    CodecDescriptor::H264 {
        sps,
        pps,
        width,
        height,
        profile,
        level,
    }
}

/// Converts an Annex-B access unit (one or more start-code-delimited NALs)
/// into AVCC framing, reporting whether it contains an IDR slice.
pub fn annex_b_to_avcc(data: &[u8]) -> (Bytes, bool) {
    let nalus = split_annex_b(data);
    let is_key = nalus.iter().any(|n| is_idr_nalu(n));
    (nalus_to_avcc(nalus), is_key)
}

/// Injects SPS then PPS immediately before the first IDR NAL in an AVCC
/// access unit, unless parameter sets are already present (spec §4.2:
/// "Keyframe decoration"). No-op on non-keyframe payloads.
pub fn decorate_keyframe(avcc: &[u8], sps: &[u8], pps: &[u8]) -> Bytes {
    let nalus = split_avcc(avcc);
    let has_sps = nalus.iter().any(|n| nal_type(n) == Some(NAL_SPS));
    let has_pps = nalus.iter().any(|n| nal_type(n) == Some(NAL_PPS));
    let has_idr = nalus.iter().any(|n| is_idr_nalu(n));
    if !has_idr || (has_sps && has_pps) {
        return Bytes::copy_from_slice(avcc);
    }
    let mut out = BytesMut::new();
    let mut injected = false;
    for nalu in nalus {
        if !injected && is_idr_nalu(nalu) {
            if !has_sps {
                out.extend_from_slice(&(sps.len() as u32).to_be_bytes());
                out.extend_from_slice(sps);
            }
            if !has_pps {
                out.extend_from_slice(&(pps.len() as u32).to_be_bytes());
                out.extend_from_slice(pps);
            }
            injected = true;
        }
        out.extend_from_slice(&(nalu.len() as u32).to_be_bytes());
        out.extend_from_slice(nalu);
    }
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annex_b_to_avcc_detects_idr() {
        let data = [0, 0, 0, 1, 0x65, 0xAA, 0xBB];
        let (avcc, is_key) = annex_b_to_avcc(&data);
        assert!(is_key);
        assert_eq!(&avcc[..], &[0, 0, 0, 3, 0x65, 0xAA, 0xBB]);
    }

    #[test]
    fn decorate_keyframe_injects_sps_pps_once() {
        let sps = [0x67, 0x42, 0x00, 0x1f];
        let pps = [0x68, 0xCE];
        let idr = super::nalus_to_avcc(vec![&[0x65u8, 0x01, 0x02][..]]);
        let decorated = decorate_keyframe(&idr, &sps, &pps);
        let units = split_avcc(&decorated);
        assert_eq!(units, vec![&sps[..], &pps[..], &[0x65, 0x01, 0x02][..]]);
    }

    #[test]
    fn decorate_keyframe_skips_when_already_present() {
        let sps = [0x67, 0x42, 0x00, 0x1f];
        let pps = [0x68, 0xCE];
        let avcc = super::nalus_to_avcc(vec![&sps[..], &pps[..], &[0x65u8, 0x01][..]]);
        let decorated = decorate_keyframe(&avcc, &sps, &pps);
        assert_eq!(&decorated[..], &avcc[..]);
    }

    #[test]
    fn decorate_keyframe_noop_on_delta_frame() {
        let avcc = super::nalus_to_avcc(vec![&[0x61u8, 0x01][..]]);
        let decorated = decorate_keyframe(&avcc, &[0x67], &[0x68]);
        assert_eq!(&decorated[..], &avcc[..]);
    }
}
