//! H.265 Annex-B/AVCC conversion and keyframe decoration. Same shape as
//! `bridge::h264`, generalised for the two-byte NAL header and VPS/SPS/PPS
//! triple (spec §3's `CodecDescriptor::H265`), grounded on
//! `liveion/src/recorder/codec/h265.rs`, including its use of
//! `scuffle_h265::SpsNALUnit` to pull picture dimensions out of the SPS.

use std::io::Cursor;

use bytes::{Bytes, BytesMut};
use scuffle_h265::SpsNALUnit;

use super::{nalus_to_avcc, split_annex_b, split_avcc};
use crate::packet::CodecDescriptor;

pub const NAL_VPS: u8 = 32;
pub const NAL_SPS: u8 = 33;
pub const NAL_PPS: u8 = 34;
/// IDR_W_RADL..CRA_NUT inclusive (ITU-T H.265 Table 7-1) covers every
/// self-contained random-access picture type.
const NAL_IRAP_RANGE: std::ops::RangeInclusive<u8> = 16..=23;

/// H.265 NAL unit type occupies bits 1..6 of the first header byte.
pub fn nal_type(nalu: &[u8]) -> Option<u8> {
    nalu.first().map(|b| (b >> 1) & 0x3F)
}

pub fn is_irap_type(t: u8) -> bool {
    NAL_IRAP_RANGE.contains(&t)
}

pub fn is_irap_nalu(nalu: &[u8]) -> bool {
    nal_type(nalu).map(is_irap_type).unwrap_or(false)
}

/// Pulls cropped picture width/height out of the SPS via
/// `scuffle_h265::SpsNALUnit`, the same parser the teacher's recorder uses
/// (`liveion/src/recorder/codec/h265.rs::update_codec_info`).
pub fn sps_dimensions(sps: &[u8]) -> Option<(u16, u16)> {
    let parsed = SpsNALUnit::parse(Cursor::new(sps)).ok()?;
    Some((
        parsed.rbsp.cropped_width() as u16,
        parsed.rbsp.cropped_height() as u16,
    ))
}

pub fn descriptor_from_params(vps: Bytes, sps: Bytes, pps: Bytes) -> CodecDescriptor {
    let (width, height) = sps_dimensions(&sps).unwrap_or((0, 0));
    CodecDescriptor::H265 {
        vps,
        sps,
        pps,
        width,
        height,
    }
}

pub fn annex_b_to_avcc(data: &[u8]) -> (Bytes, bool) {
    let nalus = split_annex_b(data);
    let is_key = nalus.iter().any(|n| is_irap_nalu(n));
    (nalus_to_avcc(nalus), is_key)
}

/// Injects VPS, SPS, PPS (in that order) before the first IRAP NAL, unless
/// all three are already present in the access unit (spec §4.2).
pub fn decorate_keyframe(avcc: &[u8], vps: &[u8], sps: &[u8], pps: &[u8]) -> Bytes {
    let nalus = split_avcc(avcc);
    let has_vps = nalus.iter().any(|n| nal_type(n) == Some(NAL_VPS));
    let has_sps = nalus.iter().any(|n| nal_type(n) == Some(NAL_SPS));
    let has_pps = nalus.iter().any(|n| nal_type(n) == Some(NAL_PPS));
    let has_irap = nalus.iter().any(|n| is_irap_nalu(n));
    if !has_irap || (has_vps && has_sps && has_pps) {
        return Bytes::copy_from_slice(avcc);
    }
    let mut out = BytesMut::new();
    let mut injected = false;
    for nalu in nalus {
        if !injected && is_irap_nalu(nalu) {
            for (present, set) in [(has_vps, vps), (has_sps, sps), (has_pps, pps)] {
                if !present {
                    out.extend_from_slice(&(set.len() as u32).to_be_bytes());
                    out.extend_from_slice(set);
                }
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
    fn irap_detection() {
        // type 19 (IDR_W_RADL) in bits 1..6: byte = 19 << 1 = 0x26.
        assert!(is_irap_nalu(&[0x26, 0x01]));
        // type 1 (TRAIL_R) is not IRAP.
        assert!(!is_irap_nalu(&[0x02, 0x01]));
    }

    #[test]
    fn decorate_keyframe_injects_vps_sps_pps() {
        let vps = [0x40, 0x01];
        let sps = [0x42, 0x01];
        let pps = [0x44, 0x01];
        let idr = nalus_to_avcc(vec![&[0x26u8, 0x01][..]]);
        let decorated = decorate_keyframe(&idr, &vps, &sps, &pps);
        let units = split_avcc(&decorated);
        assert_eq!(units, vec![&vps[..], &sps[..], &pps[..], &[0x26, 0x01][..]]);
    }
}
