//! FormatBridge (spec §4.2): pure converters between Annex-B, AVCC, RTP and
//! FLV framing. Grounded on `liveion/src/recorder/codec/h264.rs` /
//! `h265.rs` (Annex-B → AVCC + SPS/PPS extraction) and `liveion/src/recorder/
//! rtp_h264.rs` (RTP depacketisation), extended with the packetisation and
//! FLV-muxing directions the recorder path never needed (it only consumes
//! RTP, it never re-emits it).
//!
//! All functions here are pure or per-stream-stateful; none touch the
//! `Registry`/`PacketQueue`. Format errors are handled at the call site by
//! logging and dropping the offending access unit (spec §4.2's error
//! policy) — this module itself returns `Result` so callers can do that
//! uniformly.

pub mod aac;
pub mod flv;
pub mod h264;
pub mod h265;
pub mod rtp_h264;
pub mod rtp_h265;

pub const RTP_MTU: usize = 1200;

/// Splits an Annex-B byte stream (start-code delimited, `00 00 01` or
/// `00 00 00 01`) into individual NAL units (without start codes).
pub fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push(i + 3);
            i += 3;
        } else if i + 3 < data.len() && data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 0 && data[i + 3] == 1 {
            starts.push(i + 4);
            i += 4;
        } else {
            i += 1;
        }
    }
    for (idx, &start) in starts.iter().enumerate() {
        let end = starts
            .get(idx + 1)
            .map(|&next| {
                // Back off over the start code we just found.
                let mut e = next;
                while e > start && data[e - 1] == 0 {
                    e -= 1;
                }
                e
            })
            .unwrap_or(data.len());
        if end > start {
            units.push(&data[start..end]);
        }
    }
    units
}

/// Wraps a sequence of NAL units in length-prefixed (AVCC) framing: a
/// 4-byte big-endian length followed by the NAL bytes, per spec §6.
pub fn nalus_to_avcc(nalus: impl IntoIterator<Item = impl AsRef<[u8]>>) -> bytes::Bytes {
    let mut out = bytes::BytesMut::new();
    for nalu in nalus {
        let nalu = nalu.as_ref();
        out.extend_from_slice(&(nalu.len() as u32).to_be_bytes());
        out.extend_from_slice(nalu);
    }
    out.freeze()
}

/// Splits AVCC-framed payload (spec §6) back into individual NAL units.
pub fn split_avcc(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut offset = 0;
    while offset + 4 <= data.len() {
        let len = u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
        offset += 4;
        if offset + len > data.len() {
            break;
        }
        units.push(&data[offset..offset + len]);
        offset += len;
    }
    units
}

/// Wraps a sequence of NAL units in Annex-B framing (4-byte start codes),
/// the form `webrtc::track::track_local::track_local_static_sample`'s
/// built-in H.264/H.265 payloaders expect (spec §4.4.4 "sample mode").
pub fn nalus_to_annex_b(nalus: impl IntoIterator<Item = impl AsRef<[u8]>>) -> bytes::Bytes {
    let mut out = bytes::BytesMut::new();
    for nalu in nalus {
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(nalu.as_ref());
    }
    out.freeze()
}

/// Converts AVCC-framed payload (the in-queue canonical form, spec §6) to
/// Annex-B, for handing off to a `TrackLocalStaticSample`.
pub fn avcc_to_annex_b(data: &[u8]) -> bytes::Bytes {
    nalus_to_annex_b(split_avcc(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_annex_b_handles_both_start_code_widths() {
        let data = [
            0, 0, 0, 1, 0x67, 0xAA, 0xBB, 0, 0, 1, 0x68, 0xCC, 0, 0, 0, 1, 0x65, 0xDD, 0xEE,
        ];
        let units = split_annex_b(&data);
        assert_eq!(units, vec![&[0x67u8, 0xAA, 0xBB][..], &[0x68, 0xCC], &[0x65, 0xDD, 0xEE]]);
    }

    #[test]
    fn avcc_round_trip() {
        let nalus: Vec<&[u8]> = vec![&[0x67, 0x01, 0x02], &[0x68, 0x03]];
        let avcc = nalus_to_avcc(nalus.clone());
        let split = split_avcc(&avcc);
        assert_eq!(split, nalus);
    }

    #[test]
    fn avcc_to_annex_b_uses_four_byte_start_codes() {
        let avcc = nalus_to_avcc(vec![&[0x67u8, 0x01][..], &[0x68, 0x02]]);
        let annex_b = avcc_to_annex_b(&avcc);
        assert_eq!(&annex_b[..], &[0, 0, 0, 1, 0x67, 0x01, 0, 0, 0, 1, 0x68, 0x02][..]);
    }
}
