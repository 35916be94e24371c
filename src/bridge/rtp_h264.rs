//! RTP packetisation/depacketisation for H.264 (RFC 6184): FU-A
//! fragmentation/aggregation and STAP-A aggregation (spec §4.2).
//!
//! Depacketisation is grounded on `liveion/src/recorder/rtp_h264.rs`'s
//! `H264RtpParser`, generalised to (a) emit AVCC framing (the in-queue
//! canonical form, spec §6) rather than Annex-B, and (b) reject a
//! continuation/end FU-A fragment that arrives without a prior start
//! fragment with `NonStartingFragment`, per spec §4.2, instead of silently
//! ignoring it. Packetisation (the reverse direction, needed for RTSP/WebRTC
//! egress) has no teacher analogue — `liveion` only ever receives RTP, it
//! never re-emits H.264 over RTP itself — so it is written fresh against
//! RFC 6184 using the `webrtc` crate's `rtp::packet::Packet` type, which is
//! already a transitive dependency via the teacher's `webrtc` crate.

use bytes::{Bytes, BytesMut};
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;

use crate::bridge::{h264, RTP_MTU};
use crate::error::{RelayError, Result};

const FU_A: u8 = 28;
const STAP_A: u8 = 24;

/// Per-`(ssrc, stream)` FU-A reassembly state (spec §4.2).
#[derive(Default)]
pub struct H264Depacketizer {
    buffer: BytesMut,
    is_key: bool,
    fragment_in_progress: bool,
}

impl H264Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one RTP packet. Returns `Some((avcc_access_unit, is_key))` when
    /// the packet's marker bit completes an access unit.
    pub fn push(&mut self, packet: &Packet) -> Result<Option<(Bytes, bool)>> {
        let payload = &packet.payload;
        if payload.is_empty() {
            return Ok(None);
        }
        let nal_type = payload[0] & h264::NAL_TYPE_MASK;
        match nal_type {
            1..=23 => {
                self.push_nalu(payload);
            }
            STAP_A => {
                let mut offset = 1;
                while offset + 2 <= payload.len() {
                    let size = ((payload[offset] as usize) << 8) | payload[offset + 1] as usize;
                    offset += 2;
                    if offset + size > payload.len() {
                        return Err(RelayError::format("truncated STAP-A aggregation unit"));
                    }
                    self.push_nalu(&payload[offset..offset + size]);
                    offset += size;
                }
            }
            FU_A => {
                if payload.len() < 2 {
                    return Err(RelayError::format("FU-A payload too short"));
                }
                let fu_header = payload[1];
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;
                let reconstructed_type = fu_header & h264::NAL_TYPE_MASK;
                let nri = payload[0] & 0x60;
                if start {
                    self.fragment_in_progress = true;
                    let header = nri | reconstructed_type;
                    if reconstructed_type == h264::NAL_SLICE_IDR {
                        self.is_key = true;
                    }
                    self.buffer.extend_from_slice(&(0u32).to_be_bytes()); // length placeholder
                    self.buffer.extend_from_slice(&[header]);
                    self.buffer.extend_from_slice(&payload[2..]);
                } else {
                    if !self.fragment_in_progress {
                        return Err(RelayError::format(
                            "FU-A continuation without a preceding start fragment",
                        ));
                    }
                    self.buffer.extend_from_slice(&payload[2..]);
                }
                if end {
                    self.fragment_in_progress = false;
                    self.fix_up_length_placeholder();
                }
            }
            _ => return Err(RelayError::format(format!("unsupported NAL type {nal_type}"))),
        }

        if packet.header.marker {
            let mut out = BytesMut::new();
            std::mem::swap(&mut out, &mut self.buffer);
            let is_key = self.is_key;
            self.is_key = false;
            self.fragment_in_progress = false;
            Ok(Some((out.freeze(), is_key)))
        } else {
            Ok(None)
        }
    }

    fn push_nalu(&mut self, nalu: &[u8]) {
        if nalu.first().map(|b| b & h264::NAL_TYPE_MASK) == Some(h264::NAL_SLICE_IDR) {
            self.is_key = true;
        }
        self.buffer.extend_from_slice(&(nalu.len() as u32).to_be_bytes());
        self.buffer.extend_from_slice(nalu);
    }

    /// The most recently appended entry was a length-prefixed NALU whose
    /// length placeholder was written as 0 before the FU-A fragments that
    /// make it up were known in full; patch it in now that `end` arrived.
    fn fix_up_length_placeholder(&mut self) {
        // Find the last 4-byte length field we wrote as a placeholder: it is
        // always the last one preceding the tail of the buffer we've been
        // appending raw FU-A payload bytes onto.
        if self.buffer.len() < 4 {
            return;
        }
        // Walk length-prefixed entries from the start to find the final one.
        let mut offset = 0usize;
        let mut last_len_offset = 0usize;
        while offset + 4 <= self.buffer.len() {
            let len = u32::from_be_bytes(self.buffer[offset..offset + 4].try_into().unwrap());
            if len == 0 {
                last_len_offset = offset;
                break;
            }
            offset += 4 + len as usize;
        }
        let nalu_len = (self.buffer.len() - last_len_offset - 4) as u32;
        self.buffer[last_len_offset..last_len_offset + 4].copy_from_slice(&nalu_len.to_be_bytes());
    }
}

/// Packetises one AVCC-framed access unit into RTP packets per RFC 6184:
/// NALUs under `RTP_MTU` are emitted as single-NALU packets (aggregated via
/// STAP-A where more than one fits a packet); larger NALUs are fragmented
/// with FU-A. The marker bit is set on the final packet of the unit.
pub fn packetize(
    avcc: &[u8],
    payload_type: u8,
    ssrc: u32,
    next_seq: &mut u16,
    timestamp: u32,
) -> Vec<Packet> {
    let nalus = super::split_avcc(avcc);
    let mut out = Vec::new();
    let mut pending_small: Vec<&[u8]> = Vec::new();

    let flush_small = |pending: &mut Vec<&[u8]>, out: &mut Vec<Packet>, seq: &mut u16| {
        if pending.is_empty() {
            return;
        }
        if pending.len() == 1 {
            out.push(make_packet(pending[0].to_vec(), payload_type, ssrc, *seq, timestamp, false));
        } else {
            let mut payload = BytesMut::new();
            payload.extend_from_slice(&[pending[0][0] & 0x60]); // STAP-A header reuses F|NRI of first NALU, type=24
            payload[0] |= STAP_A;
            for nalu in pending.iter() {
                payload.extend_from_slice(&(nalu.len() as u16).to_be_bytes());
                payload.extend_from_slice(nalu);
            }
            out.push(make_packet(payload.to_vec(), payload_type, ssrc, *seq, timestamp, false));
        }
        *seq = seq.wrapping_add(1);
        pending.clear();
    };

    for (idx, nalu) in nalus.iter().enumerate() {
        let is_last = idx + 1 == nalus.len();
        if nalu.len() > RTP_MTU {
            flush_small(&mut pending_small, &mut out, next_seq);
            fragment_fu_a(nalu, payload_type, ssrc, next_seq, timestamp, is_last, &mut out);
        } else {
            let combined: usize = pending_small.iter().map(|n| n.len() + 2).sum::<usize>() + nalu.len() + 2;
            if combined > RTP_MTU && !pending_small.is_empty() {
                flush_small(&mut pending_small, &mut out, next_seq);
            }
            pending_small.push(nalu);
            if is_last {
                flush_small(&mut pending_small, &mut out, next_seq);
            }
        }
    }
    if let Some(last) = out.last_mut() {
        last.header.marker = true;
    }
    out
}

fn fragment_fu_a(
    nalu: &[u8],
    payload_type: u8,
    ssrc: u32,
    next_seq: &mut u16,
    timestamp: u32,
    _is_last_nalu: bool,
    out: &mut Vec<Packet>,
) {
    let nri = nalu[0] & 0x60;
    let nal_type = nalu[0] & h264::NAL_TYPE_MASK;
    let body = &nalu[1..];
    let chunk_size = RTP_MTU - 2;
    let mut offset = 0;
    let chunks = body.chunks(chunk_size).collect::<Vec<_>>();
    let total = chunks.len();
    for (i, chunk) in chunks.into_iter().enumerate() {
        let start = i == 0;
        let end = i + 1 == total;
        let mut fu_header = nal_type;
        if start {
            fu_header |= 0x80;
        }
        if end {
            fu_header |= 0x40;
        }
        let mut payload = Vec::with_capacity(chunk.len() + 2);
        payload.push(FU_A | nri);
        payload.push(fu_header);
        payload.extend_from_slice(chunk);
        out.push(make_packet(payload, payload_type, ssrc, *next_seq, timestamp, false));
        *next_seq = next_seq.wrapping_add(1);
        offset += chunk.len();
    }
    let _ = offset;
}

fn make_packet(payload: Vec<u8>, payload_type: u8, ssrc: u32, seq: u16, timestamp: u32, marker: bool) -> Packet {
    Packet {
        header: Header {
            version: 2,
            padding: false,
            extension: false,
            marker,
            payload_type,
            sequence_number: seq,
            timestamp,
            ssrc,
            ..Default::default()
        },
        payload: Bytes::from(payload),
    }
}

/// Converts a presentation timestamp to the 90 kHz RTP clock used by video
/// (spec §4.2: "RTP timestamp = pts * 90000 / 1s").
pub fn rtp_timestamp_90k(pts: std::time::Duration) -> u32 {
    (pts.as_nanos() as u128 * 90_000 / 1_000_000_000) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_rtp_packet(payload: Vec<u8>, marker: bool) -> Packet {
        make_packet(payload, 96, 1, 0, 0, marker)
    }

    #[test]
    fn depacketise_single_nalu() {
        let mut d = H264Depacketizer::new();
        let pkt = single_rtp_packet(vec![0x65, 0xAA, 0xBB], true);
        let (avcc, is_key) = d.push(&pkt).unwrap().unwrap();
        assert!(is_key);
        assert_eq!(&avcc[..], &[0, 0, 0, 3, 0x65, 0xAA, 0xBB]);
    }

    #[test]
    fn fu_a_continuation_without_start_errors() {
        let mut d = H264Depacketizer::new();
        // fu_header without start bit set (end=1, start=0)
        let pkt = single_rtp_packet(vec![FU_A, 0x40 | 0x05, 0xAA], true);
        assert!(d.push(&pkt).is_err());
    }

    #[test]
    fn packetise_then_depacketise_round_trip_small_nalu() {
        let avcc = super::super::nalus_to_avcc(vec![&[0x67u8, 0x42, 0x00, 0x1f][..]]);
        let mut seq = 0u16;
        let packets = packetize(&avcc, 96, 1, &mut seq, 0);
        assert_eq!(packets.len(), 1);
        let mut d = H264Depacketizer::new();
        let (out, _) = d.push(&packets[0]).unwrap().unwrap();
        assert_eq!(&out[..], &avcc[..]);
    }

    #[test]
    fn packetise_large_nalu_uses_fu_a_and_reassembles() {
        let big_nalu: Vec<u8> = std::iter::once(0x65u8)
            .chain((0..3000u32).map(|i| (i % 251) as u8))
            .collect();
        let avcc = super::super::nalus_to_avcc(vec![&big_nalu[..]]);
        let mut seq = 0u16;
        let packets = packetize(&avcc, 96, 1, &mut seq, 0);
        assert!(packets.len() > 1);
        let mut d = H264Depacketizer::new();
        let mut result = None;
        for p in &packets {
            if let Some(r) = d.push(p).unwrap() {
                result = Some(r);
            }
        }
        let (out, is_key) = result.expect("access unit should complete on marker");
        assert!(is_key);
        assert_eq!(&out[..], &avcc[..]);
    }
}
