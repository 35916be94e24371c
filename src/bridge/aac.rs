//! AAC LATM/ADTS/MPEG4-GENERIC RTP framing and `config=` fmtp parsing
//! (spec §4.2). Grounded on `libs/rtsp/src/sdp.rs`'s fmtp-attribute parsing
//! pattern (`extract_h264_params`'s "split on `;`, match key, decode value"
//! shape), extended here for the `config=` hex AudioSpecificConfig field
//! that file does not parse (it only handles video fmtp).

use bytes::{Bytes, BytesMut};
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;

use crate::error::{RelayError, Result};
use crate::packet::CodecDescriptor;

/// MPEG-4 Audio object types relevant here (ISO/IEC 14496-3 Table 1.17).
pub const AOT_AAC_LC: u8 = 2;

/// Decodes an AudioSpecificConfig (the `config=` fmtp hex string) into
/// `(object_type, sample_rate, channel_count)`.
pub fn parse_audio_specific_config(bytes: &[u8]) -> Option<(u8, u32, u8)> {
    if bytes.len() < 2 {
        return None;
    }
    let b0 = bytes[0];
    let b1 = bytes[1];
    let object_type = b0 >> 3;
    let freq_index = ((b0 & 0x07) << 1) | (b1 >> 7);
    let channel_config = (b1 >> 3) & 0x0F;
    const SAMPLE_RATES: [u32; 13] = [
        96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
    ];
    let sample_rate = *SAMPLE_RATES.get(freq_index as usize)?;
    Some((object_type, sample_rate, channel_config))
}

/// Parses the `config=` hex parameter out of a raw fmtp value string, e.g.
/// `"profile-level-id=1;mode=AAC-hbr;sizeLength=13;indexLength=3;\
/// indexDeltaLength=3;config=1190"`.
pub fn parse_config_fmtp(fmtp: &str) -> Option<Bytes> {
    for kv in fmtp.split(';') {
        let mut parts = kv.trim().splitn(2, '=');
        let key = parts.next()?.trim();
        let value = parts.next()?.trim();
        if key.eq_ignore_ascii_case("config") {
            return hex_decode(value).map(Bytes::from);
        }
    }
    None
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

pub fn descriptor_from_config(config_bytes: Bytes) -> Option<CodecDescriptor> {
    let (object_type, sample_rate, channel_count) = parse_audio_specific_config(&config_bytes)?;
    Some(CodecDescriptor::Aac {
        object_type,
        sample_rate,
        channel_count,
        config_bytes,
    })
}

/// Strips a 7-byte ADTS header off one AAC frame, returning the raw frame
/// (the in-queue canonical form carries no ADTS header, spec §6).
pub fn strip_adts(frame: &[u8]) -> Result<Bytes> {
    if frame.len() < 7 || frame[0] != 0xFF || frame[1] & 0xF0 != 0xF0 {
        return Err(RelayError::format("not an ADTS frame"));
    }
    let protection_absent = frame[1] & 0x01 == 1;
    let header_len = if protection_absent { 7 } else { 9 };
    if frame.len() < header_len {
        return Err(RelayError::format("truncated ADTS header"));
    }
    Ok(Bytes::copy_from_slice(&frame[header_len..]))
}

/// One raw AAC frame per RTP packet (MPEG4-GENERIC, spec §6): a 4-byte
/// AU-header-length + AU-header section (`sizeLength=13;indexLength=3;
/// indexDeltaLength=3`) followed by the frame payload.
pub fn depacketize(packet: &Packet) -> Result<Bytes> {
    let payload = &packet.payload;
    if payload.len() < 2 {
        return Err(RelayError::format("AAC RTP payload too short"));
    }
    let au_headers_len_bits = u16::from_be_bytes([payload[0], payload[1]]);
    let au_headers_len_bytes = (au_headers_len_bits as usize).div_ceil(8);
    let start = 2 + au_headers_len_bytes;
    if payload.len() < start {
        return Err(RelayError::format("AAC RTP payload missing frame data"));
    }
    Ok(Bytes::copy_from_slice(&payload[start..]))
}

/// Packetises one raw AAC frame as a single RTP packet: `size=13, index=3,
/// delta=3` AU header (spec §4.2).
pub fn packetize(frame: &[u8], payload_type: u8, ssrc: u32, seq: u16, timestamp: u32) -> Packet {
    let au_size_bits: u16 = (frame.len() as u16) << 3; // 13-bit size, left-aligned in a 16-bit AU-header
    let mut payload = BytesMut::with_capacity(4 + frame.len());
    payload.extend_from_slice(&16u16.to_be_bytes()); // AU-headers-length in bits (one 16-bit header)
    payload.extend_from_slice(&au_size_bits.to_be_bytes());
    payload.extend_from_slice(frame);
    Packet {
        header: Header {
            version: 2,
            marker: true,
            payload_type,
            sequence_number: seq,
            timestamp,
            ssrc,
            ..Default::default()
        },
        payload: payload.freeze(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_fmtp_parses_hex() {
        // 0x1190 => AAC-LC (object type 2), 44100 Hz (index 4), stereo.
        let parsed = parse_config_fmtp(
            "profile-level-id=1;mode=AAC-hbr;sizeLength=13;indexLength=3;indexDeltaLength=3;config=1190",
        )
        .unwrap();
        assert_eq!(&parsed[..], &[0x11, 0x90]);
        let (object_type, sample_rate, channels) = parse_audio_specific_config(&parsed).unwrap();
        assert_eq!(object_type, AOT_AAC_LC);
        assert_eq!(sample_rate, 44100);
        assert_eq!(channels, 2);
    }

    #[test]
    fn strip_adts_removes_seven_byte_header() {
        let mut frame = vec![0xFF, 0xF1, 0x4C, 0x80, 0x01, 0x1F, 0xFC];
        frame.extend_from_slice(&[1, 2, 3]);
        let raw = strip_adts(&frame).unwrap();
        assert_eq!(&raw[..], &[1, 2, 3]);
    }

    #[test]
    fn packetize_then_depacketize_round_trip() {
        let frame = [1u8, 2, 3, 4, 5];
        let packet = packetize(&frame, 97, 1, 0, 0);
        let out = depacketize(&packet).unwrap();
        assert_eq!(&out[..], &frame[..]);
    }
}
