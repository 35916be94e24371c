//! Drives a channel through `FlvMuxState` the way `egress::http_flv::run`
//! does: file header, then sequence headers, then one tag per queued
//! packet, confirming the byte-level framing the spec's transport-layer
//! contract (spec §8, S1) describes survives the registry/queue plumbing.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use relay::bridge::flv::FlvMuxState;
use relay::packet::{CodecDescriptor, Packet};
use relay::queue::ReadOutcome;
use relay::registry::Registry;

const FLV_SIGNATURE: [u8; 4] = [0x46, 0x4C, 0x56, 0x01];
const TAG_TYPE_VIDEO: u8 = 9;

fn aac_h264_catalog() -> Vec<CodecDescriptor> {
    vec![
        CodecDescriptor::H264 {
            sps: Bytes::from_static(&[0x67, 0x42, 0x00, 0x1f]),
            pps: Bytes::from_static(&[0x68, 0xCE]),
            width: 1280,
            height: 720,
            profile: 100,
            level: 31,
        },
        CodecDescriptor::Aac {
            object_type: 2,
            sample_rate: 44100,
            channel_count: 2,
            config_bytes: Bytes::from_static(&[0x12, 0x10]),
        },
    ]
}

#[tokio::test]
async fn published_packets_mux_into_a_well_formed_flv_byte_stream() {
    let registry = Arc::new(Registry::new(16));
    let (channel, _) = registry.create("/live/flv").await;
    let catalog = aac_h264_catalog();
    channel.set_streams(catalog.clone()).await.unwrap();

    channel
        .queue
        .write_packet(Packet::video(0, Duration::from_millis(0), true, Bytes::from_static(b"idr")))
        .await
        .unwrap();
    channel
        .queue
        .write_packet(Packet::audio(1, Duration::from_millis(0), Bytes::from_static(b"aac-frame")))
        .await
        .unwrap();

    let mut cursor = channel.subscribe().await.unwrap();
    let mut mux = FlvMuxState::new();

    let header = mux.file_header(true, true).unwrap();
    assert_eq!(&header[..4], &FLV_SIGNATURE);

    let sequence = mux.sequence_headers(&catalog).unwrap();
    assert!(!sequence.is_empty(), "both codecs in the catalog carry a sequence header");

    let mut tags_muxed = 0;
    for _ in 0..2 {
        let ReadOutcome::Packet(packet) = cursor.read_packet().await else {
            panic!("expected a packet");
        };
        let descriptor = &catalog[packet.stream_index as usize];
        let tag = mux.mux_packet(&packet, descriptor).unwrap();
        assert!(!tag.is_empty());
        if packet.stream_index == 0 {
            assert_eq!(tag[0], TAG_TYPE_VIDEO);
        }
        tags_muxed += 1;
    }
    assert_eq!(tags_muxed, 2);

    channel.unsubscribe();
    registry.remove("/live/flv").await;
}
