//! Exercises the publish/subscribe/shutdown lifecycle across `Registry`,
//! `Channel` and `PacketQueue` together, the way a real ingest/egress pair
//! would drive them, without any protocol transport in between.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use relay::packet::{CodecDescriptor, Packet};
use relay::queue::ReadOutcome;
use relay::registry::{ChannelState, Registry};

fn h264_catalog() -> Vec<CodecDescriptor> {
    vec![CodecDescriptor::H264 {
        sps: Bytes::from_static(&[0x67, 0x42, 0x00, 0x1f]),
        pps: Bytes::from_static(&[0x68, 0xCE]),
        width: 1280,
        height: 720,
        profile: 100,
        level: 31,
    }]
}

#[tokio::test]
async fn publish_then_late_subscriber_catches_up_from_a_keyframe() {
    let registry = Arc::new(Registry::new(32));
    let (channel, created) = registry.create("/live/room1").await;
    assert!(created);
    assert_eq!(channel.state().await, ChannelState::Live);

    channel.set_streams(h264_catalog()).await.unwrap();
    channel
        .queue
        .write_packet(Packet::video(0, Duration::from_millis(0), true, Bytes::from_static(b"idr-0")))
        .await
        .unwrap();
    for i in 1..4u64 {
        channel
            .queue
            .write_packet(Packet::video(0, Duration::from_millis(i * 10), false, Bytes::from_static(b"p")))
            .await
            .unwrap();
    }
    channel
        .queue
        .write_packet(Packet::video(0, Duration::from_millis(40), true, Bytes::from_static(b"idr-1")))
        .await
        .unwrap();

    // A viewer joining after several frames should land on the most recent
    // keyframe, never on a delta frame it can't decode.
    let mut cursor = channel.subscribe().await.unwrap();
    assert_eq!(channel.subscriber_count(), 1);
    let ReadOutcome::Packet(first) = cursor.read_packet().await else {
        panic!("expected a packet");
    };
    assert!(first.is_key);
    assert_eq!(first.pts, Duration::from_millis(40));

    channel.unsubscribe();
    assert_eq!(channel.subscriber_count(), 0);

    registry.remove("/live/room1").await;
    assert!(registry.get("/live/room1").await.is_none());
    matches!(cursor.read_packet().await, ReadOutcome::EndOfStream);
}

#[tokio::test]
async fn second_publish_to_a_live_path_is_rejected() {
    let registry = Registry::new(16);
    let (_first, created) = registry.create("/live/room2").await;
    assert!(created);
    let (_second, created_again) = registry.create("/live/room2").await;
    assert!(!created_again, "a live path must reject a second publisher");
}

#[tokio::test]
async fn shutdown_all_closes_every_channel_and_wakes_subscribers() {
    let registry = Arc::new(Registry::new(16));
    let (room_a, _) = registry.create("/live/a").await;
    let (room_b, _) = registry.create("/live/b").await;
    room_a.set_streams(h264_catalog()).await.unwrap();
    room_b.set_streams(h264_catalog()).await.unwrap();

    let mut cursor_a = room_a.subscribe().await.unwrap();
    let mut cursor_b = room_b.subscribe().await.unwrap();

    registry.shutdown_all().await;

    assert_eq!(registry.live_count().await, 0);
    matches!(cursor_a.read_packet().await, ReadOutcome::EndOfStream);
    matches!(cursor_b.read_packet().await, ReadOutcome::EndOfStream);
}
