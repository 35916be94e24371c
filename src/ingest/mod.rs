//! Ingest state machines (spec §4.3): RTMP publish, RTSP announce/record,
//! WebRTC publish. Each owns one accepted connection, builds a
//! `CodecCatalog`, and drives `Channel::queue.write_packet` until the peer
//! disconnects or protocol errors out.

pub mod rtmp;
pub mod rtsp;
pub mod webrtc;

/// Splits a `path = app/stream_key` RTMP pair into the crate-wide
/// stream-path convention (spec §6: "begins with `/`").
pub fn rtmp_stream_path(app: &str, stream_key: &str) -> String {
    format!("/{}/{}", app.trim_matches('/'), stream_key.trim_matches('/'))
}
