//! Egress state machines (spec §4.4): RTMP play, RTSP describe/setup/play,
//! HTTP-FLV and WebSocket-FLV, WebRTC play. Each subscribes to a `Channel`
//! via `Registry` and drives packets out to one connected player until it
//! disconnects, the channel closes, or TEARDOWN-equivalent.

pub mod http_flv;
pub mod rtmp;
pub mod rtsp;
pub mod webrtc;
