//! Registry and Channel (spec §3, §4.5).
//!
//! Grounded on `liveion/src/stream/manager.rs`'s `Arc<RwLock<HashMap<String,
//! PeerForward>>>` shape for the map/critical-section pattern, generalised
//! from a WebRTC-only forwarder keyed by stream id to a protocol-agnostic
//! `Channel` keyed by stream-path.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use webrtc::rtp::packet::Packet as RtpPacket;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

use crate::error::{RelayError, Result};
use crate::packet::CodecCatalog;
use crate::queue::PacketQueue;

/// Fan-out buffer depth per remote WebRTC track (spec §4.4.5: "a bounded
/// per-subscriber buffer"), matching `liveion`'s `PublishTrackRemote`
/// broadcast channel capacity.
const WEBRTC_FANOUT_CAPACITY: usize = 128;

/// One live WebRTC publisher's remote track, made available for direct
/// subscriber-to-publisher forwarding (spec §4.4.5) alongside the ordinary
/// `PacketQueue` routed path (spec §4.4.4). Grounded on `liveion/src/
/// forward/track.rs::PublishTrackRemote` — a `tokio::sync::broadcast`
/// channel fed by one reader task per remote track, so every subscriber
/// re-emits the same RTP payload without going through FormatBridge.
#[derive(Clone)]
pub struct WebrtcRemoteTrack {
    pub is_video: bool,
    pub capability: RTCRtpCodecCapability,
    pub ssrc: u32,
    pub rtp_broadcast: Arc<broadcast::Sender<Arc<RtpPacket>>>,
}

impl WebrtcRemoteTrack {
    pub fn new(is_video: bool, capability: RTCRtpCodecCapability, ssrc: u32) -> Self {
        let (tx, _rx) = broadcast::channel(WEBRTC_FANOUT_CAPACITY);
        WebrtcRemoteTrack {
            is_video,
            capability,
            ssrc,
            rtp_broadcast: Arc::new(tx),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RtpPacket>> {
        self.rtp_broadcast.subscribe()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Live,
    Closing,
    Closed,
}

/// The rendezvous for one stream-path: one publisher, zero or more
/// subscribers, sharing a `PacketQueue`.
pub struct Channel {
    pub path: String,
    pub queue: PacketQueue,
    state: RwLock<ChannelState>,
    subscriber_count: std::sync::atomic::AtomicUsize,
    /// Populated only when the publisher is itself WebRTC (spec §4.4.5);
    /// empty for RTMP/RTSP-ingested channels, which only ever have the
    /// routed `PacketQueue` path.
    webrtc_tracks: RwLock<Vec<WebrtcRemoteTrack>>,
}

impl Channel {
    fn new(path: String, capacity: usize, min_gop_headroom: usize) -> Self {
        Channel {
            queue: PacketQueue::new(capacity, min_gop_headroom, path.as_str()),
            path,
            state: RwLock::new(ChannelState::Live),
            subscriber_count: std::sync::atomic::AtomicUsize::new(0),
            webrtc_tracks: RwLock::new(Vec::new()),
        }
    }

    /// Registers a live WebRTC publisher's remote track for direct
    /// subscriber forwarding (spec §4.4.5). Called once per track as the
    /// ingest session's `on_track` callbacks fire.
    pub async fn add_webrtc_remote_track(&self, track: WebrtcRemoteTrack) {
        self.webrtc_tracks.write().await.push(track);
    }

    /// Non-empty only when the current publisher is WebRTC; egress uses this
    /// to choose the direct-forward path (§4.4.5) over the routed-channel
    /// path (§4.4.4).
    pub async fn webrtc_remote_tracks(&self) -> Vec<WebrtcRemoteTrack> {
        self.webrtc_tracks.read().await.clone()
    }

    pub async fn state(&self) -> ChannelState {
        *self.state.read().await
    }

    pub async fn set_streams(&self, streams: CodecCatalog) -> Result<()> {
        self.queue.write_header(streams).await
    }

    pub async fn streams(&self) -> Option<CodecCatalog> {
        self.queue.header().await
    }

    /// Opens a subscriber cursor. Rejected once the channel has begun
    /// closing (spec §3: "Once state=closing, no new cursors may be
    /// opened").
    pub async fn subscribe(&self) -> Result<crate::queue::Cursor> {
        if *self.state.read().await != ChannelState::Live {
            return Err(RelayError::not_found(self.path.clone()));
        }
        let cursor = self.queue.latest_cursor().await?;
        self.subscriber_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        crate::metrics::SUBSCRIBERS_TOTAL
            .with_label_values(&[&self.path])
            .inc();
        Ok(cursor)
    }

    pub fn unsubscribe(&self) {
        self.subscriber_count
            .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        crate::metrics::SUBSCRIBERS_TOTAL
            .with_label_values(&[&self.path])
            .dec();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Closes the queue before marking `Closed`, so subscribers observe EOS
    /// rather than being silently abandoned (spec §4.5: "remove closes the
    /// queue before unlinking").
    async fn close(&self) {
        *self.state.write().await = ChannelState::Closing;
        self.queue.close().await;
        self.webrtc_tracks.write().await.clear();
        *self.state.write().await = ChannelState::Closed;
    }
}

/// Process-wide `stream-path -> Channel` map (spec §3, §4.5). Sessions hold
/// an `Arc<Registry>` back-reference capability rather than owning it, per
/// the design notes' cyclic-lifetime guidance (spec §9) — mirroring the
/// teacher's `Arc::downgrade` back-reference from `PeerForward` callbacks to
/// the owning `Manager`.
pub struct Registry {
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    capacity: usize,
    min_gop_headroom: usize,
}

impl Registry {
    pub fn new(capacity: usize, min_gop_headroom: usize) -> Self {
        Registry {
            channels: RwLock::new(HashMap::new()),
            capacity,
            min_gop_headroom,
        }
    }

    pub async fn get(&self, path: &str) -> Option<Arc<Channel>> {
        self.channels.read().await.get(path).cloned()
    }

    /// Creates a channel at `path`, or returns `(existing, false)` if one is
    /// already live there (spec §4.5). The whole check-then-insert is one
    /// critical section so two concurrent creates never both succeed.
    pub async fn create(&self, path: &str) -> (Arc<Channel>, bool) {
        let mut channels = self.channels.write().await;
        if let Some(existing) = channels.get(path) {
            crate::metrics::PUBLISH_REJECTED_TOTAL.inc();
            return (existing.clone(), false);
        }
        let channel = Arc::new(Channel::new(path.to_string(), self.capacity, self.min_gop_headroom));
        channels.insert(path.to_string(), channel.clone());
        crate::metrics::CHANNELS_LIVE.inc();
        (channel, true)
    }

    /// Closes the channel's queue (waking every subscriber with EOS) and
    /// unlinks it from the map.
    pub async fn remove(&self, path: &str) {
        let channel = self.channels.write().await.remove(path);
        if let Some(channel) = channel {
            channel.close().await;
            crate::metrics::CHANNELS_LIVE.dec();
        }
    }

    pub async fn paths(&self) -> Vec<String> {
        self.channels.read().await.keys().cloned().collect()
    }

    pub async fn live_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Closes every live channel's queue (waking all subscribers with EOS)
    /// and empties the map. Used by the supervisor's shutdown sequence
    /// (spec §4.5: "Shutdown closes all listeners, then closes every
    /// channel in the Registry").
    pub async fn shutdown_all(&self) {
        let channels: Vec<Arc<Channel>> = self.channels.write().await.drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.close().await;
            crate::metrics::CHANNELS_LIVE.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_exclusivity() {
        let registry = Arc::new(Registry::new(16, 0));
        let (r1, r2) = tokio::join!(registry.create("/live/a"), registry.create("/live/a"));
        assert!(r1.1 ^ r2.1, "exactly one create() call should report created=true");
    }

    #[tokio::test]
    async fn remove_closes_queue_and_unlinks() {
        let registry = Registry::new(16, 0);
        let (channel, created) = registry.create("/live/a").await;
        assert!(created);
        let mut cursor = channel.subscribe().await.unwrap();
        registry.remove("/live/a").await;
        assert!(registry.get("/live/a").await.is_none());
        matches!(
            cursor.read_packet().await,
            crate::queue::ReadOutcome::EndOfStream
        );
    }

    #[tokio::test]
    async fn get_missing_path_is_none() {
        let registry = Registry::new(16, 0);
        assert!(registry.get("/live/missing").await.is_none());
    }
}
