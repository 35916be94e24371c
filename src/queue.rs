//! PacketQueue: per-stream bounded pub/sub queue with keyframe catch-up
//! (spec §4.1).
//!
//! Grounded on `liveion/src/stream/manager.rs`'s `Arc<RwLock<..>>` shared-state
//! shape for the lock discipline, and on the design notes' explicit guidance
//! (spec §9, "many cursors sharing one queue") to use a ring buffer with a
//! monotonic sequence number rather than per-cursor cloning of the backlog.
//! There is no direct teacher analogue for the ring buffer itself: `liveion`
//! forwards WebRTC tracks directly rather than through a shared multi-reader
//! queue, so this type is the one piece of the core synthesised fresh from
//! the design notes plus the original Go relay's documented `Que.Latest()`
//! catch-up behaviour.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tracing::warn;

use crate::error::{RelayError, Result};
use crate::packet::{primary_video_index, CodecCatalog, CodecDescriptor, Packet};

/// Default ring capacity: generous headroom over one GOP at typical frame
/// rates, tunable via `config.queue.capacity` (spec §10.1).
pub const DEFAULT_CAPACITY: usize = 512;

struct Entry {
    seq: u64,
    packet: Packet,
}

struct Inner {
    streams: Option<CodecCatalog>,
    capacity: usize,
    /// Extra ring slots the writer may grow into, beyond `capacity`, to
    /// avoid evicting the only complete prior GOP retained for late joiners
    /// (spec §4.1, `config.queue.min_gop_headroom`).
    min_gop_headroom: usize,
    ring: VecDeque<Entry>,
    next_seq: u64,
    /// Lowest sequence number still held in `ring`; used to detect a cursor
    /// that has fallen off the back of the ring.
    floor_seq: u64,
    closed: bool,
}

impl Inner {
    fn new(capacity: usize, min_gop_headroom: usize) -> Self {
        Inner {
            streams: None,
            capacity,
            min_gop_headroom,
            ring: VecDeque::with_capacity(capacity),
            next_seq: 0,
            floor_seq: 0,
            closed: false,
        }
    }

    /// Number of retained keyframes on the primary video stream.
    fn retained_keyframe_count(&self) -> usize {
        let Some(video_idx) = primary_video_index(self.streams.as_deref().unwrap_or(&[])) else {
            return 0;
        };
        let video_idx = video_idx as u8;
        self.ring
            .iter()
            .filter(|e| e.packet.stream_index == video_idx && e.packet.is_key)
            .count()
    }

    /// Evicts oldest entries back toward `capacity`, but keeps growing into
    /// `min_gop_headroom` extra slots rather than delete the boundary
    /// keyframe of the only complete prior GOP still retained (spec §4.1:
    /// "retain at least one complete prior GOP"). Once the ring exceeds
    /// `capacity + min_gop_headroom`, eviction proceeds regardless.
    fn evict(&mut self) {
        loop {
            if self.ring.len() <= self.capacity {
                return;
            }
            if self.ring.len() <= self.capacity + self.min_gop_headroom && self.front_is_last_prior_keyframe() {
                return;
            }
            self.ring.pop_front();
            self.floor_seq = self.ring.front().map(|e| e.seq).unwrap_or(self.next_seq);
        }
    }

    /// True when the oldest retained entry is the keyframe that starts the
    /// only complete prior GOP we have (removing it would drop us to zero
    /// prior GOPs).
    fn front_is_last_prior_keyframe(&self) -> bool {
        let Some(video_idx) = primary_video_index(self.streams.as_deref().unwrap_or(&[])) else {
            return false;
        };
        let video_idx = video_idx as u8;
        let Some(front) = self.ring.front() else {
            return false;
        };
        front.packet.stream_index == video_idx && front.packet.is_key && self.retained_keyframe_count() <= 2
    }

    /// Largest sequence number of a packet with `is_key=true` on the primary
    /// video stream, at or after `floor`. None if no keyframe is retained.
    fn latest_keyframe_seq(&self) -> Option<u64> {
        let video_idx = primary_video_index(self.streams.as_deref().unwrap_or(&[]))? as u8;
        self.ring
            .iter()
            .rev()
            .find(|e| e.packet.stream_index == video_idx && e.packet.is_key)
            .map(|e| e.seq)
    }

    /// Oldest retained keyframe's sequence number (the re-anchor target for
    /// a cursor that has fallen behind past the ring, spec §3).
    fn oldest_keyframe_seq(&self) -> Option<u64> {
        let video_idx = primary_video_index(self.streams.as_deref().unwrap_or(&[]))? as u8;
        self.ring
            .iter()
            .find(|e| e.packet.stream_index == video_idx && e.packet.is_key)
            .map(|e| e.seq)
    }
}

/// Shared, thread-safe handle to one channel's packet ring. Cheap to clone.
#[derive(Clone)]
pub struct PacketQueue {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    /// Carried only for metric labelling (spec §10.4); never read for logic.
    path: Arc<str>,
}

impl PacketQueue {
    pub fn new(capacity: usize, min_gop_headroom: usize, path: impl Into<Arc<str>>) -> Self {
        PacketQueue {
            inner: Arc::new(Mutex::new(Inner::new(capacity.max(1), min_gop_headroom))),
            notify: Arc::new(Notify::new()),
            path: path.into(),
        }
    }

    /// Idempotent only for identical arguments (spec §4.1).
    pub async fn write_header(&self, streams: CodecCatalog) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match &inner.streams {
            None => {
                inner.streams = Some(streams);
                Ok(())
            }
            Some(existing) if *existing == streams => Ok(()),
            Some(_) => Err(RelayError::already_published("stream header mismatch")),
        }
    }

    pub async fn header(&self) -> Option<CodecCatalog> {
        self.inner.lock().await.streams.clone()
    }

    /// Appends a packet, evicting the oldest entry if the ring is full.
    /// Rejects packets whose `stream_index` has no matching descriptor
    /// (§9 open question i: drop with a log, not an error back to the
    /// caller — the caller already successfully wrote the header).
    pub async fn write_packet(&self, packet: Packet) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(RelayError::transport("queue closed"));
        }
        let in_range = inner
            .streams
            .as_ref()
            .map(|s| (packet.stream_index as usize) < s.len())
            .unwrap_or(false);
        if !in_range {
            warn!(
                stream_index = packet.stream_index,
                "packet with out-of-range stream_index dropped"
            );
            return Ok(());
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let stream_index = packet.stream_index;
        inner.ring.push_back(Entry { seq, packet });
        inner.evict();
        drop(inner);
        self.notify.notify_waiters();
        crate::metrics::PACKETS_WRITTEN_TOTAL
            .with_label_values(&[&self.path, &stream_index.to_string()])
            .inc();
        Ok(())
    }

    /// Opens a cursor anchored per spec §3/§4.1: the most recent keyframe of
    /// the primary video stream, or the tail if there is none yet.
    pub async fn latest_cursor(&self) -> Result<Cursor> {
        let inner = self.inner.lock().await;
        if inner.closed {
            return Err(RelayError::transport("queue closed"));
        }
        let next_seq = inner.latest_keyframe_seq().unwrap_or(inner.next_seq);
        Ok(Cursor {
            queue: self.clone(),
            next_seq,
            dropped: 0,
        })
    }

    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }
}

/// A reader's position in a `PacketQueue`.
pub struct Cursor {
    queue: PacketQueue,
    next_seq: u64,
    dropped: u64,
}

pub enum ReadOutcome {
    Packet(Packet),
    EndOfStream,
}

impl Cursor {
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Reads the next packet, suspending until the writer notifies or the
    /// queue closes. Re-anchors to the oldest retained keyframe (incrementing
    /// `dropped`) if this cursor has fallen behind the ring (spec §3/§5:
    /// "readers never block writers").
    pub async fn read_packet(&mut self) -> ReadOutcome {
        loop {
            {
                let inner = self.queue.inner.lock().await;
                if self.next_seq < inner.floor_seq {
                    let reanchor = inner.oldest_keyframe_seq().unwrap_or(inner.floor_seq);
                    let skipped = reanchor.saturating_sub(self.next_seq).max(1);
                    self.dropped += skipped;
                    self.next_seq = reanchor;
                    crate::metrics::PACKETS_DROPPED_TOTAL
                        .with_label_values(&[&self.queue.path])
                        .inc_by(skipped as f64);
                }
                if let Some(entry) = inner
                    .ring
                    .iter()
                    .find(|e| e.seq == self.next_seq)
                {
                    let packet = entry.packet.clone();
                    self.next_seq += 1;
                    return ReadOutcome::Packet(packet);
                }
                if inner.closed && self.next_seq >= inner.next_seq {
                    return ReadOutcome::EndOfStream;
                }
            }
            self.queue.notify.notified().await;
            if self.queue.is_closed().await {
                let inner = self.queue.inner.lock().await;
                if self.next_seq >= inner.next_seq {
                    return ReadOutcome::EndOfStream;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn h264_streams() -> CodecCatalog {
        vec![CodecDescriptor::H264 {
            sps: Bytes::new(),
            pps: Bytes::new(),
            width: 1280,
            height: 720,
            profile: 100,
            level: 31,
        }]
    }

    fn key(n: u64) -> Packet {
        Packet::video(0, Duration::from_millis(n), true, Bytes::from_static(b"idr"))
    }

    fn delta(n: u64) -> Packet {
        Packet::video(0, Duration::from_millis(n), false, Bytes::from_static(b"p"))
    }

    #[tokio::test]
    async fn fan_out_identical_order() {
        let q = PacketQueue::new(16, 0, "/live/test");
        q.write_header(h264_streams()).await.unwrap();
        let mut c1 = q.latest_cursor().await.unwrap();
        let mut c2 = q.latest_cursor().await.unwrap();
        for i in 0..5 {
            q.write_packet(key(i)).await.unwrap();
        }
        for _ in 0..5 {
            let (ReadOutcome::Packet(p1), ReadOutcome::Packet(p2)) =
                (c1.read_packet().await, c2.read_packet().await)
            else {
                panic!("expected packets");
            };
            assert_eq!(p1.pts, p2.pts);
        }
    }

    #[tokio::test]
    async fn late_joiner_anchors_to_keyframe() {
        let q = PacketQueue::new(16, 0, "/live/test");
        q.write_header(h264_streams()).await.unwrap();
        q.write_packet(key(0)).await.unwrap();
        for i in 1..4 {
            q.write_packet(delta(i)).await.unwrap();
        }
        q.write_packet(key(4)).await.unwrap();
        for i in 5..8 {
            q.write_packet(delta(i)).await.unwrap();
        }
        let mut cursor = q.latest_cursor().await.unwrap();
        let ReadOutcome::Packet(first) = cursor.read_packet().await else {
            panic!("expected packet");
        };
        assert!(first.is_key);
        assert_eq!(first.pts, Duration::from_millis(4));
    }

    #[tokio::test]
    async fn eviction_reanchors_slow_cursor() {
        let q = PacketQueue::new(4, 0, "/live/test");
        q.write_header(h264_streams()).await.unwrap();
        let mut slow = q.latest_cursor().await.unwrap();
        for i in 0..4u64 {
            q.write_packet(key(i)).await.unwrap();
        }
        // Force eviction well past the slow cursor's position.
        for i in 4..12u64 {
            q.write_packet(key(i)).await.unwrap();
        }
        let ReadOutcome::Packet(p) = slow.read_packet().await else {
            panic!("expected packet");
        };
        assert!(p.is_key);
        assert!(slow.dropped() > 0);
    }

    #[tokio::test]
    async fn close_yields_end_of_stream() {
        let q = PacketQueue::new(4, 0, "/live/test");
        q.write_header(h264_streams()).await.unwrap();
        let mut cursor = q.latest_cursor().await.unwrap();
        q.close().await;
        matches!(cursor.read_packet().await, ReadOutcome::EndOfStream);
    }

    #[tokio::test]
    async fn write_header_idempotent_for_identical_args() {
        let q = PacketQueue::new(4, 0, "/live/test");
        q.write_header(h264_streams()).await.unwrap();
        assert!(q.write_header(h264_streams()).await.is_ok());
    }

    #[tokio::test]
    async fn write_header_rejects_mismatch() {
        let q = PacketQueue::new(4, 0, "/live/test");
        q.write_header(h264_streams()).await.unwrap();
        let other = vec![CodecDescriptor::Opus { channel_count: 2 }];
        assert!(q.write_header(other).await.is_err());
    }

    #[tokio::test]
    async fn min_gop_headroom_keeps_one_full_prior_gop() {
        // capacity=4, headroom=4: one keyframe plus 3 deltas fills capacity
        // exactly, so without headroom the next GOP's first delta would
        // evict the prior keyframe before a late joiner could re-anchor to
        // it.
        let q = PacketQueue::new(4, 4, "/live/test");
        q.write_header(h264_streams()).await.unwrap();
        q.write_packet(key(0)).await.unwrap();
        for i in 1..4 {
            q.write_packet(delta(i)).await.unwrap();
        }
        q.write_packet(key(4)).await.unwrap();
        for i in 5..7 {
            q.write_packet(delta(i)).await.unwrap();
        }
        // The ring has grown past `capacity` into the headroom, so the
        // first keyframe (seq 0) is still retained.
        let mut cursor = q.latest_cursor().await.unwrap();
        let ReadOutcome::Packet(first) = cursor.read_packet().await else {
            panic!("expected packet");
        };
        assert!(first.is_key);
        assert_eq!(first.pts, Duration::from_millis(4));
    }

    #[tokio::test]
    async fn min_gop_headroom_eventually_evicts_past_capacity() {
        let q = PacketQueue::new(2, 2, "/live/test");
        q.write_header(h264_streams()).await.unwrap();
        let mut cursor = q.latest_cursor().await.unwrap();
        // Every packet here is a keyframe, so the retained-keyframe-count
        // check alone would never let eviction proceed; once the ring
        // exceeds capacity + headroom (4), it must evict regardless.
        for i in 0..8u64 {
            q.write_packet(key(i)).await.unwrap();
        }
        let ReadOutcome::Packet(first) = cursor.read_packet().await else {
            panic!("expected packet");
        };
        assert!(first.pts >= Duration::from_millis(1));
        assert!(cursor.dropped() > 0);
    }
}
