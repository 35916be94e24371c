//! Prometheus metrics (spec §10.4). Grounded on the teacher's `lazy_static`
//! + `prometheus` registry in `liveion` (a custom registry namespaced
//! `live777`), extended with the gauges/counters this relay's routing
//! fabric needs instead of WebRTC-forwarder-specific ones.

use lazy_static::lazy_static;
use prometheus::{CounterVec, Gauge, GaugeVec, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new_custom(Some("relay".to_string()), None).unwrap();
    pub static ref ENCODER: TextEncoder = TextEncoder::new();

    pub static ref CHANNELS_LIVE: Gauge = {
        let g = Gauge::new("channels_live", "number of channels currently live").unwrap();
        REGISTRY.register(Box::new(g.clone())).unwrap();
        g
    };

    pub static ref SUBSCRIBERS_TOTAL: GaugeVec = {
        let g = GaugeVec::new(
            Opts::new("subscribers_total", "current subscriber count per path"),
            &["path"],
        )
        .unwrap();
        REGISTRY.register(Box::new(g.clone())).unwrap();
        g
    };

    pub static ref PACKETS_WRITTEN_TOTAL: CounterVec = {
        let c = CounterVec::new(
            Opts::new("packets_written_total", "packets written per path and stream_index"),
            &["path", "stream_index"],
        )
        .unwrap();
        REGISTRY.register(Box::new(c.clone())).unwrap();
        c
    };

    pub static ref PACKETS_DROPPED_TOTAL: CounterVec = {
        let c = CounterVec::new(
            Opts::new("packets_dropped_total", "packets dropped per path due to slow subscribers"),
            &["path"],
        )
        .unwrap();
        REGISTRY.register(Box::new(c.clone())).unwrap();
        c
    };

    pub static ref PUBLISH_REJECTED_TOTAL: prometheus::Counter = {
        let c = prometheus::Counter::new(
            "publish_rejected_total",
            "publish attempts rejected because the path was already live",
        )
        .unwrap();
        REGISTRY.register(Box::new(c.clone())).unwrap();
        c
    };
}

pub fn encode() -> String {
    use prometheus::Encoder;
    let mut buf = Vec::new();
    ENCODER.encode(&REGISTRY.gather(), &mut buf).unwrap_or(());
    String::from_utf8(buf).unwrap_or_default()
}
