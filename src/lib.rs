//! Library surface of the relay binary: every module named in spec §2's
//! component table, plus the crate-wide data model (§3) they share.

pub mod bridge;
pub mod config;
pub mod egress;
pub mod error;
pub mod ingest;
pub mod log;
pub mod metrics;
pub mod packet;
pub mod queue;
pub mod registry;
pub mod rtmp;
pub mod rtsp_wire;
pub mod static_ui;
pub mod supervisor;
