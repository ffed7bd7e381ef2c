//! steep-repl - PostgreSQL Node Initialization Engine
//!
//! Brings a new or broken replica into a consistent, continuously
//! replicated state from an existing source node.
//!
//! # Architecture
//!
//! Each replica node is owned by a single lifecycle actor. Starting an
//! initialization opens a snapshot session: the source is pinned to one
//! consistent view, every table is streamed in chunks to the target, and
//! each loaded table is verified against the source's checksum. The node
//! then catches up on WAL written since the snapshot point until it is
//! synchronized with its source.
//!
//! # Features
//!
//! - Parallel chunked copy with shared worker budget and LZ4 compression
//! - Order-independent per-table checksums with bounded re-fetch
//! - Foreign-key aware table ordering, constraints applied after load
//! - Column fingerprint check of the target schema before data loads
//! - Byte-weighted progress, smoothed throughput and ETA reporting
//! - Operator cancel and reinitialize with a persisted transition log
//! - HTTP API for control and progress

pub mod api;
pub mod catchup;
pub mod checksum;
pub mod config;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod model;
pub mod progress;
pub mod schema;
pub mod snapshot;
pub mod state;
pub mod throughput;
pub mod tuning;

pub use config::SteepConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::SteepConfig;
    pub use crate::error::{Error, Result};
    pub use crate::executor::NodeConnector;
    pub use crate::lifecycle::{InitManager, NodeHandle, NodeStatus};
    pub use crate::model::{InitState, NodeRecord, SnapshotPhase, SnapshotStep};
    pub use crate::progress::InitProgress;
}
