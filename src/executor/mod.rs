//! Database Executor Module
//!
//! Backends that resolve node ids to snapshot sources, snapshot targets
//! and change feeds: PostgreSQL for real deployments and an in-process
//! store for tests and demos.

pub mod memory;
pub mod postgres;

pub use memory::{MemoryCluster, MemoryDatabase};
pub use postgres::PostgresConnector;

use std::sync::Arc;

use async_trait::async_trait;

use crate::catchup::ChangeFeed;
use crate::error::Result;
use crate::snapshot::{SnapshotSource, SnapshotTarget};

/// Resolves nodes to the collaborators an initialization needs
#[async_trait]
pub trait NodeConnector: Send + Sync {
    async fn source(&self, node_id: &str) -> Result<Arc<dyn SnapshotSource>>;

    async fn target(&self, node_id: &str) -> Result<Arc<dyn SnapshotTarget>>;

    /// Change stream replicating `source` into `target`
    async fn change_feed(&self, source: &str, target: &str) -> Result<Arc<dyn ChangeFeed>>;
}
