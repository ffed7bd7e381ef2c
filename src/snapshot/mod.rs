//! Snapshot Module
//!
//! Two-phase, pipelined snapshot transfer. The generator reads a pinned,
//! transactionally consistent view of the source and streams schema,
//! table chunks, digests and sequence values through a bounded channel;
//! the applier materializes them on the target as they arrive.

mod applier;
mod codec;
mod generator;
mod pipeline;
mod plan;
mod retry;

pub use applier::SnapshotApplier;
pub use codec::{format_ratio, ChunkCodec, EncodedChunk};
pub use generator::{SnapshotGenerator, StreamMode};
pub use pipeline::{run_snapshot, PipelineOptions, SnapshotSummary};
pub use plan::{dependency_order, plan_chunks};
pub use retry::RetryPolicy;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::checksum::TableDigest;
use crate::error::Result;
use crate::model::{Lsn, SessionEvent, TableProgress};
use crate::schema::TableFingerprint;

/// A table as enumerated from the source catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    pub rows_estimate: u64,
    pub bytes_estimate: u64,
    /// Qualified names of tables this one references through foreign keys
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl TableInfo {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    pub fn progress(&self) -> TableProgress {
        TableProgress::new(&self.schema, &self.name, self.rows_estimate, self.bytes_estimate)
    }
}

/// DDL split around the data load
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaExport {
    /// Schemas, types, sequences and tables, in dependency order
    pub pre_data: Vec<String>,
    /// Constraints and indexes, created once all rows are loaded
    pub post_data: Vec<String>,
    /// Column fingerprints of every source table
    #[serde(default)]
    pub fingerprints: Vec<TableFingerprint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceValue {
    pub schema: String,
    pub name: String,
    pub last_value: i64,
    pub is_called: bool,
}

impl SequenceValue {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// Row range of one table. The last range is open-ended so rows beyond
/// the catalog estimate are still copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub index: u32,
    pub offset: u64,
    pub limit: Option<u64>,
}

/// Raw COPY text for one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkData {
    pub index: u32,
    pub rows: u64,
    pub payload: Bytes,
}

/// Items flowing from generator to applier, in protocol order:
/// `Schema`, `Tables`, then `Chunk`/`TableDone` interleaved across
/// tables, then `Sequences`.
#[derive(Debug)]
pub enum SnapshotItem {
    Schema(SchemaExport),
    Tables(Vec<TableInfo>),
    Chunk { table: usize, chunk: EncodedChunk },
    TableDone { table: usize, digest: TableDigest },
    Sequences(Vec<SequenceValue>),
}

/// Source side: hands out consistent views
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Open a view pinned at a consistency LSN. History from that LSN on
    /// is retained for the catch-up of `target_node`.
    async fn open_view(&self, target_node: &str) -> Result<Arc<dyn SourceView>>;
}

/// A pinned, read-only view of the source
#[async_trait]
pub trait SourceView: Send + Sync {
    fn consistency_lsn(&self) -> Lsn;

    async fn export_schema(&self) -> Result<SchemaExport>;

    async fn list_tables(&self) -> Result<Vec<TableInfo>>;

    async fn read_chunk(&self, table: &TableInfo, range: &ChunkRange) -> Result<ChunkData>;

    async fn export_sequences(&self) -> Result<Vec<SequenceValue>>;

    /// Release the view
    async fn close(&self) -> Result<()>;
}

/// Target side: the node being provisioned
#[async_trait]
pub trait SnapshotTarget: Send + Sync {
    /// Discard all replicated objects ahead of a fresh session
    async fn reset(&self) -> Result<()>;

    async fn apply_ddl(&self, statements: &[String]) -> Result<()>;

    /// Column fingerprints of the tables currently on the target
    async fn table_fingerprints(&self) -> Result<Vec<TableFingerprint>>;

    /// Load one chunk atomically, returning rows written
    async fn load_chunk(&self, table: &TableInfo, chunk: &ChunkData) -> Result<u64>;

    async fn truncate_table(&self, table: &TableInfo) -> Result<()>;

    /// Recompute the table digest from what the target actually stored
    async fn table_digest(&self, table: &TableInfo) -> Result<TableDigest>;

    async fn apply_sequences(&self, sequences: &[SequenceValue]) -> Result<()>;
}

/// Session-tagged progress channel into the node's coordinating task
#[derive(Debug, Clone)]
pub struct EventSink {
    session: Uuid,
    tx: mpsc::UnboundedSender<(Uuid, SessionEvent)>,
}

impl EventSink {
    pub fn new(session: Uuid, tx: mpsc::UnboundedSender<(Uuid, SessionEvent)>) -> Self {
        Self { session, tx }
    }

    /// Never blocks; events for a coordinator that has gone away are dropped
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.tx.send((self.session, event));
    }

    pub fn session(&self) -> Uuid {
        self.session
    }
}
