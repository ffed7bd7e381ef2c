//! Progress events sent from pipeline workers to the node's coordinating task

use serde::{Deserialize, Serialize};

use super::{ChecksumStatus, Lsn, SnapshotPhase, SnapshotStep, TableProgress};
use crate::checksum::TableDigest;

/// Observations reported by the snapshot and catch-up stages.
///
/// Workers never touch session state directly; they emit these and the
/// node's coordinating task folds them into the `SnapshotSession`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Consistent source view is open
    Prepared { consistency_lsn: Lsn },
    StepStarted { phase: SnapshotPhase, step: SnapshotStep },
    TablesEnumerated { phase: SnapshotPhase, tables: Vec<TableProgress> },
    TableStarted { phase: SnapshotPhase, table: usize },
    ChunkCopied { phase: SnapshotPhase, table: usize, rows: u64, bytes: u64 },
    TableCompleted { phase: SnapshotPhase, table: usize },
    TableFailed { phase: SnapshotPhase, table: usize, reason: String },
    /// Counters cleared ahead of a re-fetch
    TableReset { phase: SnapshotPhase, table: usize },
    ChecksumComputed { table: usize, digest: TableDigest },
    ChecksumVerified { table: usize, actual: TableDigest, status: ChecksumStatus },
    Compressed { original: u64, compressed: u64 },
    PhaseFinished { phase: SnapshotPhase },
    CatchupStarted { from: Lsn },
    CatchupLag { applied: Lsn, tip: Lsn },
}
