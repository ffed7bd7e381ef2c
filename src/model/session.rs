//! Snapshot sessions
//!
//! A session is one generation + application attempt. The node's
//! coordinating task owns the live `SnapshotSession` and folds
//! `SessionEvent`s into it; observers only ever see cloned snapshots.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ChecksumRecord, ChecksumStatus, Lsn, SessionEvent, TableProgress, TableStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPhase {
    Generation,
    Application,
}

impl SnapshotPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotPhase::Generation => "generation",
            SnapshotPhase::Application => "application",
        }
    }
}

impl fmt::Display for SnapshotPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Steps of either phase, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStep {
    Schema,
    Tables,
    Sequences,
    Checksums,
}

impl SnapshotStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStep::Schema => "schema",
            SnapshotStep::Tables => "tables",
            SnapshotStep::Sequences => "sequences",
            SnapshotStep::Checksums => "checksums",
        }
    }
}

impl fmt::Display for SnapshotStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Progress of one side of the pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub step: Option<SnapshotStep>,
    pub tables: Vec<TableProgress>,
    /// Most recently started table still in flight
    pub current_table: Option<usize>,
    pub finished: bool,
}

impl PhaseProgress {
    pub fn tables_completed(&self) -> usize {
        self.tables
            .iter()
            .filter(|t| t.status == TableStatus::Completed)
            .count()
    }

    pub fn rows_copied(&self) -> u64 {
        self.tables.iter().map(|t| t.rows_copied).sum()
    }

    pub fn bytes_copied(&self) -> u64 {
        self.tables.iter().map(|t| t.bytes_copied).sum()
    }

    pub fn bytes_total(&self) -> u64 {
        self.tables.iter().map(|t| t.bytes_total).sum()
    }

    pub fn current(&self) -> Option<&TableProgress> {
        self.current_table.and_then(|i| self.tables.get(i))
    }

    fn table_mut(&mut self, idx: usize) -> Option<&mut TableProgress> {
        self.tables.get_mut(idx)
    }

    fn settle_current(&mut self, idx: usize) {
        if self.current_table == Some(idx) {
            self.current_table = self
                .tables
                .iter()
                .rposition(|t| t.status == TableStatus::InProgress);
        }
    }
}

/// WAL catch-up position after the snapshot has been applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchupProgress {
    pub from: Lsn,
    pub applied: Lsn,
    pub tip: Lsn,
}

impl CatchupProgress {
    pub fn lag_bytes(&self) -> u64 {
        self.tip - self.applied
    }

    pub fn replayed_bytes(&self) -> u64 {
        self.applied - self.from
    }
}

/// One generation + application attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSession {
    pub snapshot_id: Uuid,
    pub source_node: String,
    pub target_node: String,
    pub consistency_lsn: Option<Lsn>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: SessionOutcome,
    pub parallel_workers: usize,
    pub compression_enabled: bool,
    pub bytes_original: u64,
    pub bytes_compressed: u64,
    pub generation: PhaseProgress,
    pub application: PhaseProgress,
    /// Indexed like the table lists; `None` until the source digest exists
    pub checksums: Vec<Option<ChecksumRecord>>,
    pub catchup: Option<CatchupProgress>,
    /// Monotonic counters of work done (re-fetches included), for throughput
    pub bytes_transferred: u64,
    pub rows_transferred: u64,
    /// Highest overall percent reported so far
    pub percent_floor: f64,
}

impl SnapshotSession {
    pub fn new(
        source_node: impl Into<String>,
        target_node: impl Into<String>,
        parallel_workers: usize,
        compression_enabled: bool,
    ) -> Self {
        Self {
            snapshot_id: Uuid::new_v4(),
            source_node: source_node.into(),
            target_node: target_node.into(),
            consistency_lsn: None,
            started_at: Utc::now(),
            finished_at: None,
            outcome: SessionOutcome::Running,
            parallel_workers,
            compression_enabled,
            bytes_original: 0,
            bytes_compressed: 0,
            generation: PhaseProgress::default(),
            application: PhaseProgress::default(),
            checksums: Vec::new(),
            catchup: None,
            bytes_transferred: 0,
            rows_transferred: 0,
            percent_floor: 0.0,
        }
    }

    /// Generation is reported until the generator has finished every step
    pub fn phase(&self) -> SnapshotPhase {
        if self.generation.finished {
            SnapshotPhase::Application
        } else {
            SnapshotPhase::Generation
        }
    }

    pub fn phase_progress(&self, phase: SnapshotPhase) -> &PhaseProgress {
        match phase {
            SnapshotPhase::Generation => &self.generation,
            SnapshotPhase::Application => &self.application,
        }
    }

    fn phase_mut(&mut self, phase: SnapshotPhase) -> &mut PhaseProgress {
        match phase {
            SnapshotPhase::Generation => &mut self.generation,
            SnapshotPhase::Application => &mut self.application,
        }
    }

    pub fn reported(&self) -> &PhaseProgress {
        self.phase_progress(self.phase())
    }

    pub fn current_step(&self) -> Option<SnapshotStep> {
        self.reported().step
    }

    pub fn is_running(&self) -> bool {
        self.outcome == SessionOutcome::Running
    }

    /// compressed / original, `None` when disabled or nothing sent yet
    pub fn compression_ratio(&self) -> Option<f64> {
        if !self.compression_enabled || self.bytes_original == 0 {
            return None;
        }
        Some(self.bytes_compressed as f64 / self.bytes_original as f64)
    }

    pub fn checksum_records(&self) -> impl Iterator<Item = &ChecksumRecord> {
        self.checksums.iter().flatten()
    }

    pub fn checksums_with(&self, status: ChecksumStatus) -> usize {
        self.checksum_records().filter(|c| c.status == status).count()
    }

    pub fn finish(&mut self, outcome: SessionOutcome) {
        if self.is_running() {
            self.outcome = outcome;
            self.finished_at = Some(Utc::now());
        }
    }

    /// Fold a worker observation into the session. Events after a terminal
    /// outcome are ignored; the session is immutable from then on.
    pub fn apply(&mut self, event: &SessionEvent) {
        if !self.is_running() {
            return;
        }
        match event {
            SessionEvent::Prepared { consistency_lsn } => {
                self.consistency_lsn = Some(*consistency_lsn);
            }
            SessionEvent::StepStarted { phase, step } => {
                self.phase_mut(*phase).step = Some(*step);
            }
            SessionEvent::TablesEnumerated { phase, tables } => {
                if self.checksums.len() < tables.len() {
                    self.checksums.resize(tables.len(), None);
                }
                self.phase_mut(*phase).tables = tables.clone();
            }
            SessionEvent::TableStarted { phase, table } => {
                let p = self.phase_mut(*phase);
                if let Some(t) = p.table_mut(*table) {
                    t.start();
                    p.current_table = Some(*table);
                }
            }
            SessionEvent::ChunkCopied { phase, table, rows, bytes } => {
                if let Some(t) = self.phase_mut(*phase).table_mut(*table) {
                    t.record_chunk(*rows, *bytes);
                }
                if *phase == SnapshotPhase::Application {
                    self.bytes_transferred += bytes;
                    self.rows_transferred += rows;
                }
            }
            SessionEvent::TableCompleted { phase, table } => {
                let p = self.phase_mut(*phase);
                if let Some(t) = p.table_mut(*table) {
                    t.complete();
                }
                p.settle_current(*table);
            }
            SessionEvent::TableFailed { phase, table, .. } => {
                let p = self.phase_mut(*phase);
                if let Some(t) = p.table_mut(*table) {
                    t.fail();
                }
                p.settle_current(*table);
            }
            SessionEvent::TableReset { phase, table } => {
                let p = self.phase_mut(*phase);
                if let Some(t) = p.table_mut(*table) {
                    t.reset();
                    p.current_table = Some(*table);
                }
            }
            SessionEvent::ChecksumComputed { table, digest } => {
                if *table >= self.checksums.len() {
                    self.checksums.resize(table + 1, None);
                }
                let (schema, name) = self
                    .generation
                    .tables
                    .get(*table)
                    .map(|t| (t.schema.clone(), t.table_name.clone()))
                    .unwrap_or_default();
                match &mut self.checksums[*table] {
                    Some(record) => record.refresh(*digest),
                    slot => *slot = Some(ChecksumRecord::new(schema, name, *digest)),
                }
            }
            SessionEvent::ChecksumVerified { table, actual, status } => {
                if let Some(Some(record)) = self.checksums.get_mut(*table) {
                    record.record_verification(*actual, *status);
                }
            }
            SessionEvent::Compressed { original, compressed } => {
                self.bytes_original += original;
                self.bytes_compressed += compressed;
            }
            SessionEvent::PhaseFinished { phase } => {
                let p = self.phase_mut(*phase);
                p.finished = true;
                p.current_table = None;
            }
            SessionEvent::CatchupStarted { from } => {
                self.catchup = Some(CatchupProgress {
                    from: *from,
                    applied: *from,
                    tip: *from,
                });
            }
            SessionEvent::CatchupLag { applied, tip } => {
                if let Some(c) = self.catchup.as_mut() {
                    c.applied = (*applied).max(c.applied);
                    c.tip = *tip;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumVerifier;

    fn enumerated(session: &mut SnapshotSession) {
        let tables = vec![
            TableProgress::new("public", "a", 1, 10),
            TableProgress::new("public", "b", 9, 90),
        ];
        for phase in [SnapshotPhase::Generation, SnapshotPhase::Application] {
            session.apply(&SessionEvent::TablesEnumerated { phase, tables: tables.clone() });
        }
    }

    #[test]
    fn test_phase_switches_when_generation_finishes() {
        let mut s = SnapshotSession::new("src", "dst", 4, false);
        enumerated(&mut s);
        s.apply(&SessionEvent::StepStarted {
            phase: SnapshotPhase::Generation,
            step: SnapshotStep::Tables,
        });
        s.apply(&SessionEvent::StepStarted {
            phase: SnapshotPhase::Application,
            step: SnapshotStep::Schema,
        });
        assert_eq!(s.phase(), SnapshotPhase::Generation);
        assert_eq!(s.current_step(), Some(SnapshotStep::Tables));

        s.apply(&SessionEvent::PhaseFinished { phase: SnapshotPhase::Generation });
        assert_eq!(s.phase(), SnapshotPhase::Application);
        assert_eq!(s.current_step(), Some(SnapshotStep::Schema));
    }

    #[test]
    fn test_checksum_failure_then_pass() {
        let mut s = SnapshotSession::new("src", "dst", 4, false);
        enumerated(&mut s);
        let digest = ChecksumVerifier::digest(b"1\n");
        let bad = ChecksumVerifier::digest(b"2\n");
        s.apply(&SessionEvent::ChecksumComputed { table: 1, digest });
        assert_eq!(s.checksums_with(ChecksumStatus::Verifying), 1);

        s.apply(&SessionEvent::ChecksumVerified { table: 1, actual: bad, status: ChecksumStatus::Failed });
        assert_eq!(s.checksums_with(ChecksumStatus::Failed), 1);

        s.apply(&SessionEvent::ChecksumComputed { table: 1, digest });
        s.apply(&SessionEvent::ChecksumVerified { table: 1, actual: digest, status: ChecksumStatus::Passed });
        assert_eq!(s.checksums_with(ChecksumStatus::Failed), 0);
        assert_eq!(s.checksums_with(ChecksumStatus::Passed), 1);

        let record = s.checksums[1].as_ref().unwrap();
        assert_eq!(record.attempts, 2);
        assert_eq!(record.table_name, "b");
    }

    #[test]
    fn test_current_table_follows_in_flight_work() {
        let mut s = SnapshotSession::new("src", "dst", 2, false);
        enumerated(&mut s);
        let phase = SnapshotPhase::Application;
        s.apply(&SessionEvent::TableStarted { phase, table: 0 });
        s.apply(&SessionEvent::TableStarted { phase, table: 1 });
        assert_eq!(s.application.current().unwrap().table_name, "b");
        s.apply(&SessionEvent::TableCompleted { phase, table: 1 });
        assert_eq!(s.application.current().unwrap().table_name, "a");
        s.apply(&SessionEvent::TableCompleted { phase, table: 0 });
        assert!(s.application.current().is_none());
        assert_eq!(s.application.tables_completed(), 2);
    }

    #[test]
    fn test_terminal_session_is_frozen() {
        let mut s = SnapshotSession::new("src", "dst", 2, true);
        enumerated(&mut s);
        s.finish(SessionOutcome::Cancelled);
        s.apply(&SessionEvent::ChunkCopied {
            phase: SnapshotPhase::Application,
            table: 0,
            rows: 1,
            bytes: 10,
        });
        assert_eq!(s.application.bytes_copied(), 0);
        assert_eq!(s.outcome, SessionOutcome::Cancelled);
        assert!(s.finished_at.is_some());
    }

    #[test]
    fn test_compression_ratio() {
        let mut s = SnapshotSession::new("src", "dst", 2, true);
        assert_eq!(s.compression_ratio(), None);
        s.apply(&SessionEvent::Compressed { original: 1000, compressed: 250 });
        assert_eq!(s.compression_ratio(), Some(0.25));
    }
}
