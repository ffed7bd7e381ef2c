//! Progress reporting
//!
//! A read-side projection of a node's record, its snapshot session and the
//! throughput ring into the flat `InitProgress` structure consumed by
//! dashboards and the HTTP API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    ChecksumStatus, InitState, NodeRecord, SnapshotPhase, SnapshotSession, SnapshotStep,
    TableProgress,
};
use crate::throughput::ThroughputSampler;

/// Outbound progress for one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitProgress {
    pub node_id: String,
    pub node_name: String,
    pub state: InitState,
    pub phase: Option<SnapshotPhase>,
    pub current_step: Option<SnapshotStep>,
    pub overall_percent: f64,
    pub tables_total: usize,
    pub tables_completed: usize,
    pub current_table: Option<String>,
    pub current_table_percent: f64,
    pub rows_copied: u64,
    pub bytes_copied: u64,
    pub throughput_rows_per_sec: f64,
    pub throughput_bytes_per_sec: f64,
    pub started_at: Option<DateTime<Utc>>,
    /// `None` while throughput is zero
    pub eta_seconds: Option<u64>,
    pub parallel_workers: usize,
    /// compressed / original; `None` when compression is off
    pub compression_ratio: Option<f64>,
    pub checksums_total: usize,
    pub checksums_verified: usize,
    pub checksums_failed: usize,
    pub checksum_status: Option<ChecksumStatus>,
    pub error_message: Option<String>,
    pub source_node: Option<String>,
    /// Replication lag during catch-up
    pub lag_bytes: Option<u64>,
    pub tables: Vec<TableProgress>,
    /// Bytes/sec samples, oldest first
    pub throughput_history: Vec<f64>,
}

impl InitProgress {
    /// Report for a node with no session: identity and state, every counter zero
    pub fn idle(record: &NodeRecord) -> Self {
        Self {
            node_id: record.id.clone(),
            node_name: record.name.clone(),
            state: record.state,
            phase: None,
            current_step: None,
            overall_percent: 0.0,
            tables_total: 0,
            tables_completed: 0,
            current_table: None,
            current_table_percent: 0.0,
            rows_copied: 0,
            bytes_copied: 0,
            throughput_rows_per_sec: 0.0,
            throughput_bytes_per_sec: 0.0,
            started_at: None,
            eta_seconds: None,
            parallel_workers: 0,
            compression_ratio: None,
            checksums_total: 0,
            checksums_verified: 0,
            checksums_failed: 0,
            checksum_status: None,
            error_message: record.last_error.clone(),
            source_node: record.source_node.clone(),
            lag_bytes: None,
            tables: Vec::new(),
            throughput_history: Vec::new(),
        }
    }
}

/// Byte-weighted completion over a set of tables, in percent
pub fn weighted_percent<'a, I>(tables: I) -> f64
where
    I: IntoIterator<Item = &'a TableProgress>,
{
    let (copied, total) = tables.into_iter().fold((0u64, 0u64), |(c, t), table| {
        (c + table.bytes_copied.min(table.bytes_total), t + table.bytes_total)
    });
    if total == 0 {
        return 0.0;
    }
    copied as f64 / total as f64 * 100.0
}

pub struct ProgressReporter;

impl ProgressReporter {
    /// Project the current state without touching the running pipeline
    pub fn project(
        record: &NodeRecord,
        session: Option<&SnapshotSession>,
        sampler: &ThroughputSampler,
    ) -> InitProgress {
        let mut progress = InitProgress::idle(record);
        let Some(session) = session else {
            return progress;
        };

        let phase = session.phase();
        let reported = session.reported();
        let running = session.is_running();

        progress.phase = Some(phase);
        progress.current_step = reported.step;
        progress.tables_total = reported.tables.len();
        progress.tables_completed = reported.tables_completed();
        if let Some(table) = reported.current() {
            progress.current_table = Some(table.qualified_name());
            progress.current_table_percent = table.percent();
        }
        progress.rows_copied = reported.rows_copied();
        progress.bytes_copied = reported.bytes_copied();
        progress.started_at = Some(session.started_at);
        progress.parallel_workers = session.parallel_workers;
        progress.compression_ratio = session.compression_ratio();
        progress.source_node = Some(session.source_node.clone());
        progress.tables = reported.tables.clone();

        progress.checksums_total = session.checksums.len();
        progress.checksums_verified = session.checksums_with(ChecksumStatus::Passed);
        progress.checksums_failed = session.checksums_with(ChecksumStatus::Failed);
        progress.checksum_status = if progress.checksums_total == 0 {
            None
        } else if progress.checksums_failed > 0 {
            Some(ChecksumStatus::Failed)
        } else if progress.checksums_verified == progress.checksums_total {
            Some(ChecksumStatus::Passed)
        } else {
            Some(ChecksumStatus::Verifying)
        };

        let snapshot_percent = if session.application.finished {
            100.0
        } else {
            weighted_percent(session.generation.tables.iter().chain(&session.application.tables))
        };
        progress.overall_percent = snapshot_percent.max(session.percent_floor).min(100.0);

        progress.lag_bytes = session.catchup.map(|c| c.lag_bytes());
        let remaining = match session.catchup {
            Some(c) => c.lag_bytes(),
            None if !session.application.tables.is_empty() => {
                remaining_bytes(&session.application.tables)
            }
            None => remaining_bytes(&session.generation.tables),
        };

        if running {
            progress.throughput_bytes_per_sec = sampler.smoothed_bytes_per_sec();
            progress.throughput_rows_per_sec = sampler.smoothed_rows_per_sec();
            progress.eta_seconds = sampler.eta_secs(remaining);
        } else if record.state == InitState::Synchronized {
            progress.eta_seconds = Some(0);
        }
        progress.throughput_history = sampler.byte_series();
        progress
    }
}

fn remaining_bytes(tables: &[TableProgress]) -> u64 {
    tables
        .iter()
        .map(|t| t.bytes_total.saturating_sub(t.bytes_copied))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumVerifier;
    use crate::model::{SessionEvent, SessionOutcome, TableStatus};
    use std::time::{Duration, Instant};

    fn session_with(tables: Vec<TableProgress>) -> SnapshotSession {
        let mut s = SnapshotSession::new("primary", "replica", 4, true);
        for phase in [SnapshotPhase::Generation, SnapshotPhase::Application] {
            s.apply(&SessionEvent::TablesEnumerated { phase, tables: tables.clone() });
        }
        s
    }

    #[test]
    fn test_weighting_by_bytes() {
        let mut small = TableProgress::new("public", "small", 1, 10);
        small.record_chunk(1, 10);
        small.complete();
        let big = TableProgress::new("public", "big", 9, 90);
        assert_eq!(weighted_percent([&small, &big]), 10.0);
        assert_eq!(weighted_percent(std::iter::empty()), 0.0);
    }

    #[test]
    fn test_idle_report_is_zeroed() {
        let record = NodeRecord::new("replica", "Replica");
        let p = ProgressReporter::project(&record, None, &ThroughputSampler::new(60));
        assert_eq!(p.state, InitState::Uninitialized);
        assert_eq!(p.overall_percent, 0.0);
        assert_eq!(p.tables_total, 0);
        assert!(p.tables.is_empty());
        assert!(p.phase.is_none());
        assert!(p.eta_seconds.is_none());
        assert!(p.throughput_history.is_empty());
    }

    #[test]
    fn test_projection_of_running_session() {
        let mut record = NodeRecord::new("replica", "Replica");
        record.state = InitState::Copying;
        let mut s = session_with(vec![
            TableProgress::new("public", "a", 10, 100),
            TableProgress::new("public", "b", 10, 100),
        ]);
        let phase = SnapshotPhase::Generation;
        s.apply(&SessionEvent::TableStarted { phase, table: 1 });
        s.apply(&SessionEvent::ChunkCopied { phase, table: 1, rows: 5, bytes: 50 });
        s.apply(&SessionEvent::Compressed { original: 50, compressed: 20 });
        s.apply(&SessionEvent::ChecksumComputed { table: 0, digest: ChecksumVerifier::digest(b"x\n") });

        let mut sampler = ThroughputSampler::new(60);
        let t0 = Instant::now();
        sampler.observe(t0, 0, 0);
        sampler.observe(t0 + Duration::from_secs(1), 50, 5);

        let p = ProgressReporter::project(&record, Some(&s), &sampler);
        assert_eq!(p.phase, Some(SnapshotPhase::Generation));
        assert_eq!(p.tables_total, 2);
        assert_eq!(p.current_table.as_deref(), Some("public.b"));
        assert_eq!(p.current_table_percent, 50.0);
        assert_eq!(p.bytes_copied, 50);
        assert_eq!(p.overall_percent, 12.5);
        assert_eq!(p.compression_ratio, Some(0.4));
        assert_eq!(p.checksums_total, 2);
        assert_eq!(p.checksum_status, Some(ChecksumStatus::Verifying));
        assert_eq!(p.throughput_bytes_per_sec, 50.0);
        // application side has all 200 bytes left
        assert_eq!(p.eta_seconds, Some(4));
        assert_eq!(p.throughput_history, vec![50.0]);
    }

    #[test]
    fn test_floor_keeps_percent_monotonic() {
        let record = NodeRecord::new("replica", "Replica");
        let mut s = session_with(vec![TableProgress::new("public", "a", 10, 100)]);
        let phase = SnapshotPhase::Application;
        s.apply(&SessionEvent::ChunkCopied { phase, table: 0, rows: 10, bytes: 100 });
        let sampler = ThroughputSampler::new(60);
        let before = ProgressReporter::project(&record, Some(&s), &sampler).overall_percent;
        s.percent_floor = before;

        s.apply(&SessionEvent::TableReset { phase, table: 0 });
        let after = ProgressReporter::project(&record, Some(&s), &sampler).overall_percent;
        assert_eq!(after, before);
    }

    #[test]
    fn test_failed_session_keeps_evidence() {
        let mut record = NodeRecord::new("replica", "Replica");
        record.state = InitState::Failed;
        record.last_error = Some("cancelled by operator".into());
        let mut s = session_with(vec![TableProgress::new("public", "a", 1, 10)]);
        s.apply(&SessionEvent::ChunkCopied {
            phase: SnapshotPhase::Application,
            table: 0,
            rows: 1,
            bytes: 10,
        });
        s.apply(&SessionEvent::TableCompleted { phase: SnapshotPhase::Application, table: 0 });
        s.finish(SessionOutcome::Cancelled);

        let p = ProgressReporter::project(&record, Some(&s), &ThroughputSampler::new(60));
        assert_eq!(p.error_message.as_deref(), Some("cancelled by operator"));
        assert_eq!(p.throughput_bytes_per_sec, 0.0);
        assert!(p.eta_seconds.is_none());
        assert_eq!(p.tables_total, 1);
        assert_eq!(s.application.tables[0].status, TableStatus::Completed);
    }
}
