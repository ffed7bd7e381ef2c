//! Per-table copy progress

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for TableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TableStatus::Pending => "pending",
            TableStatus::InProgress => "in_progress",
            TableStatus::Completed => "completed",
            TableStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One row per table copied in a session.
///
/// Totals start as catalog estimates and are raised whenever the copied
/// counters would exceed them, so `copied <= total` holds at every
/// observation point. Completion pins totals to the copied values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableProgress {
    pub schema: String,
    pub table_name: String,
    pub rows_total: u64,
    pub rows_copied: u64,
    pub bytes_total: u64,
    pub bytes_copied: u64,
    pub status: TableStatus,
}

impl TableProgress {
    pub fn new(schema: impl Into<String>, table_name: impl Into<String>, rows_total: u64, bytes_total: u64) -> Self {
        Self {
            schema: schema.into(),
            table_name: table_name.into(),
            rows_total,
            rows_copied: 0,
            bytes_total,
            bytes_copied: 0,
            status: TableStatus::Pending,
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table_name)
    }

    /// Completion percentage derived from byte counters
    pub fn percent(&self) -> f64 {
        if self.status == TableStatus::Completed {
            return 100.0;
        }
        if self.bytes_total == 0 {
            return 0.0;
        }
        (self.bytes_copied as f64 / self.bytes_total as f64 * 100.0).min(100.0)
    }

    pub fn start(&mut self) {
        self.status = TableStatus::InProgress;
    }

    pub fn record_chunk(&mut self, rows: u64, bytes: u64) {
        self.rows_copied += rows;
        self.bytes_copied += bytes;
        self.rows_total = self.rows_total.max(self.rows_copied);
        self.bytes_total = self.bytes_total.max(self.bytes_copied);
        if self.status == TableStatus::Pending {
            self.status = TableStatus::InProgress;
        }
    }

    pub fn complete(&mut self) {
        self.rows_total = self.rows_copied;
        self.bytes_total = self.bytes_copied;
        self.status = TableStatus::Completed;
    }

    pub fn fail(&mut self) {
        self.status = TableStatus::Failed;
    }

    /// Clear copied counters before a re-fetch. Totals keep the best known size.
    pub fn reset(&mut self) {
        self.rows_copied = 0;
        self.bytes_copied = 0;
        self.status = TableStatus::InProgress;
    }
}
