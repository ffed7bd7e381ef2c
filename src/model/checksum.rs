//! Per-table checksum records

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::checksum::TableDigest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumStatus {
    Verifying,
    Passed,
    Failed,
}

impl fmt::Display for ChecksumStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChecksumStatus::Verifying => "verifying",
            ChecksumStatus::Passed => "passed",
            ChecksumStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Source digest of one table plus the outcome of verifying it on the target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecksumRecord {
    pub schema: String,
    pub table_name: String,
    pub expected: TableDigest,
    pub actual: Option<TableDigest>,
    pub status: ChecksumStatus,
    /// Number of target-side verifications so far
    pub attempts: u32,
}

impl ChecksumRecord {
    pub fn new(schema: impl Into<String>, table_name: impl Into<String>, expected: TableDigest) -> Self {
        Self {
            schema: schema.into(),
            table_name: table_name.into(),
            expected,
            actual: None,
            status: ChecksumStatus::Verifying,
            attempts: 0,
        }
    }

    /// A re-fetch produced a fresh source digest; verification starts over
    pub fn refresh(&mut self, expected: TableDigest) {
        self.expected = expected;
        self.actual = None;
        self.status = ChecksumStatus::Verifying;
    }

    pub fn record_verification(&mut self, actual: TableDigest, status: ChecksumStatus) {
        self.actual = Some(actual);
        self.status = status;
        self.attempts += 1;
    }
}
