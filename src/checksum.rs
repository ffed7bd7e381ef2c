//! Table content checksums
//!
//! Rows travel as PostgreSQL COPY text (one row per line, embedded newlines
//! escaped), so a table digest is built from per-line CRC32 values summed
//! with wrapping arithmetic. The sum is independent of row and chunk order,
//! which lets the source digest chunks as they stream while the target
//! recomputes over whatever physical order it stored the rows in.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::ChecksumStatus;

/// Order-independent digest of a table's rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDigest {
    pub sum: u64,
    pub rows: u64,
    pub bytes: u64,
}

impl TableDigest {
    /// Add one row (without its line terminator)
    pub fn add_row(&mut self, row: &[u8]) {
        self.sum = self.sum.wrapping_add(u64::from(crc32fast::hash(row)));
        self.rows += 1;
        self.bytes += row.len() as u64 + 1;
    }

    /// Add a chunk of newline-terminated COPY text
    pub fn add_chunk(&mut self, data: &[u8]) {
        let mut rest = data;
        while !rest.is_empty() {
            match rest.iter().position(|b| *b == b'\n') {
                Some(i) => {
                    self.add_row(&rest[..i]);
                    rest = &rest[i + 1..];
                }
                None => {
                    self.add_row(rest);
                    break;
                }
            }
        }
    }

    /// Fold another partial digest (e.g. a chunk) into this one
    pub fn merge(&mut self, other: &TableDigest) {
        self.sum = self.sum.wrapping_add(other.sum);
        self.rows += other.rows;
        self.bytes += other.bytes;
    }

    pub fn hex(&self) -> String {
        format!("{:016x}", self.sum)
    }
}

impl fmt::Display for TableDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} rows, {} bytes)", self.hex(), self.rows, self.bytes)
    }
}

/// Computes and compares table digests
pub struct ChecksumVerifier;

impl ChecksumVerifier {
    pub fn digest(data: &[u8]) -> TableDigest {
        let mut digest = TableDigest::default();
        digest.add_chunk(data);
        digest
    }

    pub fn digest_rows<'a, I>(rows: I) -> TableDigest
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut digest = TableDigest::default();
        for row in rows {
            digest.add_row(row);
        }
        digest
    }

    pub fn compare(expected: &TableDigest, actual: &TableDigest) -> ChecksumStatus {
        if expected == actual {
            ChecksumStatus::Passed
        } else {
            ChecksumStatus::Failed
        }
    }

    /// Fail with `ChecksumMismatch` unless the digests agree
    pub fn verify(table: &str, expected: &TableDigest, actual: &TableDigest) -> Result<()> {
        match Self::compare(expected, actual) {
            ChecksumStatus::Passed => Ok(()),
            _ => Err(Error::ChecksumMismatch {
                table: table.to_string(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROWS: &[u8] = b"1\talice\t2024-01-01\n2\tbob\t\\N\n3\tcarol\t2024-03-09\n";

    #[test]
    fn test_identical_content_passes() {
        let source = ChecksumVerifier::digest(ROWS);
        let target = ChecksumVerifier::digest(ROWS);
        assert_eq!(ChecksumVerifier::compare(&source, &target), ChecksumStatus::Passed);
        assert_eq!(source.rows, 3);
        assert_eq!(source.bytes, ROWS.len() as u64);
    }

    #[test]
    fn test_single_byte_divergence_fails() {
        let source = ChecksumVerifier::digest(ROWS);
        for i in 0..ROWS.len() {
            if ROWS[i] == b'\n' {
                continue;
            }
            let mut corrupted = ROWS.to_vec();
            corrupted[i] ^= 0x01;
            let target = ChecksumVerifier::digest(&corrupted);
            assert_eq!(
                ChecksumVerifier::compare(&source, &target),
                ChecksumStatus::Failed,
                "flip at byte {} went unnoticed",
                i
            );
        }
    }

    #[test]
    fn test_chunking_and_order_do_not_matter() {
        let whole = ChecksumVerifier::digest(ROWS);

        let mut chunked = ChecksumVerifier::digest(b"3\tcarol\t2024-03-09\n");
        chunked.merge(&ChecksumVerifier::digest(b"1\talice\t2024-01-01\n2\tbob\t\\N\n"));
        assert_eq!(whole, chunked);

        let rows: [&[u8]; 3] = [b"2\tbob\t\\N", b"3\tcarol\t2024-03-09", b"1\talice\t2024-01-01"];
        assert_eq!(whole, ChecksumVerifier::digest_rows(rows));
    }

    #[test]
    fn test_missing_row_detected() {
        let source = ChecksumVerifier::digest(ROWS);
        let target = ChecksumVerifier::digest(b"1\talice\t2024-01-01\n2\tbob\t\\N\n");
        let err = ChecksumVerifier::verify("public.users", &source, &target).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_unterminated_tail_counts_as_row() {
        let a = ChecksumVerifier::digest(b"x\ny");
        assert_eq!(a.rows, 2);
        assert_eq!(ChecksumVerifier::digest(b"").rows, 0);
    }
}
