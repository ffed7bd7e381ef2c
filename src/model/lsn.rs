//! Log sequence numbers

use std::fmt;
use std::ops::Sub;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A position in the source's write-ahead log.
///
/// Displayed and parsed in PostgreSQL's `X/Y` notation (high and low
/// 32 bits in hex).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    /// Bytes between `self` and an earlier position, zero if `earlier` is ahead
    pub fn bytes_since(self, earlier: Lsn) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    pub fn advance(self, bytes: u64) -> Lsn {
        Lsn(self.0.saturating_add(bytes))
    }
}

impl Sub for Lsn {
    type Output = u64;

    fn sub(self, rhs: Lsn) -> u64 {
        self.bytes_since(rhs)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| Error::InvalidRequest(format!("malformed LSN: {}", s)))?;
        let hi = u32::from_str_radix(hi, 16)
            .map_err(|_| Error::InvalidRequest(format!("malformed LSN: {}", s)))?;
        let lo = u32::from_str_radix(lo, 16)
            .map_err(|_| Error::InvalidRequest(format!("malformed LSN: {}", s)))?;
        Ok(Lsn(((hi as u64) << 32) | lo as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let lsn: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(lsn.0, 0x16_B374_D848);
        assert_eq!(lsn.to_string(), "16/B374D848");
        assert_eq!(Lsn::ZERO.to_string(), "0/0");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("nonsense".parse::<Lsn>().is_err());
        assert!("1/XYZ".parse::<Lsn>().is_err());
    }

    #[test]
    fn test_lag_saturates() {
        let tip = Lsn(1000);
        let applied = Lsn(400);
        assert_eq!(tip - applied, 600);
        assert_eq!(applied - tip, 0);
    }
}
