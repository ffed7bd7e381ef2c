//! WAL Catch-up Module
//!
//! After the snapshot is applied, the target replays the source's change
//! stream from the snapshot's consistency LSN until it is within the live
//! lag threshold.

mod coordinator;

pub use coordinator::WalCatchupCoordinator;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::Lsn;

/// Replay position reported by a change feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedPosition {
    /// Last position applied on the target
    pub applied: Lsn,
    /// Current end of the source's log
    pub tip: Lsn,
}

impl FeedPosition {
    pub fn lag_bytes(&self) -> u64 {
        self.tip - self.applied
    }
}

/// Change stream from a source node into a target node.
///
/// Implementations return `Error::HistoryUnavailable` when the source no
/// longer retains the log needed to continue; every other error is treated
/// as a possibly transient replay failure.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Begin replaying changes after `from`
    async fn start(&self, from: Lsn) -> Result<()>;

    /// Advance replay as far as it has got and report the position
    async fn poll(&self) -> Result<FeedPosition>;

    /// Stop replaying; used when the session is abandoned
    async fn stop(&self) -> Result<()>;
}
