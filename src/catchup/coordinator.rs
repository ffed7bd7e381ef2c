//! WAL catch-up coordination

use std::sync::Arc;
use std::time::Instant;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::ChangeFeed;
use crate::config::CatchupConfig;
use crate::error::{Error, Result};
use crate::model::{Lsn, SessionEvent};
use crate::snapshot::EventSink;

/// Drives a change feed until the target is live or history is lost
pub struct WalCatchupCoordinator {
    feed: Arc<dyn ChangeFeed>,
    config: CatchupConfig,
    events: EventSink,
    cancel: CancellationToken,
}

impl WalCatchupCoordinator {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        config: CatchupConfig,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            feed,
            config,
            events,
            cancel,
        }
    }

    /// Replay from `from` until lag is within `max_lag_bytes`.
    ///
    /// Returns the applied position on success. `HistoryUnavailable` is
    /// passed through untouched so the caller can tell divergence apart
    /// from ordinary failure. Growing lag only raises a warning. The feed
    /// is stopped on every error exit, cancellation included.
    pub async fn run(&self, from: Lsn) -> Result<Lsn> {
        match self.replay(from).await {
            Ok(applied) => Ok(applied),
            Err(e) => {
                if let Err(stop_err) = self.feed.stop().await {
                    tracing::warn!("Failed to stop change feed: {}", stop_err);
                }
                Err(e)
            }
        }
    }

    async fn replay(&self, from: Lsn) -> Result<Lsn> {
        self.events.emit(SessionEvent::CatchupStarted { from });
        tracing::info!(from = %from, max_lag_bytes = self.config.max_lag_bytes, "Starting WAL catch-up");
        self.feed.start(from).await?;

        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut failures = 0u32;
        let mut last_lag: Option<u64> = None;
        let mut growing_since: Option<Instant> = None;
        let mut alerted = false;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = interval.tick() => {}
            }

            let pos = match self.feed.poll().await {
                Ok(p) => {
                    failures = 0;
                    p
                }
                Err(e) if e.is_divergence() => {
                    tracing::error!("Catch-up cannot continue: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    failures += 1;
                    if failures >= self.config.max_poll_failures.max(1) {
                        tracing::error!(failures = failures, "Giving up on catch-up: {}", e);
                        return Err(e);
                    }
                    tracing::warn!(failures = failures, "Catch-up poll failed: {}", e);
                    continue;
                }
            };

            self.events.emit(SessionEvent::CatchupLag {
                applied: pos.applied,
                tip: pos.tip,
            });

            let lag = pos.lag_bytes();
            if lag <= self.config.max_lag_bytes {
                tracing::info!(applied = %pos.applied, tip = %pos.tip, lag_bytes = lag, "Caught up with source");
                return Ok(pos.applied);
            }

            match last_lag {
                Some(prev) if lag > prev => {
                    let since = *growing_since.get_or_insert_with(Instant::now);
                    if !alerted && since.elapsed() >= self.config.lag_alert() {
                        tracing::warn!(
                            lag_bytes = lag,
                            growing_for_secs = since.elapsed().as_secs(),
                            "Replication lag keeps growing"
                        );
                        alerted = true;
                    }
                }
                _ => {
                    growing_since = None;
                    alerted = false;
                }
            }
            last_lag = Some(lag);
            tracing::debug!(applied = %pos.applied, tip = %pos.tip, lag_bytes = lag, "Catch-up progress");
        }
    }
}
