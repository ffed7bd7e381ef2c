//! Chunk-level retry with backoff

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::InitializationConfig;
use crate::error::{Error, Result};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Bounded attempts with exponential, jittered backoff and a per-attempt
/// timeout. Only retryable errors are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &InitializationConfig) -> Self {
        Self {
            max_attempts: config.chunk_retries.max(1),
            base_backoff: config.retry_backoff(),
            timeout: config.chunk_timeout(),
        }
    }

    /// Delay before attempt `attempt + 1`, with up to 25% jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
            .min(MAX_BACKOFF);
        let jitter_ms = exp.as_millis() as u64 / 4;
        if jitter_ms == 0 {
            return exp;
        }
        exp + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Cancellation is checked between attempts only; an attempt that has
    /// started runs to completion or to its timeout.
    pub async fn run<T, F, Fut>(&self, what: &str, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let result = match tokio::time::timeout(self.timeout, op()).await {
                Ok(r) => r,
                Err(_) => Err(Error::Timeout(format!("{} after {:?}", what, self.timeout))),
            };

            match result {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "{} failed, retrying: {}",
                        what,
                        e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_millis(1),
            timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_recovers_from_transient_errors() {
        let calls = &AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let value = policy(3)
            .run("read chunk", &cancel, move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Transient("connection reset".into()))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<()> = policy(2)
            .run("read chunk", &cancel, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Transient("still down".into()))
            })
            .await;
        assert!(matches!(result, Err(Error::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<()> = policy(5)
            .run("load chunk", &cancel, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Schema("relation does not exist".into()))
            })
            .await;
        assert!(matches!(result, Err(Error::Schema(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_retryable() {
        let calls = &AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let mut p = policy(2);
        p.timeout = Duration::from_millis(10);
        let result: Result<()> = p
            .run("slow chunk", &cancel, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = policy(3).run("x", &cancel, || async { Ok(()) }).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let p = RetryPolicy {
            max_attempts: 10,
            base_backoff: Duration::from_millis(100),
            timeout: Duration::from_secs(1),
        };
        let first = p.backoff(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        let third = p.backoff(3);
        assert!(third >= Duration::from_millis(400));
        assert!(p.backoff(30) <= MAX_BACKOFF + MAX_BACKOFF / 4);
    }
}
