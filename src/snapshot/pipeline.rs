//! Session pipeline: wires generator and applier together

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use super::{EventSink, RetryPolicy, SnapshotApplier, SnapshotGenerator, SnapshotSource, SnapshotTarget};
use crate::config::{InitializationConfig, SchemaSyncMode};
use crate::error::{Error, Result};
use crate::model::{Lsn, SessionEvent};

/// Knobs for one snapshot session
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub workers: usize,
    pub chunk_bytes: u64,
    pub compression: bool,
    pub retry: RetryPolicy,
    pub checksum_retries: u32,
    pub schema_sync: SchemaSyncMode,
}

impl PipelineOptions {
    pub fn from_config(config: &InitializationConfig) -> Result<Self> {
        Ok(Self {
            workers: config.effective_workers().max(1),
            chunk_bytes: config.chunk_bytes()?,
            compression: config.compression,
            retry: RetryPolicy::from_config(config),
            checksum_retries: config.checksum_retries,
            schema_sync: config.schema_sync,
        })
    }
}

/// Outcome of a successful session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub consistency_lsn: Lsn,
    pub tables: usize,
}

/// Run generation and application concurrently for one session.
///
/// Both sides share one pool of `workers` permits. A failure on either
/// side stops the other at its next chunk boundary; operator cancellation
/// through `cancel` does the same and always surfaces as `Cancelled`.
pub async fn run_snapshot(
    source: Arc<dyn SnapshotSource>,
    target: Arc<dyn SnapshotTarget>,
    target_node: &str,
    options: PipelineOptions,
    events: EventSink,
    cancel: CancellationToken,
) -> Result<SnapshotSummary> {
    let view = source.open_view(target_node).await.map_err(|e| match e {
        Error::Cancelled | Error::SourceUnavailable(_) => e,
        other => Error::SourceUnavailable(other.to_string()),
    })?;
    let consistency_lsn = view.consistency_lsn();
    events.emit(SessionEvent::Prepared { consistency_lsn });
    tracing::info!(
        lsn = %consistency_lsn,
        workers = options.workers,
        compression = options.compression,
        "Opened consistent source view"
    );

    let session_cancel = cancel.child_token();
    let workers = Arc::new(Semaphore::new(options.workers));
    let generator = Arc::new(SnapshotGenerator::new(
        Arc::clone(&view),
        options.clone(),
        Arc::clone(&workers),
        events.clone(),
        session_cancel.clone(),
    ));
    let applier = Arc::new(SnapshotApplier::new(
        target,
        Arc::clone(&generator),
        options.clone(),
        workers,
        events,
        session_cancel.clone(),
    ));

    let (tx, rx) = mpsc::channel(options.workers * 2);
    let generate = async {
        let r = generator.run(tx).await;
        if r.is_err() {
            session_cancel.cancel();
        }
        r
    };
    let apply = async {
        let r = applier.run(rx).await;
        if r.is_err() {
            session_cancel.cancel();
        }
        r
    };
    let (generated, applied) = tokio::join!(generate, apply);

    if let Err(e) = view.close().await {
        tracing::warn!("Failed to release source view: {}", e);
    }

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    match (generated, applied) {
        (Ok(()), Ok(tables)) => Ok(SnapshotSummary { consistency_lsn, tables }),
        // the side that did not fail reports a cancellation; surface the cause
        (Err(e), _) if !e.is_cancelled() => Err(e),
        (_, Err(e)) if !e.is_cancelled() => Err(e),
        (Err(e), _) | (_, Err(e)) => Err(e),
    }
}
