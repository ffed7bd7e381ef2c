//! Source-side snapshot generation

use std::sync::Arc;

use futures::stream::{self, TryStreamExt};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use super::{
    dependency_order, plan_chunks, ChunkCodec, EventSink, PipelineOptions, SnapshotItem,
    SourceView, TableInfo,
};
use crate::checksum::TableDigest;
use crate::error::{Error, Result};
use crate::model::{SessionEvent, SnapshotPhase, SnapshotStep};

const PHASE: SnapshotPhase = SnapshotPhase::Generation;

/// Whether a table stream is the session's first pass or a re-fetch
/// requested by the applier after a checksum mismatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Initial,
    Refetch,
}

/// Streams a pinned source view to the applier
pub struct SnapshotGenerator {
    view: Arc<dyn SourceView>,
    options: PipelineOptions,
    codec: ChunkCodec,
    workers: Arc<Semaphore>,
    events: EventSink,
    cancel: CancellationToken,
}

impl SnapshotGenerator {
    pub fn new(
        view: Arc<dyn SourceView>,
        options: PipelineOptions,
        workers: Arc<Semaphore>,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        let codec = ChunkCodec::new(options.compression);
        Self {
            view,
            options,
            codec,
            workers,
            events,
            cancel,
        }
    }

    /// Run every generation step in order: schema, tables, sequences, checksums
    pub async fn run(&self, tx: mpsc::Sender<SnapshotItem>) -> Result<()> {
        self.step(SnapshotStep::Schema);
        let schema = self.view.export_schema().await.map_err(|e| match e {
            Error::Cancelled | Error::Schema(_) => e,
            other => Error::Schema(format!("export failed: {}", other)),
        })?;
        tracing::debug!(
            pre_data = schema.pre_data.len(),
            post_data = schema.post_data.len(),
            "Exported schema"
        );
        send(&tx, SnapshotItem::Schema(schema)).await?;

        self.step(SnapshotStep::Tables);
        let tables = dependency_order(self.view.list_tables().await?);
        self.events.emit(SessionEvent::TablesEnumerated {
            phase: PHASE,
            tables: tables.iter().map(TableInfo::progress).collect(),
        });
        send(&tx, SnapshotItem::Tables(tables.clone())).await?;
        tracing::info!(
            tables = tables.len(),
            workers = self.options.workers,
            "Streaming table data"
        );

        // Dispatch in dependency order; at most `workers` tables in flight
        stream::iter(tables.iter().enumerate().map(Ok::<_, Error>))
            .try_for_each_concurrent(self.options.workers, |(idx, table)| {
                let tx = tx.clone();
                async move {
                    self.stream_table(idx, table, tx, StreamMode::Initial)
                        .await
                        .map(|_| ())
                }
            })
            .await?;

        // The view is pinned, so this reads sequence state as of the snapshot
        self.step(SnapshotStep::Sequences);
        let sequences = self.view.export_sequences().await.map_err(|e| match e {
            Error::Cancelled | Error::Sequences(_) => e,
            other => Error::Sequences(format!("export failed: {}", other)),
        })?;
        send(&tx, SnapshotItem::Sequences(sequences)).await?;

        // Table digests went out with each TableDone
        self.step(SnapshotStep::Checksums);
        self.events.emit(SessionEvent::PhaseFinished { phase: PHASE });
        Ok(())
    }

    /// Stream one table chunk by chunk and finish with its digest.
    ///
    /// Chunks of a table are read sequentially, so only one worker owns the
    /// table at a time. A worker permit is held only while reading.
    pub async fn stream_table(
        &self,
        idx: usize,
        table: &TableInfo,
        tx: mpsc::Sender<SnapshotItem>,
        mode: StreamMode,
    ) -> Result<TableDigest> {
        let report = mode == StreamMode::Initial;
        let name = table.qualified_name();
        if report {
            self.events.emit(SessionEvent::TableStarted { phase: PHASE, table: idx });
        }

        let mut digest = TableDigest::default();
        for range in plan_chunks(table, self.options.chunk_bytes) {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let read = {
                let _permit = self
                    .workers
                    .acquire()
                    .await
                    .map_err(|_| Error::ShuttingDown)?;
                let view = &self.view;
                let range = &range;
                self.options
                    .retry
                    .run(&format!("read {} chunk {}", name, range.index), &self.cancel, move || {
                        view.read_chunk(table, range)
                    })
                    .await
            };
            let chunk = match read {
                Ok(c) => c,
                Err(e) => {
                    if report && !e.is_cancelled() {
                        self.events.emit(SessionEvent::TableFailed {
                            phase: PHASE,
                            table: idx,
                            reason: e.to_string(),
                        });
                    }
                    return Err(e);
                }
            };

            digest.add_chunk(&chunk.payload);
            let rows = chunk.rows;
            let bytes = chunk.payload.len() as u64;
            let encoded = self.codec.encode(chunk);
            if self.codec.enabled() {
                self.events.emit(SessionEvent::Compressed {
                    original: encoded.original_len,
                    compressed: encoded.wire_len(),
                });
            }
            if report {
                self.events.emit(SessionEvent::ChunkCopied {
                    phase: PHASE,
                    table: idx,
                    rows,
                    bytes,
                });
            }
            send(&tx, SnapshotItem::Chunk { table: idx, chunk: encoded }).await?;
        }

        if report {
            self.events.emit(SessionEvent::TableCompleted { phase: PHASE, table: idx });
        }
        self.events.emit(SessionEvent::ChecksumComputed { table: idx, digest });
        tracing::debug!(table = %name, checksum = %digest, ?mode, "Table streamed");
        send(&tx, SnapshotItem::TableDone { table: idx, digest }).await?;
        Ok(digest)
    }

    fn step(&self, step: SnapshotStep) {
        tracing::debug!(phase = %PHASE, step = %step, "Step started");
        self.events.emit(SessionEvent::StepStarted { phase: PHASE, step });
    }
}

/// A closed channel means the applier has stopped; its error is the one
/// worth reporting, so this side reports a cancellation.
async fn send(tx: &mpsc::Sender<SnapshotItem>, item: SnapshotItem) -> Result<()> {
    tx.send(item).await.map_err(|_| Error::Cancelled)
}
