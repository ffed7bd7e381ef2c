//! Target-side snapshot application

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{
    ChunkCodec, EventSink, PipelineOptions, SchemaExport, SnapshotGenerator, SnapshotItem,
    SnapshotTarget, StreamMode, TableInfo,
};
use crate::checksum::{ChecksumVerifier, TableDigest};
use crate::config::SchemaSyncMode;
use crate::error::{Error, Result};
use crate::model::{ChecksumStatus, SessionEvent, SnapshotPhase, SnapshotStep};
use crate::schema::{compare, SchemaComparison, MAX_LISTED_DIFFERENCES};

const PHASE: SnapshotPhase = SnapshotPhase::Application;

/// Per-table loader queue depth
const LOADER_DEPTH: usize = 2;

/// Materializes the generator's stream on the target
pub struct SnapshotApplier {
    target: Arc<dyn SnapshotTarget>,
    generator: Arc<SnapshotGenerator>,
    options: PipelineOptions,
    codec: ChunkCodec,
    workers: Arc<Semaphore>,
    events: EventSink,
    cancel: CancellationToken,
}

impl SnapshotApplier {
    pub fn new(
        target: Arc<dyn SnapshotTarget>,
        generator: Arc<SnapshotGenerator>,
        options: PipelineOptions,
        workers: Arc<Semaphore>,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        let codec = ChunkCodec::new(options.compression);
        Self {
            target,
            generator,
            options,
            codec,
            workers,
            events,
            cancel,
        }
    }

    /// Consume the snapshot stream. Returns the number of tables applied.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<SnapshotItem>) -> Result<usize> {
        // Schema must be fully applied before any chunk is loaded
        self.step(SnapshotStep::Schema);
        let schema = match rx.recv().await {
            Some(SnapshotItem::Schema(s)) => s,
            Some(other) => return Err(unexpected(&other)),
            None => return Err(Error::Cancelled),
        };
        self.target
            .apply_ddl(&schema.pre_data)
            .await
            .map_err(|e| Error::Schema(format!("apply failed: {}", e)))?;
        self.verify_schema(&schema).await?;

        self.step(SnapshotStep::Tables);
        let tables = match rx.recv().await {
            Some(SnapshotItem::Tables(t)) => Arc::new(t),
            Some(other) => return Err(unexpected(&other)),
            None => return Err(Error::Cancelled),
        };
        self.events.emit(SessionEvent::TablesEnumerated {
            phase: PHASE,
            tables: tables.iter().map(TableInfo::progress).collect(),
        });

        let mut loaders: HashMap<usize, mpsc::Sender<SnapshotItem>> = HashMap::new();
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        let mut sequences = None;
        let mut failure: Option<Error> = None;

        loop {
            tokio::select! {
                item = rx.recv() => {
                    let Some(item) = item else { break };
                    match item {
                        SnapshotItem::Chunk { table, .. } | SnapshotItem::TableDone { table, .. } => {
                            let Some(info) = tables.get(table).cloned() else {
                                failure = Some(Error::Internal(format!("chunk for unknown table #{}", table)));
                                break;
                            };
                            let done = matches!(item, SnapshotItem::TableDone { .. });
                            let tx = loaders.entry(table).or_insert_with(|| {
                                let (tx, rx) = mpsc::channel(LOADER_DEPTH);
                                tasks.spawn(Arc::clone(&self).load_table(table, info, rx));
                                tx
                            });
                            // a closed queue means the loader failed; join_next reports why
                            let _ = tx.send(item).await;
                            if done {
                                loaders.remove(&table);
                            }
                        }
                        SnapshotItem::Sequences(s) => sequences = Some(s),
                        other => {
                            failure = Some(unexpected(&other));
                            break;
                        }
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = flatten(joined) {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        // Let in-flight loads finish at a chunk boundary before reporting
        drop(loaders);
        if failure.is_some() {
            self.cancel.cancel();
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = flatten(joined) {
                if failure.is_none() {
                    self.cancel.cancel();
                    failure = Some(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let sequences = sequences.ok_or(Error::Cancelled)?;

        self.target
            .apply_ddl(&schema.post_data)
            .await
            .map_err(|e| Error::Schema(format!("post-data apply failed: {}", e)))?;

        self.step(SnapshotStep::Sequences);
        self.target
            .apply_sequences(&sequences)
            .await
            .map_err(|e| Error::Sequences(format!("apply failed: {}", e)))?;

        // Every loader verified its table before finishing
        self.step(SnapshotStep::Checksums);
        self.events.emit(SessionEvent::PhaseFinished { phase: PHASE });
        tracing::info!(tables = tables.len(), sequences = sequences.len(), "Snapshot applied");
        Ok(tables.len())
    }

    /// Compare the tables just created against the source's fingerprints
    /// and act on differences according to the schema sync mode
    async fn verify_schema(&self, schema: &SchemaExport) -> Result<()> {
        let comparison = self.compare_schema(schema).await?;
        if !comparison.has_differences() {
            tracing::debug!(summary = %comparison.summary(), "Target schema matches source");
            return Ok(());
        }

        match self.options.schema_sync {
            SchemaSyncMode::Strict => {
                tracing::error!(summary = %comparison.summary(), "Target schema differs from source");
                Err(Error::SchemaMismatch(comparison.describe(MAX_LISTED_DIFFERENCES)))
            }
            SchemaSyncMode::Manual => {
                tracing::warn!(
                    summary = %comparison.summary(),
                    "Continuing despite schema differences: {}",
                    comparison.describe(5)
                );
                Ok(())
            }
            SchemaSyncMode::Auto => {
                tracing::warn!(
                    summary = %comparison.summary(),
                    "Target schema differs from source, recreating it"
                );
                self.target.reset().await?;
                self.target
                    .apply_ddl(&schema.pre_data)
                    .await
                    .map_err(|e| Error::Schema(format!("re-apply failed: {}", e)))?;
                let retried = self.compare_schema(schema).await?;
                if retried.has_differences() {
                    return Err(Error::SchemaMismatch(retried.describe(MAX_LISTED_DIFFERENCES)));
                }
                tracing::info!("Target schema recreated to match source");
                Ok(())
            }
        }
    }

    async fn compare_schema(&self, schema: &SchemaExport) -> Result<SchemaComparison> {
        let target = self
            .target
            .table_fingerprints()
            .await
            .map_err(|e| Error::Schema(format!("fingerprint failed: {}", e)))?;
        Ok(compare(&schema.fingerprints, &target))
    }

    /// Load, verify and if needed re-fetch one table. Owns the table's
    /// application row for the whole time.
    async fn load_table(
        self: Arc<Self>,
        idx: usize,
        table: TableInfo,
        mut rx: mpsc::Receiver<SnapshotItem>,
    ) -> Result<()> {
        let name = table.qualified_name();
        self.events.emit(SessionEvent::TableStarted { phase: PHASE, table: idx });

        let mut expected = match self.load_stream(idx, &table, &mut rx).await {
            Ok(d) => d,
            Err(e) => return Err(self.table_failed(idx, e)),
        };

        let mut attempt = 1u32;
        loop {
            let actual = self.target.table_digest(&table).await?;
            let status = ChecksumVerifier::compare(&expected, &actual);
            self.events.emit(SessionEvent::ChecksumVerified { table: idx, actual, status });

            if status == ChecksumStatus::Passed {
                self.events.emit(SessionEvent::TableCompleted { phase: PHASE, table: idx });
                tracing::info!(table = %name, rows = actual.rows, bytes = actual.bytes, "Table verified");
                return Ok(());
            }

            let mismatch = ChecksumVerifier::verify(&name, &expected, &actual)
                .err()
                .unwrap_or_else(|| Error::Internal("checksum compare disagreed with verify".into()));
            self.events.emit(SessionEvent::TableFailed {
                phase: PHASE,
                table: idx,
                reason: mismatch.to_string(),
            });
            if attempt > self.options.checksum_retries {
                tracing::error!(table = %name, attempts = attempt, "Checksum retries exhausted");
                return Err(mismatch);
            }
            tracing::warn!(table = %name, attempt = attempt, "Checksum mismatch, re-fetching table: {}", mismatch);
            attempt += 1;

            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.target.truncate_table(&table).await?;
            self.events.emit(SessionEvent::TableReset { phase: PHASE, table: idx });

            let (tx, mut refetch_rx) = mpsc::channel(LOADER_DEPTH);
            let (fetched, loaded) = tokio::join!(
                self.generator.stream_table(idx, &table, tx, StreamMode::Refetch),
                self.load_stream(idx, &table, &mut refetch_rx),
            );
            if let Err(e) = fetched {
                return Err(self.table_failed(idx, e));
            }
            expected = match loaded {
                Ok(d) => d,
                Err(e) => return Err(self.table_failed(idx, e)),
            };
        }
    }

    /// Load chunks until the table's digest arrives
    async fn load_stream(
        &self,
        idx: usize,
        table: &TableInfo,
        rx: &mut mpsc::Receiver<SnapshotItem>,
    ) -> Result<TableDigest> {
        loop {
            match rx.recv().await {
                Some(SnapshotItem::Chunk { chunk, .. }) => {
                    // chunk boundary: the only place a load can be interrupted
                    if self.cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    let data = self.codec.decode(&chunk)?;
                    {
                        let _permit = self
                            .workers
                            .acquire()
                            .await
                            .map_err(|_| Error::ShuttingDown)?;
                        let target = &self.target;
                        let data = &data;
                        self.options
                            .retry
                            .run(
                                &format!("load {} chunk {}", table.qualified_name(), data.index),
                                &self.cancel,
                                move || target.load_chunk(table, data),
                            )
                            .await?;
                    }
                    self.events.emit(SessionEvent::ChunkCopied {
                        phase: PHASE,
                        table: idx,
                        rows: data.rows,
                        bytes: data.payload.len() as u64,
                    });
                }
                Some(SnapshotItem::TableDone { digest, .. }) => return Ok(digest),
                Some(other) => return Err(unexpected(&other)),
                None => return Err(Error::Cancelled),
            }
        }
    }

    fn table_failed(&self, idx: usize, e: Error) -> Error {
        if !e.is_cancelled() {
            self.events.emit(SessionEvent::TableFailed {
                phase: PHASE,
                table: idx,
                reason: e.to_string(),
            });
        }
        e
    }

    fn step(&self, step: SnapshotStep) {
        tracing::debug!(phase = %PHASE, step = %step, "Step started");
        self.events.emit(SessionEvent::StepStarted { phase: PHASE, step });
    }
}

fn unexpected(item: &SnapshotItem) -> Error {
    let kind = match item {
        SnapshotItem::Schema(_) => "schema",
        SnapshotItem::Tables(_) => "table list",
        SnapshotItem::Chunk { .. } => "chunk",
        SnapshotItem::TableDone { .. } => "table digest",
        SnapshotItem::Sequences(_) => "sequences",
    };
    Error::Internal(format!("unexpected {} in snapshot stream", kind))
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.map_err(|e| Error::Internal(format!("table loader panicked: {}", e)))?
}
