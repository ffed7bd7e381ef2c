//! In-memory backend
//!
//! Each `MemoryDatabase` stores tables as COPY text rows, sequences, and a
//! write-ahead log of inserts. It acts as snapshot source, snapshot target
//! and change feed endpoint, and carries fault switches for exercising
//! retry, checksum and divergence paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, RwLock};

use super::NodeConnector;
use crate::catchup::{ChangeFeed, FeedPosition};
use crate::checksum::{ChecksumVerifier, TableDigest};
use crate::error::{Error, Result};
use crate::model::Lsn;
use crate::schema::{ColumnDef, TableFingerprint};
use crate::snapshot::{
    ChunkData, ChunkRange, SchemaExport, SequenceValue, SnapshotSource, SnapshotTarget,
    SourceView, TableInfo,
};

/// Records replayed per change feed poll
const REPLAY_BATCH: usize = 64;

#[derive(Debug, Clone, Default)]
struct MemTable {
    schema: String,
    name: String,
    depends_on: Vec<String>,
    columns: Vec<ColumnDef>,
    rows: Vec<String>,
}

impl MemTable {
    fn fingerprint(&self) -> TableFingerprint {
        TableFingerprint::new(&self.schema, &self.name, &self.columns)
    }

    fn create_statement(&self) -> String {
        let name = format!("{}.{}", self.schema, self.name);
        if self.columns.is_empty() {
            return format!("CREATE TABLE {}", name);
        }
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.data_type))
            .collect();
        format!("CREATE TABLE {} ({})", name, columns.join(", "))
    }

    fn info(&self) -> TableInfo {
        TableInfo {
            schema: self.schema.clone(),
            name: self.name.clone(),
            rows_estimate: self.rows.len() as u64,
            bytes_estimate: self.rows.iter().map(|r| r.len() as u64 + 1).sum(),
            depends_on: self.depends_on.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct WalRecord {
    lsn: Lsn,
    table: String,
    row: String,
}

#[derive(Debug, Default)]
struct DbState {
    tables: BTreeMap<String, MemTable>,
    sequences: BTreeMap<String, (i64, bool)>,
    ddl_log: Vec<String>,
    wal: Vec<WalRecord>,
    tip: Lsn,
    /// Oldest position still replayable
    oldest: Lsn,
}

impl DbState {
    fn append_wal(&mut self, table: &str, row: &str) {
        self.tip = self.tip.advance(row.len() as u64 + 1);
        self.wal.push(WalRecord {
            lsn: self.tip,
            table: table.to_string(),
            row: row.to_string(),
        });
    }

    fn recycle_wal(&mut self) {
        self.wal.clear();
        self.oldest = self.tip;
    }
}

#[derive(Debug, Default)]
struct Faults {
    chunk_read_failures: HashMap<String, u32>,
    corrupt_loads: HashMap<String, u32>,
    read_delay: Option<Duration>,
    fail_schema_export: bool,
    fail_sequence_export: bool,
    stall_replay: bool,
    drift_on_create: HashMap<String, ColumnDef>,
    recycle_wal_on_open: bool,
    unavailable: bool,
}

/// Split `CREATE TABLE name [(col type, ...)]` into name and columns
fn parse_create_table(stmt: &str) -> Result<(&str, Vec<ColumnDef>)> {
    let rest = stmt
        .strip_prefix("CREATE TABLE ")
        .ok_or_else(|| Error::Schema(format!("unsupported statement: {}", stmt)))?;
    let Some((name, list)) = rest.split_once(" (") else {
        return Ok((rest.trim(), Vec::new()));
    };
    let list = list
        .strip_suffix(')')
        .ok_or_else(|| Error::Schema(format!("unterminated column list: {}", stmt)))?;
    let columns = list
        .split(", ")
        .map(|col| {
            col.split_once(' ')
                .map(|(name, data_type)| ColumnDef::new(name, data_type))
                .ok_or_else(|| Error::Schema(format!("malformed column '{}'", col)))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((name.trim(), columns))
}

/// One in-process database node
#[derive(Debug)]
pub struct MemoryDatabase {
    id: String,
    state: Arc<Mutex<DbState>>,
    faults: Arc<Mutex<Faults>>,
}

impl MemoryDatabase {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Arc::new(Mutex::new(DbState::default())),
            faults: Arc::new(Mutex::new(Faults::default())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Create a table; `depends_on` lists referenced tables by qualified name
    pub async fn create_table(&self, schema: &str, name: &str, depends_on: &[&str]) {
        let mut state = self.state.lock().await;
        state.tables.insert(
            format!("{}.{}", schema, name),
            MemTable {
                schema: schema.to_string(),
                name: name.to_string(),
                depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
                columns: Vec::new(),
                rows: Vec::new(),
            },
        );
    }

    pub async fn add_column(&self, table: &str, name: &str, data_type: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let t = state
            .tables
            .get_mut(table)
            .ok_or_else(|| Error::Schema(format!("relation {} does not exist", table)))?;
        t.columns.push(ColumnDef::new(name, data_type));
        Ok(())
    }

    pub async fn columns(&self, table: &str) -> Vec<ColumnDef> {
        let state = self.state.lock().await;
        state.tables.get(table).map(|t| t.columns.clone()).unwrap_or_default()
    }

    /// Insert COPY text rows, logging each in the WAL
    pub async fn insert_rows<I, S>(&self, table: &str, rows: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.lock().await;
        if !state.tables.contains_key(table) {
            return Err(Error::Schema(format!("relation {} does not exist", table)));
        }
        for row in rows {
            let row = row.into();
            state.append_wal(table, &row);
            if let Some(t) = state.tables.get_mut(table) {
                t.rows.push(row);
            }
        }
        Ok(())
    }

    pub async fn set_sequence(&self, name: &str, value: i64) {
        self.state.lock().await.sequences.insert(name.to_string(), (value, true));
    }

    pub async fn rows(&self, table: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state.tables.get(table).map(|t| t.rows.clone()).unwrap_or_default()
    }

    pub async fn has_table(&self, table: &str) -> bool {
        self.state.lock().await.tables.contains_key(table)
    }

    pub async fn sequence(&self, name: &str) -> Option<i64> {
        self.state.lock().await.sequences.get(name).map(|(v, _)| *v)
    }

    pub async fn ddl_log(&self) -> Vec<String> {
        self.state.lock().await.ddl_log.clone()
    }

    pub async fn tip(&self) -> Lsn {
        self.state.lock().await.tip
    }

    /// Drop all retained WAL; replay from any earlier position becomes impossible
    pub async fn recycle_wal(&self) {
        self.state.lock().await.recycle_wal();
    }

    // Fault switches

    /// The next `times` reads of `table` fail with a transient error
    pub async fn fail_chunk_reads(&self, table: &str, times: u32) {
        self.faults.lock().await.chunk_read_failures.insert(table.to_string(), times);
    }

    /// The next `times` loads of the first chunk of `table` store a corrupted row
    pub async fn corrupt_loads(&self, table: &str, times: u32) {
        self.faults.lock().await.corrupt_loads.insert(table.to_string(), times);
    }

    pub async fn set_read_delay(&self, delay: Duration) {
        self.faults.lock().await.read_delay = Some(delay);
    }

    pub async fn fail_schema_export(&self) {
        self.faults.lock().await.fail_schema_export = true;
    }

    pub async fn fail_sequence_export(&self) {
        self.faults.lock().await.fail_sequence_export = true;
    }

    /// The next creation of `table` on this node gains an extra column, as
    /// if a local DDL trigger had altered it
    pub async fn drift_on_create(&self, table: &str, column: &str, data_type: &str) {
        self.faults
            .lock()
            .await
            .drift_on_create
            .insert(table.to_string(), ColumnDef::new(column, data_type));
    }

    /// While set, change feeds reading from this node report progress without applying anything
    pub async fn stall_replay(&self, stalled: bool) {
        self.faults.lock().await.stall_replay = stalled;
    }

    /// Writes land and WAL is recycled right after a view opens, so the
    /// history from the snapshot's LSN is gone by catch-up time
    pub async fn recycle_wal_after_snapshot(&self) {
        self.faults.lock().await.recycle_wal_on_open = true;
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.faults.lock().await.unavailable = unavailable;
    }

    pub async fn clear_faults(&self) {
        *self.faults.lock().await = Faults::default();
    }

    async fn check_available(&self) -> Result<()> {
        if self.faults.lock().await.unavailable {
            return Err(Error::SourceUnavailable(format!("node {} is not reachable", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotSource for MemoryDatabase {
    async fn open_view(&self, target_node: &str) -> Result<Arc<dyn SourceView>> {
        self.check_available().await?;
        let mut state = self.state.lock().await;
        let view = MemoryView {
            lsn: state.tip,
            tables: state.tables.clone(),
            sequences: state.sequences.clone(),
            faults: Arc::clone(&self.faults),
        };

        if self.faults.lock().await.recycle_wal_on_open {
            state.tip = state.tip.advance(1);
            state.recycle_wal();
        }
        tracing::debug!(node = %self.id, target = %target_node, lsn = %view.lsn, "Opened memory view");
        Ok(Arc::new(view))
    }
}

/// Copy of a database taken at open time
struct MemoryView {
    lsn: Lsn,
    tables: BTreeMap<String, MemTable>,
    sequences: BTreeMap<String, (i64, bool)>,
    faults: Arc<Mutex<Faults>>,
}

#[async_trait]
impl SourceView for MemoryView {
    fn consistency_lsn(&self) -> Lsn {
        self.lsn
    }

    async fn export_schema(&self) -> Result<SchemaExport> {
        if self.faults.lock().await.fail_schema_export {
            return Err(Error::Schema("permission denied for schema public".into()));
        }

        let mut export = SchemaExport::default();
        let mut schemas: Vec<&str> = self.tables.values().map(|t| t.schema.as_str()).collect();
        schemas.dedup();
        for schema in schemas {
            export.pre_data.push(format!("CREATE SCHEMA IF NOT EXISTS {}", schema));
        }
        for name in self.sequences.keys() {
            export.pre_data.push(format!("CREATE SEQUENCE {}", name));
        }
        for (name, table) in &self.tables {
            export.pre_data.push(table.create_statement());
            export.fingerprints.push(table.fingerprint());
            for parent in &table.depends_on {
                export
                    .post_data
                    .push(format!("ALTER TABLE {} ADD FOREIGN KEY REFERENCES {}", name, parent));
            }
        }
        Ok(export)
    }

    async fn list_tables(&self) -> Result<Vec<TableInfo>> {
        Ok(self.tables.values().map(MemTable::info).collect())
    }

    async fn read_chunk(&self, table: &TableInfo, range: &ChunkRange) -> Result<ChunkData> {
        let name = table.qualified_name();
        let delay = {
            let mut faults = self.faults.lock().await;
            if let Some(remaining) = faults.chunk_read_failures.get_mut(&name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::Transient(format!("connection reset reading {}", name)));
                }
            }
            faults.read_delay
        };
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }

        let rows = &self
            .tables
            .get(&name)
            .ok_or_else(|| Error::Schema(format!("relation {} does not exist", name)))?
            .rows;
        let start = (range.offset as usize).min(rows.len());
        let end = match range.limit {
            Some(limit) => (start + limit as usize).min(rows.len()),
            None => rows.len(),
        };

        let mut payload = String::new();
        for row in &rows[start..end] {
            payload.push_str(row);
            payload.push('\n');
        }
        Ok(ChunkData {
            index: range.index,
            rows: (end - start) as u64,
            payload: Bytes::from(payload),
        })
    }

    async fn export_sequences(&self) -> Result<Vec<SequenceValue>> {
        if self.faults.lock().await.fail_sequence_export {
            return Err(Error::Sequences("permission denied for sequence".into()));
        }
        self.sequences
            .iter()
            .map(|(name, (value, is_called))| {
                let (schema, seq) = name
                    .split_once('.')
                    .ok_or_else(|| Error::Sequences(format!("unqualified sequence {}", name)))?;
                Ok(SequenceValue {
                    schema: schema.to_string(),
                    name: seq.to_string(),
                    last_value: *value,
                    is_called: *is_called,
                })
            })
            .collect()
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl SnapshotTarget for MemoryDatabase {
    async fn reset(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.tables.clear();
        state.sequences.clear();
        state.ddl_log.clear();
        Ok(())
    }

    async fn apply_ddl(&self, statements: &[String]) -> Result<()> {
        let mut state = self.state.lock().await;
        for stmt in statements {
            let words: Vec<&str> = stmt.split_whitespace().collect();
            match words.as_slice() {
                ["CREATE", "SCHEMA", ..] => {}
                ["CREATE", "SEQUENCE", name] => {
                    state.sequences.entry(name.to_string()).or_insert((1, false));
                }
                ["CREATE", "TABLE", ..] => {
                    let (name, mut columns) = parse_create_table(stmt)?;
                    let (schema, table) = name
                        .split_once('.')
                        .ok_or_else(|| Error::Schema(format!("unqualified table {}", name)))?;
                    if let Some(extra) = self.faults.lock().await.drift_on_create.remove(name) {
                        columns.push(extra);
                    }
                    state.tables.insert(
                        name.to_string(),
                        MemTable {
                            schema: schema.to_string(),
                            name: table.to_string(),
                            columns,
                            ..Default::default()
                        },
                    );
                }
                ["ALTER", "TABLE", name, "ADD", "FOREIGN", "KEY", "REFERENCES", parent] => {
                    if !state.tables.contains_key(*parent) {
                        return Err(Error::Schema(format!("relation {} does not exist", parent)));
                    }
                    let table = state
                        .tables
                        .get_mut(*name)
                        .ok_or_else(|| Error::Schema(format!("relation {} does not exist", name)))?;
                    table.depends_on.push(parent.to_string());
                }
                _ => return Err(Error::Schema(format!("unsupported statement: {}", stmt))),
            }
            state.ddl_log.push(stmt.clone());
        }
        Ok(())
    }

    async fn table_fingerprints(&self) -> Result<Vec<TableFingerprint>> {
        let state = self.state.lock().await;
        Ok(state.tables.values().map(MemTable::fingerprint).collect())
    }

    async fn load_chunk(&self, table: &TableInfo, chunk: &ChunkData) -> Result<u64> {
        let name = table.qualified_name();
        let corrupt = {
            let mut faults = self.faults.lock().await;
            match faults.corrupt_loads.get_mut(&name) {
                Some(remaining) if *remaining > 0 && chunk.index == 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };

        let text = std::str::from_utf8(&chunk.payload)
            .map_err(|e| Error::Internal(format!("chunk for {} is not UTF-8: {}", name, e)))?;
        let mut rows: Vec<String> = text.split_terminator('\n').map(str::to_string).collect();
        if corrupt {
            if let Some(first) = rows.first_mut() {
                first.push('~');
            }
        }

        let mut state = self.state.lock().await;
        let stored = state
            .tables
            .get_mut(&name)
            .ok_or_else(|| Error::Schema(format!("relation {} does not exist", name)))?;
        let count = rows.len() as u64;
        stored.rows.append(&mut rows);
        Ok(count)
    }

    async fn truncate_table(&self, table: &TableInfo) -> Result<()> {
        let name = table.qualified_name();
        let mut state = self.state.lock().await;
        let stored = state
            .tables
            .get_mut(&name)
            .ok_or_else(|| Error::Schema(format!("relation {} does not exist", name)))?;
        stored.rows.clear();
        Ok(())
    }

    async fn table_digest(&self, table: &TableInfo) -> Result<TableDigest> {
        let name = table.qualified_name();
        let state = self.state.lock().await;
        let stored = state
            .tables
            .get(&name)
            .ok_or_else(|| Error::Schema(format!("relation {} does not exist", name)))?;
        Ok(ChecksumVerifier::digest_rows(stored.rows.iter().map(|r| r.as_bytes())))
    }

    async fn apply_sequences(&self, sequences: &[SequenceValue]) -> Result<()> {
        let mut state = self.state.lock().await;
        for seq in sequences {
            let name = seq.qualified_name();
            match state.sequences.get_mut(&name) {
                Some(v) => *v = (seq.last_value, seq.is_called),
                None => return Err(Error::Sequences(format!("sequence {} does not exist", name))),
            }
        }
        Ok(())
    }
}

/// Replays a source's WAL records into a target
pub struct MemoryChangeFeed {
    source: Arc<MemoryDatabase>,
    target: Arc<MemoryDatabase>,
    applied: Mutex<Option<Lsn>>,
}

impl MemoryChangeFeed {
    pub fn new(source: Arc<MemoryDatabase>, target: Arc<MemoryDatabase>) -> Self {
        Self {
            source,
            target,
            applied: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ChangeFeed for MemoryChangeFeed {
    async fn start(&self, from: Lsn) -> Result<()> {
        self.source.check_available().await?;
        let oldest = self.source.state.lock().await.oldest;
        if from < oldest {
            return Err(Error::HistoryUnavailable { required: from, oldest });
        }
        *self.applied.lock().await = Some(from);
        Ok(())
    }

    async fn poll(&self) -> Result<FeedPosition> {
        self.source.check_available().await?;
        let mut applied_guard = self.applied.lock().await;
        let applied = applied_guard.ok_or_else(|| Error::Internal("change feed not started".into()))?;
        if self.source.faults.lock().await.stall_replay {
            let tip = self.source.state.lock().await.tip;
            return Ok(FeedPosition { applied, tip });
        }

        let (batch, tip) = {
            let state = self.source.state.lock().await;
            if applied < state.oldest {
                return Err(Error::HistoryUnavailable { required: applied, oldest: state.oldest });
            }
            let batch: Vec<WalRecord> = state
                .wal
                .iter()
                .filter(|r| r.lsn > applied)
                .take(REPLAY_BATCH)
                .cloned()
                .collect();
            (batch, state.tip)
        };

        let mut position = applied;
        if !batch.is_empty() {
            let mut target = self.target.state.lock().await;
            for record in batch {
                let table = target.tables.get_mut(&record.table).ok_or_else(|| {
                    Error::Internal(format!("replicated insert into missing table {}", record.table))
                })?;
                table.rows.push(record.row);
                position = record.lsn;
            }
        }
        *applied_guard = Some(position);

        Ok(FeedPosition { applied: position, tip })
    }

    async fn stop(&self) -> Result<()> {
        *self.applied.lock().await = None;
        Ok(())
    }
}

/// A set of in-memory nodes addressable by id
#[derive(Debug, Default)]
pub struct MemoryCluster {
    nodes: RwLock<HashMap<String, Arc<MemoryDatabase>>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_node(&self, id: &str) -> Arc<MemoryDatabase> {
        let db = Arc::new(MemoryDatabase::new(id));
        self.nodes.write().await.insert(id.to_string(), Arc::clone(&db));
        db
    }

    pub async fn node(&self, id: &str) -> Result<Arc<MemoryDatabase>> {
        self.nodes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NodeNotFound(id.to_string()))
    }
}

#[async_trait]
impl NodeConnector for MemoryCluster {
    async fn source(&self, node_id: &str) -> Result<Arc<dyn SnapshotSource>> {
        Ok(self.node(node_id).await?)
    }

    async fn target(&self, node_id: &str) -> Result<Arc<dyn SnapshotTarget>> {
        Ok(self.node(node_id).await?)
    }

    async fn change_feed(&self, source: &str, target: &str) -> Result<Arc<dyn ChangeFeed>> {
        Ok(Arc::new(MemoryChangeFeed::new(
            self.node(source).await?,
            self.node(target).await?,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn source_with_orders() -> Arc<MemoryDatabase> {
        let db = Arc::new(MemoryDatabase::new("primary"));
        db.create_table("public", "customers", &[]).await;
        db.create_table("public", "orders", &["public.customers"]).await;
        db.insert_rows("public.customers", ["1\tada", "2\tgrace"]).await.unwrap();
        db.insert_rows("public.orders", ["10\t1\t9.99", "11\t2\t5.00", "12\t1\t1.50"])
            .await
            .unwrap();
        db.set_sequence("public.orders_id_seq", 12).await;
        db
    }

    #[tokio::test]
    async fn test_view_is_pinned() {
        let db = source_with_orders().await;
        let view = db.open_view("replica").await.unwrap();
        db.insert_rows("public.orders", ["13\t2\t7.25"]).await.unwrap();

        let tables = view.list_tables().await.unwrap();
        let orders = tables.iter().find(|t| t.name == "orders").unwrap();
        assert_eq!(orders.rows_estimate, 3);

        let range = ChunkRange { index: 0, offset: 0, limit: None };
        let chunk = view.read_chunk(orders, &range).await.unwrap();
        assert_eq!(chunk.rows, 3);
        assert!(view.consistency_lsn() < db.tip().await);
    }

    #[tokio::test]
    async fn test_read_chunk_ranges() {
        let db = source_with_orders().await;
        let view = db.open_view("replica").await.unwrap();
        let orders = view
            .list_tables()
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.name == "orders")
            .unwrap();
        let first = view
            .read_chunk(&orders, &ChunkRange { index: 0, offset: 0, limit: Some(2) })
            .await
            .unwrap();
        let rest = view
            .read_chunk(&orders, &ChunkRange { index: 1, offset: 2, limit: None })
            .await
            .unwrap();
        assert_eq!(first.rows, 2);
        assert_eq!(rest.rows, 1);
        assert_eq!(rest.payload.as_ref(), b"12\t1\t1.50\n");
    }

    #[tokio::test]
    async fn test_target_requires_schema_first() {
        let target = MemoryDatabase::new("replica");
        let info = TableInfo {
            schema: "public".into(),
            name: "orders".into(),
            rows_estimate: 1,
            bytes_estimate: 8,
            depends_on: vec![],
        };
        let chunk = ChunkData { index: 0, rows: 1, payload: Bytes::from_static(b"1\t2\t3\n") };
        assert!(matches!(target.load_chunk(&info, &chunk).await, Err(Error::Schema(_))));

        target.apply_ddl(&["CREATE TABLE public.orders".to_string()]).await.unwrap();
        assert_eq!(target.load_chunk(&info, &chunk).await.unwrap(), 1);
        assert_eq!(
            target.table_digest(&info).await.unwrap(),
            ChecksumVerifier::digest(b"1\t2\t3\n")
        );
    }

    #[tokio::test]
    async fn test_change_feed_replays_after_snapshot() {
        let source = source_with_orders().await;
        let target = Arc::new(MemoryDatabase::new("replica"));
        target.apply_ddl(&["CREATE TABLE public.orders".to_string()]).await.unwrap();

        let from = source.tip().await;
        source.insert_rows("public.orders", ["13\t2\t7.25"]).await.unwrap();

        let feed = MemoryChangeFeed::new(Arc::clone(&source), Arc::clone(&target));
        feed.start(from).await.unwrap();
        let pos = feed.poll().await.unwrap();
        assert_eq!(pos.lag_bytes(), 0);
        assert_eq!(target.rows("public.orders").await, vec!["13\t2\t7.25".to_string()]);
    }

    #[tokio::test]
    async fn test_recycled_wal_is_history_unavailable() {
        let source = source_with_orders().await;
        let target = Arc::new(MemoryDatabase::new("replica"));
        let from = source.tip().await;
        source.insert_rows("public.orders", ["13\t2\t7.25"]).await.unwrap();
        source.recycle_wal().await;

        let feed = MemoryChangeFeed::new(source, target);
        let err = feed.start(from).await.unwrap_err();
        assert!(err.is_divergence());
    }

    #[tokio::test]
    async fn test_created_columns_fingerprint_like_source() {
        let db = source_with_orders().await;
        db.add_column("public.orders", "id", "bigint").await.unwrap();
        db.add_column("public.orders", "total", "numeric").await.unwrap();
        let schema = db.open_view("replica").await.unwrap().export_schema().await.unwrap();
        assert!(schema
            .pre_data
            .contains(&"CREATE TABLE public.orders (id bigint, total numeric)".to_string()));

        let target = MemoryDatabase::new("replica");
        target.apply_ddl(&schema.pre_data).await.unwrap();
        assert_eq!(target.columns("public.orders").await.len(), 2);
        let mut applied = target.table_fingerprints().await.unwrap();
        applied.sort_by_key(TableFingerprint::qualified_name);
        let mut exported = schema.fingerprints.clone();
        exported.sort_by_key(TableFingerprint::qualified_name);
        assert_eq!(applied, exported);
    }

    #[tokio::test]
    async fn test_drift_on_create_fires_once() {
        let target = MemoryDatabase::new("replica");
        target.drift_on_create("public.orders", "audit_id", "uuid").await;
        let ddl = vec!["CREATE TABLE public.orders (id bigint)".to_string()];

        target.apply_ddl(&ddl).await.unwrap();
        assert_eq!(target.columns("public.orders").await.len(), 2);

        target.reset().await.unwrap();
        target.apply_ddl(&ddl).await.unwrap();
        assert_eq!(
            target.columns("public.orders").await,
            vec![ColumnDef::new("id", "bigint")]
        );
    }

    #[test]
    fn test_parse_create_table_rejects_malformed_columns() {
        assert!(parse_create_table("CREATE TABLE public.t (id)").is_err());
        assert!(parse_create_table("CREATE TABLE public.t (id bigint").is_err());
        let (name, columns) = parse_create_table("CREATE TABLE public.t").unwrap();
        assert_eq!(name, "public.t");
        assert!(columns.is_empty());
    }

    #[tokio::test]
    async fn test_schema_export_orders_constraints_after_tables() {
        let db = source_with_orders().await;
        let view = db.open_view("replica").await.unwrap();
        let schema = view.export_schema().await.unwrap();
        assert!(schema.pre_data.contains(&"CREATE TABLE public.orders".to_string()));
        assert_eq!(
            schema.post_data,
            vec!["ALTER TABLE public.orders ADD FOREIGN KEY REFERENCES public.customers".to_string()]
        );
    }
}
