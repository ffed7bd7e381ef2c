//! PostgreSQL Executor
//!
//! Snapshot source, snapshot target and change feed backed by real
//! PostgreSQL servers. The source pins its view with an exported snapshot
//! held open on a dedicated connection and reserves history with a logical
//! replication slot; catch-up hands over to a native subscription on the
//! target that consumes that slot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::TryStreamExt;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::Connection;
use tokio::sync::Mutex;

use super::NodeConnector;
use crate::catchup::{ChangeFeed, FeedPosition};
use crate::checksum::TableDigest;
use crate::config::{PostgresConfig, SteepConfig};
use crate::error::{Error, Result};
use crate::model::Lsn;
use crate::schema::{ColumnDef, TableFingerprint};
use crate::snapshot::{
    ChunkData, ChunkRange, SchemaExport, SequenceValue, SnapshotSource, SnapshotTarget,
    SourceView, TableInfo,
};

/// Publication covering every table on a source
pub const PUBLICATION: &str = "steep_pub";

/// Schemas never copied
const SCHEMA_FILTER: &str =
    "n.nspname NOT IN ('pg_catalog', 'information_schema') AND n.nspname NOT LIKE 'pg_toast%' AND n.nspname NOT LIKE 'pg_temp%'";

/// Quote an identifier for inclusion in SQL text
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub fn qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// Replication slot reserved for a target node
pub fn slot_name(target_node: &str) -> String {
    let mut name = String::from("steep_");
    for c in target_node.chars() {
        if c.is_ascii_alphanumeric() {
            name.push(c.to_ascii_lowercase());
        } else {
            name.push('_');
        }
    }
    name.truncate(63);
    name
}

pub fn subscription_name(slot: &str) -> String {
    let mut name = format!("{}_sub", slot);
    name.truncate(63);
    name
}

/// `COPY` statement reading one row range of a table
pub fn chunk_copy_statement(table: &TableInfo, range: &ChunkRange) -> String {
    let mut select = format!(
        "SELECT * FROM {} ORDER BY ctid",
        qualified(&table.schema, &table.name)
    );
    if range.offset > 0 {
        select.push_str(&format!(" OFFSET {}", range.offset));
    }
    if let Some(limit) = range.limit {
        select.push_str(&format!(" LIMIT {}", limit));
    }
    format!("COPY ({}) TO STDOUT", select)
}

/// At most `max` bytes of `stmt`, cut on a character boundary
pub fn statement_prefix(stmt: &str, max: usize) -> &str {
    if stmt.len() <= max {
        return stmt;
    }
    let mut end = max;
    while !stmt.is_char_boundary(end) {
        end -= 1;
    }
    &stmt[..end]
}

pub fn create_table_statement(schema: &str, name: &str, columns: &[ColumnDef]) -> String {
    let cols: Vec<String> = columns
        .iter()
        .map(|c| {
            let mut col = format!("{} {}", quote_ident(&c.name), c.data_type);
            if let Some(default) = &c.default {
                col.push_str(" DEFAULT ");
                col.push_str(default);
            }
            if c.not_null {
                col.push_str(" NOT NULL");
            }
            col
        })
        .collect();
    format!("CREATE TABLE {} ({})", qualified(schema, name), cols.join(", "))
}

/// Column definitions of every user table, in ordinal order
async fn table_columns<'e, E>(executor: E) -> Result<HashMap<(String, String), Vec<ColumnDef>>>
where
    E: sqlx::PgExecutor<'e>,
{
    let rows: Vec<(String, String, String, String, bool, Option<String>)> = sqlx::query_as(&format!(
        "SELECT n.nspname, c.relname, a.attname, format_type(a.atttypid, a.atttypmod), \
                a.attnotnull, pg_get_expr(d.adbin, d.adrelid) \
         FROM pg_attribute a \
         JOIN pg_class c ON c.oid = a.attrelid \
         JOIN pg_namespace n ON n.oid = c.relnamespace \
         LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum \
         WHERE a.attnum > 0 AND NOT a.attisdropped AND c.relkind = 'r' AND {} \
         ORDER BY n.nspname, c.relname, a.attnum",
        SCHEMA_FILTER
    ))
    .fetch_all(executor)
    .await?;

    let mut columns: HashMap<(String, String), Vec<ColumnDef>> = HashMap::new();
    for (schema, table, name, data_type, not_null, default) in rows {
        columns.entry((schema, table)).or_default().push(ColumnDef {
            name,
            data_type,
            not_null,
            default,
        });
    }
    Ok(columns)
}

fn fingerprints(columns: &HashMap<(String, String), Vec<ColumnDef>>) -> Vec<TableFingerprint> {
    let mut fps: Vec<TableFingerprint> = columns
        .iter()
        .map(|((schema, name), cols)| TableFingerprint::new(schema, name, cols))
        .collect();
    fps.sort_by_key(TableFingerprint::qualified_name);
    fps
}

/// Digest over a COPY stream whose buffers may split rows
#[derive(Debug, Default)]
struct StreamDigest {
    digest: TableDigest,
    pending: Vec<u8>,
}

impl StreamDigest {
    fn feed(&mut self, buf: &[u8]) {
        self.pending.extend_from_slice(buf);
        if let Some(end) = self.pending.iter().rposition(|b| *b == b'\n') {
            self.digest.add_chunk(&self.pending[..=end]);
            self.pending.drain(..=end);
        }
    }

    fn finish(mut self) -> TableDigest {
        if !self.pending.is_empty() {
            self.digest.add_row(&self.pending);
        }
        self.digest
    }
}

async fn connect(config: &PostgresConfig, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect(&config.url())
        .await
        .map_err(|e| {
            Error::SourceUnavailable(format!("cannot connect to {}:{}: {}", config.host, config.port, e))
        })?;
    Ok(pool)
}

/// A source server
pub struct PostgresSource {
    pool: PgPool,
}

impl PostgresSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_publication(&self) -> Result<()> {
        let exists: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM pg_publication WHERE pubname = $1")
            .bind(PUBLICATION)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            sqlx::query(&format!("CREATE PUBLICATION {} FOR ALL TABLES", quote_ident(PUBLICATION)))
                .execute(&self.pool)
                .await?;
            tracing::info!(publication = PUBLICATION, "Created publication");
        }
        Ok(())
    }

    /// Recreate the target's slot and return the position it reserves from
    async fn reserve_slot(&self, slot: &str) -> Result<Lsn> {
        sqlx::query(
            "SELECT pg_drop_replication_slot(slot_name) FROM pg_replication_slots WHERE slot_name = $1 AND NOT active",
        )
        .bind(slot)
        .execute(&self.pool)
        .await?;

        let (lsn,): (String,) =
            sqlx::query_as("SELECT lsn::text FROM pg_create_logical_replication_slot($1, 'pgoutput')")
                .bind(slot)
                .fetch_one(&self.pool)
                .await?;
        lsn.parse()
    }
}

#[async_trait]
impl SnapshotSource for PostgresSource {
    async fn open_view(&self, target_node: &str) -> Result<Arc<dyn SourceView>> {
        self.ensure_publication().await?;
        let slot = slot_name(target_node);
        // changes between slot creation and the exported snapshot are replayed twice
        let lsn = self.reserve_slot(&slot).await?;

        let mut conn = self.pool.acquire().await?.detach();
        sqlx::query("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut conn)
            .await?;
        let (snapshot_id,): (String,) = sqlx::query_as("SELECT pg_export_snapshot()")
            .fetch_one(&mut conn)
            .await?;

        tracing::info!(slot = %slot, lsn = %lsn, snapshot = %snapshot_id, "Exported source snapshot");
        Ok(Arc::new(PostgresView {
            pool: self.pool.clone(),
            exporter: Mutex::new(Some(conn)),
            snapshot_id,
            lsn,
        }))
    }
}

/// Snapshot pinned by an open exporting transaction
struct PostgresView {
    pool: PgPool,
    exporter: Mutex<Option<PgConnection>>,
    snapshot_id: String,
    lsn: Lsn,
}

impl PostgresView {
    fn exporter<'a>(&self, slot: &'a mut Option<PgConnection>) -> Result<&'a mut PgConnection> {
        slot
            .as_mut()
            .ok_or_else(|| Error::Internal(format!("snapshot {} already released", self.snapshot_id)))
    }

    async fn columns(&self) -> Result<HashMap<(String, String), Vec<ColumnDef>>> {
        let mut guard = self.exporter.lock().await;
        let conn = self.exporter(&mut guard)?;
        table_columns(&mut *conn).await
    }
}

#[async_trait]
impl SourceView for PostgresView {
    fn consistency_lsn(&self) -> Lsn {
        self.lsn
    }

    async fn export_schema(&self) -> Result<SchemaExport> {
        let columns = self.columns().await?;
        let mut guard = self.exporter.lock().await;
        let conn = self.exporter(&mut guard)?;
        let mut export = SchemaExport {
            fingerprints: fingerprints(&columns),
            ..Default::default()
        };

        let schemas: Vec<(String,)> = sqlx::query_as(&format!(
            "SELECT n.nspname FROM pg_namespace n WHERE {} AND n.nspname <> 'public' ORDER BY 1",
            SCHEMA_FILTER
        ))
        .fetch_all(&mut *conn)
        .await?;
        for (schema,) in schemas {
            export.pre_data.push(format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&schema)));
        }

        let enums: Vec<(String, String, Vec<String>)> = sqlx::query_as(&format!(
            "SELECT n.nspname, t.typname, array_agg(e.enumlabel::text ORDER BY e.enumsortorder) \
             FROM pg_type t \
             JOIN pg_enum e ON e.enumtypid = t.oid \
             JOIN pg_namespace n ON n.oid = t.typnamespace \
             WHERE {} GROUP BY n.nspname, t.typname ORDER BY 1, 2",
            SCHEMA_FILTER
        ))
        .fetch_all(&mut *conn)
        .await?;
        for (schema, name, labels) in enums {
            let labels: Vec<String> = labels.iter().map(|l| quote_literal(l)).collect();
            export.pre_data.push(format!(
                "CREATE TYPE {} AS ENUM ({})",
                qualified(&schema, &name),
                labels.join(", ")
            ));
        }

        let sequences: Vec<(String, String, String, i64, i64, i64, i64, bool)> = sqlx::query_as(
            "SELECT schemaname::text, sequencename::text, data_type::text, start_value, increment_by, \
                    min_value, max_value, cycle \
             FROM pg_sequences ORDER BY 1, 2",
        )
        .fetch_all(&mut *conn)
        .await?;
        for (schema, name, data_type, start, increment, min, max, cycle) in sequences {
            export.pre_data.push(format!(
                "CREATE SEQUENCE IF NOT EXISTS {} AS {} INCREMENT BY {} MINVALUE {} MAXVALUE {} START WITH {} {}",
                qualified(&schema, &name),
                data_type,
                increment,
                min,
                max,
                start,
                if cycle { "CYCLE" } else { "NO CYCLE" }
            ));
        }

        let mut tables: Vec<&(String, String)> = columns.keys().collect();
        tables.sort();
        for key in tables {
            export
                .pre_data
                .push(create_table_statement(&key.0, &key.1, &columns[key]));
        }

        // Foreign keys last so every referenced key exists
        let constraints: Vec<(String, String, String, String)> = sqlx::query_as(&format!(
            "SELECT n.nspname, c.relname, k.conname, pg_get_constraintdef(k.oid) \
             FROM pg_constraint k \
             JOIN pg_class c ON c.oid = k.conrelid \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             WHERE k.contype IN ('p', 'u', 'c', 'x', 'f') AND c.relkind = 'r' AND {} \
             ORDER BY CASE k.contype WHEN 'f' THEN 1 ELSE 0 END, 1, 2, 3",
            SCHEMA_FILTER
        ))
        .fetch_all(&mut *conn)
        .await?;
        for (schema, table, name, def) in constraints {
            export.post_data.push(format!(
                "ALTER TABLE {} ADD CONSTRAINT {} {}",
                qualified(&schema, &table),
                quote_ident(&name),
                def
            ));
        }

        let indexes: Vec<(String,)> = sqlx::query_as(&format!(
            "SELECT pg_get_indexdef(i.indexrelid) \
             FROM pg_index i \
             JOIN pg_class c ON c.oid = i.indrelid \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             WHERE c.relkind = 'r' AND {} \
               AND NOT EXISTS (SELECT 1 FROM pg_constraint k WHERE k.conindid = i.indexrelid) \
             ORDER BY 1",
            SCHEMA_FILTER
        ))
        .fetch_all(&mut *conn)
        .await?;
        export.post_data.extend(indexes.into_iter().map(|(def,)| def));

        Ok(export)
    }

    async fn list_tables(&self) -> Result<Vec<TableInfo>> {
        let mut guard = self.exporter.lock().await;
        let conn = self.exporter(&mut guard)?;

        let rows: Vec<(String, String, i64, i64)> = sqlx::query_as(&format!(
            "SELECT n.nspname, c.relname, GREATEST(c.reltuples, 0)::bigint, pg_table_size(c.oid) \
             FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
             WHERE c.relkind = 'r' AND c.relpersistence = 'p' AND {} \
             ORDER BY 1, 2",
            SCHEMA_FILTER
        ))
        .fetch_all(&mut *conn)
        .await?;

        let refs: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT n.nspname, c.relname, rn.nspname || '.' || rc.relname \
             FROM pg_constraint k \
             JOIN pg_class c ON c.oid = k.conrelid \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             JOIN pg_class rc ON rc.oid = k.confrelid \
             JOIN pg_namespace rn ON rn.oid = rc.relnamespace \
             WHERE k.contype = 'f'",
        )
        .fetch_all(&mut *conn)
        .await?;
        let mut depends: HashMap<(String, String), Vec<String>> = HashMap::new();
        for (schema, table, parent) in refs {
            depends.entry((schema, table)).or_default().push(parent);
        }

        Ok(rows
            .into_iter()
            .map(|(schema, name, rows, bytes)| {
                let depends_on = depends.remove(&(schema.clone(), name.clone())).unwrap_or_default();
                TableInfo {
                    schema,
                    name,
                    rows_estimate: rows.max(0) as u64,
                    bytes_estimate: bytes.max(0) as u64,
                    depends_on,
                }
            })
            .collect())
    }

    async fn read_chunk(&self, table: &TableInfo, range: &ChunkRange) -> Result<ChunkData> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("SET TRANSACTION SNAPSHOT {}", quote_literal(&self.snapshot_id)))
            .execute(&mut *tx)
            .await?;

        let mut payload = BytesMut::new();
        {
            let mut stream = tx.copy_out_raw(&chunk_copy_statement(table, range)).await?;
            while let Some(buf) = stream.try_next().await? {
                payload.extend_from_slice(&buf);
            }
        }
        tx.commit().await?;

        let rows = payload.iter().filter(|b| **b == b'\n').count() as u64;
        Ok(ChunkData {
            index: range.index,
            rows,
            payload: payload.freeze(),
        })
    }

    async fn export_sequences(&self) -> Result<Vec<SequenceValue>> {
        let mut guard = self.exporter.lock().await;
        let conn = self.exporter(&mut guard)?;

        let names: Vec<(String, String)> =
            sqlx::query_as("SELECT schemaname::text, sequencename::text FROM pg_sequences ORDER BY 1, 2")
                .fetch_all(&mut *conn)
                .await?;
        let mut values = Vec::with_capacity(names.len());
        for (schema, name) in names {
            let (last_value, is_called): (i64, bool) = sqlx::query_as(&format!(
                "SELECT last_value, is_called FROM {}",
                qualified(&schema, &name)
            ))
            .fetch_one(&mut *conn)
            .await?;
            values.push(SequenceValue {
                schema,
                name,
                last_value,
                is_called,
            });
        }
        Ok(values)
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut conn) = self.exporter.lock().await.take() {
            sqlx::query("COMMIT").execute(&mut conn).await?;
            conn.close().await?;
            tracing::debug!(snapshot = %self.snapshot_id, "Released exported snapshot");
        }
        Ok(())
    }
}

/// The node being provisioned
pub struct PostgresTarget {
    pool: PgPool,
}

impl PostgresTarget {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotTarget for PostgresTarget {
    async fn reset(&self) -> Result<()> {
        // Detach subscriptions from their slots first so dropping them leaves
        // the source's slots alone
        let subs: Vec<(String,)> = sqlx::query_as(
            "SELECT s.subname::text FROM pg_subscription s \
             JOIN pg_database d ON d.oid = s.subdbid WHERE d.datname = current_database()",
        )
        .fetch_all(&self.pool)
        .await?;
        for (sub,) in subs {
            let sub = quote_ident(&sub);
            sqlx::query(&format!("ALTER SUBSCRIPTION {} DISABLE", sub)).execute(&self.pool).await?;
            sqlx::query(&format!("ALTER SUBSCRIPTION {} SET (slot_name = NONE)", sub))
                .execute(&self.pool)
                .await?;
            sqlx::query(&format!("DROP SUBSCRIPTION {}", sub)).execute(&self.pool).await?;
        }

        let relations: Vec<(String, String, String)> = sqlx::query_as(&format!(
            "SELECT n.nspname, c.relname, c.relkind::text \
             FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
             WHERE c.relkind IN ('r', 'S') AND {}",
            SCHEMA_FILTER
        ))
        .fetch_all(&self.pool)
        .await?;
        for (schema, name, kind) in &relations {
            let object = if kind == "S" { "SEQUENCE" } else { "TABLE" };
            sqlx::query(&format!("DROP {} IF EXISTS {} CASCADE", object, qualified(schema, name)))
                .execute(&self.pool)
                .await?;
        }
        tracing::info!(dropped = relations.len(), "Reset target database");
        Ok(())
    }

    async fn apply_ddl(&self, statements: &[String]) -> Result<()> {
        for stmt in statements {
            tracing::debug!("Executing: {}", statement_prefix(stmt, 100));
            sqlx::query(stmt).execute(&self.pool).await.map_err(|e| {
                Error::Schema(format!("failed to execute '{}...': {}", statement_prefix(stmt, 50), e))
            })?;
        }
        Ok(())
    }

    async fn table_fingerprints(&self) -> Result<Vec<TableFingerprint>> {
        Ok(fingerprints(&table_columns(&self.pool).await?))
    }

    async fn load_chunk(&self, table: &TableInfo, chunk: &ChunkData) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        let mut copy = conn
            .copy_in_raw(&format!("COPY {} FROM STDIN", qualified(&table.schema, &table.name)))
            .await?;
        copy.send(chunk.payload.clone()).await?;
        Ok(copy.finish().await?)
    }

    async fn truncate_table(&self, table: &TableInfo) -> Result<()> {
        sqlx::query(&format!("TRUNCATE {}", qualified(&table.schema, &table.name)))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn table_digest(&self, table: &TableInfo) -> Result<TableDigest> {
        let mut conn = self.pool.acquire().await?;
        let mut stream = conn
            .copy_out_raw(&format!("COPY {} TO STDOUT", qualified(&table.schema, &table.name)))
            .await?;
        let mut digest = StreamDigest::default();
        while let Some(buf) = stream.try_next().await? {
            digest.feed(&buf);
        }
        Ok(digest.finish())
    }

    async fn apply_sequences(&self, sequences: &[SequenceValue]) -> Result<()> {
        for seq in sequences {
            sqlx::query("SELECT setval($1::regclass, $2, $3)")
                .bind(qualified(&seq.schema, &seq.name))
                .bind(seq.last_value)
                .bind(seq.is_called)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

/// Native logical replication from a source slot into the target
pub struct PostgresChangeFeed {
    source: PgPool,
    target: PgPool,
    source_conninfo: String,
    slot: String,
}

impl PostgresChangeFeed {
    pub fn new(source: PgPool, target: PgPool, source_conninfo: String, slot: String) -> Self {
        Self {
            source,
            target,
            source_conninfo,
            slot,
        }
    }

    async fn slot_state(&self) -> Result<Option<(Option<String>, Option<String>, Option<String>)>> {
        let row: Option<(Option<String>, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT confirmed_flush_lsn::text, restart_lsn::text, wal_status \
             FROM pg_replication_slots WHERE slot_name = $1",
        )
        .bind(&self.slot)
        .fetch_optional(&self.source)
        .await?;
        Ok(row)
    }

    async fn current_tip(&self) -> Result<Lsn> {
        let (tip,): (String,) = sqlx::query_as("SELECT pg_current_wal_lsn()::text")
            .fetch_one(&self.source)
            .await?;
        tip.parse()
    }

    /// Divergence if the slot is gone or its WAL has been removed
    async fn check_history(&self, required: Lsn) -> Result<Option<Lsn>> {
        match self.slot_state().await? {
            None => Err(Error::HistoryUnavailable {
                required,
                oldest: self.current_tip().await?,
            }),
            Some((_, restart, Some(status))) if status == "lost" => Err(Error::HistoryUnavailable {
                required,
                oldest: match restart {
                    Some(lsn) => lsn.parse()?,
                    None => self.current_tip().await?,
                },
            }),
            Some((confirmed, _, _)) => confirmed.map(|c| c.parse()).transpose(),
        }
    }
}

#[async_trait]
impl ChangeFeed for PostgresChangeFeed {
    async fn start(&self, from: Lsn) -> Result<()> {
        self.check_history(from).await?;

        let sub = subscription_name(&self.slot);
        let exists: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM pg_subscription WHERE subname = $1")
            .bind(&sub)
            .fetch_optional(&self.target)
            .await?;
        if exists.is_some() {
            sqlx::query(&format!("ALTER SUBSCRIPTION {} ENABLE", quote_ident(&sub)))
                .execute(&self.target)
                .await?;
        } else {
            sqlx::query(&format!(
                "CREATE SUBSCRIPTION {} CONNECTION {} PUBLICATION {} \
                 WITH (copy_data = false, create_slot = false, slot_name = {}, enabled = true)",
                quote_ident(&sub),
                quote_literal(&self.source_conninfo),
                quote_ident(PUBLICATION),
                quote_literal(&self.slot)
            ))
            .execute(&self.target)
            .await?;
        }
        tracing::info!(subscription = %sub, slot = %self.slot, from = %from, "Subscription started");
        Ok(())
    }

    async fn poll(&self) -> Result<FeedPosition> {
        let confirmed = self.check_history(Lsn::ZERO).await.map_err(|e| match e {
            Error::HistoryUnavailable { oldest, .. } => Error::HistoryUnavailable {
                required: Lsn::ZERO,
                oldest,
            },
            other => other,
        })?;
        let tip = self.current_tip().await?;
        Ok(FeedPosition {
            applied: confirmed.unwrap_or(Lsn::ZERO).min(tip),
            tip,
        })
    }

    async fn stop(&self) -> Result<()> {
        let sub = subscription_name(&self.slot);
        let exists: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM pg_subscription WHERE subname = $1")
            .bind(&sub)
            .fetch_optional(&self.target)
            .await?;
        // start may have failed before the subscription was created
        if exists.is_none() {
            return Ok(());
        }
        sqlx::query(&format!("ALTER SUBSCRIPTION {} DISABLE", quote_ident(&sub)))
            .execute(&self.target)
            .await?;
        tracing::info!(subscription = %sub, "Subscription disabled");
        Ok(())
    }
}

/// Resolves the local node and configured peers to PostgreSQL backends
pub struct PostgresConnector {
    nodes: HashMap<String, PostgresConfig>,
    pool_size: u32,
    pools: Mutex<HashMap<String, PgPool>>,
}

impl PostgresConnector {
    /// Pools are sized so every worker plus the snapshot exporter gets a connection
    pub fn from_config(config: &SteepConfig) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(config.node.id.clone(), config.postgresql.clone());
        for peer in &config.peers {
            nodes.insert(peer.id.clone(), peer.postgresql.clone());
        }
        let workers = config.initialization.effective_workers() as u32;
        let pool_size = config.postgresql.pool_size.max(workers + 2);
        Self {
            nodes,
            pool_size,
            pools: Mutex::new(HashMap::new()),
        }
    }

    fn config(&self, node_id: &str) -> Result<&PostgresConfig> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))
    }

    async fn pool(&self, node_id: &str) -> Result<PgPool> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(node_id) {
            return Ok(pool.clone());
        }
        let pool = connect(self.config(node_id)?, self.pool_size).await?;
        pools.insert(node_id.to_string(), pool.clone());
        Ok(pool)
    }
}

#[async_trait]
impl NodeConnector for PostgresConnector {
    async fn source(&self, node_id: &str) -> Result<Arc<dyn SnapshotSource>> {
        Ok(Arc::new(PostgresSource::new(self.pool(node_id).await?)))
    }

    async fn target(&self, node_id: &str) -> Result<Arc<dyn SnapshotTarget>> {
        Ok(Arc::new(PostgresTarget::new(self.pool(node_id).await?)))
    }

    async fn change_feed(&self, source: &str, target: &str) -> Result<Arc<dyn ChangeFeed>> {
        let conninfo = self.config(source)?.conninfo();
        Ok(Arc::new(PostgresChangeFeed::new(
            self.pool(source).await?,
            self.pool(target).await?,
            conninfo,
            slot_name(target),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumVerifier;

    fn table() -> TableInfo {
        TableInfo {
            schema: "public".into(),
            name: "order\"items".into(),
            rows_estimate: 100,
            bytes_estimate: 4096,
            depends_on: vec![],
        }
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(qualified("sales", "orders"), "\"sales\".\"orders\"");
    }

    #[test]
    fn test_slot_names_are_valid_identifiers() {
        assert_eq!(slot_name("Replica-1"), "steep_replica_1");
        assert_eq!(subscription_name("steep_replica_1"), "steep_replica_1_sub");
        assert!(slot_name(&"x".repeat(100)).len() <= 63);
    }

    #[test]
    fn test_chunk_copy_statement() {
        let first = ChunkRange { index: 0, offset: 0, limit: Some(500) };
        assert_eq!(
            chunk_copy_statement(&table(), &first),
            "COPY (SELECT * FROM \"public\".\"order\"\"items\" ORDER BY ctid LIMIT 500) TO STDOUT"
        );
        let last = ChunkRange { index: 3, offset: 1500, limit: None };
        assert_eq!(
            chunk_copy_statement(&table(), &last),
            "COPY (SELECT * FROM \"public\".\"order\"\"items\" ORDER BY ctid OFFSET 1500) TO STDOUT"
        );
    }

    #[test]
    fn test_statement_prefix_respects_char_boundaries() {
        let stmt = "CREATE TYPE public.status AS ENUM ('aaaaaaaaaaaaaé')";
        assert_eq!(stmt.find('é'), Some(49));
        assert_eq!(statement_prefix(stmt, 50), &stmt[..49]);
        assert_eq!(statement_prefix(stmt, 51), &stmt[..51]);
        assert_eq!(statement_prefix("SELECT 1", 50), "SELECT 1");
        assert_eq!(statement_prefix("ééé", 1), "");
    }

    #[tokio::test]
    async fn test_apply_ddl_with_multibyte_statement_reports_schema_error() {
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(300))
            .connect_lazy("postgres://steep@127.0.0.1:1/postgres")
            .unwrap();
        let target = PostgresTarget::new(pool);
        let err = target
            .apply_ddl(&["CREATE TYPE public.status AS ENUM ('aaaaaaaaaaaaaé')".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Schema(_)), "{}", err);
    }

    #[test]
    fn test_create_table_statement() {
        let columns = vec![
            ColumnDef {
                name: "id".into(),
                data_type: "bigint".into(),
                not_null: true,
                default: Some("nextval('orders_id_seq'::regclass)".into()),
            },
            ColumnDef {
                name: "note".into(),
                data_type: "text".into(),
                not_null: false,
                default: None,
            },
        ];
        assert_eq!(
            create_table_statement("public", "orders", &columns),
            "CREATE TABLE \"public\".\"orders\" (\"id\" bigint DEFAULT nextval('orders_id_seq'::regclass) NOT NULL, \"note\" text)"
        );
    }

    #[test]
    fn test_fingerprints_are_sorted_by_table() {
        let mut columns = HashMap::new();
        columns.insert(("sales".to_string(), "orders".to_string()), vec![ColumnDef::new("id", "bigint")]);
        columns.insert(("public".to_string(), "users".to_string()), vec![ColumnDef::new("id", "integer")]);
        let fps = fingerprints(&columns);
        let names: Vec<String> = fps.iter().map(TableFingerprint::qualified_name).collect();
        assert_eq!(names, vec!["public.users", "sales.orders"]);
        assert_ne!(fps[0].fingerprint, fps[1].fingerprint);
    }

    #[test]
    fn test_stream_digest_handles_split_rows() {
        let data = b"1\talpha\n2\tbeta\n3\tgamma\n";
        let mut stream = StreamDigest::default();
        stream.feed(&data[..5]);
        stream.feed(&data[5..17]);
        stream.feed(&data[17..]);
        assert_eq!(stream.finish(), ChecksumVerifier::digest(data));
    }
}
