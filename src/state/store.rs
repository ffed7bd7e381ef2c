//! State Store
//!
//! Persistent storage for node records and an audit log of every
//! lifecycle transition.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::model::{InitState, NodeRecord};

/// Reason recorded for nodes that were mid-initialization when the daemon stopped
pub const INTERRUPTED_REASON: &str = "interrupted by restart";

/// One row of the transition audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub node_id: String,
    pub from: InitState,
    pub to: InitState,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Node registry backed by SQLite
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Create or open the store in `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join("nodes.db"))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                state TEXT NOT NULL,
                source_node TEXT,
                last_error TEXT,
                init_started_at TEXT,
                init_completed_at TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS transitions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id TEXT NOT NULL,
                from_state TEXT NOT NULL,
                to_state TEXT NOT NULL,
                reason TEXT,
                at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_transitions_node
                ON transitions(node_id);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace a node record
    pub async fn save_node(&self, node: &NodeRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO nodes (id, name, state, source_node, last_error,
                               init_started_at, init_completed_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                name = ?2, state = ?3, source_node = ?4, last_error = ?5,
                init_started_at = ?6, init_completed_at = ?7, updated_at = ?8
            "#,
            params![
                node.id,
                node.name,
                node.state.as_str(),
                node.source_node,
                node.last_error,
                node.init_started_at.map(|t| t.to_rfc3339()),
                node.init_completed_at.map(|t| t.to_rfc3339()),
                node.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn load_node(&self, id: &str) -> Result<Option<NodeRecord>> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                "SELECT id, name, state, source_node, last_error, init_started_at, init_completed_at, updated_at \
                 FROM nodes WHERE id = ?1",
                params![id],
                RawNode::from_row,
            )
            .optional()?;
        raw.map(RawNode::into_record).transpose()
    }

    pub async fn load_nodes(&self) -> Result<Vec<NodeRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, state, source_node, last_error, init_started_at, init_completed_at, updated_at \
             FROM nodes ORDER BY id",
        )?;
        let raws = stmt
            .query_map([], RawNode::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawNode::into_record).collect()
    }

    pub async fn remove_node(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let removed = conn.execute("DELETE FROM nodes WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    pub async fn record_transition(
        &self,
        node_id: &str,
        from: InitState,
        to: InitState,
        reason: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO transitions (node_id, from_state, to_state, reason, at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![node_id, from.as_str(), to.as_str(), reason, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Transition history of a node, oldest first
    pub async fn transitions(&self, node_id: &str) -> Result<Vec<TransitionRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT from_state, to_state, reason, at FROM transitions WHERE node_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![node_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(from, to, reason, at)| -> Result<TransitionRecord> {
                Ok(TransitionRecord {
                    node_id: node_id.to_string(),
                    from: from.parse()?,
                    to: to.parse()?,
                    reason,
                    at: parse_time(&at)?,
                })
            })
            .collect()
    }

    /// Mark nodes persisted in an active state as failed. No pipeline
    /// survives a restart, so their state can no longer be trusted.
    pub async fn recover_interrupted(&self) -> Result<Vec<NodeRecord>> {
        let mut recovered = Vec::new();
        for mut node in self.load_nodes().await? {
            if !node.state.is_active() {
                continue;
            }
            let from = node.state;
            node.state = InitState::Failed;
            node.last_error = Some(INTERRUPTED_REASON.to_string());
            node.updated_at = Utc::now();
            self.save_node(&node).await?;
            self.record_transition(&node.id, from, InitState::Failed, Some(INTERRUPTED_REASON))
                .await?;
            tracing::warn!(node = %node.id, from = %from, "Recovered interrupted initialization as failed");
            recovered.push(node);
        }
        Ok(recovered)
    }
}

struct RawNode {
    id: String,
    name: String,
    state: String,
    source_node: Option<String>,
    last_error: Option<String>,
    init_started_at: Option<String>,
    init_completed_at: Option<String>,
    updated_at: String,
}

impl RawNode {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            state: row.get(2)?,
            source_node: row.get(3)?,
            last_error: row.get(4)?,
            init_started_at: row.get(5)?,
            init_completed_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<NodeRecord> {
        Ok(NodeRecord {
            id: self.id,
            name: self.name,
            state: self.state.parse()?,
            source_node: self.source_node,
            last_error: self.last_error,
            init_started_at: self.init_started_at.as_deref().map(parse_time).transpose()?,
            init_completed_at: self.init_completed_at.as_deref().map(parse_time).transpose()?,
            updated_at: parse_time(&self.updated_at)?,
        })
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("bad timestamp {:?} in state store: {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();

        let mut node = NodeRecord::new("replica-1", "Replica One");
        store.save_node(&node).await.unwrap();
        node.state = InitState::Synchronized;
        node.source_node = Some("primary".into());
        node.init_started_at = Some(Utc::now());
        store.save_node(&node).await.unwrap();

        let loaded = store.load_node("replica-1").await.unwrap().unwrap();
        assert_eq!(loaded.state, InitState::Synchronized);
        assert_eq!(loaded.source_node.as_deref(), Some("primary"));
        assert!(loaded.init_started_at.is_some());
        assert_eq!(store.load_nodes().await.unwrap().len(), 1);
        assert!(store.load_node("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = StateStore::open(dir.path()).unwrap();
            store.save_node(&NodeRecord::new("a", "a")).await.unwrap();
            store
                .record_transition("a", InitState::Uninitialized, InitState::Preparing, None)
                .await
                .unwrap();
        }
        let store = StateStore::open(dir.path()).unwrap();
        assert_eq!(store.load_nodes().await.unwrap()[0].id, "a");
        assert_eq!(store.transitions("a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transition_log_order() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        store
            .record_transition("n", InitState::Uninitialized, InitState::Preparing, None)
            .await
            .unwrap();
        store
            .record_transition("n", InitState::Preparing, InitState::Failed, Some("cancelled by operator"))
            .await
            .unwrap();

        let log = store.transitions("n").await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].to, InitState::Preparing);
        assert_eq!(log[1].from, InitState::Preparing);
        assert_eq!(log[1].reason.as_deref(), Some("cancelled by operator"));
    }

    #[tokio::test]
    async fn test_recover_interrupted() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();

        let mut copying = NodeRecord::new("copying", "copying");
        copying.state = InitState::Copying;
        let mut synced = NodeRecord::new("synced", "synced");
        synced.state = InitState::Synchronized;
        store.save_node(&copying).await.unwrap();
        store.save_node(&synced).await.unwrap();

        let recovered = store.recover_interrupted().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, "copying");

        let node = store.load_node("copying").await.unwrap().unwrap();
        assert_eq!(node.state, InitState::Failed);
        assert_eq!(node.last_error.as_deref(), Some(INTERRUPTED_REASON));
        assert_eq!(
            store.load_node("synced").await.unwrap().unwrap().state,
            InitState::Synchronized
        );
        assert_eq!(store.transitions("copying").await.unwrap()[0].to, InitState::Failed);
    }
}
