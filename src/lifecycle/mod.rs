//! Node Lifecycle Module
//!
//! Each replica node is driven by a single coordinating task that owns its
//! state. Everything else talks to that task through a `NodeHandle`:
//! requests go in as messages, and status comes out as immutable snapshots
//! that can be read at any time without touching the pipeline.

mod actor;
mod manager;

pub use actor::{LifecycleContext, NodeLifecycle, CANCELLED_REASON};
pub use manager::InitManager;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use actor::Command;
use crate::error::{Error, Result};
use crate::model::{NodeRecord, SnapshotSession};
use crate::progress::InitProgress;

/// Point-in-time view of one node
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub record: NodeRecord,
    /// Active or most recent session, kept after failure for diagnosis
    pub session: Option<SnapshotSession>,
    pub progress: InitProgress,
}

impl NodeStatus {
    fn idle(record: &NodeRecord) -> Self {
        Self {
            record: record.clone(),
            session: None,
            progress: InitProgress::idle(record),
        }
    }
}

/// Cheap, cloneable access to a node's coordinating task
#[derive(Clone)]
pub struct NodeHandle {
    id: String,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<Arc<NodeStatus>>,
}

impl NodeHandle {
    fn new(id: String, commands: mpsc::Sender<Command>, status: watch::Receiver<Arc<NodeStatus>>) -> Self {
        Self { id, commands, status }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Begin initializing from `source`
    pub async fn start(&self, source: &str) -> Result<()> {
        let source = source.to_string();
        self.request(|reply| Command::Start { source, reply }).await
    }

    /// Request an orderly abort; the node ends in `Failed`
    pub async fn cancel(&self) -> Result<()> {
        self.request(|reply| Command::Cancel { reply }).await
    }

    /// Discard the previous session and initialize again from scratch
    pub async fn reinitialize(&self) -> Result<()> {
        self.request(|reply| Command::Reinitialize { reply }).await
    }

    pub fn status(&self) -> Arc<NodeStatus> {
        Arc::clone(&self.status.borrow())
    }

    pub fn progress(&self) -> InitProgress {
        self.status.borrow().progress.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<NodeStatus>> {
        self.status.clone()
    }

    /// Wait for a status matching `pred`. Intermediate snapshots may be
    /// skipped; only the latest is ever observed.
    pub async fn wait_until<F>(&self, timeout: Duration, mut pred: F) -> Result<Arc<NodeStatus>>
    where
        F: FnMut(&NodeStatus) -> bool,
    {
        let mut rx = self.status.clone();
        let wait = async {
            loop {
                let current = Arc::clone(&rx.borrow_and_update());
                if pred(&current) {
                    return Ok(current);
                }
                if rx.changed().await.is_err() {
                    return Err(Error::ShuttingDown);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout(format!("waiting on node {}", self.id)))?
    }

    async fn request<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> Command,
    {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| Error::ShuttingDown)?;
        rx.await.map_err(|_| Error::ShuttingDown)?
    }
}
