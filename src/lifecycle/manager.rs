//! Multi-node initialization manager
//!
//! Registry of node lifecycles exposing the inbound control surface:
//! `start_init`, `cancel_init` and `reinitialize_node`.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::{LifecycleContext, NodeHandle, NodeLifecycle, NodeStatus};
use crate::config::{CatchupConfig, InitializationConfig};
use crate::error::{Error, Result};
use crate::executor::NodeConnector;
use crate::model::NodeRecord;
use crate::progress::InitProgress;
use crate::state::{StateStore, TransitionRecord};

pub struct InitManager {
    ctx: LifecycleContext,
    nodes: RwLock<BTreeMap<String, NodeHandle>>,
}

impl InitManager {
    pub fn new(
        connector: Arc<dyn NodeConnector>,
        initialization: InitializationConfig,
        catchup: CatchupConfig,
    ) -> Self {
        Self {
            ctx: LifecycleContext {
                connector,
                store: None,
                initialization,
                catchup,
            },
            nodes: RwLock::new(BTreeMap::new()),
        }
    }

    /// Persist node records and transitions in `store`
    pub fn with_store(mut self, store: Arc<StateStore>) -> Self {
        self.ctx.store = Some(store);
        self
    }

    /// Re-register every persisted node. Nodes caught mid-initialization
    /// by the previous shutdown come back as failed.
    pub async fn restore(&self) -> Result<usize> {
        let Some(store) = self.ctx.store.clone() else {
            return Ok(0);
        };
        let recovered = store.recover_interrupted().await?;
        if !recovered.is_empty() {
            tracing::warn!(count = recovered.len(), "Recovered interrupted initializations");
        }

        let records = store.load_nodes().await?;
        let count = records.len();
        let mut nodes = self.nodes.write().await;
        for record in records {
            let id = record.id.clone();
            nodes
                .entry(id)
                .or_insert_with(|| NodeLifecycle::spawn(record, self.ctx.clone()));
        }
        tracing::info!(nodes = count, "Restored node registry");
        Ok(count)
    }

    /// Register a node for provisioning; returns the existing handle if known
    pub async fn register_node(&self, id: &str, name: &str) -> Result<NodeHandle> {
        if id.is_empty() {
            return Err(Error::InvalidRequest("node id cannot be empty".into()));
        }

        let mut nodes = self.nodes.write().await;
        if let Some(handle) = nodes.get(id) {
            return Ok(handle.clone());
        }

        let record = NodeRecord::new(id, name);
        if let Some(store) = &self.ctx.store {
            store.save_node(&record).await?;
        }
        tracing::info!(node = %id, "Registered node");
        let handle = NodeLifecycle::spawn(record, self.ctx.clone());
        nodes.insert(id.to_string(), handle.clone());
        Ok(handle)
    }

    pub async fn handle(&self, id: &str) -> Result<NodeHandle> {
        self.nodes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NodeNotFound(id.to_string()))
    }

    pub async fn start_init(&self, node: &str, source: &str) -> Result<()> {
        self.handle(node).await?.start(source).await
    }

    pub async fn cancel_init(&self, node: &str) -> Result<()> {
        self.handle(node).await?.cancel().await
    }

    pub async fn reinitialize_node(&self, node: &str) -> Result<()> {
        self.handle(node).await?.reinitialize().await
    }

    pub async fn status(&self, node: &str) -> Result<Arc<NodeStatus>> {
        Ok(self.handle(node).await?.status())
    }

    pub async fn progress(&self, node: &str) -> Result<InitProgress> {
        Ok(self.handle(node).await?.progress())
    }

    /// Audit log for `node`; empty when running without a store
    pub async fn transitions(&self, node: &str) -> Result<Vec<TransitionRecord>> {
        self.handle(node).await?;
        match &self.ctx.store {
            Some(store) => store.transitions(node).await,
            None => Ok(Vec::new()),
        }
    }

    /// Progress of every registered node, ordered by id
    pub async fn list(&self) -> Vec<InitProgress> {
        self.nodes
            .read()
            .await
            .values()
            .map(NodeHandle::progress)
            .collect()
    }

    /// Drop every handle. Each actor then cancels its running stage and exits;
    /// records left mid-initialization are recovered on the next `restore`.
    pub async fn shutdown(&self) {
        let nodes = std::mem::take(&mut *self.nodes.write().await);
        tracing::info!(nodes = nodes.len(), "Stopping node lifecycles");
    }
}
