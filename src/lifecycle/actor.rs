//! Node lifecycle actor
//!
//! One task per node owns the `NodeRecord` and the live `SnapshotSession`.
//! Control requests arrive as commands, pipeline workers report through
//! session-tagged events, and each stage (target reset, snapshot, catch-up)
//! runs as its own task whose completion drives the next transition.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{NodeHandle, NodeStatus};
use crate::catchup::WalCatchupCoordinator;
use crate::config::{CatchupConfig, InitializationConfig};
use crate::error::{Error, Result};
use crate::executor::NodeConnector;
use crate::model::{InitState, Lsn, NodeRecord, SessionEvent, SessionOutcome, SnapshotSession};
use crate::progress::ProgressReporter;
use crate::snapshot::{run_snapshot, EventSink, PipelineOptions, SnapshotSummary};
use crate::state::StateStore;
use crate::throughput::ThroughputSampler;

/// Reason recorded when an operator cancels an initialization
pub const CANCELLED_REASON: &str = "cancelled by operator";

/// Command queue depth per node
const COMMAND_BUFFER: usize = 16;

pub(super) enum Command {
    Start {
        source: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel {
        reply: oneshot::Sender<Result<()>>,
    },
    Reinitialize {
        reply: oneshot::Sender<Result<()>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageKind {
    Reset,
    Snapshot,
    Catchup,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageKind::Reset => "reset",
            StageKind::Snapshot => "snapshot",
            StageKind::Catchup => "catch-up",
        };
        f.write_str(s)
    }
}

enum StageOutput {
    Reset(Result<()>),
    Snapshot(Result<SnapshotSummary>),
    Catchup(Result<Lsn>),
}

struct RunningStage {
    kind: StageKind,
    handle: JoinHandle<StageOutput>,
    cancel: CancellationToken,
}

/// Collaborators and settings shared by every node's actor
#[derive(Clone)]
pub struct LifecycleContext {
    pub connector: Arc<dyn NodeConnector>,
    pub store: Option<Arc<StateStore>>,
    pub initialization: InitializationConfig,
    pub catchup: CatchupConfig,
}

/// Single owner of one node's lifecycle state
pub struct NodeLifecycle {
    record: NodeRecord,
    session: Option<SnapshotSession>,
    sampler: ThroughputSampler,
    ctx: LifecycleContext,
    status_tx: watch::Sender<Arc<NodeStatus>>,
    events_tx: mpsc::UnboundedSender<(Uuid, SessionEvent)>,
    events_rx: mpsc::UnboundedReceiver<(Uuid, SessionEvent)>,
    stage: Option<RunningStage>,
    cancel_requested: bool,
    cancel_deadline: Option<Instant>,
    shutdown: CancellationToken,
}

impl NodeLifecycle {
    /// Spawn the actor for `record` and return a handle to it
    pub fn spawn(record: NodeRecord, ctx: LifecycleContext) -> NodeHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let initial = Arc::new(NodeStatus::idle(&record));
        let (status_tx, status_rx) = watch::channel(initial);
        let id = record.id.clone();

        let actor = Self {
            sampler: ThroughputSampler::new(ctx.initialization.progress_window),
            record,
            session: None,
            ctx,
            status_tx,
            events_tx,
            events_rx,
            stage: None,
            cancel_requested: false,
            cancel_deadline: None,
            shutdown: CancellationToken::new(),
        };
        tokio::spawn(actor.run(cmd_rx));

        NodeHandle::new(id, cmd_tx, status_rx)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut tick = tokio::time::interval(self.ctx.initialization.sample_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(node = %self.record.id, state = %self.record.state, "Node lifecycle started");

        loop {
            let deadline = self.cancel_deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some((session, event)) = self.events_rx.recv() => {
                    self.on_event(session, event).await;
                    // fold whatever else is queued before publishing once
                    while let Ok((session, event)) = self.events_rx.try_recv() {
                        self.on_event(session, event).await;
                    }
                    self.publish();
                }
                joined = join_stage(&mut self.stage) => {
                    let kind = self.stage.take().map(|s| s.kind);
                    // workers finished emitting before the stage returned
                    while let Ok((session, event)) = self.events_rx.try_recv() {
                        self.on_event(session, event).await;
                    }
                    if let Some(kind) = kind {
                        self.on_stage_done(kind, joined).await;
                    }
                }
                _ = tick.tick() => self.sample(),
                _ = tokio::time::sleep_until(deadline), if self.cancel_deadline.is_some() => {
                    self.on_grace_expired().await;
                }
            }
        }

        self.shutdown.cancel();
        if let Some(stage) = self.stage.take() {
            let grace = self.ctx.initialization.cancel_grace();
            if tokio::time::timeout(grace, stage.handle).await.is_err() {
                tracing::warn!(node = %self.record.id, "Stage did not stop within grace period");
            }
        }
        tracing::debug!(node = %self.record.id, "Node lifecycle stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start { source, reply } => {
                let result = self.start(source).await;
                let _ = reply.send(result);
            }
            Command::Cancel { reply } => {
                let result = self.cancel().await;
                let _ = reply.send(result);
            }
            Command::Reinitialize { reply } => {
                let result = self.reinitialize().await;
                let _ = reply.send(result);
            }
        }
        self.publish();
    }

    async fn start(&mut self, source: String) -> Result<()> {
        let state = self.record.state;
        if !state.can_start() {
            return Err(self.invalid_state("start"));
        }
        if source == self.record.id {
            return Err(Error::InvalidRequest(format!(
                "node {} cannot initialize from itself",
                source
            )));
        }

        self.record.source_node = Some(source);
        // a previous attempt may have left objects behind on the target
        self.begin_session(state != InitState::Uninitialized).await
    }

    async fn cancel(&mut self) -> Result<()> {
        if !self.record.state.can_cancel() {
            return Err(self.invalid_state("cancel"));
        }

        match &self.stage {
            Some(stage) => {
                if !self.cancel_requested {
                    tracing::info!(node = %self.record.id, stage = %stage.kind, "Cancelling initialization");
                    stage.cancel.cancel();
                    self.cancel_requested = true;
                    self.cancel_deadline = Some(Instant::now() + self.ctx.initialization.cancel_grace());
                }
            }
            None => self.finish_cancelled().await,
        }
        Ok(())
    }

    async fn reinitialize(&mut self) -> Result<()> {
        if !self.record.state.can_reinitialize() {
            return Err(self.invalid_state("reinitialize"));
        }
        if self.record.source_node.is_none() {
            return Err(Error::InvalidRequest(format!(
                "node {} has no source node to reinitialize from",
                self.record.id
            )));
        }

        // prior session data is discarded, not merged
        self.session = None;
        self.sampler = ThroughputSampler::new(self.ctx.initialization.progress_window);
        self.transition(InitState::Reinitializing, None).await;

        let connector = Arc::clone(&self.ctx.connector);
        let target = self.record.id.clone();
        self.spawn_stage(StageKind::Reset, move |_cancel| async move {
            let target = connector.target(&target).await?;
            target.reset().await
        });
        Ok(())
    }

    /// Open a fresh session and launch the snapshot stage
    async fn begin_session(&mut self, reset_target: bool) -> Result<()> {
        let source = self.record.source_node.clone().ok_or_else(|| {
            Error::InvalidRequest(format!("node {} has no source node", self.record.id))
        })?;
        let options = PipelineOptions::from_config(&self.ctx.initialization)?;

        self.transition(InitState::Preparing, None).await;
        let session = SnapshotSession::new(
            source.clone(),
            self.record.id.clone(),
            options.workers,
            options.compression,
        );
        let events = EventSink::new(session.snapshot_id, self.events_tx.clone());
        tracing::info!(
            node = %self.record.id,
            source = %source,
            session = %session.snapshot_id,
            workers = options.workers,
            "Starting snapshot session"
        );
        self.session = Some(session);
        self.sampler = ThroughputSampler::new(self.ctx.initialization.progress_window);

        let connector = Arc::clone(&self.ctx.connector);
        let target_id = self.record.id.clone();
        self.spawn_stage(StageKind::Snapshot, move |cancel| async move {
            let source = connector.source(&source).await?;
            let target = connector.target(&target_id).await?;
            if reset_target {
                target.reset().await?;
            }
            run_snapshot(source, target, &target_id, options, events, cancel).await
        });
        Ok(())
    }

    fn begin_catchup(&mut self, from: Lsn) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let events = EventSink::new(session.snapshot_id, self.events_tx.clone());
        let connector = Arc::clone(&self.ctx.connector);
        let source = session.source_node.clone();
        let target = self.record.id.clone();
        let config = self.ctx.catchup.clone();

        self.spawn_stage(StageKind::Catchup, move |cancel| async move {
            let feed = connector.change_feed(&source, &target).await?;
            WalCatchupCoordinator::new(feed, config, events, cancel).run(from).await
        });
    }

    fn spawn_stage<F, Fut, T>(&mut self, kind: StageKind, stage: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = Result<T>> + Send + 'static,
        T: IntoStageOutput,
    {
        let cancel = self.shutdown.child_token();
        let fut = stage(cancel.clone());
        let handle = tokio::spawn(async move { T::wrap(fut.await) });
        self.cancel_requested = false;
        self.cancel_deadline = None;
        self.stage = Some(RunningStage { kind, handle, cancel });
    }

    async fn on_event(&mut self, session_id: Uuid, event: SessionEvent) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.snapshot_id != session_id {
            tracing::trace!(node = %self.record.id, session = %session_id, "Ignoring event from stale session");
            return;
        }
        session.apply(&event);

        if let SessionEvent::Prepared { consistency_lsn } = event {
            if self.record.state == InitState::Preparing {
                tracing::debug!(node = %self.record.id, lsn = %consistency_lsn, "Source view pinned");
                self.transition(InitState::Copying, None).await;
            }
        }
    }

    async fn on_stage_done(
        &mut self,
        kind: StageKind,
        joined: std::result::Result<StageOutput, JoinError>,
    ) {
        let output = match joined {
            Ok(output) => output,
            Err(e) => {
                self.fail(Error::Internal(format!("{} stage aborted: {}", kind, e))).await;
                return;
            }
        };
        if self.cancel_requested {
            self.finish_cancelled().await;
            return;
        }

        match output {
            StageOutput::Reset(Ok(())) => {
                if let Err(e) = self.begin_session(false).await {
                    self.fail(e).await;
                }
            }
            StageOutput::Snapshot(Ok(summary)) => {
                if self.record.state == InitState::Preparing {
                    self.transition(InitState::Copying, None).await;
                }
                tracing::info!(
                    node = %self.record.id,
                    tables = summary.tables,
                    lsn = %summary.consistency_lsn,
                    "Snapshot applied and verified"
                );
                self.transition(InitState::CatchingUp, None).await;
                self.begin_catchup(summary.consistency_lsn);
            }
            StageOutput::Catchup(Ok(applied)) => {
                tracing::info!(node = %self.record.id, applied = %applied, "Node synchronized");
                self.finish_session(SessionOutcome::Succeeded);
                self.transition(InitState::Synchronized, None).await;
            }
            StageOutput::Catchup(Err(e)) if e.is_divergence() => {
                self.finish_session(SessionOutcome::Failed);
                self.transition(InitState::Diverged, Some(e.to_string())).await;
            }
            StageOutput::Reset(Err(e))
            | StageOutput::Snapshot(Err(e))
            | StageOutput::Catchup(Err(e)) => self.fail(e).await,
        }
    }

    async fn on_grace_expired(&mut self) {
        self.cancel_deadline = None;
        if let Some(stage) = self.stage.take() {
            tracing::warn!(
                node = %self.record.id,
                stage = %stage.kind,
                "Stage ignored cancellation past the grace period, aborting"
            );
            stage.handle.abort();
        }
        self.finish_cancelled().await;
    }

    async fn fail(&mut self, error: Error) {
        let outcome = if error.is_cancelled() {
            SessionOutcome::Cancelled
        } else {
            SessionOutcome::Failed
        };
        self.finish_session(outcome);
        self.transition(InitState::Failed, Some(error.to_string())).await;
    }

    async fn finish_cancelled(&mut self) {
        self.cancel_requested = false;
        self.cancel_deadline = None;
        self.finish_session(SessionOutcome::Cancelled);
        self.transition(InitState::Failed, Some(CANCELLED_REASON.to_string()))
            .await;
    }

    fn finish_session(&mut self, outcome: SessionOutcome) {
        if let Some(session) = self.session.as_mut() {
            session.finish(outcome);
        }
    }

    /// Apply a lifecycle transition. This is the only place `record.state` changes.
    async fn transition(&mut self, to: InitState, reason: Option<String>) {
        let from = self.record.state;
        if from == to {
            return;
        }
        if !from.can_transition_to(to) {
            tracing::error!(node = %self.record.id, from = %from, to = %to, "Refusing invalid lifecycle transition");
            return;
        }

        let now = Utc::now();
        self.record.state = to;
        self.record.updated_at = now;
        self.record.last_error = match to {
            InitState::Failed | InitState::Diverged => reason.clone(),
            _ => None,
        };
        match to {
            InitState::Preparing => {
                self.record.init_started_at = Some(now);
                self.record.init_completed_at = None;
            }
            InitState::Synchronized => self.record.init_completed_at = Some(now),
            _ => {}
        }

        match to {
            InitState::Failed => {
                tracing::error!(node = %self.record.id, from = %from, to = %to, reason = ?reason, "Node transition")
            }
            InitState::Diverged => {
                tracing::warn!(node = %self.record.id, from = %from, to = %to, reason = ?reason, "Node transition")
            }
            _ => tracing::info!(node = %self.record.id, from = %from, to = %to, "Node transition"),
        }

        if let Some(store) = &self.ctx.store {
            if let Err(e) = store.save_node(&self.record).await {
                tracing::warn!(node = %self.record.id, "Failed to persist node record: {}", e);
            }
            if let Err(e) = store
                .record_transition(&self.record.id, from, to, reason.as_deref())
                .await
            {
                tracing::warn!(node = %self.record.id, "Failed to record transition: {}", e);
            }
        }
        self.publish();
    }

    fn invalid_state(&self, action: &'static str) -> Error {
        Error::InvalidState {
            node: self.record.id.clone(),
            state: self.record.state,
            action,
        }
    }

    fn sample(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if !session.is_running() || self.stage.is_none() {
            return;
        }
        let replayed = session.catchup.map(|c| c.replayed_bytes()).unwrap_or(0);
        self.sampler.observe(
            std::time::Instant::now(),
            session.bytes_transferred + replayed,
            session.rows_transferred,
        );
        self.publish();
    }

    /// Publish a fresh status snapshot for observers
    fn publish(&mut self) {
        let progress = ProgressReporter::project(&self.record, self.session.as_ref(), &self.sampler);
        if let Some(session) = self.session.as_mut() {
            if session.is_running() {
                session.percent_floor = progress.overall_percent;
            }
        }
        let status = NodeStatus {
            record: self.record.clone(),
            session: self.session.clone(),
            progress,
        };
        self.status_tx.send_replace(Arc::new(status));
    }
}

trait IntoStageOutput: Send + 'static {
    fn wrap(result: Result<Self>) -> StageOutput
    where
        Self: Sized;
}

impl IntoStageOutput for () {
    fn wrap(result: Result<()>) -> StageOutput {
        StageOutput::Reset(result)
    }
}

impl IntoStageOutput for SnapshotSummary {
    fn wrap(result: Result<SnapshotSummary>) -> StageOutput {
        StageOutput::Snapshot(result)
    }
}

impl IntoStageOutput for Lsn {
    fn wrap(result: Result<Lsn>) -> StageOutput {
        StageOutput::Catchup(result)
    }
}

async fn join_stage(
    stage: &mut Option<RunningStage>,
) -> std::result::Result<StageOutput, JoinError> {
    match stage {
        Some(stage) => (&mut stage.handle).await,
        None => std::future::pending().await,
    }
}
