//! Explicit session handle.
//!
//! A `Session` owns one active workflow, its progress projection, the fix
//! memory and the fix loop, and runs the background actors that connect them
//! over the event bus. Every operation goes through the handle; there is no
//! ambient "current workflow".
//!
//! A remediation hold is identified by the seq of its `node:blocked` event.
//! The loop started for a hold resolves only that hold, and unblocking the
//! node by hand cancels the loop.

mod actors;

use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::WardenConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, Subscription};
use crate::executor::{Executor, GateDecision, NodeOutcome};
use crate::fixloop::{AutoFixLoop, FixLoopSnapshot, Remediator};
use crate::memory::{FixMemory, RecallQuery, RecallResult, StoreAck};
use crate::models::{ErrorReport, FixLoopRequest, FixLoopResult, FixRecord, WorkflowGraph};
use crate::progress::{BlockerReport, Direction, PersistedSnapshot, ProgressSnapshot, ProgressTracker};

use actors::{ActiveHold, SharedExecutor};

/// How long a read waits for the projection to catch up with the bus
const SYNC_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Session {
    config: WardenConfig,
    bus: EventBus,
    executor: SharedExecutor,
    tracker: Arc<RwLock<ProgressTracker>>,
    applied: watch::Receiver<u64>,
    fix_loop: AutoFixLoop,
    remediator: Arc<dyn Remediator>,
    active_hold: ActiveHold,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("bus", &self.bus)
            .field("fix_loop", &self.fix_loop)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Open fix memory per `config.storage` and start the actors.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: WardenConfig, remediator: Arc<dyn Remediator>) -> anyhow::Result<Self> {
        let memory = match &config.storage.fix_memory {
            Some(path) => FixMemory::open(path)
                .with_context(|| format!("Failed to open fix memory: {}", path.display()))?,
            None => FixMemory::in_memory(),
        };
        Ok(Self::with_memory(config, memory, remediator))
    }

    /// Start a session over an already opened fix memory
    pub fn with_memory(
        config: WardenConfig,
        memory: FixMemory,
        remediator: Arc<dyn Remediator>,
    ) -> Self {
        let memory = Arc::new(Mutex::new(
            memory.with_min_similarity(config.fix_loop.min_similarity),
        ));
        let bus = EventBus::new(config.engine.event_capacity);
        let fix_loop = AutoFixLoop::new(memory, bus.clone(), config.fix_loop.clone());
        let executor: SharedExecutor = Arc::new(Mutex::new(None));
        let tracker = Arc::new(RwLock::new(ProgressTracker::new()));
        let (applied_tx, applied) = watch::channel(0);
        let shutdown = CancellationToken::new();
        let active_hold: ActiveHold = Arc::new(Mutex::new(None));

        // Subscribe before anything can publish
        let projection_events = bus.subscribe();
        let hold_events = bus.subscribe_filtered(actors::is_remediation_hold);

        let tasks = vec![
            tokio::spawn(actors::run_projection(
                projection_events,
                Arc::clone(&tracker),
                applied_tx,
                shutdown.clone(),
            )),
            tokio::spawn(actors::run_remediation(
                hold_events,
                Arc::clone(&executor),
                fix_loop.clone(),
                Arc::clone(&remediator),
                Arc::clone(&active_hold),
                shutdown.clone(),
            )),
            tokio::spawn(actors::run_timeout_sweeper(
                Arc::clone(&executor),
                config.engine.sweep_interval(),
                shutdown.clone(),
            )),
        ];

        Self {
            config,
            bus,
            executor,
            tracker,
            applied,
            fix_loop,
            remediator,
            active_hold,
            shutdown,
            tasks,
        }
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn fix_loop(&self) -> &AutoFixLoop {
        &self.fix_loop
    }

    /// Validate and start a workflow, replacing any previous one
    pub fn start_workflow(&self, graph: WorkflowGraph) -> EngineResult<()> {
        let mut guard = self.executor.lock();
        if let Some(previous) = guard.as_ref() {
            info!(workflow_id = %previous.workflow_id(), "replacing active workflow");
        }
        let mut executor = Executor::start(graph, self.bus.clone())?;
        executor.set_default_timeout_ms(self.config.engine.default_timeout());
        *guard = Some(executor);
        Ok(())
    }

    /// Run a closure against the active executor
    pub fn with_executor<T>(
        &self,
        f: impl FnOnce(&mut Executor) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut guard = self.executor.lock();
        let executor = guard.as_mut().ok_or(EngineError::NoActiveWorkflow)?;
        f(executor)
    }

    pub fn begin(&self, node_id: &str) -> EngineResult<()> {
        self.with_executor(|e| e.begin(node_id))
    }

    pub fn advance(&self, node_id: &str, outcome: NodeOutcome) -> EngineResult<()> {
        self.with_executor(|e| e.advance(node_id, outcome))
    }

    pub fn approve_gate(&self, node_id: &str) -> EngineResult<GateDecision> {
        self.with_executor(|e| e.approve_gate(node_id))
    }

    pub fn reject_gate(&self, node_id: &str, reason: &str) -> EngineResult<GateDecision> {
        self.with_executor(|e| e.reject_gate(node_id, reason))
    }

    /// Return a blocked node to `ready`.
    ///
    /// If the fix loop is working on this node's remediation hold, it is
    /// cancelled; its result could no longer apply.
    pub fn unblock_node(&self, node_id: &str) -> EngineResult<()> {
        self.with_executor(|e| {
            e.unblock(node_id)?;
            let remediating = self
                .active_hold
                .lock()
                .as_ref()
                .is_some_and(|(held, _)| held == node_id);
            if remediating && self.fix_loop.cancel() {
                info!(node_id, "cancelled remediation for unblocked node");
            }
            Ok(())
        })
    }

    /// Block every running or gated node and halt the workflow
    pub fn cancel_workflow(&self) -> EngineResult<Vec<String>> {
        self.with_executor(|e| e.cancel())
    }

    /// Report an error from a running node.
    ///
    /// With `auto_fix` the node is held for the fix loop; otherwise it is
    /// blocked for an operator.
    pub fn report_error(&self, node_id: &str, error: ErrorReport) -> EngineResult<()> {
        if self.config.engine.auto_fix {
            return self.with_executor(|e| e.hold_for_remediation(node_id, error).map(|_| ()));
        }
        let outcome = NodeOutcome::Blocked {
            reason: format!("error reported: {}", error.summary()),
            next_tool_calls: vec![
                "start_fix_loop".to_string(),
                "recall_fixes".to_string(),
                "unblock_node".to_string(),
            ],
        };
        self.advance(node_id, outcome)
    }

    /// Wait until the projection has folded in everything published so far
    pub async fn sync(&self) {
        let target = self.bus.last_seq();
        let mut applied = self.applied.clone();
        let wait = async {
            loop {
                if self.tracker.read().seq() >= target {
                    return;
                }
                if applied.changed().await.is_err() {
                    return;
                }
            }
        };
        if tokio::time::timeout(SYNC_TIMEOUT, wait).await.is_err() {
            warn!(target, "projection did not catch up in time");
        }
    }

    pub async fn status(&self, workflow_id: Option<&str>) -> EngineResult<ProgressSnapshot> {
        self.sync().await;
        self.tracker.read().status(workflow_id)
    }

    pub async fn blockers(&self) -> EngineResult<BlockerReport> {
        self.sync().await;
        self.tracker.read().blockers()
    }

    pub async fn diagram(&self, direction: Direction, show_gate_badges: bool) -> EngineResult<String> {
        self.sync().await;
        self.tracker.read().diagram(direction, show_gate_badges)
    }

    /// Reset the projection. The executor is untouched.
    pub async fn clear(&self) {
        self.sync().await;
        self.tracker.write().clear();
    }

    pub async fn start_fix_loop(&self, request: FixLoopRequest) -> EngineResult<FixLoopResult> {
        Ok(self
            .fix_loop
            .start_fix_loop(request, self.remediator.as_ref())
            .await?)
    }

    /// Claim the fix loop now and run it on a separate task.
    ///
    /// `Busy` is returned immediately; once this returns, `cancel_fix_loop`
    /// reaches the spawned loop.
    pub fn spawn_fix_loop(
        &self,
        request: FixLoopRequest,
    ) -> EngineResult<JoinHandle<FixLoopResult>> {
        let run = self.fix_loop.claim(request)?;
        let remediator = Arc::clone(&self.remediator);
        Ok(tokio::spawn(async move { run.run(remediator.as_ref()).await }))
    }

    pub fn cancel_fix_loop(&self) -> bool {
        self.fix_loop.cancel()
    }

    pub fn fix_loop_status(&self) -> FixLoopSnapshot {
        self.fix_loop.snapshot()
    }

    pub fn recall_fixes(&self, query: &RecallQuery) -> RecallResult {
        self.fix_loop.memory().lock().recall(query)
    }

    pub fn store_fix(&self, record: FixRecord) -> EngineResult<StoreAck> {
        let error_id = self.fix_loop.memory().lock().store(record)?;
        Ok(StoreAck { error_id })
    }

    /// Persist the projection. Falls back to the configured snapshot path.
    pub async fn save_snapshot(&self, path: Option<&Path>) -> EngineResult<PathBuf> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| self.config.storage.snapshot.clone())
            .ok_or_else(|| anyhow::anyhow!("no snapshot path configured"))?;
        self.sync().await;
        let snapshot = self.tracker.read().to_persisted()?;
        snapshot.save(&path)?;
        Ok(path)
    }

    /// Resume a workflow from a persisted snapshot.
    ///
    /// The projection is restored first so a stale snapshot is rejected
    /// before the executor is replaced.
    pub async fn restore(&self, snapshot: PersistedSnapshot) -> EngineResult<()> {
        self.sync().await;
        self.tracker.write().restore(snapshot.clone())?;
        self.bus.advance_seq_to(snapshot.seq);

        let cancelled = snapshot.is_cancelled();
        let mut executor = Executor::restore(snapshot.graph, snapshot.node_states, self.bus.clone())?;
        executor.set_default_timeout_ms(self.config.engine.default_timeout());
        if cancelled && !executor.is_halted() {
            executor.cancel()?;
        }
        *self.executor.lock() = Some(executor);
        info!(seq = snapshot.seq, workflow_id = %snapshot.workflow_id, "session restored");
        Ok(())
    }

    /// Restore from the configured snapshot path if a snapshot exists there
    pub async fn restore_from_disk(&self) -> EngineResult<bool> {
        let Some(path) = self.config.storage.snapshot.clone() else {
            return Ok(false);
        };
        match PersistedSnapshot::load_optional(&path)? {
            Some(snapshot) => {
                self.restore(snapshot).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stop the actors and wait for them to exit
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "session actor ended abnormally");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
