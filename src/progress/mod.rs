//! Event-derived progress projection.
//!
//! The tracker never touches executor internals: it folds lifecycle events
//! into its own copy of node state and answers status, blocker and diagram
//! queries from that copy.
//!
//! ## Module Organization
//!
//! - `blockers`: blocker ranking and summary
//! - `diagram`: Mermaid flowchart and terminal level view
//! - `snapshot`: persisted snapshot for restart

mod blockers;
mod diagram;
mod snapshot;


use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventKind};
use crate::models::{BlockCause, NodeState, NodeStatus, WorkflowGraph};

pub use blockers::{Blocker, BlockerReport};
pub use diagram::{render_levels, render_mermaid, Direction};
pub use snapshot::PersistedSnapshot;

/// Entry in the blocked-order list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedEntry {
    pub node_id: String,
    pub blocked_at: DateTime<Utc>,
}

/// Lifecycle of the tracked workflow as seen by the projection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    #[default]
    Running,
    Completed,
    Cancelled,
}

/// Node counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    pub total: usize,
    pub pending: usize,
    pub ready: usize,
    pub awaiting_gate: usize,
    pub running: usize,
    pub blocked: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusSummary {
    fn from_states<'a>(states: impl Iterator<Item = &'a NodeState>) -> Self {
        let mut summary = Self::default();
        for state in states {
            summary.total += 1;
            match state.status {
                NodeStatus::Pending => summary.pending += 1,
                NodeStatus::Ready => summary.ready += 1,
                NodeStatus::AwaitingGate => summary.awaiting_gate += 1,
                NodeStatus::Running => summary.running += 1,
                NodeStatus::Blocked => summary.blocked += 1,
                NodeStatus::Completed => summary.completed += 1,
                NodeStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        match status {
            NodeStatus::Pending => self.pending,
            NodeStatus::Ready => self.ready,
            NodeStatus::AwaitingGate => self.awaiting_gate,
            NodeStatus::Running => self.running,
            NodeStatus::Blocked => self.blocked,
            NodeStatus::Completed => self.completed,
            NodeStatus::Failed => self.failed,
        }
    }
}

/// Point-in-time view of a workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub workflow_id: String,
    /// Sequence number of the last event folded in
    pub seq: u64,
    pub phase: WorkflowPhase,
    /// Declaration order
    pub node_states: IndexMap<String, NodeState>,
    pub summary: StatusSummary,
    pub blockers: Vec<Blocker>,
}

/// Read model over the event stream
#[derive(Debug, Default)]
pub struct ProgressTracker {
    graph: Option<Arc<WorkflowGraph>>,
    node_states: IndexMap<String, NodeState>,
    blocked_order: Vec<BlockedEntry>,
    phase: WorkflowPhase,
    seq: u64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number of the last applied event
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn graph(&self) -> Option<&Arc<WorkflowGraph>> {
        self.graph.as_ref()
    }

    pub fn node_state(&self, node_id: &str) -> Option<&NodeState> {
        self.node_states.get(node_id)
    }

    /// Fold one event into the projection.
    ///
    /// Events at or below the current sequence number were already applied
    /// (or predate a restored snapshot) and are ignored.
    pub fn on_event(&mut self, event: &Event) {
        if event.seq <= self.seq {
            trace!(seq = event.seq, current = self.seq, "skipping already applied event");
            return;
        }
        self.seq = event.seq;
        let at = event.timestamp;

        match &event.kind {
            EventKind::WorkflowStarted { graph, .. } => {
                self.graph = Some(Arc::clone(graph));
                self.node_states = graph
                    .nodes
                    .iter()
                    .map(|n| (n.id.clone(), NodeState::pending()))
                    .collect();
                self.blocked_order.clear();
                self.phase = WorkflowPhase::Running;
            }
            EventKind::WorkflowCompleted { .. } => self.phase = WorkflowPhase::Completed,
            EventKind::WorkflowCancelled { .. } => self.phase = WorkflowPhase::Cancelled,

            EventKind::NodeReady { node_id, partial } => {
                if let Some(state) = self.state_mut(node_id) {
                    clear_block(state);
                    state.status = NodeStatus::Ready;
                    state.partial = *partial;
                }
                self.remove_blocked(node_id);
            }
            EventKind::NodeAwaitingGate { node_id } => {
                if let Some(state) = self.state_mut(node_id) {
                    state.status = NodeStatus::AwaitingGate;
                    state.awaiting_since = Some(at);
                }
            }
            EventKind::NodeStarted { node_id } => {
                if let Some(state) = self.state_mut(node_id) {
                    clear_block(state);
                    state.status = NodeStatus::Running;
                    state.awaiting_since = None;
                    state.started_at = Some(at);
                }
                self.remove_blocked(node_id);
            }
            EventKind::NodeCompleted { node_id } => {
                if let Some(state) = self.state_mut(node_id) {
                    state.status = NodeStatus::Completed;
                    state.completed_at = Some(at);
                }
                self.remove_blocked(node_id);
            }
            EventKind::NodeBlocked {
                node_id,
                cause,
                reason,
                next_tool_calls,
                ..
            } => {
                if let Some(state) = self.state_mut(node_id) {
                    state.status = NodeStatus::Blocked;
                    state.awaiting_since = None;
                    state.blocked_reason = Some(reason.clone());
                    state.block_cause = Some(*cause);
                    state.next_tool_calls = next_tool_calls.clone();
                    state.blocked_at = Some(at);
                    state.hold_seq = (*cause == BlockCause::Remediation).then_some(event.seq);
                    self.remove_blocked(node_id);
                    self.blocked_order.push(BlockedEntry {
                        node_id: node_id.clone(),
                        blocked_at: at,
                    });
                }
            }
            EventKind::NodeUnblocked { node_id } => {
                if let Some(state) = self.state_mut(node_id) {
                    clear_block(state);
                    state.status = NodeStatus::Ready;
                }
                self.remove_blocked(node_id);
            }
            EventKind::NodeFailed { node_id, reason } => {
                if let Some(state) = self.state_mut(node_id) {
                    clear_block(state);
                    state.status = NodeStatus::Failed;
                    state.failure_reason = Some(reason.clone());
                    state.completed_at = Some(at);
                }
                self.remove_blocked(node_id);
            }

            EventKind::FixLoopAttempt { .. }
            | EventKind::FixLoopSucceeded { .. }
            | EventKind::FixLoopFailed { .. }
            | EventKind::FixLoopRolledBack { .. } => {}
        }
        debug!(seq = event.seq, event = event.name(), "projection updated");
    }

    /// Current snapshot, optionally checked against a workflow id
    pub fn status(&self, workflow_id: Option<&str>) -> EngineResult<ProgressSnapshot> {
        let graph = self.active_graph()?;
        if let Some(requested) = workflow_id {
            if requested != graph.id {
                return Err(EngineError::WorkflowMismatch {
                    requested: requested.to_string(),
                    active: graph.id.clone(),
                });
            }
        }

        Ok(ProgressSnapshot {
            workflow_id: graph.id.clone(),
            seq: self.seq,
            phase: self.phase,
            node_states: self.node_states.clone(),
            summary: StatusSummary::from_states(self.node_states.values()),
            blockers: self.ranked_blockers(graph),
        })
    }

    /// Blocked nodes, most recently blocked first
    pub fn blockers(&self) -> EngineResult<BlockerReport> {
        let graph = self.active_graph()?;
        Ok(BlockerReport::new(self.ranked_blockers(graph)))
    }

    /// Mermaid flowchart of the graph with current status markers
    pub fn diagram(&self, direction: Direction, show_gate_badges: bool) -> EngineResult<String> {
        let graph = self.active_graph()?;
        Ok(render_mermaid(
            graph,
            &self.node_states,
            direction,
            show_gate_badges,
        ))
    }

    /// Forget everything. The executor is unaffected.
    pub fn clear(&mut self) {
        debug!(seq = self.seq, "projection cleared");
        *self = Self {
            seq: self.seq,
            ..Self::default()
        };
    }

    fn active_graph(&self) -> EngineResult<&Arc<WorkflowGraph>> {
        self.graph.as_ref().ok_or(EngineError::NoActiveWorkflow)
    }

    fn ranked_blockers(&self, graph: &WorkflowGraph) -> Vec<Blocker> {
        blockers::rank(graph, &self.node_states, &self.blocked_order)
    }

    fn state_mut(&mut self, node_id: &str) -> Option<&mut NodeState> {
        let state = self.node_states.get_mut(node_id);
        if state.is_none() {
            debug!(node_id, "event for node outside the tracked graph");
        }
        state
    }

    fn remove_blocked(&mut self, node_id: &str) {
        self.blocked_order.retain(|e| e.node_id != node_id);
    }
}

fn clear_block(state: &mut NodeState) {
    state.blocked_reason = None;
    state.block_cause = None;
    state.next_tool_calls.clear();
    state.blocked_at = None;
    state.hold_seq = None;
}
