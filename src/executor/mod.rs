//! Graph executor: owns node state and drives a workflow from entry to completion.
//!
//! ## Module Organization
//!
//! - `gates`: approval and rejection of gated nodes
//! - `recovery`: unblocking and fix loop hand-off
//! - `timeouts`: timeout sweep and workflow cancellation
//!
//! Every mutating operation takes `&mut self`; callers that share an executor
//! wrap it in a lock, which serializes transitions per node.

mod gates;
mod recovery;
mod timeouts;

#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, EventKind};
use crate::graph::{self, evaluate_readiness, GraphIndex, Readiness};
use crate::models::node_state::non_empty_reason;
use crate::models::{BlockCause, NodeState, NodeStatus, WorkflowGraph, WorkflowNode};

pub use gates::GateDecision;
pub use recovery::RemediationOutcome;

/// Outcome an agent reports for a running node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NodeOutcome {
    Completed,
    /// Recoverable: missing precondition, validation issue
    Blocked {
        reason: String,
        #[serde(default, rename = "nextToolCalls")]
        next_tool_calls: Vec<String>,
    },
    /// Unrecoverable
    Failed { reason: String },
}

/// Drives one workflow graph
#[derive(Debug)]
pub struct Executor {
    graph: Arc<WorkflowGraph>,
    index: GraphIndex,
    /// Declaration order
    states: IndexMap<String, NodeState>,
    bus: EventBus,
    default_timeout_ms: Option<u64>,
    halted: bool,
    settled: bool,
}

impl Executor {
    /// Validate the graph, reset every node to pending and offer the roots.
    ///
    /// Emits `workflow:started`, then `node:ready` for each in-degree 0 node
    /// in declaration order, followed by `node:awaiting_gate` for gated ones.
    pub fn start(graph: WorkflowGraph, bus: EventBus) -> EngineResult<Self> {
        let index = graph::validate(&graph)?;
        let graph = Arc::new(graph);
        let states = graph
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeState::pending()))
            .collect();

        let mut executor = Self {
            graph: Arc::clone(&graph),
            index,
            states,
            bus,
            default_timeout_ms: None,
            halted: false,
            settled: false,
        };

        info!(workflow_id = %graph.id, nodes = graph.nodes.len(), "workflow started");
        executor.bus.publish(EventKind::WorkflowStarted {
            workflow_id: graph.id.clone(),
            graph: Arc::clone(&graph),
        });

        let now = Utc::now();
        let roots: Vec<String> = executor
            .index
            .order
            .iter()
            .filter(|id| executor.index.predecessors_of(id).is_empty())
            .cloned()
            .collect();
        for id in roots {
            executor.make_ready(&id, false, now)?;
        }
        Ok(executor)
    }

    /// Resume from persisted node states without replaying events.
    ///
    /// Nodes missing from `states` restart as pending. A persisted
    /// cancellation keeps the workflow halted.
    pub fn restore(
        graph: WorkflowGraph,
        states: IndexMap<String, NodeState>,
        bus: EventBus,
    ) -> EngineResult<Self> {
        let index = graph::validate(&graph)?;
        if let Some(unknown) = states.keys().find(|id| index.position(id).is_none()) {
            return Err(EngineError::UnknownNode(unknown.clone()));
        }

        let mut restored = IndexMap::with_capacity(graph.nodes.len());
        for node in &graph.nodes {
            let state = states.get(&node.id).cloned().unwrap_or_default();
            restored.insert(node.id.clone(), state);
        }
        let halted = restored
            .values()
            .any(|s| s.block_cause == Some(BlockCause::Cancelled));
        let settled = !restored.values().any(|s| is_active(s.status));

        info!(workflow_id = %graph.id, halted, "workflow restored");
        Ok(Self {
            graph: Arc::new(graph),
            index,
            states: restored,
            bus,
            default_timeout_ms: None,
            halted,
            settled,
        })
    }

    /// Engine-wide timeout for nodes and graphs that set none
    pub fn set_default_timeout_ms(&mut self, timeout_ms: Option<u64>) {
        self.default_timeout_ms = timeout_ms.filter(|ms| *ms > 0);
    }

    pub fn graph(&self) -> &Arc<WorkflowGraph> {
        &self.graph
    }

    pub fn workflow_id(&self) -> &str {
        &self.graph.id
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// True once no node can make further progress
    pub fn is_settled(&self) -> bool {
        self.settled
    }

    pub fn state(&self, node_id: &str) -> Option<&NodeState> {
        self.states.get(node_id)
    }

    /// All node states in declaration order
    pub fn states(&self) -> &IndexMap<String, NodeState> {
        &self.states
    }

    /// Ids currently `ready`, in declaration order
    pub fn ready_nodes(&self) -> Vec<String> {
        self.nodes_with_status(NodeStatus::Ready)
    }

    pub fn nodes_with_status(&self, status: NodeStatus) -> Vec<String> {
        self.states
            .iter()
            .filter(|(_, s)| s.status == status)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Pick up an ungated ready node.
    pub fn begin(&mut self, node_id: &str) -> EngineResult<()> {
        self.ensure_running()?;
        let state = self.state_of(node_id)?;
        match state.status {
            NodeStatus::Ready => {}
            NodeStatus::Blocked => {
                if let Some(err) = gate_error(node_id, state) {
                    return Err(err);
                }
                return Err(self.invalid(node_id, NodeStatus::Running));
            }
            // Gated nodes only start through approval
            _ => return Err(self.invalid(node_id, NodeStatus::Running)),
        }
        let now = Utc::now();
        self.state_mut(node_id)?
            .try_transition(node_id, NodeStatus::Running, now)?;
        debug!(node_id, "node started");
        self.bus.publish(EventKind::NodeStarted {
            node_id: node_id.to_string(),
        });
        Ok(())
    }

    /// Apply the terminal outcome of a running node and recompute downstream readiness.
    pub fn advance(&mut self, node_id: &str, outcome: NodeOutcome) -> EngineResult<()> {
        self.ensure_running()?;
        let now = Utc::now();
        match outcome {
            NodeOutcome::Completed => {
                self.state_mut(node_id)?
                    .try_transition(node_id, NodeStatus::Completed, now)?;
                debug!(node_id, "node completed");
                self.bus.publish(EventKind::NodeCompleted {
                    node_id: node_id.to_string(),
                });
                self.propagate(node_id, now)?;
            }
            NodeOutcome::Blocked {
                reason,
                next_tool_calls,
            } => {
                let reason = non_empty_reason(&reason, "blocked by agent");
                self.block(node_id, BlockCause::Reported, reason, next_tool_calls, None, now)?;
            }
            NodeOutcome::Failed { reason } => {
                let reason = non_empty_reason(&reason, "failed without a reason");
                self.fail(node_id, reason, now)?;
            }
        }
        self.check_settled();
        Ok(())
    }

    fn ensure_running(&self) -> EngineResult<()> {
        if self.halted {
            return Err(EngineError::Halted(self.graph.id.clone()));
        }
        Ok(())
    }

    fn node(&self, node_id: &str) -> EngineResult<&WorkflowNode> {
        self.graph
            .node(node_id)
            .ok_or_else(|| EngineError::UnknownNode(node_id.to_string()))
    }

    fn state_of(&self, node_id: &str) -> EngineResult<&NodeState> {
        self.states
            .get(node_id)
            .ok_or_else(|| EngineError::UnknownNode(node_id.to_string()))
    }

    fn state_mut(&mut self, node_id: &str) -> EngineResult<&mut NodeState> {
        self.states
            .get_mut(node_id)
            .ok_or_else(|| EngineError::UnknownNode(node_id.to_string()))
    }

    fn invalid(&self, node_id: &str, to: NodeStatus) -> EngineError {
        EngineError::InvalidTransition {
            node_id: node_id.to_string(),
            from: self
                .states
                .get(node_id)
                .map(|s| s.status)
                .unwrap_or(NodeStatus::Pending),
            to,
        }
    }

    /// Pending → ready, then straight on to awaiting_gate when the node is gated
    fn make_ready(&mut self, node_id: &str, partial: bool, at: DateTime<Utc>) -> EngineResult<()> {
        let gated = self.node(node_id)?.requires_gate(&self.graph.defaults);
        let state = self.state_mut(node_id)?;
        state.try_transition(node_id, NodeStatus::Ready, at)?;
        state.partial = partial;
        debug!(node_id, partial, "node ready");
        self.bus.publish(EventKind::NodeReady {
            node_id: node_id.to_string(),
            partial,
        });

        if gated {
            self.state_mut(node_id)?
                .try_transition(node_id, NodeStatus::AwaitingGate, at)?;
            info!(node_id, "node awaiting gate approval");
            self.bus.publish(EventKind::NodeAwaitingGate {
                node_id: node_id.to_string(),
            });
        }
        Ok(())
    }

    fn block(
        &mut self,
        node_id: &str,
        cause: BlockCause,
        reason: String,
        next_tool_calls: Vec<String>,
        error: Option<crate::models::ErrorReport>,
        at: DateTime<Utc>,
    ) -> EngineResult<u64> {
        let state = self.state_mut(node_id)?;
        state.try_block(node_id, cause, reason, next_tool_calls, at)?;
        let reason = state.blocked_reason.clone().unwrap_or_default();
        let next_tool_calls = state.next_tool_calls.clone();
        info!(node_id, ?cause, %reason, "node blocked");
        let event = self.bus.publish(EventKind::NodeBlocked {
            node_id: node_id.to_string(),
            cause,
            reason,
            next_tool_calls,
            error,
        });
        Ok(event.seq)
    }

    fn fail(&mut self, node_id: &str, reason: String, at: DateTime<Utc>) -> EngineResult<()> {
        self.state_mut(node_id)?
            .try_fail(node_id, reason.clone(), at)?;
        info!(node_id, %reason, "node failed");
        self.bus.publish(EventKind::NodeFailed {
            node_id: node_id.to_string(),
            reason,
        });
        self.propagate(node_id, at)
    }

    /// Re-evaluate pending successors of a node that just settled.
    ///
    /// Successors are visited in declaration order so simultaneously ready
    /// nodes are offered deterministically. Joins that fail fast cascade.
    fn propagate(&mut self, node_id: &str, at: DateTime<Utc>) -> EngineResult<()> {
        let mut worklist = vec![node_id.to_string()];
        while let Some(settled) = worklist.pop() {
            let successors = self
                .index
                .in_declaration_order(self.index.successors_of(&settled).iter().cloned());
            let mut failed_now = Vec::new();

            for succ in successors {
                if self.state_of(&succ)?.status != NodeStatus::Pending {
                    continue;
                }
                let preds: Vec<(String, NodeStatus)> = self
                    .index
                    .predecessors_of(&succ)
                    .iter()
                    .map(|p| {
                        let status = self
                            .states
                            .get(p)
                            .map(|s| s.status)
                            .unwrap_or(NodeStatus::Pending);
                        (p.clone(), status)
                    })
                    .collect();

                match evaluate_readiness(self.node(&succ)?, &preds) {
                    Readiness::Waiting => {}
                    Readiness::Ready { partial } => self.make_ready(&succ, partial, at)?,
                    Readiness::Fail { reason } => {
                        self.state_mut(&succ)?.try_fail(&succ, reason.clone(), at)?;
                        info!(node_id = %succ, %reason, "join failed");
                        self.bus.publish(EventKind::NodeFailed {
                            node_id: succ.clone(),
                            reason,
                        });
                        failed_now.push(succ);
                    }
                }
            }
            // Keep declaration order for cascades: last pushed is popped first
            worklist.extend(failed_now.into_iter().rev());
        }
        Ok(())
    }

    /// Emit `workflow:completed` the first time no node can make progress
    fn check_settled(&mut self) {
        if self.settled || self.halted {
            return;
        }
        if self.states.values().any(|s| is_active(s.status)) {
            return;
        }
        self.settled = true;
        let count = |status| self.states.values().filter(|s| s.status == status).count();
        let (completed, failed, unreached) = (
            count(NodeStatus::Completed),
            count(NodeStatus::Failed),
            count(NodeStatus::Pending),
        );
        info!(workflow_id = %self.graph.id, completed, failed, unreached, "workflow settled");
        self.bus.publish(EventKind::WorkflowCompleted {
            workflow_id: self.graph.id.clone(),
            completed,
            failed,
            unreached,
        });
    }

    fn effective_timeout_ms(&self, node: &WorkflowNode) -> Option<u64> {
        node.effective_timeout_ms(&self.graph.defaults)
            .or(self.default_timeout_ms)
    }
}

/// Statuses from which a node can still make progress
fn is_active(status: NodeStatus) -> bool {
    matches!(
        status,
        NodeStatus::Ready | NodeStatus::AwaitingGate | NodeStatus::Running | NodeStatus::Blocked
    )
}

/// Error explaining that a gate, not the agent, holds this node
fn gate_error(node_id: &str, state: &NodeState) -> Option<EngineError> {
    match state.block_cause? {
        BlockCause::GateRejected => Some(EngineError::GateRejected {
            node_id: node_id.to_string(),
            reason: state.blocked_reason.clone().unwrap_or_default(),
        }),
        BlockCause::GateTimeout => Some(EngineError::GateTimeout(node_id.to_string())),
        _ => None,
    }
}
