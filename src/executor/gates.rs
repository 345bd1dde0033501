//! Gate resolution.
//!
//! A gated node waits in `awaiting_gate` until an external approver acts.
//! Rejected or timed-out gates block the node; approving again resumes it.

use chrono::Utc;
use tracing::info;

use super::Executor;
use crate::error::{EngineError, EngineResult};
use crate::events::EventKind;
use crate::models::constants::reasons;
use crate::models::{BlockCause, NodeStatus};

/// Decision recorded for a gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Approved,
    /// Approved after an earlier rejection or timeout
    Reapproved,
    Rejected { reason: String },
}

impl Executor {
    /// Approve a node waiting at its gate, or re-approve one whose gate was
    /// rejected or timed out. The node moves to `running`.
    pub fn approve_gate(&mut self, node_id: &str) -> EngineResult<GateDecision> {
        self.ensure_running()?;
        let state = self.state_of(node_id)?;
        let decision = match (state.status, state.block_cause) {
            (NodeStatus::AwaitingGate, _) => GateDecision::Approved,
            (NodeStatus::Blocked, Some(cause)) if cause.is_gate() => GateDecision::Reapproved,
            _ => return Err(self.invalid(node_id, NodeStatus::Running)),
        };

        let now = Utc::now();
        self.state_mut(node_id)?
            .try_transition(node_id, NodeStatus::Running, now)?;
        info!(node_id, ?decision, "gate approved");

        if decision == GateDecision::Reapproved {
            self.bus.publish(EventKind::NodeUnblocked {
                node_id: node_id.to_string(),
            });
        }
        self.bus.publish(EventKind::NodeStarted {
            node_id: node_id.to_string(),
        });
        Ok(decision)
    }

    /// Reject a node waiting at its gate. The node becomes `blocked` with
    /// reason `gate rejected`, suffixed with the approver's reason if given.
    pub fn reject_gate(&mut self, node_id: &str, reason: &str) -> EngineResult<GateDecision> {
        self.ensure_running()?;
        let state = self.state_of(node_id)?;
        if state.status != NodeStatus::AwaitingGate {
            return Err(self.invalid(node_id, NodeStatus::Blocked));
        }

        let reason = reason.trim();
        let blocked_reason = if reason.is_empty() {
            reasons::GATE_REJECTED.to_string()
        } else {
            format!("{}: {reason}", reasons::GATE_REJECTED)
        };
        self.block(
            node_id,
            BlockCause::GateRejected,
            blocked_reason,
            Vec::new(),
            None,
            Utc::now(),
        )?;
        Ok(GateDecision::Rejected {
            reason: reason.to_string(),
        })
    }

    /// Ids currently waiting at a gate, in declaration order
    pub fn awaiting_gate(&self) -> Vec<String> {
        self.nodes_with_status(NodeStatus::AwaitingGate)
    }

    /// Error to surface when work is attempted on a gate-blocked node
    pub fn gate_block(&self, node_id: &str) -> Option<EngineError> {
        self.states
            .get(node_id)
            .and_then(|state| super::gate_error(node_id, state))
    }
}
