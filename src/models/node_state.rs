use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::EngineError;

/// Status of a node in the execution lifecycle.
///
/// State machine transitions:
/// - `Pending` → `Ready` (all predecessors completed) | `Failed` (join fail-fast)
/// - `Ready` → `AwaitingGate` (gated) | `Running` (ungated, picked up by the agent)
/// - `AwaitingGate` → `Running` (approved) | `Blocked` (rejected, timed out, cancelled)
/// - `Running` → `Completed` | `Blocked` | `Failed`
/// - `Blocked` → `Ready` (unblocked) | `Running` (gate re-approved) | `Failed` (remediation exhausted)
/// - `Completed` and `Failed` are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    AwaitingGate,
    Running,
    Blocked,
    Completed,
    Failed,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Pending => write!(f, "pending"),
            NodeStatus::Ready => write!(f, "ready"),
            NodeStatus::AwaitingGate => write!(f, "awaiting_gate"),
            NodeStatus::Running => write!(f, "running"),
            NodeStatus::Blocked => write!(f, "blocked"),
            NodeStatus::Completed => write!(f, "completed"),
            NodeStatus::Failed => write!(f, "failed"),
        }
    }
}

impl NodeStatus {
    pub fn all() -> &'static [NodeStatus] {
        &[
            NodeStatus::Pending,
            NodeStatus::Ready,
            NodeStatus::AwaitingGate,
            NodeStatus::Running,
            NodeStatus::Blocked,
            NodeStatus::Completed,
            NodeStatus::Failed,
        ]
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Failed)
    }

    /// Check if transitioning from the current status to the new status is valid.
    ///
    /// Unlike stage files, re-asserting the same status is rejected: terminal
    /// outcomes are assigned exactly once.
    pub fn can_transition_to(&self, new_status: &NodeStatus) -> bool {
        match self {
            NodeStatus::Pending => matches!(new_status, NodeStatus::Ready | NodeStatus::Failed),
            NodeStatus::Ready => {
                matches!(new_status, NodeStatus::AwaitingGate | NodeStatus::Running)
            }
            NodeStatus::AwaitingGate => {
                matches!(new_status, NodeStatus::Running | NodeStatus::Blocked)
            }
            NodeStatus::Running => matches!(
                new_status,
                NodeStatus::Completed | NodeStatus::Blocked | NodeStatus::Failed
            ),
            NodeStatus::Blocked => matches!(
                new_status,
                NodeStatus::Ready | NodeStatus::Running | NodeStatus::Failed
            ),
            NodeStatus::Completed | NodeStatus::Failed => false,
        }
    }

    /// Returns the list of valid statuses this status can transition to.
    pub fn valid_transitions(&self) -> Vec<NodeStatus> {
        NodeStatus::all()
            .iter()
            .copied()
            .filter(|s| self.can_transition_to(s))
            .collect()
    }
}

/// Why a node entered `Blocked`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockCause {
    GateRejected,
    GateTimeout,
    Timeout,
    Cancelled,
    /// The agent reported a recoverable problem (missing precondition, validation issue)
    Reported,
    /// Held while the fix loop attempts remediation
    Remediation,
}

impl BlockCause {
    /// Whether re-approval through the gate resumes the node
    pub fn is_gate(&self) -> bool {
        matches!(self, BlockCause::GateRejected | BlockCause::GateTimeout)
    }

    /// Tool calls suggested to an operator for this kind of block
    pub fn default_tool_calls(&self) -> Vec<String> {
        let calls: &[&str] = match self {
            BlockCause::GateRejected => &["approve_gate", "status"],
            BlockCause::GateTimeout => &["approve_gate", "reject_gate"],
            BlockCause::Timeout => &["unblock_node", "report_error"],
            BlockCause::Cancelled => &["status", "clear"],
            BlockCause::Reported => &["unblock_node", "start_fix_loop"],
            BlockCause::Remediation => &["fix_loop_status", "recall_fixes"],
        };
        calls.iter().map(|c| c.to_string()).collect()
    }
}

/// Mutable per-node execution state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_cause: Option<BlockCause>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_tool_calls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awaiting_since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Best-effort join that proceeded with at least one failed predecessor
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
    /// Sequence number of the `node:blocked` event that placed a remediation hold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_seq: Option<u64>,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::pending()
    }
}

impl NodeState {
    pub fn pending() -> Self {
        Self {
            status: NodeStatus::Pending,
            blocked_reason: None,
            block_cause: None,
            next_tool_calls: Vec::new(),
            blocked_at: None,
            awaiting_since: None,
            started_at: None,
            completed_at: None,
            failure_reason: None,
            partial: false,
            hold_seq: None,
        }
    }

    /// Apply a validated transition and maintain timestamps.
    pub fn try_transition(
        &mut self,
        node_id: &str,
        new_status: NodeStatus,
        at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if !self.status.can_transition_to(&new_status) {
            return Err(EngineError::InvalidTransition {
                node_id: node_id.to_string(),
                from: self.status,
                to: new_status,
            });
        }

        if self.status == NodeStatus::Blocked {
            self.clear_block();
        }

        match new_status {
            NodeStatus::AwaitingGate => self.awaiting_since = Some(at),
            NodeStatus::Running => {
                self.awaiting_since = None;
                self.started_at = Some(at);
            }
            NodeStatus::Completed | NodeStatus::Failed => {
                self.awaiting_since = None;
                self.completed_at = Some(at);
            }
            _ => {}
        }

        self.status = new_status;
        Ok(())
    }

    /// Move into `Blocked`, recording why and what to do next.
    pub fn try_block(
        &mut self,
        node_id: &str,
        cause: BlockCause,
        reason: String,
        next_tool_calls: Vec<String>,
        at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.try_transition(node_id, NodeStatus::Blocked, at)?;
        self.awaiting_since = None;
        self.blocked_reason = Some(reason);
        self.block_cause = Some(cause);
        self.next_tool_calls = if next_tool_calls.is_empty() {
            cause.default_tool_calls()
        } else {
            next_tool_calls
        };
        self.blocked_at = Some(at);
        Ok(())
    }

    /// Move into `Failed` with a non-empty reason.
    pub fn try_fail(
        &mut self,
        node_id: &str,
        reason: String,
        at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.try_transition(node_id, NodeStatus::Failed, at)?;
        self.failure_reason = Some(reason);
        Ok(())
    }

    fn clear_block(&mut self) {
        self.blocked_reason = None;
        self.block_cause = None;
        self.next_tool_calls.clear();
        self.blocked_at = None;
        self.hold_seq = None;
    }
}

/// Non-empty reason text, falling back to a generic description
pub(crate) fn non_empty_reason(reason: &str, fallback: &str) -> String {
    let trimmed = reason.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}
