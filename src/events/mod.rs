//! Lifecycle events shared by the executor, the progress projection and the fix loop.
//!
//! Every event is stamped with a bus-wide sequence number so consumers can
//! tell how far their projection has caught up.

mod bus;


use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::models::{BlockCause, ErrorReport, FinalError, FixAttempt, WorkflowGraph};

pub use bus::{EventBus, Subscription};

/// Event envelope: `{seq, timestamp, type, ...}` on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Tagged event payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum EventKind {
    #[serde(rename = "workflow:started")]
    WorkflowStarted {
        workflow_id: String,
        graph: Arc<WorkflowGraph>,
    },
    /// No node can make further progress
    #[serde(rename = "workflow:completed")]
    WorkflowCompleted {
        workflow_id: String,
        completed: usize,
        failed: usize,
        /// Nodes left pending behind a failed predecessor
        unreached: usize,
    },
    #[serde(rename = "workflow:cancelled")]
    WorkflowCancelled { workflow_id: String },

    #[serde(rename = "node:ready")]
    NodeReady {
        node_id: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        partial: bool,
    },
    #[serde(rename = "node:awaiting_gate")]
    NodeAwaitingGate { node_id: String },
    #[serde(rename = "node:started")]
    NodeStarted { node_id: String },
    #[serde(rename = "node:completed")]
    NodeCompleted { node_id: String },
    #[serde(rename = "node:blocked")]
    NodeBlocked {
        node_id: String,
        cause: BlockCause,
        reason: String,
        next_tool_calls: Vec<String>,
        /// Present when the node is held for automatic remediation
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorReport>,
    },
    #[serde(rename = "node:unblocked")]
    NodeUnblocked { node_id: String },
    #[serde(rename = "node:failed")]
    NodeFailed { node_id: String, reason: String },

    #[serde(rename = "fixloop:attempt")]
    FixLoopAttempt {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        attempt: FixAttempt,
    },
    #[serde(rename = "fixloop:succeeded")]
    FixLoopSucceeded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        total_attempts: u32,
    },
    #[serde(rename = "fixloop:failed")]
    FixLoopFailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        final_error: FinalError,
        rollback_error: String,
    },
    #[serde(rename = "fixloop:rolledback")]
    FixLoopRolledBack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        final_error: FinalError,
        total_attempts: u32,
    },
}

impl EventKind {
    /// Wire name of the event type
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::WorkflowStarted { .. } => "workflow:started",
            EventKind::WorkflowCompleted { .. } => "workflow:completed",
            EventKind::WorkflowCancelled { .. } => "workflow:cancelled",
            EventKind::NodeReady { .. } => "node:ready",
            EventKind::NodeAwaitingGate { .. } => "node:awaiting_gate",
            EventKind::NodeStarted { .. } => "node:started",
            EventKind::NodeCompleted { .. } => "node:completed",
            EventKind::NodeBlocked { .. } => "node:blocked",
            EventKind::NodeUnblocked { .. } => "node:unblocked",
            EventKind::NodeFailed { .. } => "node:failed",
            EventKind::FixLoopAttempt { .. } => "fixloop:attempt",
            EventKind::FixLoopSucceeded { .. } => "fixloop:succeeded",
            EventKind::FixLoopFailed { .. } => "fixloop:failed",
            EventKind::FixLoopRolledBack { .. } => "fixloop:rolledback",
        }
    }

    /// Node the event is about; fix loop events report their task id
    pub fn node_id(&self) -> Option<&str> {
        match self {
            EventKind::NodeReady { node_id, .. }
            | EventKind::NodeAwaitingGate { node_id }
            | EventKind::NodeStarted { node_id }
            | EventKind::NodeCompleted { node_id }
            | EventKind::NodeBlocked { node_id, .. }
            | EventKind::NodeUnblocked { node_id }
            | EventKind::NodeFailed { node_id, .. } => Some(node_id),
            EventKind::FixLoopAttempt { task_id, .. }
            | EventKind::FixLoopSucceeded { task_id, .. }
            | EventKind::FixLoopFailed { task_id, .. }
            | EventKind::FixLoopRolledBack { task_id, .. } => task_id.as_deref(),
            EventKind::WorkflowStarted { .. }
            | EventKind::WorkflowCompleted { .. }
            | EventKind::WorkflowCancelled { .. } => None,
        }
    }

    pub fn is_node_event(&self) -> bool {
        self.name().starts_with("node:")
    }

    pub fn is_fix_loop_event(&self) -> bool {
        self.name().starts_with("fixloop:")
    }
}

impl Event {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn node_id(&self) -> Option<&str> {
        self.kind.node_id()
    }
}
