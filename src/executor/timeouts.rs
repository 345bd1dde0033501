//! Timeout sweep and workflow cancellation

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use super::Executor;
use crate::error::EngineResult;
use crate::events::EventKind;
use crate::models::constants::reasons;
use crate::models::{BlockCause, NodeStatus};

impl Executor {
    /// Block every `running` or `awaiting_gate` node whose timeout elapsed by `now`.
    ///
    /// Running nodes block with reason `timeout`, nodes waiting at a gate with
    /// `gate timeout`. Returns the blocked ids in declaration order.
    pub fn timeout_sweep(&mut self, now: DateTime<Utc>) -> EngineResult<Vec<String>> {
        if self.halted {
            return Ok(Vec::new());
        }

        let mut expired = Vec::new();
        for node in &self.graph.nodes {
            let Some(timeout_ms) = self.effective_timeout_ms(node) else {
                continue;
            };
            let Some(state) = self.states.get(&node.id) else {
                continue;
            };
            let (since, cause, reason) = match state.status {
                NodeStatus::Running => (state.started_at, BlockCause::Timeout, reasons::TIMEOUT),
                NodeStatus::AwaitingGate => (
                    state.awaiting_since,
                    BlockCause::GateTimeout,
                    reasons::GATE_TIMEOUT,
                ),
                _ => continue,
            };
            let Some(since) = since else {
                continue;
            };
            let deadline = since + Duration::milliseconds(timeout_ms.min(i64::MAX as u64) as i64);
            if now >= deadline {
                expired.push((node.id.clone(), cause, reason));
            }
        }

        let mut blocked = Vec::with_capacity(expired.len());
        for (node_id, cause, reason) in expired {
            warn!(node_id = %node_id, %reason, "node timed out");
            self.block(&node_id, cause, reason.to_string(), Vec::new(), None, now)?;
            blocked.push(node_id);
        }
        Ok(blocked)
    }

    /// Cancel the whole workflow.
    ///
    /// Running and gated nodes are blocked with reason `cancelled` and no
    /// further readiness is computed. Node states stay in place for
    /// inspection. Cancelling twice is a no-op.
    pub fn cancel(&mut self) -> EngineResult<Vec<String>> {
        if self.halted {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let targets: Vec<String> = self
            .states
            .iter()
            .filter(|(_, s)| matches!(s.status, NodeStatus::Running | NodeStatus::AwaitingGate))
            .map(|(id, _)| id.clone())
            .collect();

        for node_id in &targets {
            self.block(
                node_id,
                BlockCause::Cancelled,
                reasons::CANCELLED.to_string(),
                Vec::new(),
                None,
                now,
            )?;
        }

        self.halted = true;
        info!(workflow_id = %self.graph.id, cancelled = targets.len(), "workflow cancelled");
        self.bus.publish(EventKind::WorkflowCancelled {
            workflow_id: self.graph.id.clone(),
        });
        Ok(targets)
    }
}
