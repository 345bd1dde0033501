//! Unblocking and the hand-off to automatic remediation

use chrono::Utc;
use tracing::{debug, info, warn};

use super::Executor;
use crate::error::EngineResult;
use crate::events::EventKind;
use crate::models::node_state::non_empty_reason;
use crate::models::{BlockCause, ErrorReport, NodeStatus};

/// How a remediation attempt for a held node ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemediationOutcome {
    Resolved,
    Exhausted { message: String },
}

impl Executor {
    /// Return a blocked node to `ready` after external intervention.
    ///
    /// Gate blocks are resolved through `approve_gate` instead; unblocking
    /// them here would bypass the approver.
    pub fn unblock(&mut self, node_id: &str) -> EngineResult<()> {
        self.ensure_running()?;
        if let Some(err) = self.gate_block(node_id) {
            return Err(err);
        }
        let now = Utc::now();
        self.state_mut(node_id)?
            .try_transition(node_id, NodeStatus::Ready, now)?;
        info!(node_id, "node unblocked");
        self.bus.publish(EventKind::NodeUnblocked {
            node_id: node_id.to_string(),
        });
        self.bus.publish(EventKind::NodeReady {
            node_id: node_id.to_string(),
            partial: self.state_of(node_id)?.partial,
        });
        Ok(())
    }

    /// Hold a running node blocked while the fix loop works on its error.
    ///
    /// The `node:blocked` event carries the error report with `taskId` set
    /// to the node, which is what the remediation actor listens for. Returns
    /// the sequence number of that event; it identifies this hold when the
    /// outcome is resolved.
    pub fn hold_for_remediation(&mut self, node_id: &str, error: ErrorReport) -> EngineResult<u64> {
        self.ensure_running()?;
        let error = ErrorReport {
            task_id: Some(node_id.to_string()),
            ..error
        };
        let reason = format!("auto-fix in progress: {}", error.summary());
        let seq = self.block(
            node_id,
            BlockCause::Remediation,
            reason,
            Vec::new(),
            Some(error),
            Utc::now(),
        )?;
        self.state_mut(node_id)?.hold_seq = Some(seq);
        Ok(seq)
    }

    /// Whether `node_id` is still held by the hold placed at `hold_seq`
    pub fn is_held(&self, node_id: &str, hold_seq: u64) -> bool {
        self.states.get(node_id).is_some_and(|state| {
            state.status == NodeStatus::Blocked
                && state.block_cause == Some(BlockCause::Remediation)
                && state.hold_seq == Some(hold_seq)
        })
    }

    /// Apply a finished fix loop to the hold it was started for.
    ///
    /// Returns `false` when that hold is gone, for example because an
    /// operator unblocked the node, or the node has since been held again
    /// for a different error.
    pub fn resolve_remediation(
        &mut self,
        node_id: &str,
        hold_seq: u64,
        outcome: RemediationOutcome,
    ) -> EngineResult<bool> {
        if self.halted {
            debug!(node_id, "workflow halted; remediation outcome ignored");
            return Ok(false);
        }
        self.state_of(node_id)?;
        if !self.is_held(node_id, hold_seq) {
            debug!(node_id, hold_seq, "hold already released; remediation outcome ignored");
            return Ok(false);
        }

        match outcome {
            RemediationOutcome::Resolved => {
                info!(node_id, "remediation succeeded");
                self.unblock(node_id)?;
            }
            RemediationOutcome::Exhausted { message } => {
                let reason = non_empty_reason(&message, "remediation exhausted");
                warn!(node_id, %reason, "remediation exhausted; failing node");
                self.fail(node_id, reason, Utc::now())?;
                self.check_settled();
            }
        }
        Ok(true)
    }
}
