//! Self-healing fix loop.
//!
//! ## Module Organization
//!
//! - `remediation`: error classification, default remediation catalogue, backoff
//! - `command`: `Remediator` backed by configured shell commands
//!
//! One loop runs at a time per `AutoFixLoop`. Each attempt picks a remediation
//! (fix memory first, then the category default), applies it, and records the
//! outcome. A loop that ends without success rolls back, including a cancelled
//! one.

pub mod command;
pub mod remediation;


use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::FixLoopConfig;
use crate::error::FixLoopError;
use crate::events::{EventBus, EventKind};
use crate::memory::{FixMemory, RecallQuery};
use crate::models::{
    ErrorReport, FinalError, FixAttempt, FixLoopRequest, FixLoopResult, FixLoopStats,
    FixLoopStatus, FixRecord, FixResult, FixSource, FixType, ProposedFix,
};

pub use command::CommandRemediator;
pub use remediation::{calculate_backoff, classify_error, default_fixes};

/// How long a cancelled remediation may take to stop before the loop rolls
/// back without it
pub const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// What applying one remediation achieved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemediationReport {
    pub result: FixResult,
    pub detail: Option<String>,
}

impl RemediationReport {
    pub fn new(result: FixResult, detail: Option<String>) -> Self {
        Self { result, detail }
    }
}

/// Applies remediations and reverts them.
///
/// `apply` re-checks the original error condition after acting. It must stop
/// its work and return once `cancel` fires; the loop waits up to
/// [`CANCEL_GRACE`] for that before rolling back. An `Err` from `apply`
/// counts as a failed attempt; an `Err` from `rollback` leaves the loop in
/// `failed`.
#[async_trait]
pub trait Remediator: Send + Sync {
    async fn apply(
        &self,
        fix: &ProposedFix,
        error: &ErrorReport,
        cancel: &CancellationToken,
    ) -> Result<RemediationReport>;

    async fn rollback(&self, error: &ErrorReport) -> Result<()>;
}

/// Read view of the loop for `fix_loop_status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixLoopSnapshot {
    pub status: FixLoopStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub current_attempts: Vec<FixAttempt>,
    pub stats: FixLoopStats,
}

#[derive(Debug, Default)]
struct LoopState {
    status: FixLoopStatus,
    current_attempts: Vec<FixAttempt>,
    stats: FixLoopStats,
    cancel: Option<CancellationToken>,
    task_id: Option<String>,
    last_result: Option<FixLoopResult>,
}

type Signature = (FixType, String, String);

fn owned_signature(fix: &ProposedFix) -> Signature {
    let (fix_type, target, description) = fix.signature();
    (fix_type, target.to_string(), description.to_string())
}

/// A claimed fix loop, see [`AutoFixLoop::claim`].
///
/// Dropping it before `run` completes cancels the work and returns the loop
/// to `idle`.
#[must_use = "a claimed fix loop does nothing until it is run"]
pub struct FixLoopRun {
    fix_loop: AutoFixLoop,
    request: FixLoopRequest,
    token: CancellationToken,
    finished: bool,
}

impl FixLoopRun {
    pub async fn run(mut self, remediator: &dyn Remediator) -> FixLoopResult {
        let result = self
            .fix_loop
            .drive(&self.request, &self.token, remediator)
            .await;
        self.finished = true;
        result
    }
}

impl Drop for FixLoopRun {
    fn drop(&mut self) {
        if !self.finished {
            self.fix_loop.abandon(&self.token);
        }
    }
}

impl std::fmt::Debug for FixLoopRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixLoopRun")
            .field("task_id", &self.request.error.task_id)
            .field("finished", &self.finished)
            .finish()
    }
}

/// Bounded-retry remediation driver.
///
/// Cheap to clone; clones share state, so a clone can cancel a loop that
/// another task is running.
#[derive(Clone)]
pub struct AutoFixLoop {
    state: Arc<Mutex<LoopState>>,
    memory: Arc<Mutex<FixMemory>>,
    bus: EventBus,
    config: FixLoopConfig,
}

impl std::fmt::Debug for AutoFixLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoFixLoop")
            .field("status", &self.status())
            .field("config", &self.config)
            .finish()
    }
}

impl AutoFixLoop {
    pub fn new(memory: Arc<Mutex<FixMemory>>, bus: EventBus, config: FixLoopConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(LoopState::default())),
            memory,
            bus,
            config,
        }
    }

    pub fn config(&self) -> &FixLoopConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<Mutex<FixMemory>> {
        &self.memory
    }

    pub fn status(&self) -> FixLoopStatus {
        self.state.lock().status
    }

    pub fn is_running(&self) -> bool {
        self.status() == FixLoopStatus::Running
    }

    pub fn current_attempts(&self) -> Vec<FixAttempt> {
        self.state.lock().current_attempts.clone()
    }

    pub fn stats(&self) -> FixLoopStats {
        self.state.lock().stats.clone()
    }

    pub fn last_result(&self) -> Option<FixLoopResult> {
        self.state.lock().last_result.clone()
    }

    pub fn snapshot(&self) -> FixLoopSnapshot {
        let state = self.state.lock();
        FixLoopSnapshot {
            status: state.status,
            task_id: state.task_id.clone(),
            current_attempts: state.current_attempts.clone(),
            stats: state.stats.clone(),
        }
    }

    /// Cancel the running loop. Returns false when nothing is running.
    pub fn cancel(&self) -> bool {
        let state = self.state.lock();
        match (&state.status, &state.cancel) {
            (FixLoopStatus::Running, Some(token)) => {
                info!(task_id = ?state.task_id, "cancelling fix loop");
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Return to `idle`, clearing the current attempts. Stats are kept.
    pub fn reset(&self) -> Result<(), FixLoopError> {
        let mut state = self.state.lock();
        if state.status == FixLoopStatus::Running {
            return Err(FixLoopError::Busy);
        }
        state.status = FixLoopStatus::Idle;
        state.current_attempts.clear();
        state.task_id = None;
        state.last_result = None;
        Ok(())
    }

    /// Run one fix loop to completion.
    ///
    /// Only `Busy` is returned as an error. Terminal outcomes, including
    /// exhaustion and rollback failure, come back as a `FixLoopResult`;
    /// `FixLoopResult::error` maps them onto the error taxonomy.
    pub async fn start_fix_loop(
        &self,
        request: FixLoopRequest,
        remediator: &dyn Remediator,
    ) -> Result<FixLoopResult, FixLoopError> {
        Ok(self.claim(request)?.run(remediator).await)
    }

    /// Mark the loop `running` for `request` without starting any work.
    ///
    /// A `cancel` issued after this returns always reaches the claimed loop,
    /// even if [`FixLoopRun::run`] has not been polled yet.
    pub fn claim(&self, request: FixLoopRequest) -> Result<FixLoopRun, FixLoopError> {
        let token = CancellationToken::new();
        {
            let mut state = self.state.lock();
            if state.status == FixLoopStatus::Running {
                return Err(FixLoopError::Busy);
            }
            state.status = FixLoopStatus::Running;
            state.current_attempts.clear();
            state.cancel = Some(token.clone());
            state.task_id = request.error.task_id.clone();
        }
        Ok(FixLoopRun {
            fix_loop: self.clone(),
            request,
            token,
            finished: false,
        })
    }

    /// Release a claim whose run was dropped before it finished
    fn abandon(&self, token: &CancellationToken) {
        token.cancel();
        let mut state = self.state.lock();
        if state.status == FixLoopStatus::Running {
            warn!(task_id = ?state.task_id, "fix loop abandoned before finishing");
            state.status = FixLoopStatus::Idle;
            state.cancel = None;
        }
    }

    async fn drive(
        &self,
        request: &FixLoopRequest,
        token: &CancellationToken,
        remediator: &dyn Remediator,
    ) -> FixLoopResult {
        let error = request.error.clone();
        let task_id = error.task_id.clone();
        let max_retries = request
            .max_retries
            .unwrap_or(self.config.max_retries)
            .max(1);
        info!(
            task_id = ?task_id,
            error_type = %error.error_type,
            max_retries,
            "fix loop started"
        );

        let mut failed: HashSet<Signature> = HashSet::new();
        let mut attempts: Vec<FixAttempt> = Vec::new();
        let mut succeeded = false;
        let mut cancelled = false;

        for attempt_number in 1..=max_retries {
            let delay = calculate_backoff(
                attempt_number - 1,
                self.config.retry_base(),
                self.config.retry_max(),
            );
            if !delay.is_zero() {
                debug!(attempt = attempt_number, delay_ms = delay.as_millis() as u64, "backing off");
                tokio::select! {
                    _ = token.cancelled() => {
                        cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if token.is_cancelled() {
                cancelled = true;
                break;
            }

            let fix = self.generate_fix(&error, &failed);
            debug!(
                attempt = attempt_number,
                fix_type = %fix.fix_type,
                target = %fix.fix_target,
                "applying remediation"
            );
            let started = Instant::now();
            let outcome = {
                let apply = remediator.apply(&fix, &error, token);
                tokio::pin!(apply);
                let finished = tokio::select! {
                    outcome = &mut apply => Some(outcome),
                    _ = token.cancelled() => None,
                };
                if finished.is_none() {
                    // Rolling back while the remediation still runs would race it
                    if tokio::time::timeout(CANCEL_GRACE, apply).await.is_err() {
                        warn!(
                            attempt = attempt_number,
                            "remediation did not stop within the cancel grace period"
                        );
                    }
                }
                finished
            };
            let Some(outcome) = outcome else {
                cancelled = true;
                break;
            };
            let report = outcome.unwrap_or_else(|e| {
                RemediationReport::new(FixResult::Failed, Some(format!("{e:#}")))
            });

            let attempt = FixAttempt {
                attempt_number,
                fix,
                result: report.result,
                duration_ms: started.elapsed().as_millis() as u64,
                detail: report.detail,
            };
            self.state.lock().current_attempts.push(attempt.clone());
            self.bus.publish(EventKind::FixLoopAttempt {
                task_id: task_id.clone(),
                attempt: attempt.clone(),
            });

            let result = attempt.result;
            if result != FixResult::Success {
                failed.insert(owned_signature(&attempt.fix));
            }
            attempts.push(attempt);
            if result == FixResult::Success {
                succeeded = true;
                break;
            }
        }

        let (status, rolled_back, rollback_error) = if succeeded {
            (FixLoopStatus::Succeeded, false, None)
        } else {
            match remediator.rollback(&error).await {
                Ok(()) => (FixLoopStatus::RolledBack, true, None),
                Err(e) => {
                    error!(task_id = ?task_id, error = %format!("{e:#}"), "rollback failed");
                    (FixLoopStatus::Failed, false, Some(format!("{e:#}")))
                }
            }
        };

        self.remember(&error, &attempts);

        let final_error = (!succeeded).then(|| FinalError {
            error_type: error.error_type.clone(),
            message: if error.error_message.trim().is_empty() {
                error.summary()
            } else {
                error.error_message.clone()
            },
        });
        let result = FixLoopResult {
            status,
            total_attempts: attempts.len() as u32,
            rolled_back,
            attempts,
            final_error,
            rollback_error,
            cancelled,
        };

        {
            let mut state = self.state.lock();
            state.stats.record(status, !succeeded);
            state.status = status;
            state.cancel = None;
            state.last_result = Some(result.clone());
        }

        match status {
            FixLoopStatus::Succeeded => {
                info!(task_id = ?task_id, attempts = result.total_attempts, "fix loop succeeded");
            }
            _ => {
                warn!(
                    task_id = ?task_id,
                    status = %status,
                    attempts = result.total_attempts,
                    cancelled,
                    "fix loop gave up"
                );
            }
        }
        self.publish_outcome(task_id, &result);
        result
    }

    /// Pick the next remediation: the best remembered fix not yet tried,
    /// else the first untried category default.
    fn generate_fix(&self, error: &ErrorReport, failed: &HashSet<Signature>) -> ProposedFix {
        let query = RecallQuery {
            min_similarity: Some(self.config.min_similarity),
            ..RecallQuery::new(error.error_type.clone(), error.error_message.clone())
        };
        let candidates = self.memory.lock().candidates(&query);

        let remembered = candidates.into_iter().map(|m| ProposedFix {
            fix_type: m.record.fix_type,
            fix_target: m.record.fix_target,
            fix_description: m.record.fix_description,
            source: FixSource::Memory {
                error_id: m.error_id,
                similarity: m.similarity,
            },
            confidence: m.score,
        });
        let defaults = default_fixes(error);
        let fallback = defaults.first().cloned();

        remembered
            .chain(defaults)
            .find(|fix| !failed.contains(&owned_signature(fix)))
            .or(fallback)
            .unwrap_or_else(|| ProposedFix {
                fix_type: FixType::Custom,
                fix_target: "workspace".to_string(),
                fix_description: "Re-run the failed step".to_string(),
                source: FixSource::Default,
                confidence: remediation::DEFAULT_FIX_CONFIDENCE,
            })
    }

    fn remember(&self, error: &ErrorReport, attempts: &[FixAttempt]) {
        let mut memory = self.memory.lock();
        for attempt in attempts {
            let record =
                FixRecord::from_attempt(error, &attempt.fix, attempt.result == FixResult::Success);
            if let Err(e) = memory.store(record) {
                warn!(error = %format!("{e:#}"), "failed to persist fix record");
            }
        }
    }

    fn publish_outcome(&self, task_id: Option<String>, result: &FixLoopResult) {
        let final_error = result.final_error.clone().unwrap_or(FinalError {
            error_type: String::new(),
            message: "fix loop did not succeed".to_string(),
        });
        let kind = match result.status {
            FixLoopStatus::Succeeded => EventKind::FixLoopSucceeded {
                task_id,
                total_attempts: result.total_attempts,
            },
            FixLoopStatus::RolledBack => EventKind::FixLoopRolledBack {
                task_id,
                final_error,
                total_attempts: result.total_attempts,
            },
            FixLoopStatus::Failed | FixLoopStatus::Idle | FixLoopStatus::Running => {
                EventKind::FixLoopFailed {
                    task_id,
                    final_error,
                    rollback_error: result
                        .rollback_error
                        .clone()
                        .unwrap_or_else(|| "rollback did not complete".to_string()),
                }
            }
        };
        self.bus.publish(kind);
    }
}
