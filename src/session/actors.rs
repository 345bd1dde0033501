//! Background actors wired over the event bus.
//!
//! Each actor owns one subscription and touches shared state only through
//! short lock scopes; nothing is held across an await.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::FixLoopError;
use crate::events::{Event, EventKind, Subscription};
use crate::executor::{Executor, RemediationOutcome};
use crate::fixloop::{AutoFixLoop, FixLoopRun, Remediator};
use crate::models::{BlockCause, ErrorReport, FixLoopRequest, FixLoopResult};
use crate::progress::ProgressTracker;

/// Delay between attempts to start a fix loop while another one runs
const BUSY_RETRY: Duration = Duration::from_millis(100);

pub(crate) type SharedExecutor = Arc<Mutex<Option<Executor>>>;

/// Fold every event into the projection and publish how far it got
pub(crate) async fn run_projection(
    mut events: Subscription,
    tracker: Arc<RwLock<ProgressTracker>>,
    applied: watch::Sender<u64>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };
        let seq = {
            let mut tracker = tracker.write();
            tracker.on_event(&event);
            tracker.seq()
        };
        applied.send_replace(seq);
    }
    debug!("projection actor stopped");
}

/// Events the remediation actor reacts to
pub(crate) fn is_remediation_hold(event: &Event) -> bool {
    matches!(
        &event.kind,
        EventKind::NodeBlocked {
            cause: BlockCause::Remediation,
            error: Some(_),
            ..
        }
    )
}

/// The hold the remediation actor is currently working on, as node id and
/// the seq of its `node:blocked` event
pub(crate) type ActiveHold = Arc<Mutex<Option<(String, u64)>>>;

/// Start a fix loop for every node held for remediation and resolve that
/// hold with the loop's result.
///
/// Gate blocks never reach this actor; only `BlockCause::Remediation` holds
/// carry an error report.
pub(crate) async fn run_remediation(
    mut events: Subscription,
    executor: SharedExecutor,
    fix_loop: AutoFixLoop,
    remediator: Arc<dyn Remediator>,
    active: ActiveHold,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };
        let hold_seq = event.seq;
        let EventKind::NodeBlocked {
            node_id,
            error: Some(error),
            ..
        } = event.kind
        else {
            continue;
        };
        let hold = Hold {
            node_id: &node_id,
            seq: hold_seq,
            executor: &executor,
            active: &active,
        };
        hold.remediate(error, &fix_loop, remediator.as_ref(), &shutdown)
            .await;
    }
    debug!("remediation actor stopped");
}

struct Hold<'a> {
    node_id: &'a str,
    seq: u64,
    executor: &'a SharedExecutor,
    active: &'a ActiveHold,
}

enum Claim {
    Claimed(FixLoopRun),
    Released,
    Busy,
}

impl Hold<'_> {
    /// Claim the fix loop while the node is still held by this hold.
    ///
    /// Runs under the executor lock so `unblock_node` either sees the claim
    /// and cancels it, or releases the hold before the claim is attempted.
    fn claim(&self, fix_loop: &AutoFixLoop, request: &FixLoopRequest) -> Claim {
        let guard = self.executor.lock();
        let held = guard
            .as_ref()
            .is_some_and(|e| e.is_held(self.node_id, self.seq));
        if !held {
            return Claim::Released;
        }
        match fix_loop.claim(request.clone()) {
            Ok(run) => {
                *self.active.lock() = Some((self.node_id.to_string(), self.seq));
                Claim::Claimed(run)
            }
            Err(FixLoopError::Busy) => Claim::Busy,
            Err(e) => {
                warn!(node_id = self.node_id, error = %e, "could not start remediation");
                Claim::Released
            }
        }
    }

    async fn remediate(
        &self,
        error: ErrorReport,
        fix_loop: &AutoFixLoop,
        remediator: &dyn Remediator,
        shutdown: &CancellationToken,
    ) {
        let node_id = self.node_id;
        let request = FixLoopRequest::new(error);
        let run = loop {
            match self.claim(fix_loop, &request) {
                Claim::Claimed(run) => break run,
                Claim::Released => {
                    debug!(node_id, hold = self.seq, "node no longer held; skipping remediation");
                    return;
                }
                Claim::Busy => {
                    debug!(node_id, "fix loop busy; waiting");
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(BUSY_RETRY) => {}
                    }
                }
            }
        };

        let result = {
            let running = run.run(remediator);
            tokio::pin!(running);
            tokio::select! {
                result = &mut running => result,
                _ = shutdown.cancelled() => {
                    fix_loop.cancel();
                    running.await
                }
            }
        };
        *self.active.lock() = None;
        debug!(node_id, status = %result.status, "remediation loop finished");

        let outcome = outcome_of(&result);
        let mut guard = self.executor.lock();
        let Some(active) = guard.as_mut() else {
            return;
        };
        match active.resolve_remediation(node_id, self.seq, outcome) {
            Ok(true) => info!(node_id, hold = self.seq, "remediation outcome applied"),
            Ok(false) => {}
            Err(e) => warn!(node_id, error = %e, "failed to apply remediation outcome"),
        }
    }
}

fn outcome_of(result: &FixLoopResult) -> RemediationOutcome {
    if result.is_success() {
        return RemediationOutcome::Resolved;
    }
    let message = match &result.final_error {
        Some(error) => exhausted_message(&error.error_type, &error.message),
        None => "fix loop did not succeed".to_string(),
    };
    let message = match &result.rollback_error {
        Some(rollback_error) => format!("{message}; rollback failed: {rollback_error}"),
        None => message,
    };
    RemediationOutcome::Exhausted { message }
}

fn exhausted_message(error_type: &str, message: &str) -> String {
    match (error_type.trim(), message.trim()) {
        ("", message) => message.to_string(),
        (error_type, "") => error_type.to_string(),
        (error_type, message) => format!("{error_type}: {message}"),
    }
}

/// Periodically block nodes whose timeout elapsed
pub(crate) async fn run_timeout_sweeper(
    executor: SharedExecutor,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let mut guard = executor.lock();
        let Some(active) = guard.as_mut() else {
            continue;
        };
        match active.timeout_sweep(Utc::now()) {
            Ok(expired) if !expired.is_empty() => {
                info!(nodes = ?expired, "timeout sweep blocked nodes");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "timeout sweep failed"),
        }
    }
    debug!("timeout sweeper stopped");
}
