//! Types shared by the fix loop and fix memory.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::FixLoopError;

/// Category of remediation.
///
/// Categories select the default remediation when fix memory has nothing
/// similar enough to offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixType {
    /// Reset or correct configuration
    Config,
    /// Edit source code
    Patch,
    /// Install, pin or reinstall dependencies
    Dependency,
    /// Revert to a previous state
    Rollback,
    /// Anything else
    Custom,
}

impl FixType {
    pub fn all() -> &'static [FixType] {
        &[
            FixType::Config,
            FixType::Patch,
            FixType::Dependency,
            FixType::Rollback,
            FixType::Custom,
        ]
    }
}

impl fmt::Display for FixType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixType::Config => write!(f, "config"),
            FixType::Patch => write!(f, "patch"),
            FixType::Dependency => write!(f, "dependency"),
            FixType::Rollback => write!(f, "rollback"),
            FixType::Custom => write!(f, "custom"),
        }
    }
}

impl std::str::FromStr for FixType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "config" => Ok(FixType::Config),
            "patch" => Ok(FixType::Patch),
            "dependency" | "dependencies" => Ok(FixType::Dependency),
            "rollback" => Ok(FixType::Rollback),
            "custom" => Ok(FixType::Custom),
            _ => anyhow::bail!(
                "Invalid fix type: {s}. Use: config, patch, dependency, rollback, custom"
            ),
        }
    }
}

/// Structured error report handed to the fix loop
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub error_type: String,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Workflow node the error belongs to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl ErrorReport {
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            ..Default::default()
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// One-line summary, `type: message`
    pub fn summary(&self) -> String {
        match (self.error_type.trim(), self.error_message.trim()) {
            ("", "") => "unspecified error".to_string(),
            ("", message) => message.to_string(),
            (error_type, "") => error_type.to_string(),
            (error_type, message) => format!("{error_type}: {message}"),
        }
    }
}

/// Parameters for `start_fix_loop`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixLoopRequest {
    #[serde(flatten)]
    pub error: ErrorReport,
    /// Falls back to the configured default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl FixLoopRequest {
    pub fn new(error: ErrorReport) -> Self {
        Self {
            error,
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Where a proposed remediation came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FixSource {
    /// Recalled from fix memory
    Memory {
        #[serde(rename = "errorId")]
        error_id: String,
        similarity: f64,
    },
    /// Category default, used when memory had no match above threshold
    Default,
}

/// A remediation chosen by the fix loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedFix {
    pub fix_type: FixType,
    pub fix_target: String,
    pub fix_description: String,
    pub source: FixSource,
    pub confidence: f64,
}

impl ProposedFix {
    /// Key used to avoid proposing the same remediation twice in one loop
    pub fn signature(&self) -> (FixType, &str, &str) {
        (self.fix_type, &self.fix_target, &self.fix_description)
    }
}

/// Outcome of applying one remediation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixResult {
    /// The original error condition is gone
    Success,
    /// The condition improved but is not resolved
    Partial,
    Failed,
}

impl fmt::Display for FixResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixResult::Success => write!(f, "success"),
            FixResult::Partial => write!(f, "partial"),
            FixResult::Failed => write!(f, "failed"),
        }
    }
}

/// One recorded remediation attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixAttempt {
    /// 1-based
    pub attempt_number: u32,
    pub fix: ProposedFix,
    pub result: FixResult,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Lifecycle of a fix loop run.
///
/// - `Idle` → `Running` (loop started)
/// - `Running` → `Succeeded` | `RolledBack` | `Failed`
/// - `Failed` is only reached when rollback itself could not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixLoopStatus {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed,
    RolledBack,
}

impl fmt::Display for FixLoopStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixLoopStatus::Idle => write!(f, "idle"),
            FixLoopStatus::Running => write!(f, "running"),
            FixLoopStatus::Succeeded => write!(f, "succeeded"),
            FixLoopStatus::Failed => write!(f, "failed"),
            FixLoopStatus::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// Error left unresolved after a loop gives up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

/// Result of one fix loop run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixLoopResult {
    pub status: FixLoopStatus,
    pub total_attempts: u32,
    pub rolled_back: bool,
    pub attempts: Vec<FixAttempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_error: Option<FinalError>,
    /// Set when rollback itself failed; the workspace may be inconsistent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_error: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

impl FixLoopResult {
    pub fn is_success(&self) -> bool {
        self.status == FixLoopStatus::Succeeded
    }

    /// Terminal error to surface to the caller, if the loop did not succeed
    pub fn error(&self) -> Option<FixLoopError> {
        let (error_type, message) = self
            .final_error
            .as_ref()
            .map(|e| (e.error_type.clone(), e.message.clone()))
            .unwrap_or_default();
        match self.status {
            FixLoopStatus::RolledBack => Some(FixLoopError::RemediationFailed {
                error_type,
                message,
                attempts: self.total_attempts,
            }),
            FixLoopStatus::Failed => Some(FixLoopError::RollbackFailed {
                error_type,
                message,
                reason: self
                    .rollback_error
                    .clone()
                    .unwrap_or_else(|| "rollback did not complete".to_string()),
            }),
            FixLoopStatus::Idle | FixLoopStatus::Running | FixLoopStatus::Succeeded => None,
        }
    }
}

/// Cumulative fix loop statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixLoopStats {
    pub total_loops: u64,
    pub successful_fixes: u64,
    pub failed_fixes: u64,
    pub rollbacks: u64,
    pub success_rate: f64,
}

impl FixLoopStats {
    /// Fold a finished loop into the counters
    pub fn record(&mut self, status: FixLoopStatus, rollback_invoked: bool) {
        self.total_loops += 1;
        match status {
            FixLoopStatus::Succeeded => self.successful_fixes += 1,
            FixLoopStatus::Failed | FixLoopStatus::RolledBack => self.failed_fixes += 1,
            FixLoopStatus::Idle | FixLoopStatus::Running => {}
        }
        if rollback_invoked {
            self.rollbacks += 1;
        }
        self.success_rate = if self.total_loops == 0 {
            0.0
        } else {
            self.successful_fixes as f64 / self.total_loops as f64
        };
    }
}

/// Fix memory entry; immutable once stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixRecord {
    pub error_type: String,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub fix_type: FixType,
    pub fix_target: String,
    pub fix_description: String,
    pub success: bool,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl FixRecord {
    /// Build a record from a loop attempt against an error
    pub fn from_attempt(error: &ErrorReport, fix: &ProposedFix, success: bool) -> Self {
        let mut tags = BTreeSet::new();
        tags.insert(fix.fix_type.to_string());
        if let Some(task_id) = &error.task_id {
            tags.insert(format!("task:{task_id}"));
        }
        Self {
            error_type: error.error_type.clone(),
            error_message: error.error_message.clone(),
            file: error.file.clone(),
            fix_type: fix.fix_type,
            fix_target: fix.fix_target.clone(),
            fix_description: fix.fix_description.clone(),
            success,
            tags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate_zero_without_loops() {
        let stats = FixLoopStats::default();
        assert_eq!(stats.success_rate, 0.0);
    }

    #[test]
    fn test_success_rate_half_after_one_success_one_failure() {
        let mut stats = FixLoopStats::default();
        stats.record(FixLoopStatus::Succeeded, false);
        stats.record(FixLoopStatus::RolledBack, true);

        assert_eq!(stats.total_loops, 2);
        assert_eq!(stats.successful_fixes, 1);
        assert_eq!(stats.failed_fixes, 1);
        assert_eq!(stats.rollbacks, 1);
        assert_eq!(stats.success_rate, 0.5);
    }

    #[test]
    fn test_fix_type_from_str() {
        assert_eq!("Dependency".parse::<FixType>().unwrap(), FixType::Dependency);
        assert_eq!("dependencies".parse::<FixType>().unwrap(), FixType::Dependency);
        assert!("magic".parse::<FixType>().is_err());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&FixLoopStatus::RolledBack).unwrap();
        assert_eq!(json, "\"rolled_back\"");
    }

    #[test]
    fn test_request_flattens_error_fields() {
        let request: FixLoopRequest = serde_json::from_str(
            r#"{"errorType":"ModuleNotFound","errorMessage":"cannot find serde","maxRetries":2}"#,
        )
        .unwrap();
        assert_eq!(request.error.error_type, "ModuleNotFound");
        assert_eq!(request.max_retries, Some(2));
    }

    #[test]
    fn test_rollback_failure_surfaces_distinctly() {
        let result = FixLoopResult {
            status: FixLoopStatus::Failed,
            total_attempts: 3,
            rolled_back: false,
            attempts: Vec::new(),
            final_error: Some(FinalError {
                error_type: "E".into(),
                message: "boom".into(),
            }),
            rollback_error: Some("git checkout failed".into()),
            cancelled: false,
        };
        assert!(matches!(
            result.error(),
            Some(FixLoopError::RollbackFailed { reason, .. }) if reason == "git checkout failed"
        ));

        let rolled_back = FixLoopResult {
            status: FixLoopStatus::RolledBack,
            rolled_back: true,
            rollback_error: None,
            ..result
        };
        assert!(matches!(
            rolled_back.error(),
            Some(FixLoopError::RemediationFailed { attempts: 3, .. })
        ));
    }

    #[test]
    fn test_error_summary() {
        assert_eq!(ErrorReport::new("E", "boom").summary(), "E: boom");
        assert_eq!(ErrorReport::new("", "").summary(), "unspecified error");
    }
}
