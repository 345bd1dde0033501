//! Error taxonomy for the engine.
//!
//! Only `GraphInvalid` and terminal fix loop outcomes propagate to callers;
//! transient remediation failures stay inside the loop.

use crate::models::NodeStatus;

/// Structural problems found while loading or validating a workflow graph
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("failed to parse workflow graph: {0}")]
    Parse(String),

    #[error("workflow graph has no nodes")]
    Empty,

    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),

    #[error("entry node '{0}' does not exist")]
    MissingEntry(String),

    #[error("entry node '{entry}' has {count} incoming edge(s); it must have none")]
    EntryHasPredecessors { entry: String, count: usize },

    #[error("edge {from} -> {to} references unknown node '{missing}'")]
    DanglingEdge {
        from: String,
        to: String,
        missing: String,
    },

    #[error("node '{0}' has an edge to itself")]
    SelfLoop(String),

    #[error("task node '{node}' has {count} incoming edges; only join nodes may synchronize")]
    TaskFanIn { node: String, count: usize },

    #[error("circular dependency detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
}

/// Fix loop failures surfaced to callers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FixLoopError {
    #[error("a fix loop is already running; wait for it or cancel it")]
    Busy,

    #[error("remediation failed after {attempts} attempt(s): {error_type}: {message}")]
    RemediationFailed {
        error_type: String,
        message: String,
        attempts: u32,
    },

    #[error("rollback failed after remediation of {error_type}: {message}; manual intervention required: {reason}")]
    RollbackFailed {
        error_type: String,
        message: String,
        reason: String,
    },
}

/// Engine-level errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid workflow graph: {0}")]
    GraphInvalid(#[from] GraphError),

    #[error("no active workflow")]
    NoActiveWorkflow,

    #[error("workflow '{requested}' is not active (active workflow: '{active}')")]
    WorkflowMismatch { requested: String, active: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("invalid transition for node '{node_id}': {from} -> {to}")]
    InvalidTransition {
        node_id: String,
        from: NodeStatus,
        to: NodeStatus,
    },

    #[error("gate for node '{node_id}' was rejected: {reason}")]
    GateRejected { node_id: String, reason: String },

    #[error("gate for node '{0}' timed out awaiting approval")]
    GateTimeout(String),

    #[error("workflow '{0}' was cancelled; no further transitions are accepted")]
    Halted(String),

    #[error("snapshot at seq {persisted} is older than the current projection (seq {current})")]
    StaleSnapshot { persisted: u64, current: u64 },

    #[error(transparent)]
    FixLoop(#[from] FixLoopError),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_joins_path() {
        let err = GraphError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "circular dependency detected: a -> b -> a");
    }

    #[test]
    fn test_graph_error_converts_into_engine_error() {
        let err: EngineError = GraphError::Empty.into();
        assert!(matches!(err, EngineError::GraphInvalid(GraphError::Empty)));
        assert!(err.to_string().starts_with("invalid workflow graph"));
    }

    #[test]
    fn test_workflow_mismatch_names_both_ids() {
        let err = EngineError::WorkflowMismatch {
            requested: "wf-2".into(),
            active: "wf-1".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("wf-2"));
        assert!(msg.contains("wf-1"));
    }
}
