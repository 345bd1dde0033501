//! Workflow graph definitions
//!
//! A `WorkflowGraph` is produced by an external decomposer and is immutable once
//! execution starts. The engine never interprets node payloads.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of node in the workflow graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Unit of work with at most one incoming edge
    #[default]
    Task,
    /// AND-synchronization point over all incoming edges
    Join,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Task => write!(f, "task"),
            NodeKind::Join => write!(f, "join"),
        }
    }
}

/// Work phase a node belongs to.
///
/// Phases drive the default gate policy: implementation, test and review
/// are gated unless the node says otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Analysis,
    Plan,
    Impl,
    Test,
    Review,
}

impl Phase {
    /// Whether nodes in this phase require a gate when they don't specify one
    pub fn gated_by_default(&self) -> bool {
        matches!(self, Phase::Impl | Phase::Test | Phase::Review)
    }

    pub fn all() -> &'static [Phase] {
        &[
            Phase::Analysis,
            Phase::Plan,
            Phase::Impl,
            Phase::Test,
            Phase::Review,
        ]
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Analysis => write!(f, "analysis"),
            Phase::Plan => write!(f, "plan"),
            Phase::Impl => write!(f, "impl"),
            Phase::Test => write!(f, "test"),
            Phase::Review => write!(f, "review"),
        }
    }
}

/// How a join treats failed predecessors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Any failed predecessor fails the join immediately
    #[default]
    All,
    /// Wait for every predecessor to settle; proceed as partial if at least one completed
    BestEffort,
}

/// Graph-wide gate policy used when a node leaves `gateRequired` unset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePolicy {
    /// impl/test/review are gated, analysis/plan are not
    #[default]
    ByPhase,
    Always,
    Never,
}

/// Fallback values applied to nodes that don't set their own
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub gate_policy: GatePolicy,
}

/// A node in the workflow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNode {
    pub id: String,
    #[serde(default)]
    pub kind: NodeKind,
    #[serde(default)]
    pub label: String,
    pub phase: Phase,
    /// Producer-owned data, passed through untouched
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Only meaningful on join nodes
    #[serde(default)]
    pub join: JoinPolicy,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, kind: NodeKind, phase: Phase) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            kind,
            phase,
            payload: serde_json::Value::Null,
            gate_required: None,
            timeout_ms: None,
            join: JoinPolicy::All,
        }
    }

    pub fn task(id: impl Into<String>, phase: Phase) -> Self {
        Self::new(id, NodeKind::Task, phase)
    }

    pub fn join(id: impl Into<String>, phase: Phase) -> Self {
        Self::new(id, NodeKind::Join, phase)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_gate(mut self, gate_required: bool) -> Self {
        self.gate_required = Some(gate_required);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_join_policy(mut self, join: JoinPolicy) -> Self {
        self.join = join;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Resolve whether this node must pass a gate before running
    pub fn requires_gate(&self, defaults: &GraphDefaults) -> bool {
        if let Some(explicit) = self.gate_required {
            return explicit;
        }
        match defaults.gate_policy {
            GatePolicy::ByPhase => self.phase.gated_by_default(),
            GatePolicy::Always => true,
            GatePolicy::Never => false,
        }
    }

    /// Resolve the timeout for this node, if any
    pub fn effective_timeout_ms(&self, defaults: &GraphDefaults) -> Option<u64> {
        self.timeout_ms.or(defaults.timeout_ms).filter(|ms| *ms > 0)
    }

    /// Display label, falling back to the id
    pub fn display_label(&self) -> &str {
        if self.label.trim().is_empty() {
            &self.id
        } else {
            &self.label
        }
    }
}

/// Directed edge between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub from: String,
    pub to: String,
}

impl WorkflowEdge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Immutable description of work handed to the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowGraph {
    /// Identifier used by `status(workflowId)` filtering
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub entry: String,
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
    #[serde(default)]
    pub defaults: GraphDefaults,
}

fn default_version() -> String {
    "1".to_string()
}

impl WorkflowGraph {
    pub fn new(id: impl Into<String>, entry: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: default_version(),
            entry: entry.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            defaults: GraphDefaults::default(),
        }
    }

    pub fn with_node(mut self, node: WorkflowNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(WorkflowEdge::new(from, to));
        self
    }

    pub fn with_defaults(mut self, defaults: GraphDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Position of a node in declaration order
    pub fn declaration_index(&self, id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }

    /// Source ids of all edges pointing at `id`, in edge declaration order
    pub fn predecessors(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.to == id)
            .map(|e| e.from.as_str())
            .collect()
    }

    /// Target ids of all edges leaving `id`, in edge declaration order
    pub fn successors(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.from == id)
            .map(|e| e.to.as_str())
            .collect()
    }

    pub fn in_degree(&self, id: &str) -> usize {
        self.edges.iter().filter(|e| e.to == id).count()
    }
}
