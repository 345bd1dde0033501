//! Diagram rendering.
//!
//! Both renderers are pure functions of graph + node states: identical
//! inputs produce byte-identical output.

use colored::{ColoredString, Colorize};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::graph::{compute_levels, GraphIndex};
use crate::models::{NodeKind, NodeState, NodeStatus, WorkflowGraph};

/// Flowchart direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    #[default]
    #[serde(alias = "TB")]
    TD,
    LR,
    BT,
    RL,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::TD => write!(f, "TD"),
            Direction::LR => write!(f, "LR"),
            Direction::BT => write!(f, "BT"),
            Direction::RL => write!(f, "RL"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "TD" | "TB" => Ok(Direction::TD),
            "LR" => Ok(Direction::LR),
            "BT" => Ok(Direction::BT),
            "RL" => Ok(Direction::RL),
            _ => anyhow::bail!("Invalid direction: {s}. Use: TD, LR, BT, RL"),
        }
    }
}

const GATE_BADGE: &str = "🔒";

/// Mermaid class per status
fn status_class(status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Pending => "pending",
        NodeStatus::Ready => "ready",
        NodeStatus::AwaitingGate => "gate",
        NodeStatus::Running => "active",
        NodeStatus::Blocked => "blocked",
        NodeStatus::Completed => "done",
        NodeStatus::Failed => "failed",
    }
}

const CLASS_DEFS: &[(&str, &str)] = &[
    ("pending", "fill:#f5f5f5,stroke:#9e9e9e,color:#616161"),
    ("ready", "fill:#e0f7fa,stroke:#00838f"),
    ("gate", "fill:#f3e5f5,stroke:#8e24aa,stroke-dasharray:4 2"),
    ("active", "fill:#e3f2fd,stroke:#1565c0,stroke-width:2px"),
    ("blocked", "fill:#fff3e0,stroke:#ef6c00,stroke-width:2px"),
    ("done", "fill:#e8f5e9,stroke:#2e7d32"),
    ("failed", "fill:#ffebee,stroke:#c62828,stroke-width:2px"),
];

/// Mermaid-safe identifiers, unique per node
fn mermaid_ids(graph: &WorkflowGraph) -> IndexMap<&str, String> {
    let mut used = HashSet::new();
    let mut ids = IndexMap::with_capacity(graph.nodes.len());
    for (position, node) in graph.nodes.iter().enumerate() {
        let mut id: String = node
            .id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        if id.is_empty() || id.starts_with(|c: char| c.is_ascii_digit()) {
            id.insert(0, 'n');
        }
        // Reserved by Mermaid's parser
        if id == "end" || id == "graph" || id == "subgraph" {
            id.push('_');
        }
        if !used.insert(id.clone()) {
            id = format!("{id}_{position}");
            used.insert(id.clone());
        }
        ids.insert(node.id.as_str(), id);
    }
    ids
}

fn escape_label(label: &str) -> String {
    label
        .replace('"', "#quot;")
        .replace('<', "#lt;")
        .replace('>', "#gt;")
        .replace('\n', " ")
}

/// Render a Mermaid `flowchart` with one class marker per node status
pub fn render_mermaid(
    graph: &WorkflowGraph,
    states: &IndexMap<String, NodeState>,
    direction: Direction,
    show_gate_badges: bool,
) -> String {
    let ids = mermaid_ids(graph);
    let mut out = format!("flowchart {direction}\n");

    for node in &graph.nodes {
        let id = &ids[node.id.as_str()];
        let mut label = escape_label(node.display_label());
        if show_gate_badges && node.requires_gate(&graph.defaults) {
            label = format!("{GATE_BADGE} {label}");
        }
        let status = states
            .get(&node.id)
            .map(|s| s.status)
            .unwrap_or(NodeStatus::Pending);
        let shape = match node.kind {
            NodeKind::Task => format!("[\"{label}\"]"),
            NodeKind::Join => format!("{{{{\"{label}\"}}}}"),
        };
        out.push_str(&format!("    {id}{shape}:::{}\n", status_class(status)));
    }

    for edge in &graph.edges {
        let (Some(from), Some(to)) = (ids.get(edge.from.as_str()), ids.get(edge.to.as_str()))
        else {
            continue;
        };
        out.push_str(&format!("    {from} --> {to}\n"));
    }

    for (class, style) in CLASS_DEFS {
        out.push_str(&format!("    classDef {class} {style}\n"));
    }
    out
}

/// Status indicator with color for terminal display
pub fn status_indicator(status: NodeStatus) -> ColoredString {
    match status {
        NodeStatus::Completed => "✓".green().bold(),
        NodeStatus::Running => "●".blue().bold(),
        NodeStatus::Ready => "▶".cyan().bold(),
        NodeStatus::AwaitingGate => "?".magenta().bold(),
        NodeStatus::Pending => "○".white().dimmed(),
        NodeStatus::Blocked => "⚠".yellow().bold(),
        NodeStatus::Failed => "✗".red().bold(),
    }
}

/// Order within a level: active work first, settled last
fn status_priority(status: NodeStatus) -> u8 {
    match status {
        NodeStatus::Running => 0,
        NodeStatus::Blocked => 1,
        NodeStatus::AwaitingGate => 2,
        NodeStatus::Ready => 3,
        NodeStatus::Pending => 4,
        NodeStatus::Failed => 5,
        NodeStatus::Completed => 6,
    }
}

/// Layered text view: one block per topological level
pub fn render_levels(graph: &WorkflowGraph, states: &IndexMap<String, NodeState>) -> String {
    if graph.nodes.is_empty() {
        return "(empty workflow graph)".to_string();
    }
    let index = GraphIndex::build(graph);
    let levels = match compute_levels(&index) {
        Ok(levels) => levels,
        Err(e) => return format!("(cannot lay out graph: {e})"),
    };

    let status_of = |id: &str| {
        states
            .get(id)
            .map(|s| s.status)
            .unwrap_or(NodeStatus::Pending)
    };

    let mut by_level: BTreeMap<usize, Vec<(usize, &str)>> = BTreeMap::new();
    for (position, node) in graph.nodes.iter().enumerate() {
        let level = levels.get(&node.id).copied().unwrap_or(0);
        by_level
            .entry(level)
            .or_default()
            .push((position, node.id.as_str()));
    }
    for nodes in by_level.values_mut() {
        nodes.sort_by_key(|(position, id)| (status_priority(status_of(*id)), *position));
    }

    let mut out = String::new();
    for (level, nodes) in &by_level {
        if *level == 0 {
            out.push_str("Level 0 (entry):\n");
        } else {
            out.push_str(&format!("Level {level}:\n"));
        }
        for (_, id) in nodes {
            let Some(node) = graph.node(id) else {
                continue;
            };
            let status = status_of(*id);
            let gate = if node.requires_gate(&graph.defaults) {
                format!(" {GATE_BADGE}")
            } else {
                String::new()
            };
            let deps = index.predecessors_of(id);
            let deps = if deps.is_empty() {
                String::new()
            } else {
                let rendered: Vec<String> = deps
                    .iter()
                    .map(|d| format!("{}{d}", status_indicator(status_of(d.as_str()))))
                    .collect();
                format!(" ← {}", rendered.join(", "))
            };
            out.push_str(&format!(
                "  {} {} ({id}, {}){gate}{deps}\n",
                status_indicator(status),
                node.display_label().bold(),
                node.phase,
            ));
            if let Some(reason) = states
                .get(*id)
                .and_then(|s| s.blocked_reason.as_deref().or(s.failure_reason.as_deref()))
            {
                out.push_str(&format!("      {}\n", reason.dimmed()));
            }
        }
        out.push('\n');
    }
    out
}
