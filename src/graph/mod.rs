//! Workflow graph loading and validation
//!
//! ## Module Organization
//!
//! - `cycle`: DFS cycle detection
//! - `scheduling`: adjacency index, topological order, readiness evaluation

mod cycle;
mod scheduling;

#[cfg(test)]
mod tests;

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::error::GraphError;
use crate::models::{NodeKind, WorkflowGraph};

pub use scheduling::{compute_levels, evaluate_readiness, topological_sort, GraphIndex, Readiness};

/// Parse a workflow graph from YAML or JSON text.
///
/// JSON is a subset of YAML, so one parser covers both.
pub fn parse_graph(content: &str) -> Result<WorkflowGraph, GraphError> {
    serde_yaml::from_str(content).map_err(|e| GraphError::Parse(e.to_string()))
}

/// Read, parse and validate a workflow graph file
pub fn load_graph(path: &Path) -> Result<WorkflowGraph> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read workflow graph: {}", path.display()))?;
    let graph = parse_graph(&content)
        .with_context(|| format!("Failed to load workflow graph: {}", path.display()))?;
    validate(&graph).with_context(|| format!("Invalid workflow graph: {}", path.display()))?;
    Ok(graph)
}

/// Validate the structural invariants of a graph.
///
/// Checks, in order: non-empty, unique ids, entry exists with in-degree 0,
/// edges reference known nodes, no self loops, task nodes have at most one
/// incoming edge, and the graph is acyclic.
pub fn validate(graph: &WorkflowGraph) -> Result<GraphIndex, GraphError> {
    if graph.nodes.is_empty() {
        return Err(GraphError::Empty);
    }

    let mut seen = HashSet::new();
    for node in &graph.nodes {
        if !seen.insert(node.id.as_str()) {
            return Err(GraphError::DuplicateNode(node.id.clone()));
        }
    }

    if !seen.contains(graph.entry.as_str()) {
        return Err(GraphError::MissingEntry(graph.entry.clone()));
    }

    for edge in &graph.edges {
        for endpoint in [&edge.from, &edge.to] {
            if !seen.contains(endpoint.as_str()) {
                return Err(GraphError::DanglingEdge {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    missing: endpoint.clone(),
                });
            }
        }
        if edge.from == edge.to {
            return Err(GraphError::SelfLoop(edge.from.clone()));
        }
    }

    let index = GraphIndex::build(graph);

    let entry_in = index.predecessors_of(&graph.entry).len();
    if entry_in > 0 {
        return Err(GraphError::EntryHasPredecessors {
            entry: graph.entry.clone(),
            count: entry_in,
        });
    }

    for node in &graph.nodes {
        let count = index.predecessors_of(&node.id).len();
        if node.kind == NodeKind::Task && count > 1 {
            return Err(GraphError::TaskFanIn {
                node: node.id.clone(),
                count,
            });
        }
    }

    cycle::detect_cycles(&index.order, &index.predecessors)?;

    Ok(index)
}
