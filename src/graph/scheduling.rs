//! Scheduling: adjacency index, topological order, readiness evaluation

use std::collections::{BTreeSet, HashMap};

use crate::error::GraphError;
use crate::models::{JoinPolicy, NodeKind, NodeStatus, WorkflowGraph, WorkflowNode};

/// Adjacency lists keyed by node id, with declaration order preserved
#[derive(Debug, Clone, Default)]
pub struct GraphIndex {
    /// Node ids in declaration order
    pub order: Vec<String>,
    position: HashMap<String, usize>,
    /// node -> sources of its incoming edges
    pub predecessors: HashMap<String, Vec<String>>,
    /// node -> targets of its outgoing edges
    pub successors: HashMap<String, Vec<String>>,
}

impl GraphIndex {
    /// Build the index. Edges that reference unknown nodes are kept as-is;
    /// validation reports them before the index is relied on.
    pub fn build(graph: &WorkflowGraph) -> Self {
        let order: Vec<String> = graph.nodes.iter().map(|n| n.id.clone()).collect();
        let position = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        let mut predecessors: HashMap<String, Vec<String>> = HashMap::new();
        let mut successors: HashMap<String, Vec<String>> = HashMap::new();
        for id in &order {
            predecessors.entry(id.clone()).or_default();
            successors.entry(id.clone()).or_default();
        }
        for edge in &graph.edges {
            predecessors
                .entry(edge.to.clone())
                .or_default()
                .push(edge.from.clone());
            successors
                .entry(edge.from.clone())
                .or_default()
                .push(edge.to.clone());
        }

        Self {
            order,
            position,
            predecessors,
            successors,
        }
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.position.get(id).copied()
    }

    pub fn predecessors_of(&self, id: &str) -> &[String] {
        self.predecessors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn successors_of(&self, id: &str) -> &[String] {
        self.successors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Sort ids into declaration order, dropping duplicates
    pub fn in_declaration_order<I>(&self, ids: I) -> Vec<String>
    where
        I: IntoIterator<Item = String>,
    {
        let positions: BTreeSet<usize> = ids
            .into_iter()
            .filter_map(|id| self.position(&id))
            .collect();
        positions
            .into_iter()
            .map(|i| self.order[i].clone())
            .collect()
    }
}

/// Topologically sorted node ids.
///
/// Kahn's algorithm with the ready set ordered by declaration position, so
/// independent nodes keep the producer's order.
pub fn topological_sort(index: &GraphIndex) -> Result<Vec<String>, GraphError> {
    let mut in_degree: HashMap<&str, usize> = index
        .order
        .iter()
        .map(|id| (id.as_str(), index.predecessors_of(id).len()))
        .collect();

    let mut queue: BTreeSet<usize> = index
        .order
        .iter()
        .enumerate()
        .filter(|(_, id)| in_degree.get(id.as_str()) == Some(&0))
        .map(|(i, _)| i)
        .collect();

    let mut result = Vec::with_capacity(index.order.len());

    while let Some(pos) = queue.pop_first() {
        let node_id = &index.order[pos];
        result.push(node_id.clone());

        for dependent in index.successors_of(node_id) {
            if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                *degree -= 1;
                if *degree == 0 {
                    if let Some(p) = index.position(dependent) {
                        queue.insert(p);
                    }
                }
            }
        }
    }

    if result.len() != index.order.len() {
        let stuck: Vec<String> = index
            .order
            .iter()
            .filter(|id| !result.contains(id))
            .cloned()
            .collect();
        return Err(GraphError::Cycle { path: stuck });
    }

    Ok(result)
}

/// Topological level of every node: roots are 0, others are one past their deepest predecessor
pub fn compute_levels(index: &GraphIndex) -> Result<HashMap<String, usize>, GraphError> {
    let mut levels = HashMap::new();
    for id in topological_sort(index)? {
        let level = index
            .predecessors_of(&id)
            .iter()
            .filter_map(|p| levels.get(p))
            .map(|l: &usize| l + 1)
            .max()
            .unwrap_or(0);
        levels.insert(id, level);
    }
    Ok(levels)
}

/// What the predecessors of a pending node allow it to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// At least one predecessor has not settled
    Waiting,
    /// All required predecessors completed
    Ready { partial: bool },
    /// The node can never run
    Fail { reason: String },
}

/// Evaluate a pending node against the statuses of its predecessors.
///
/// Task nodes and `all` joins need every predecessor completed and fail fast
/// when a join source fails. Best-effort joins wait for every predecessor to
/// settle and proceed if at least one completed.
pub fn evaluate_readiness(
    node: &WorkflowNode,
    predecessors: &[(String, NodeStatus)],
) -> Readiness {
    if predecessors.is_empty() {
        return Readiness::Ready { partial: false };
    }

    let failed: Vec<&str> = predecessors
        .iter()
        .filter(|(_, s)| *s == NodeStatus::Failed)
        .map(|(id, _)| id.as_str())
        .collect();
    let completed = predecessors
        .iter()
        .filter(|(_, s)| *s == NodeStatus::Completed)
        .count();

    let best_effort = node.kind == NodeKind::Join && node.join == JoinPolicy::BestEffort;

    if !best_effort {
        if node.kind == NodeKind::Join && !failed.is_empty() {
            return Readiness::Fail {
                reason: format!("predecessor failed: {}", failed.join(", ")),
            };
        }
        if completed == predecessors.len() {
            return Readiness::Ready { partial: false };
        }
        return Readiness::Waiting;
    }

    if completed + failed.len() < predecessors.len() {
        return Readiness::Waiting;
    }
    if completed == 0 {
        return Readiness::Fail {
            reason: format!("all predecessors failed: {}", failed.join(", ")),
        };
    }
    Readiness::Ready {
        partial: !failed.is_empty(),
    }
}
