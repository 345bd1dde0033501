//! Blocker ranking

use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;

use super::BlockedEntry;
use crate::models::{BlockCause, NodeState, NodeStatus, WorkflowGraph};

/// A blocked node and what to do about it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blocker {
    pub node_id: String,
    pub label: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<BlockCause>,
    pub next_tool_calls: Vec<String>,
    /// 1 is the most recently blocked node
    pub priority: usize,
    pub blocked_at: DateTime<Utc>,
}

/// Result of the `blockers` query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockerReport {
    pub blockers: Vec<Blocker>,
    pub summary: String,
}

impl BlockerReport {
    pub fn new(blockers: Vec<Blocker>) -> Self {
        let summary = summarize(&blockers);
        Self { blockers, summary }
    }
}

/// Rank blocked nodes by recency of blocking, newest first.
///
/// Ties on `blocked_at` fall back to declaration order. Entries whose node is
/// no longer blocked are ignored.
pub(super) fn rank(
    graph: &WorkflowGraph,
    states: &IndexMap<String, NodeState>,
    blocked_order: &[BlockedEntry],
) -> Vec<Blocker> {
    let mut entries: Vec<(&BlockedEntry, usize, &NodeState)> = blocked_order
        .iter()
        .filter_map(|entry| {
            let (position, _, state) = states.get_full(&entry.node_id)?;
            (state.status == NodeStatus::Blocked).then_some((entry, position, state))
        })
        .collect();

    entries.sort_by_key(|(entry, position, _)| (Reverse(entry.blocked_at), *position));

    entries
        .into_iter()
        .enumerate()
        .map(|(rank, (entry, _, state))| Blocker {
            node_id: entry.node_id.clone(),
            label: graph
                .node(&entry.node_id)
                .map(|n| n.display_label().to_string())
                .unwrap_or_else(|| entry.node_id.clone()),
            reason: state
                .blocked_reason
                .clone()
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| "blocked".to_string()),
            cause: state.block_cause,
            next_tool_calls: state.next_tool_calls.clone(),
            priority: rank + 1,
            blocked_at: entry.blocked_at,
        })
        .collect()
}

/// Human-readable count plus every distinct suggested tool call, first-seen order
fn summarize(blockers: &[Blocker]) -> String {
    if blockers.is_empty() {
        return "No blocked nodes".to_string();
    }
    let calls: IndexSet<&str> = blockers
        .iter()
        .flat_map(|b| b.next_tool_calls.iter().map(String::as_str))
        .collect();
    let noun = if blockers.len() == 1 { "node" } else { "nodes" };
    if calls.is_empty() {
        format!("{} blocked {noun}", blockers.len())
    } else {
        format!(
            "{} blocked {noun}; suggested next tool calls: {}",
            blockers.len(),
            calls.into_iter().collect::<Vec<_>>().join(", ")
        )
    }
}
