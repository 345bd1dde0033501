//! Cycle detection for workflow graphs

use std::collections::{HashMap, HashSet};

use crate::error::GraphError;

/// Detect circular dependencies using DFS over predecessor lists.
///
/// Nodes are visited in declaration order so the reported path is stable.
pub fn detect_cycles(
    order: &[String],
    predecessors: &HashMap<String, Vec<String>>,
) -> Result<(), GraphError> {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    for node_id in order {
        if !visited.contains(node_id.as_str()) {
            if let Some(cycle) = dfs_detect_cycle(
                predecessors,
                node_id,
                &mut visited,
                &mut rec_stack,
                &mut path,
            ) {
                return Err(GraphError::Cycle { path: cycle });
            }
        }
    }

    Ok(())
}

fn dfs_detect_cycle(
    predecessors: &HashMap<String, Vec<String>>,
    node_id: &str,
    visited: &mut HashSet<String>,
    rec_stack: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> Option<Vec<String>> {
    visited.insert(node_id.to_string());
    rec_stack.insert(node_id.to_string());
    path.push(node_id.to_string());

    if let Some(preds) = predecessors.get(node_id) {
        for pred in preds {
            if !visited.contains(pred) {
                if let Some(cycle) = dfs_detect_cycle(predecessors, pred, visited, rec_stack, path)
                {
                    return Some(cycle);
                }
            } else if rec_stack.contains(pred) {
                // Unwinding the predecessor path back to `pred` lists the
                // loop in edge order
                let mut cycle = vec![pred.clone()];
                for p in path.iter().rev() {
                    cycle.push(p.clone());
                    if p == pred {
                        break;
                    }
                }
                return Some(cycle);
            }
        }
    }

    path.pop();
    rec_stack.remove(node_id);
    None
}
