//! `warden validate <graph>`

use anyhow::Result;
use colored::Colorize;
use std::path::Path;

use crate::graph::{compute_levels, load_graph, topological_sort, validate};

/// Load and validate a graph, then print its execution order
pub fn execute(path: &Path) -> Result<()> {
    let graph = load_graph(path)?;
    let index = validate(&graph)?;
    let order = topological_sort(&index)?;
    let levels = compute_levels(&index)?;
    let depth = levels.values().max().map(|l| l + 1).unwrap_or(0);

    println!(
        "{} {} ({} nodes, {} edges, {} levels)",
        "✓".green().bold(),
        graph.id.bold(),
        graph.nodes.len(),
        graph.edges.len(),
        depth
    );
    println!();
    println!("Execution order:");
    for (i, id) in order.iter().enumerate() {
        let gate = graph
            .node(id)
            .map(|n| n.requires_gate(&graph.defaults))
            .unwrap_or(false);
        let badge = if gate { " 🔒" } else { "" };
        println!("  {:>2}. {id}{badge}", i + 1);
    }
    Ok(())
}
