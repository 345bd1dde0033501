//! `warden diagram <graph>`: render a graph in its initial state

use anyhow::Result;
use std::path::Path;

use crate::events::EventBus;
use crate::executor::Executor;
use crate::graph::load_graph;
use crate::progress::{render_levels, render_mermaid, Direction};

/// Print the graph as a Mermaid flowchart, or as topological levels with `text`
pub fn execute(path: &Path, direction: Direction, show_gate_badges: bool, text: bool) -> Result<()> {
    let graph = load_graph(path)?;
    // Start against a throwaway bus so roots show as ready and gates as awaiting
    let executor = Executor::start(graph, EventBus::default())?;

    let output = if text {
        render_levels(executor.graph(), executor.states())
    } else {
        render_mermaid(executor.graph(), executor.states(), direction, show_gate_badges)
    };
    println!("{output}");
    Ok(())
}
