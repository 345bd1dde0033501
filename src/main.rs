use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use warden::commands::{diagram, serve, validate};
use warden::config::WardenConfig;
use warden::logging;
use warden::progress::Direction;

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Gated task-graph execution with self-healing fix loops", long_about = None)]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (default: .warden/config.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a workflow graph, then print its execution order
    Validate {
        /// Path to the graph (YAML or JSON)
        graph: PathBuf,
    },

    /// Render a workflow graph in its initial state
    Diagram {
        /// Path to the graph (YAML or JSON)
        graph: PathBuf,

        /// Flowchart direction: TD, LR, BT, RL
        #[arg(short, long, default_value = "TD")]
        direction: Direction,

        /// Mark nodes that require gate approval
        #[arg(long)]
        gates: bool,

        /// Print topological levels instead of Mermaid
        #[arg(long)]
        text: bool,
    },

    /// Run a workflow and answer tool requests, one JSON object per line on stdin
    Serve {
        /// Path to the graph (YAML or JSON)
        graph: PathBuf,

        /// Resume from the configured snapshot if one exists
        #[arg(long)]
        resume: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command {
        Commands::Validate { graph } => validate::execute(&graph),
        Commands::Diagram {
            graph,
            direction,
            gates,
            text,
        } => diagram::execute(&graph, direction, gates, text),
        Commands::Serve { graph, resume } => {
            let config = WardenConfig::discover(cli.config.as_deref())?;
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(serve::execute(&graph, config, resume))
        }
    }
}
