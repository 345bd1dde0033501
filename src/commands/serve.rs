//! `warden serve <graph>`: line-delimited JSON tool protocol over stdio

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::info;

use crate::config::WardenConfig;
use crate::fixloop::CommandRemediator;
use crate::graph::load_graph;
use crate::session::Session;
use crate::tools::serve;

/// Serve tool requests until stdin closes.
///
/// Fix loops started over the protocol keep running while further requests
/// are answered; the command returns once they have finished.
///
/// With `resume`, a snapshot at the configured path replaces the fresh start
/// when one exists.
pub async fn execute(graph_path: &Path, config: WardenConfig, resume: bool) -> Result<()> {
    let graph = load_graph(graph_path)?;
    let remediator = Arc::new(CommandRemediator::new(config.remediation.clone()));
    let session = Session::new(config, remediator)?;

    let restored = resume && session.restore_from_disk().await?;
    if !restored {
        session.start_workflow(graph)?;
    }
    info!(restored, "serving tool requests on stdin");

    serve(&session, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await?;

    session.shutdown().await;
    Ok(())
}
