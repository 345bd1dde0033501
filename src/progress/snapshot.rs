//! Persisted projection for resuming after a restart

use anyhow::Context;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::{BlockedEntry, ProgressTracker, WorkflowPhase};
use crate::error::{EngineError, EngineResult};
use crate::fs::{ensure_parent_dir, locked_read, locked_write};
use crate::models::{NodeState, WorkflowGraph};

/// Self-describing snapshot of a workflow run.
///
/// `seq` is the sequence number of the last event folded in; a snapshot is
/// stale when the live projection has already moved past it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSnapshot {
    pub seq: u64,
    pub workflow_id: String,
    pub graph: WorkflowGraph,
    pub node_states: IndexMap<String, NodeState>,
    #[serde(default)]
    pub blocked_order: Vec<BlockedEntry>,
    #[serde(default)]
    pub phase: WorkflowPhase,
    pub saved_at: DateTime<Utc>,
}

impl PersistedSnapshot {
    /// Write as pretty JSON under an exclusive lock
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        ensure_parent_dir(path)?;
        let json = serde_json::to_string_pretty(self).context("Failed to serialize snapshot")?;
        locked_write(path, &json)?;
        info!(path = %path.display(), seq = self.seq, "snapshot saved");
        Ok(())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = locked_read(path)?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse snapshot: {}", path.display()))
    }

    /// Load if the file exists
    pub fn load_optional(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        Self::load(path).map(Some)
    }

    pub fn is_cancelled(&self) -> bool {
        self.phase == WorkflowPhase::Cancelled
    }
}

impl ProgressTracker {
    /// Capture the projection for persistence
    pub fn to_persisted(&self) -> EngineResult<PersistedSnapshot> {
        let graph = self.active_graph()?;
        Ok(PersistedSnapshot {
            seq: self.seq,
            workflow_id: graph.id.clone(),
            graph: graph.as_ref().clone(),
            node_states: self.node_states.clone(),
            blocked_order: self.blocked_order.clone(),
            phase: self.phase,
            saved_at: Utc::now(),
        })
    }

    /// Replace the projection with a persisted snapshot.
    ///
    /// Fails with `StaleSnapshot` when the projection has already applied
    /// events newer than the snapshot.
    pub fn restore(&mut self, snapshot: PersistedSnapshot) -> EngineResult<()> {
        if snapshot.seq < self.seq {
            return Err(EngineError::StaleSnapshot {
                persisted: snapshot.seq,
                current: self.seq,
            });
        }
        let graph = Arc::new(snapshot.graph);
        let mut node_states: IndexMap<String, NodeState> = graph
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeState::pending()))
            .collect();
        for (id, state) in snapshot.node_states {
            if let Some(slot) = node_states.get_mut(&id) {
                *slot = state;
            } else {
                return Err(EngineError::UnknownNode(id));
            }
        }

        self.graph = Some(graph);
        self.node_states = node_states;
        self.blocked_order = snapshot.blocked_order;
        self.phase = snapshot.phase;
        self.seq = snapshot.seq;
        info!(seq = self.seq, workflow_id = %snapshot.workflow_id, "projection restored");
        Ok(())
    }
}
