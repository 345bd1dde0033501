//! JSON-lines storage for fix records

use anyhow::{Context, Result};
use std::path::Path;
use tracing::warn;

use super::StoredFix;
use crate::fs::{ensure_parent_dir, locked_append, locked_read};

/// Load every well-formed record. Malformed lines are skipped with a warning.
pub fn load_records(path: &Path) -> Result<Vec<StoredFix>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = locked_read(path)?;
    let mut records = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StoredFix>(line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(
                path = %path.display(),
                line = line_no + 1,
                error = %e,
                "skipping malformed fix record"
            ),
        }
    }
    Ok(records)
}

/// Append one record as a single line
pub fn append_record(path: &Path, record: &StoredFix) -> Result<()> {
    ensure_parent_dir(path)?;
    let line = serde_json::to_string(record).context("Failed to serialize fix record")?;
    locked_append(path, &line)
}
