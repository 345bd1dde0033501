//! File persistence helpers shared by fix memory and snapshots

pub mod locking;

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

pub use locking::{locked_append, locked_read, locked_write};

/// Create the parent directory of `path` if it does not exist yet
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}
