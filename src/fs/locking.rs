//! Advisory-locked file access.
//!
//! Fix memory and snapshots may be touched by more than one `warden`
//! process sharing a workspace. Locks are cooperative: every writer must go
//! through these functions.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// How a locked file is opened. Reads share the lock; everything else holds
/// it exclusively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Replace,
    Append,
}

impl Access {
    // Replace truncates with set_len once the lock is held
    #[allow(clippy::suspicious_open_options)]
    fn options(self) -> OpenOptions {
        let mut options = OpenOptions::new();
        match self {
            Access::Read => options.read(true),
            Access::Replace => options.write(true).create(true),
            Access::Append => options.append(true).create(true),
        };
        options
    }

    fn purpose(self) -> &'static str {
        match self {
            Access::Read => "reading",
            Access::Replace => "writing",
            Access::Append => "append",
        }
    }
}

fn open_locked(path: &Path, access: Access) -> Result<File> {
    let file = access
        .options()
        .open(path)
        .with_context(|| format!("Failed to open {} for {}", path.display(), access.purpose()))?;
    let locked = match access {
        Access::Read => file.lock_shared(),
        Access::Replace | Access::Append => file.lock_exclusive(),
    };
    locked.with_context(|| format!("Failed to lock {} for {}", path.display(), access.purpose()))?;
    Ok(file)
}

fn write_through(file: &File, path: &Path, parts: &[&[u8]]) -> Result<()> {
    let mut writer = BufWriter::new(file);
    for part in parts {
        writer
            .write_all(part)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to flush {}", path.display()))
}

/// Read a whole file under a shared lock.
pub fn locked_read(path: &Path) -> Result<String> {
    let file = open_locked(path, Access::Read)?;
    let mut content = String::new();
    BufReader::new(&file)
        .read_to_string(&mut content)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(content)
}

/// Replace a file's contents under an exclusive lock.
///
/// The file is truncated only after the lock is held, so readers never see
/// it empty.
pub fn locked_write(path: &Path, content: &str) -> Result<()> {
    let file = open_locked(path, Access::Replace)?;
    file.set_len(0)
        .with_context(|| format!("Failed to truncate {}", path.display()))?;
    write_through(&file, path, &[content.as_bytes()])
}

/// Append one line under an exclusive lock. A trailing newline is added.
pub fn locked_append(path: &Path, line: &str) -> Result<()> {
    let file = open_locked(path, Access::Append)?;
    write_through(
        &file,
        path,
        &[line.trim_end_matches('\n').as_bytes(), b"\n".as_slice()],
    )
}
