//! I/O adapters for the orchestration engine.

pub mod agent;
pub mod cancel;
pub mod checkpoint;
pub mod config;
pub mod git;
pub mod init;
pub mod plan;
pub mod process;
pub mod registry;
pub mod signals;
pub mod state_store;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// Replace `path` with `contents` via a sibling temp file and rename.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
