//! AN-015: Lock file management: load, save (atomic), path derivation.

use super::types::StackLock;
use crate::error::{Error, Result};
use crate::ledger::eventlog::now_iso8601;
use std::path::{Path, PathBuf};

/// Derive the lock file path for a stack within the state directory.
pub fn lock_file_path(state_dir: &Path, stack: &str) -> PathBuf {
    state_dir.join(stack).join("state.lock.yaml")
}

/// Load a stack's lock file. Returns None if the stack was never applied.
pub fn load_lock(state_dir: &Path, stack: &str) -> Result<Option<StackLock>> {
    let path = lock_file_path(state_dir, stack);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path).map_err(|e| Error::io("cannot read", &path, e))?;
    let lock: StackLock = serde_yaml_ng::from_str(&content)
        .map_err(|e| Error::Parse(format!("invalid lock file {}: {}", path.display(), e)))?;
    Ok(Some(lock))
}

/// Save a lock file atomically.
pub fn save_lock(state_dir: &Path, lock: &StackLock) -> Result<()> {
    let yaml = serde_yaml_ng::to_string(lock)?;
    write_atomic(&lock_file_path(state_dir, &lock.stack), &yaml)
}

/// Write to a sibling temp file, then rename over `path`.
pub fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io("cannot create", parent, e))?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    std::fs::write(&tmp_path, content).map_err(|e| Error::io("cannot write", &tmp_path, e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| Error::io("cannot rename into", path, e))?;
    Ok(())
}

/// Create a new empty lock for a stack.
pub fn new_lock(stack: &str, template_hash: &str) -> StackLock {
    StackLock {
        schema: "1.0".to_string(),
        stack: stack.to_string(),
        generated_at: now_iso8601(),
        generator: format!("andamio {}", env!("CARGO_PKG_VERSION")),
        template_hash: template_hash.to_string(),
        resources: indexmap::IndexMap::new(),
    }
}
