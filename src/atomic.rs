//! Crash-safe file replacement.
//!
//! Contents go to a temp file in the destination directory, are flushed and
//! fsynced, then renamed over the destination. A crash at any point leaves
//! either the old file or the new one, never a torn write.

use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Write `bytes` to a fresh temp file next to `path` without replacing it yet.
pub fn stage(path: &Path, bytes: &[u8]) -> std::io::Result<NamedTempFile> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    Ok(tmp)
}

/// Rename a staged temp file over `path`.
pub fn commit(staged: NamedTempFile, path: &Path) -> std::io::Result<()> {
    staged.persist(path).map_err(|e| e.error)?;
    sync_parent(path);
    Ok(())
}

/// Stage and commit in one step.
pub fn write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let staged = stage(path, bytes)?;
    commit(staged, path)
}

#[cfg(unix)]
fn sync_parent(path: &Path) {
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(handle) = std::fs::File::open(dir) {
            let _ = handle.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}
