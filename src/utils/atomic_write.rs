//! Atomic file write utility.
//!
//! Write-to-temp-then-rename, used for every persisted chunk segment.
//!
//! Invariants:
//! - Write goes to a sibling `.tmp` file first, then a rename replaces the target.
//! - On rename failure, the temp file is cleaned up to avoid stale artifacts.
//! - Parent directories are created if absent.
//! - A reader never observes a half-written segment, even after a crash.
//!
//! Note: `rename()` is atomic on NTFS, ext4, APFS, and all major filesystems
//! when source and destination are on the same mount.

use std::io;
use std::path::{Path, PathBuf};
use tracing::error;

/// Path of the temporary sibling used while writing `path`.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Atomically write `content` to `path` via a temporary file and rename.
///
/// # Errors
/// Returns an error if the parent directory cannot be created, the temp file
/// cannot be written or the rename fails.
pub fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = temp_path(path);

    std::fs::write(&tmp_path, content).map_err(|e| {
        error!(
            event = "atomic_write_failure",
            path = %tmp_path.display(),
            error = %e,
            "Failed to write temp file"
        );
        e
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| {
        error!(
            event = "atomic_rename_failure",
            from = %tmp_path.display(),
            to = %path.display(),
            error = %e,
            "Failed to rename temp file"
        );
        let _ = std::fs::remove_file(&tmp_path);
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("spacedrop_test_{name}_{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_atomic_write_creates_parents() {
        let dir = scratch("atomic");
        let path = dir.join("nested").join("0000000000.seg");

        atomic_write(&path, b"hello").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_atomic_write_overwrites() {
        let dir = scratch("atomic_overwrite");
        let path = dir.join("segment.seg");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_atomic_write_no_temp_file_remains() {
        let dir = scratch("atomic_notmp");
        let path = dir.join("segment.seg");

        atomic_write(&path, b"data").unwrap();
        let tmp = temp_path(&path);
        assert_eq!(tmp.file_name().unwrap(), "segment.seg.tmp");
        assert!(
            !tmp.exists(),
            "Temp file should not remain after successful write"
        );

        let _ = std::fs::remove_dir_all(&dir);
    }
}
