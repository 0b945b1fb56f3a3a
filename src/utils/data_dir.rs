//! Global data directory for persistent storage.
//!
//! Defaults to `~/.spacedrop/` but can be overridden via `--conf`.
//! Must be initialized once at startup via `init()`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Name of the default directory under the user's home.
const DEFAULT_DIR_NAME: &str = ".spacedrop";

/// Initialize the global data directory.
///
/// If `custom` is `Some`, uses that path. Otherwise falls back to `~/.spacedrop/`.
///
/// # Errors
/// `NotFound` when no home directory is known and no path was given,
/// `AlreadyExists` when called more than once.
pub fn init(custom: Option<&Path>) -> io::Result<&'static Path> {
    let dir = resolve(custom, dirs::home_dir())?;
    DATA_DIR.set(dir).map_err(|_| {
        io::Error::new(
            io::ErrorKind::AlreadyExists,
            "data directory initialized more than once",
        )
    })?;
    get()
}

/// Returns the global data directory path.
pub fn get() -> io::Result<&'static Path> {
    DATA_DIR.get().map(PathBuf::as_path).ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "data directory not initialized")
    })
}

/// Directory holding persisted chunk segments of inbound transfers.
pub fn segments_dir() -> io::Result<PathBuf> {
    Ok(get()?.join("segments"))
}

fn resolve(custom: Option<&Path>, home: Option<PathBuf>) -> io::Result<PathBuf> {
    match custom {
        Some(p) => Ok(p.to_path_buf()),
        None => home
            .map(|h| h.join(DEFAULT_DIR_NAME))
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no home directory found")),
    }
}
