//! Self-removal ("melt"): delete the running executable from disk.
//!
//! Unlinking a running binary is safe on Unix; the process keeps its
//! mapped image and forwarding is unaffected.

use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

/// Deletes one file at most once.
#[derive(Debug)]
pub struct SelfRemoval {
    path: PathBuf,
    removed: bool,
}

impl SelfRemoval {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            removed: false,
        }
    }

    /// Target the executable of the current process.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file. Returns `Ok(true)` the first time and `Ok(false)`
    /// on every later call. A file that is already gone counts as removed.
    pub fn remove(&mut self) -> io::Result<bool> {
        if self.removed {
            return Ok(false);
        }

        match std::fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "executable removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "executable already absent");
            }
            Err(e) => return Err(e),
        }

        self.removed = true;
        Ok(true)
    }
}
