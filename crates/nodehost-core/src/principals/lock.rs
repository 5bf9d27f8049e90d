//! Cross-process named locks over lock files.

use crate::error::{HostingError, Result};
use crate::principals::store::file_safe_name;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// Named mutual-exclusion locks backed by files in one folder.
///
/// Each name maps to `<folder>/<name>.lock`; holding the lock means holding
/// an exclusive `fd-lock` on that file. The lock blocks, so callers on the
/// async runtime go through `spawn_blocking`.
#[derive(Debug, Clone)]
pub struct NamedLocks {
    folder: PathBuf,
}

impl NamedLocks {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.folder.join(format!("{}.lock", file_safe_name(name)))
    }

    /// Run `f` while holding the lock called `name`.
    pub fn with_lock<T>(&self, name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        std::fs::create_dir_all(&self.folder)?;
        let path = self.lock_path(name);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        let mut lock = fd_lock::RwLock::new(file);
        let _guard = lock.write().map_err(|e| {
            tracing::warn!(lock = %name, path = %path.display(), error = %e, "Failed to acquire named lock");
            HostingError::OperationFailed(format!("failed to acquire lock {name}: {e}"))
        })?;
        tracing::trace!(lock = %name, "Acquired named lock");

        // Released when `_guard` drops.
        f()
    }
}
