//! Per-repository merge lock table.
//!
//! Merging, building, and testing mutate the host checkout, so at most one
//! project may occupy those phases per repository. Projects targeting
//! different repositories interleave freely.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Process-wide table of async locks keyed by canonical repository path.
#[derive(Clone, Default)]
pub struct RepoLockTable {
    locks: Arc<Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>>,
}

impl RepoLockTable {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for one repository, waiting if another project
    /// holds it. The guard releases on drop.
    pub async fn acquire(&self, repo_path: &Path) -> OwnedMutexGuard<()> {
        let key = std::fs::canonicalize(repo_path).unwrap_or_else(|_| repo_path.to_path_buf());
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };

            Arc::clone(locks.entry(key).or_default())
        };

        lock.lock_owned().await
    }
}
