//! Post-rewrite hooks.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Location of npm's derived copy of the lock file, relative to the
/// directory holding `package-lock.json`.
pub const DERIVED_LOCKFILE: &str = "node_modules/.package-lock.json";

/// Runs after the lock file has been rewritten.
///
/// Hooks are advisory: they cannot fail the run.
#[async_trait]
pub trait AfterRewrite: Send + Sync {
    async fn after_rewrite(&self, lockfile: &Path);
}

/// Deletes the package manager's cached copy of the lock file so it is
/// regenerated from the rewritten one.
#[derive(Clone, Debug)]
pub struct RemoveDerivedLockfile {
    path: PathBuf,
}

impl RemoveDerivedLockfile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The derived lock file that belongs to `lockfile`.
    pub fn for_lockfile(lockfile: &Path) -> Self {
        let dir = lockfile.parent().unwrap_or(Path::new(""));
        Self::new(dir.join(DERIVED_LOCKFILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AfterRewrite for RemoveDerivedLockfile {
    async fn after_rewrite(&self, _lockfile: &Path) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => tracing::debug!(path = %self.path.display(), "removed derived lock file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::debug!(path = %self.path.display(), error = %e, "could not remove derived lock file");
            }
        }
    }
}
