//! Tool settings.

use anyhow::Result;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default settings file, looked up in the working directory.
pub const CONFIG_FILE: &str = "lockmirror.toml";

const ENV_PREFIX: &str = "LOCKMIRROR_";
const DEFAULT_LOCKFILE: &str = "package-lock.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Lock file to reconcile.
    pub lockfile: PathBuf,
    /// Cached copy of the lock file to delete after a rewrite. Defaults to
    /// `node_modules/.package-lock.json` next to the lock file.
    pub derived_lockfile: Option<PathBuf>,
    /// Per-request timeout for registry downloads.
    pub timeout_secs: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            lockfile: PathBuf::from(DEFAULT_LOCKFILE),
            derived_lockfile: None,
            timeout_secs: None,
        }
    }
}

/// Load settings from `path` (if it exists) and `LOCKMIRROR_*` variables.
pub fn load(path: &Path) -> Result<Settings> {
    let mut figment = Figment::new();

    if path.exists() {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed(ENV_PREFIX).only(&[
        "lockfile",
        "derived_lockfile",
        "timeout_secs",
    ]));

    figment
        .extract()
        .map_err(|err| anyhow::anyhow!(err).context("failed to load lockmirror settings"))
}
