//! Configuration shared across crates.

use crate::credentials::{CredentialResolver, RegistrySettings};
use std::path::PathBuf;

/// Setting key that overrides the mirror directory.
pub const MIRROR_PATH_KEY: &str = "npm-offline-mirror";

/// Configuration for one reconciliation run.
///
/// Built once by the caller and passed explicitly into the engine; nothing in
/// the core reads process-wide configuration.
#[derive(Clone, Debug)]
pub struct MirrorConfig {
    /// Directory holding mirror entries.
    pub mirror_path: PathBuf,
    /// Registry settings used to resolve fetch credentials.
    pub registries: RegistrySettings,
}

impl MirrorConfig {
    /// Build a configuration from flat settings, honouring the
    /// `npm-offline-mirror` override.
    pub fn from_settings(registries: RegistrySettings) -> Self {
        let mirror_path = registries
            .get(MIRROR_PATH_KEY)
            .filter(|path| !path.is_empty())
            .unwrap_or(crate::DEFAULT_MIRROR_PATH);
        Self {
            mirror_path: PathBuf::from(mirror_path),
            registries,
        }
    }

    /// Replace the mirror directory.
    pub fn with_mirror_path(mut self, mirror_path: impl Into<PathBuf>) -> Self {
        self.mirror_path = mirror_path.into();
        self
    }

    /// Credential resolver over this configuration's registry settings.
    pub fn credential_resolver(&self) -> CredentialResolver {
        CredentialResolver::new(self.registries.clone())
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self::from_settings(RegistrySettings::new())
    }
}
