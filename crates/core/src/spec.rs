//! Package specs and mirror file naming.

use std::fmt;
use std::path::{Path, PathBuf};

/// Path segment that marks a nested (installed) dependency.
pub const NESTED_MARKER: &str = "node_modules/";

/// A canonical `<name>@<version>` identifier.
///
/// The name is the install path with everything up to and including the last
/// `node_modules/` segment removed, so `node_modules/a/node_modules/@s/b`
/// becomes `@s/b`. Two install paths resolving to the same name and version
/// produce the same spec.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Spec(String);

impl Spec {
    /// Derive a spec from an install path and an optional version.
    ///
    /// Without a version the spec is the bare package name.
    pub fn new(install_path: &str, version: Option<&str>) -> Self {
        let name = package_name(install_path);
        match version {
            Some(version) if !version.is_empty() => Self(format!("{name}@{version}")),
            _ => Self(name.to_string()),
        }
    }

    /// Get the spec string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of this spec's mirror entry.
    pub fn mirror_file_name(&self) -> String {
        format!("{}.{}", self.0.replace('/', "_"), crate::MIRROR_EXTENSION)
    }

    /// Full path of this spec's mirror entry inside `mirror_dir`.
    pub fn mirror_path(&self, mirror_dir: &Path) -> PathBuf {
        mirror_dir.join(self.mirror_file_name())
    }
}

impl fmt::Debug for Spec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Spec({})", self.0)
    }
}

impl fmt::Display for Spec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Package name of an install path.
///
/// Only whole `node_modules/` segments count, so `my_node_modules/foo` is
/// returned unchanged.
pub fn package_name(install_path: &str) -> &str {
    let mut end = install_path.len();
    while let Some(idx) = install_path[..end].rfind(NESTED_MARKER) {
        if idx == 0 || install_path[..idx].ends_with('/') {
            return &install_path[idx + NESTED_MARKER.len()..];
        }
        end = idx;
    }
    install_path
}

/// Whether an install path refers to a nested dependency rather than the
/// workspace root or a linked workspace package.
pub fn is_nested(install_path: &str) -> bool {
    install_path.starts_with(NESTED_MARKER) || install_path.contains(&format!("/{NESTED_MARKER}"))
}
