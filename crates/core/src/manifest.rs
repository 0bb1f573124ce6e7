//! Lock file model and in-place rewrite.
//!
//! The document is kept as an ordered JSON tree so that every field this
//! crate does not own survives a rewrite verbatim and in its original
//! position. Only `resolved` and `integrity` of mirrored records are touched.

use crate::integrity::Integrity;
use crate::spec::{self, Spec};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// Digests computed during a run, keyed by spec.
pub type DigestTable = BTreeMap<Spec, Integrity>;

const PACKAGES: &str = "packages";
const DEPENDENCIES: &str = "dependencies";
const VERSION: &str = "version";
const RESOLVED: &str = "resolved";
const INTEGRITY: &str = "integrity";

/// Prefix of a local file location.
pub const FILE_PREFIX: &str = "file:";

/// Read-only view of one package record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PackageRecord<'a> {
    pub version: Option<&'a str>,
    pub resolved: Option<&'a str>,
    pub integrity: Option<&'a str>,
}

impl<'a> PackageRecord<'a> {
    fn from_map(map: &'a Map<String, Value>) -> Self {
        let field = |key: &str| map.get(key).and_then(Value::as_str);
        Self {
            version: field(VERSION),
            resolved: field(RESOLVED),
            integrity: field(INTEGRITY),
        }
    }

    /// Spec of this record at the given install path.
    pub fn spec(&self, install_path: &str) -> Spec {
        Spec::new(install_path, self.version)
    }

    /// The resolved location if it is an http(s) URL.
    pub fn remote_url(&self) -> Option<&'a str> {
        self.resolved
            .filter(|url| url.starts_with("http://") || url.starts_with("https://"))
    }

    /// The resolved location if it is a local file reference.
    pub fn local_file(&self) -> Option<&'a str> {
        self.resolved.and_then(|loc| loc.strip_prefix(FILE_PREFIX))
    }

    /// Whether this record should be copied into the mirror: it has a
    /// version, an http(s) location, and is installed below a
    /// `node_modules/` segment.
    pub fn is_mirror_eligible(&self, install_path: &str) -> bool {
        self.version.is_some() && self.remote_url().is_some() && spec::is_nested(install_path)
    }
}

/// Render a mirror path as a lock file location.
pub fn file_reference(path: &Path) -> String {
    format!("{FILE_PREFIX}{}", path.display())
}

/// A parsed lock file.
#[derive(Clone, Debug, PartialEq)]
pub struct Manifest {
    root: Map<String, Value>,
}

impl Manifest {
    /// Parse a lock file document.
    pub fn parse(text: &str) -> crate::Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(root) = value else {
            return Err(crate::Error::InvalidManifest(
                "top level is not an object".to_string(),
            ));
        };
        if let Some(packages) = root.get(PACKAGES)
            && !packages.is_object()
        {
            return Err(crate::Error::InvalidManifest(format!(
                "\"{PACKAGES}\" is not an object"
            )));
        }
        Ok(Self { root })
    }

    /// Iterate the flat package table in document order.
    ///
    /// Entries that are not objects are skipped.
    pub fn packages(&self) -> impl Iterator<Item = (&str, PackageRecord<'_>)> {
        self.root
            .get(PACKAGES)
            .and_then(Value::as_object)
            .into_iter()
            .flat_map(|packages| packages.iter())
            .filter_map(|(path, value)| {
                value
                    .as_object()
                    .map(|record| (path.as_str(), PackageRecord::from_map(record)))
            })
    }

    /// Whether the legacy nested `dependencies` table is present.
    pub fn has_legacy_dependencies(&self) -> bool {
        self.root.get(DEPENDENCIES).is_some_and(Value::is_object)
    }

    /// Point every mirrored record at its mirror entry.
    ///
    /// Eligible package records whose spec has a digest get
    /// `resolved = file:<mirror>/<entry>` and `integrity = <digest>`. Records
    /// in the legacy tree are matched by name and version and get the same
    /// assignment. Returns whether any value actually changed.
    pub fn rewrite(&mut self, digests: &DigestTable, mirror_dir: &Path) -> bool {
        let mut changed = false;

        if let Some(packages) = self.root.get_mut(PACKAGES).and_then(Value::as_object_mut) {
            changed |= rewrite_packages(packages, digests, mirror_dir);
        }
        if let Some(dependencies) = self
            .root
            .get_mut(DEPENDENCIES)
            .and_then(Value::as_object_mut)
        {
            changed |= rewrite_dependencies(dependencies, digests, mirror_dir);
        }

        changed
    }

    /// Serialize with two-space indentation and a trailing newline.
    pub fn to_json_pretty(&self) -> crate::Result<String> {
        let mut text = serde_json::to_string_pretty(&self.root)
            .map_err(|e| crate::Error::Serialization(e.to_string()))?;
        text.push('\n');
        Ok(text)
    }
}

fn rewrite_packages(
    packages: &mut Map<String, Value>,
    digests: &DigestTable,
    mirror_dir: &Path,
) -> bool {
    let mut changed = false;
    for (install_path, value) in packages.iter_mut() {
        let Some(record) = value.as_object_mut() else {
            continue;
        };
        let view = PackageRecord::from_map(record);
        if !view.is_mirror_eligible(install_path) {
            continue;
        }
        let spec = view.spec(install_path);
        if let Some(integrity) = digests.get(&spec) {
            changed |= set_location(record, &spec.mirror_path(mirror_dir), integrity);
        }
    }
    changed
}

fn rewrite_dependencies(
    dependencies: &mut Map<String, Value>,
    digests: &DigestTable,
    mirror_dir: &Path,
) -> bool {
    let mut changed = false;
    for (name, value) in dependencies.iter_mut() {
        let Some(record) = value.as_object_mut() else {
            continue;
        };
        let spec = record
            .get(VERSION)
            .and_then(Value::as_str)
            .map(|version| Spec::new(name, Some(version)));
        if let Some(spec) = spec
            && let Some(integrity) = digests.get(&spec)
        {
            changed |= set_location(record, &spec.mirror_path(mirror_dir), integrity);
        }
        if let Some(children) = record.get_mut(DEPENDENCIES).and_then(Value::as_object_mut) {
            changed |= rewrite_dependencies(children, digests, mirror_dir);
        }
    }
    changed
}

fn set_location(record: &mut Map<String, Value>, path: &Path, integrity: &Integrity) -> bool {
    let mut changed = false;
    for (key, value) in [
        (RESOLVED, Value::String(file_reference(path))),
        (INTEGRITY, Value::String(integrity.to_sri())),
    ] {
        if record.get(key) != Some(&value) {
            record.insert(key.to_string(), value);
            changed = true;
        }
    }
    changed
}
