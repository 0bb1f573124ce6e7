//! Core domain types and shared logic for lockmirror.
//!
//! This crate defines the data model used across all other crates:
//! - Specs and mirror file naming
//! - Integrity digests (SRI, SHA-512) and incremental hashing
//! - Registry settings and credential resolution
//! - The lock file model and its in-place rewrite

pub mod config;
pub mod credentials;
pub mod error;
pub mod integrity;
pub mod manifest;
pub mod spec;

pub use config::MirrorConfig;
pub use credentials::{Auth, ClientCertificate, CredentialResolver, Credentials, RegistrySettings};
pub use error::{Error, Result};
pub use integrity::{Integrity, IntegrityHasher};
pub use manifest::{DigestTable, Manifest, PackageRecord};
pub use spec::Spec;

/// Default mirror directory, relative to the working directory.
pub const DEFAULT_MIRROR_PATH: &str = ".npm-offline-mirror";

/// Extension of every mirror entry.
pub const MIRROR_EXTENSION: &str = "tar";
