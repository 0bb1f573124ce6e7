//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("lock file parse error: {0}")]
    ManifestParse(#[from] serde_json::Error),

    #[error("invalid lock file: {0}")]
    InvalidManifest(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
