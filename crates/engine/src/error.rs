//! Engine error types.

use lockmirror_storage::StorageError;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors that abort a run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{} not found", .0.display())]
    ManifestMissing(PathBuf),

    #[error("failed to read {}: {source}", .path.display())]
    ManifestRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    ManifestParse {
        path: PathBuf,
        source: lockmirror_core::Error,
    },

    #[error("failed to serialize lock file: {0}")]
    ManifestSerialize(lockmirror_core::Error),

    #[error("failed to write {}: {source}", .path.display())]
    ManifestWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("mirror directory error: {0}")]
    Mirror(#[from] StorageError),
}

/// Per-record errors. These are logged and the record is left unmirrored.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("failed to read client certificate {}: {source}", .path.display())]
    Tls {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid client certificate: {0}")]
    Identity(#[source] reqwest::Error),

    #[error("failed to download {url}: {source}")]
    Transport { url: String, source: reqwest::Error },

    #[error("failed to download {url} (status: {status})")]
    Status { url: String, status: u16 },

    #[error("empty response from {url}")]
    EmptyResponse { url: String },

    #[error("failed to download {url}: {source}")]
    Download { url: String, source: std::io::Error },

    #[error("failed to calculate integrity for {url}: {source}")]
    Integrity { url: String, source: std::io::Error },

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: StorageError,
    },
}
