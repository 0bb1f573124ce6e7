//! Storage error types.

use std::path::PathBuf;
use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to calculate integrity of {}: {source}", .path.display())]
    Integrity {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid mirror path: {}", .0.display())]
    InvalidPath(PathBuf),
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
