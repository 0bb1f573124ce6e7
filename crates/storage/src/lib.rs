//! Mirror directory storage for lockmirror.
//!
//! This crate provides:
//! - Listing, naming and deleting mirror entries
//! - Atomic streaming writes (temporary file, then rename)
//! - Integrity computation over decompressed local archives

pub mod digest;
pub mod error;
pub mod mirror;

pub use digest::{decompress_maybe, digest_file, digest_reader};
pub use error::{StorageError, StorageResult};
pub use mirror::{MirrorStore, MirrorUpload};
