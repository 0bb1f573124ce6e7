//! Integrity digests in SRI format.

use base64::Engine;
use sha2::{Digest, Sha512};
use std::fmt;

/// A SHA-512 digest of a decompressed archive stream, rendered as
/// `sha512-<base64>`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Integrity([u8; 64]);

impl Integrity {
    /// Algorithm tag used as the SRI prefix.
    pub const ALGORITHM: &'static str = "sha512";

    /// Compute the digest of data in one shot.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = IntegrityHasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    /// Encode as SRI format.
    pub fn to_sri(&self) -> String {
        format!(
            "{}-{}",
            Self::ALGORITHM,
            base64::engine::general_purpose::STANDARD.encode(self.0)
        )
    }
}

impl fmt::Debug for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sri = self.to_sri();
        write!(f, "Integrity({})", &sri[..sri.len().min(24)])
    }
}

impl fmt::Display for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_sri())
    }
}

/// Incremental SHA-512 hasher.
pub struct IntegrityHasher {
    inner: Sha512,
    bytes: u64,
}

impl IntegrityHasher {
    /// Create a new hasher.
    pub fn new() -> Self {
        Self {
            inner: Sha512::new(),
            bytes: 0,
        }
    }

    /// Update the hasher with data.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes fed so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    /// Finalize and return the digest.
    pub fn finalize(self) -> Integrity {
        let mut digest = [0u8; 64];
        digest.copy_from_slice(&self.inner.finalize());
        Integrity(digest)
    }
}

impl Default for IntegrityHasher {
    fn default() -> Self {
        Self::new()
    }
}
