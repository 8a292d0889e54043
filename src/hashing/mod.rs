//! Centralized module for cryptographic hashing algorithms.

use serde::Serialize;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

/// Digest algorithms used by code signatures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DigestKind {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestKind {
    /// Output size in bytes
    pub fn output_size(&self) -> usize {
        match self {
            DigestKind::Sha1 => 20,
            DigestKind::Sha256 => 32,
            DigestKind::Sha384 => 48,
            DigestKind::Sha512 => 64,
        }
    }
}

/// Computes the raw digest of `data` with the given algorithm.
pub fn digest(kind: DigestKind, data: &[u8]) -> Vec<u8> {
    match kind {
        DigestKind::Sha1 => Sha1::digest(data).to_vec(),
        DigestKind::Sha256 => Sha256::digest(data).to_vec(),
        DigestKind::Sha384 => Sha384::digest(data).to_vec(),
        DigestKind::Sha512 => Sha512::digest(data).to_vec(),
    }
}

/// Computes the SHA-256 digest of the given data and returns it as a hex string.
pub fn sha256_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Computes the SHA-1 digest of the given data and returns it as a hex string.
pub fn sha1_digest(data: &[u8]) -> String {
    hex::encode(digest(DigestKind::Sha1, data))
}
