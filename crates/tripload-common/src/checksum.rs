//! Content fingerprints for staged objects

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest of an in-memory buffer
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
