//! # SHA-256 Hashing

use sha2::{Digest, Sha256};

/// SHA-256 output (256-bit).
pub type Hash = [u8; 32];

/// Hash data with SHA-256 (one-shot).
pub fn sha256(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

/// Lower-case hex SHA-256 digest, used to key request bodies compactly.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}
