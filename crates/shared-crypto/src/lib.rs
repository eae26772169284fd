//! # Shared Crypto - Courier Cipher Primitives
//!
//! ## Components
//!
//! | Module | Algorithm | Use Case |
//! |--------|-----------|----------|
//! | `symmetric` | AES-256-CBC | Envelope body encryption |
//! | `asymmetric` | RSA PKCS#1 v1.5 | Session key wrap, timestamp signatures |
//! | `compression` | DEFLATE, gzip | Large body compression before encryption |
//! | `hashing` | SHA-256 | Replay-guard body digests |
//!
//! ## Wire Compatibility
//!
//! The default IV mode is the fixed IV deployed endpoints expect. New
//! deployments can opt into per-message random IVs via [`IvMode::Random`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod asymmetric;
pub mod compression;
pub mod errors;
pub mod hashing;
pub mod symmetric;

// Re-exports
pub use asymmetric::{
    generate_private_key, private_key_from_pem, public_key_from_pem, public_key_to_pem,
    sign_timestamp, unwrap_key, verify_timestamp, wrap_key, wrapped_len,
};
pub use compression::{compress, decompress, BodyEncoding};
pub use errors::CryptoError;
pub use hashing::sha256_hex;
pub use rsa::{RsaPrivateKey, RsaPublicKey};
pub use symmetric::{decrypt, encrypt, IvMode, SessionKey};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    #[test]
    fn test_version() {
        assert!(!super::VERSION.is_empty());
    }
}
