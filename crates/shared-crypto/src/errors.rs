//! Crypto error types.

use thiserror::Error;

/// Cryptographic operation errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Invalid key length
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length in bytes
        expected: usize,
        /// Actual key length in bytes
        actual: usize,
    },

    /// Key wrapping (RSA encryption of a session key) failed
    #[error("Key wrap failed: {0}")]
    KeyWrapFailed(String),

    /// Key unwrapping (RSA decryption of a session key) failed
    #[error("Key unwrap failed: {0}")]
    KeyUnwrapFailed(String),

    /// Signature verification failed
    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    /// Signing failed
    #[error("Signing failed: {0}")]
    SigningFailed(String),

    /// Invalid public key
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Invalid private key
    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// Compression or decompression failed
    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    /// Decompressed body exceeded the configured limit
    #[error("Decompressed body exceeds {limit} bytes")]
    BodyTooLarge {
        /// Maximum permitted size
        limit: usize,
    },

    /// Unknown body encoding name
    #[error("Unknown body encoding: {0}")]
    UnknownEncoding(String),

    /// Invalid base64 input
    #[error("Invalid base64: {0}")]
    InvalidBase64(String),
}
