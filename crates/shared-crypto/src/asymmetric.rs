//! # RSA Key Exchange
//!
//! Session keys travel RSA-wrapped (PKCS#1 v1.5 encryption) for the
//! recipient. Request timestamps on the authenticated transport are signed
//! with the sender's private key (PKCS#1 v1.5, SHA-256).

use crate::symmetric::SessionKey;
use crate::CryptoError;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

/// Parse a PEM-encoded (SPKI) public key.
pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_public_key_pem(pem).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

/// Parse a PEM-encoded (PKCS#8) private key.
pub fn private_key_from_pem(pem: &str) -> Result<RsaPrivateKey, CryptoError> {
    RsaPrivateKey::from_pkcs8_pem(pem).map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))
}

/// Encode a public key as PEM (SPKI).
pub fn public_key_to_pem(key: &RsaPublicKey) -> Result<String, CryptoError> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

/// Generate a new private key of the given modulus size.
pub fn generate_private_key(bits: usize) -> Result<RsaPrivateKey, CryptoError> {
    RsaPrivateKey::new(&mut rand::thread_rng(), bits)
        .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))
}

/// Size in bytes of a wrapped key blob produced for `key`.
pub fn wrapped_len(key: &RsaPrivateKey) -> usize {
    key.size()
}

/// Wrap a session key for the holder of `recipient`'s private key.
pub fn wrap_key(recipient: &RsaPublicKey, key: &SessionKey) -> Result<Vec<u8>, CryptoError> {
    recipient
        .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, key.as_bytes())
        .map_err(|e| CryptoError::KeyWrapFailed(e.to_string()))
}

/// Unwrap a session key with our own private key.
pub fn unwrap_key(own: &RsaPrivateKey, wrapped: &[u8]) -> Result<SessionKey, CryptoError> {
    let raw = own
        .decrypt(Pkcs1v15Encrypt, wrapped)
        .map_err(|e| CryptoError::KeyUnwrapFailed(e.to_string()))?;
    SessionKey::from_slice(&raw)
}

/// Sign a millisecond timestamp (decimal ASCII form).
pub fn sign_timestamp(own: &RsaPrivateKey, ts_ms: i64) -> Result<Vec<u8>, CryptoError> {
    let digest = Sha256::digest(ts_ms.to_string().as_bytes());
    own.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .map_err(|e| CryptoError::SigningFailed(e.to_string()))
}

/// Verify a timestamp signature produced by [`sign_timestamp`].
pub fn verify_timestamp(
    sender: &RsaPublicKey,
    ts_ms: i64,
    signature: &[u8],
) -> Result<(), CryptoError> {
    let digest = Sha256::digest(ts_ms.to_string().as_bytes());
    sender
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
        .map_err(|_| CryptoError::SignatureVerificationFailed)
}
