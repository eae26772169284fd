//! # Symmetric Encryption
//!
//! AES-256 in CBC mode with PKCS#7 padding.
//!
//! ## IV Handling
//!
//! - **Fixed**: every message uses [`FIXED_IV`]. This is what deployed endpoints
//!   expect on the wire; the same plaintext under the same key always produces
//!   the same ciphertext.
//! - **Random**: a fresh 16-byte IV is generated per message and prepended to
//!   the ciphertext.

use crate::CryptoError;
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Session key length in bytes (AES-256).
pub const KEY_SIZE: usize = 32;

/// AES block and IV length in bytes.
pub const IV_SIZE: usize = 16;

/// Initialization vector shared by all wire-compatible endpoints.
pub const FIXED_IV: [u8; IV_SIZE] = [0u8; IV_SIZE];

/// Symmetric session key (256-bit).
#[derive(Clone, Zeroize, PartialEq, Eq)]
#[zeroize(drop)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, checking its length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; KEY_SIZE] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_SIZE,
                    actual: bytes.len(),
                })?;
        Ok(Self(array))
    }

    /// Generate random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive a key from a shared secret string (SHA-256 of the secret).
    pub fn derive_from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Get inner bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Standard base64 form, as carried in config pushes.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Parse the base64 form.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let raw = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::InvalidBase64(e.to_string()))?;
        Self::from_slice(&raw)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// How the IV is chosen for each message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IvMode {
    /// Constant IV, wire-compatible with existing endpoints.
    #[default]
    Fixed,
    /// Random IV prepended to each ciphertext.
    Random,
}

/// Encrypt plaintext with AES-256-CBC.
pub fn encrypt(key: &SessionKey, mode: IvMode, plaintext: &[u8]) -> Vec<u8> {
    match mode {
        IvMode::Fixed => cbc_encrypt(key, &FIXED_IV, plaintext),
        IvMode::Random => {
            let mut iv = [0u8; IV_SIZE];
            rand::thread_rng().fill_bytes(&mut iv);
            let body = cbc_encrypt(key, &iv, plaintext);
            let mut out = Vec::with_capacity(IV_SIZE + body.len());
            out.extend_from_slice(&iv);
            out.extend_from_slice(&body);
            out
        }
    }
}

/// Decrypt ciphertext produced by [`encrypt`] with the same mode.
///
/// # Errors
///
/// Returns `CryptoError::DecryptionFailed` on bad padding, a truncated
/// ciphertext or a length that is not a whole number of blocks.
pub fn decrypt(key: &SessionKey, mode: IvMode, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match mode {
        IvMode::Fixed => cbc_decrypt(key, &FIXED_IV, ciphertext),
        IvMode::Random => {
            if ciphertext.len() < IV_SIZE {
                return Err(CryptoError::DecryptionFailed("missing IV".into()));
            }
            let (iv, body) = ciphertext.split_at(IV_SIZE);
            let mut iv_bytes = [0u8; IV_SIZE];
            iv_bytes.copy_from_slice(iv);
            cbc_decrypt(key, &iv_bytes, body)
        }
    }
}

fn cbc_encrypt(key: &SessionKey, iv: &[u8; IV_SIZE], plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(key.as_bytes().into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

fn cbc_decrypt(
    key: &SessionKey,
    iv: &[u8; IV_SIZE],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() || ciphertext.len() % IV_SIZE != 0 {
        return Err(CryptoError::DecryptionFailed(format!(
            "ciphertext length {} is not a positive multiple of {}",
            ciphertext.len(),
            IV_SIZE
        )));
    }
    Aes256CbcDec::new(key.as_bytes().into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = SessionKey::generate();
        let plaintext = b"{\"type\":\"REQUEST\",\"name\":\"ping\"}";

        let ciphertext = encrypt(&key, IvMode::Fixed, plaintext);
        let decrypted = decrypt(&key, IvMode::Fixed, &ciphertext).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_fixed_iv_is_deterministic() {
        let key = SessionKey::generate();
        let a = encrypt(&key, IvMode::Fixed, b"same body");
        let b = encrypt(&key, IvMode::Fixed, b"same body");
        assert_eq!(a, b);
    }

    #[test]
    fn test_random_iv_differs_per_message() {
        let key = SessionKey::generate();
        let a = encrypt(&key, IvMode::Random, b"same body");
        let b = encrypt(&key, IvMode::Random, b"same body");
        assert_ne!(a, b);
        assert_eq!(decrypt(&key, IvMode::Random, &a).unwrap(), b"same body");
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = SessionKey::from_bytes([1u8; KEY_SIZE]);
        let key2 = SessionKey::from_bytes([2u8; KEY_SIZE]);

        let ciphertext = encrypt(&key1, IvMode::Fixed, b"Secret message");
        match decrypt(&key2, IvMode::Fixed, &ciphertext) {
            Err(_) => {}
            // CBC has no authentication; a wrong key that happens to yield
            // valid padding still cannot reproduce the plaintext.
            Ok(plain) => assert_ne!(plain, b"Secret message"),
        }
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let key = SessionKey::generate();
        let ciphertext = encrypt(&key, IvMode::Fixed, b"Secret message");
        assert!(decrypt(&key, IvMode::Fixed, &ciphertext[..ciphertext.len() - 3]).is_err());
        assert!(decrypt(&key, IvMode::Fixed, &[]).is_err());
    }

    #[test]
    fn test_key_base64_roundtrip() {
        let key = SessionKey::generate();
        let parsed = SessionKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_key_from_short_slice_rejected() {
        let result = SessionKey::from_slice(&[0u8; 16]);
        assert!(matches!(
            result,
            Err(CryptoError::InvalidKeyLength { expected: 32, actual: 16 })
        ));
    }

    #[test]
    fn test_derived_key_is_stable() {
        let a = SessionKey::derive_from_secret("partner-secret");
        let b = SessionKey::derive_from_secret("partner-secret");
        let c = SessionKey::derive_from_secret("other-secret");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(hex::encode(a.as_bytes()).len(), 64);
    }
}
