//! # Body Compression
//!
//! Bodies larger than the configured threshold are compressed before they
//! are encrypted. The receiver learns which pipeline to reverse from a frame
//! leader byte (socket transport) or an encoding header (request/response).

use crate::CryptoError;
use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use std::io::{Read, Write};
use std::str::FromStr;

/// Compression applied to a body before encryption.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BodyEncoding {
    /// Sent as-is.
    #[default]
    Identity,
    /// Raw DEFLATE stream.
    Deflate,
    /// Gzip container.
    Gzip,
}

impl BodyEncoding {
    /// Header value for this encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            BodyEncoding::Identity => "identity",
            BodyEncoding::Deflate => "deflate",
            BodyEncoding::Gzip => "gzip",
        }
    }

    /// Pick the encoding for an outgoing body of `len` bytes.
    pub fn for_len(len: usize, threshold: usize) -> Self {
        if len > threshold {
            BodyEncoding::Deflate
        } else {
            BodyEncoding::Identity
        }
    }
}

impl FromStr for BodyEncoding {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => Ok(BodyEncoding::Identity),
            "deflate" => Ok(BodyEncoding::Deflate),
            "gzip" => Ok(BodyEncoding::Gzip),
            other => Err(CryptoError::UnknownEncoding(other.to_string())),
        }
    }
}

/// Compress `data` with `encoding`.
pub fn compress(encoding: BodyEncoding, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match encoding {
        BodyEncoding::Identity => Ok(data.to_vec()),
        BodyEncoding::Deflate => {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(data)
                .map_err(|e| CryptoError::CompressionFailed(e.to_string()))?;
            encoder
                .finish()
                .map_err(|e| CryptoError::CompressionFailed(e.to_string()))
        }
        BodyEncoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(data)
                .map_err(|e| CryptoError::CompressionFailed(e.to_string()))?;
            encoder
                .finish()
                .map_err(|e| CryptoError::CompressionFailed(e.to_string()))
        }
    }
}

/// Reverse [`compress`], refusing to produce more than `limit` bytes.
pub fn decompress(
    encoding: BodyEncoding,
    data: &[u8],
    limit: usize,
) -> Result<Vec<u8>, CryptoError> {
    match encoding {
        BodyEncoding::Identity => {
            if data.len() > limit {
                return Err(CryptoError::BodyTooLarge { limit });
            }
            Ok(data.to_vec())
        }
        BodyEncoding::Deflate => read_bounded(DeflateDecoder::new(data), limit),
        BodyEncoding::Gzip => read_bounded(GzDecoder::new(data), limit),
    }
}

fn read_bounded<R: Read>(reader: R, limit: usize) -> Result<Vec<u8>, CryptoError> {
    let mut out = Vec::new();
    // One extra byte tells an exact-limit body apart from an oversized one.
    reader
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| CryptoError::CompressionFailed(e.to_string()))?;
    if out.len() > limit {
        return Err(CryptoError::BodyTooLarge { limit });
    }
    Ok(out)
}
