//! Wire codecs: socket frames and the opening handshake.

pub mod frame;
pub mod handshake;

pub use frame::{parse_batch, serialize_batch, CodecSettings, FrameCodec};
pub use handshake::{build_handshake, parse_handshake, ClientIdentity, Handshake};

use shared_crypto::CryptoError;
use thiserror::Error;

/// Frame and handshake decoding failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("empty frame")]
    Empty,

    #[error("unknown frame leader {0}")]
    UnknownLeader(u8),

    #[error("binary frame without header line")]
    MissingBinaryHeader,

    #[error("malformed handshake: {0}")]
    Handshake(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
