//! Socket frame codec.
//!
//! ```text
//! ┌────────┬──────────────────────────────────────────────┐
//! │ leader │ payload (AES-256-CBC when the socket is enc) │
//! └────────┴──────────────────────────────────────────────┘
//!   0  JSON envelope or JSON array of envelopes
//!   1  DEFLATE(JSON)
//!   2  JSON header line, '\n', raw binary payload
//! ```
//!
//! A batch becomes one frame. Envelopes carrying a binary payload each get a
//! frame of their own after the JSON frame.

use crate::codec::CodecError;
use crate::domain::config::CodecConfig;
use crate::domain::envelope::WireEnvelope;
use serde::Deserialize;
use shared_crypto::{compress, decompress, decrypt, encrypt, BodyEncoding, IvMode, SessionKey};

pub const LEADER_JSON: u8 = 0;
pub const LEADER_DEFLATE: u8 = 1;
pub const LEADER_BINARY: u8 = 2;

/// Codec knobs shared by every transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecSettings {
    pub compression_threshold: usize,
    pub iv_mode: IvMode,
    pub max_body_bytes: usize,
}

impl Default for CodecSettings {
    fn default() -> Self {
        Self::from(&CodecConfig::default())
    }
}

impl From<&CodecConfig> for CodecSettings {
    fn from(config: &CodecConfig) -> Self {
        Self {
            compression_threshold: config.compression_threshold,
            iv_mode: config.iv_mode.into(),
            max_body_bytes: config.max_body_bytes,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<WireEnvelope>),
    One(WireEnvelope),
}

/// Parse a JSON envelope or a JSON array of envelopes.
pub fn parse_batch(json: &[u8]) -> Result<Vec<WireEnvelope>, CodecError> {
    match serde_json::from_slice::<OneOrMany>(json)? {
        OneOrMany::Many(batch) => Ok(batch),
        OneOrMany::One(envelope) => Ok(vec![envelope]),
    }
}

/// Serialize a batch: a lone envelope as an object, several as an array.
pub fn serialize_batch(batch: &[WireEnvelope]) -> Result<Vec<u8>, CodecError> {
    Ok(match batch {
        [single] => serde_json::to_vec(single)?,
        many => serde_json::to_vec(many)?,
    })
}

/// Frame encoder/decoder for one socket.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    key: Option<SessionKey>,
    settings: CodecSettings,
}

impl FrameCodec {
    pub fn plaintext(settings: CodecSettings) -> Self {
        Self { key: None, settings }
    }

    pub fn encrypted(key: SessionKey, settings: CodecSettings) -> Self {
        Self {
            key: Some(key),
            settings,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    pub fn settings(&self) -> CodecSettings {
        self.settings
    }

    /// Replace the session key. No-op on plaintext sockets.
    pub fn rotate(&mut self, key: SessionKey) {
        if self.key.is_some() {
            self.key = Some(key);
        }
    }

    /// Encode a batch into the frames that carry it.
    ///
    /// A leader `2` frame holds exactly one envelope, so a batch with `n`
    /// binary envelopes yields up to `n + 1` frames: the JSON envelopes first,
    /// then each binary envelope in batch order. Receivers must not assume
    /// one frame per batch.
    pub fn encode(&self, batch: &[WireEnvelope]) -> Result<Vec<Vec<u8>>, CodecError> {
        let (binary, plain): (Vec<&WireEnvelope>, Vec<&WireEnvelope>) =
            batch.iter().partition(|e| e.binary().is_some());

        let mut frames = Vec::with_capacity(1 + binary.len());
        if !plain.is_empty() {
            let owned: Vec<WireEnvelope> = plain.into_iter().cloned().collect();
            let json = serialize_batch(&owned)?;
            let frame = match BodyEncoding::for_len(json.len(), self.settings.compression_threshold) {
                BodyEncoding::Identity => self.seal(LEADER_JSON, json),
                encoding => self.seal(LEADER_DEFLATE, compress(encoding, &json)?),
            };
            frames.push(frame);
        }

        for envelope in binary {
            let mut payload = serde_json::to_vec(envelope)?;
            payload.push(b'\n');
            if let Some(raw) = envelope.binary() {
                payload.extend_from_slice(raw);
            }
            frames.push(self.seal(LEADER_BINARY, payload));
        }
        Ok(frames)
    }

    /// Decode one inbound frame.
    ///
    /// Plaintext sockets also accept bare JSON text frames without a leader.
    pub fn decode(&self, frame: &[u8]) -> Result<Vec<WireEnvelope>, CodecError> {
        let (&leader, rest) = frame.split_first().ok_or(CodecError::Empty)?;
        if self.key.is_none() && matches!(leader, b'{' | b'[') {
            return parse_batch(frame);
        }

        let payload = self.open(rest)?;
        match leader {
            LEADER_JSON => parse_batch(&payload),
            LEADER_DEFLATE => {
                let json = decompress(BodyEncoding::Deflate, &payload, self.settings.max_body_bytes)?;
                parse_batch(&json)
            }
            LEADER_BINARY => {
                let split = payload
                    .iter()
                    .position(|&b| b == b'\n')
                    .ok_or(CodecError::MissingBinaryHeader)?;
                let header: WireEnvelope = serde_json::from_slice(&payload[..split])?;
                Ok(vec![header.with_binary(payload[split + 1..].to_vec())])
            }
            other => Err(CodecError::UnknownLeader(other)),
        }
    }

    fn seal(&self, leader: u8, payload: Vec<u8>) -> Vec<u8> {
        let body = match &self.key {
            Some(key) => encrypt(key, self.settings.iv_mode, &payload),
            None => payload,
        };
        let mut frame = Vec::with_capacity(1 + body.len());
        frame.push(leader);
        frame.extend_from_slice(&body);
        frame
    }

    fn open(&self, body: &[u8]) -> Result<Vec<u8>, CodecError> {
        match &self.key {
            Some(key) => Ok(decrypt(key, self.settings.iv_mode, body)?),
            None => Ok(body.to_vec()),
        }
    }
}
