//! Socket opening handshake.
//!
//! ```text
//! [0..4)   short client name, biased ASCII, zero padded
//! [4..7)   connection number, three ASCII digits
//! enc:     RSA-wrapped session key (server modulus length), then
//!          AES(identity JSON) under that key
//! plain:   identity JSON
//! ```
//!
//! Biased ASCII stores a printable character `c` as `c - 0x1F`, leaving 0
//! free for padding.

use crate::codec::CodecError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shared_crypto::{
    decrypt, encrypt, unwrap_key, wrap_key, wrapped_len, IvMode, RsaPrivateKey, RsaPublicKey,
    SessionKey,
};

pub const SHORT_NAME_LEN: usize = 4;
pub const CONNECTION_NUMBER_LEN: usize = 3;
pub const HEADER_LEN: usize = SHORT_NAME_LEN + CONNECTION_NUMBER_LEN;

const ASCII_BIAS: u8 = 0x1F;

/// Identity block sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientIdentity {
    /// Client clock (ms).
    pub now: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClientIdentity {
    pub fn new(now: i64) -> Self {
        Self {
            now,
            network_type: None,
            location: None,
            extra: Map::new(),
        }
    }
}

/// A parsed handshake.
#[derive(Debug)]
pub struct Handshake {
    pub short_name: String,
    pub connection_number: u16,
    /// Present on encrypted sockets.
    pub session_key: Option<SessionKey>,
    pub identity: ClientIdentity,
}

pub fn encode_short_name(name: &str) -> Result<[u8; SHORT_NAME_LEN], CodecError> {
    if name.len() > SHORT_NAME_LEN {
        return Err(CodecError::Handshake(format!("short name {name:?} longer than {SHORT_NAME_LEN}")));
    }
    let mut out = [0u8; SHORT_NAME_LEN];
    for (slot, c) in out.iter_mut().zip(name.bytes()) {
        if !(0x20..=0x7E).contains(&c) {
            return Err(CodecError::Handshake(format!("non-printable byte {c:#x} in short name")));
        }
        *slot = c - ASCII_BIAS;
    }
    Ok(out)
}

pub fn decode_short_name(bytes: &[u8]) -> Result<String, CodecError> {
    let mut name = String::with_capacity(SHORT_NAME_LEN);
    for &b in bytes.iter().take(SHORT_NAME_LEN) {
        if b == 0 {
            break;
        }
        let c = b
            .checked_add(ASCII_BIAS)
            .filter(|c| (0x20..=0x7E).contains(c))
            .ok_or_else(|| CodecError::Handshake(format!("invalid short name byte {b:#x}")))?;
        name.push(char::from(c));
    }
    Ok(name)
}

fn parse_connection_number(bytes: &[u8]) -> Result<u16, CodecError> {
    if !bytes.iter().all(u8::is_ascii_digit) {
        return Err(CodecError::Handshake("connection number is not three digits".into()));
    }
    Ok(bytes.iter().fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0')))
}

/// Parse an opening frame. `server_key` is required on encrypted sockets.
pub fn parse_handshake(
    frame: &[u8],
    server_key: Option<&RsaPrivateKey>,
    iv_mode: IvMode,
) -> Result<Handshake, CodecError> {
    if frame.len() < HEADER_LEN {
        return Err(CodecError::Handshake(format!(
            "handshake is {} bytes, header needs {HEADER_LEN}",
            frame.len()
        )));
    }
    let short_name = decode_short_name(&frame[..SHORT_NAME_LEN])?;
    let connection_number = parse_connection_number(&frame[SHORT_NAME_LEN..HEADER_LEN])?;
    let rest = &frame[HEADER_LEN..];

    let (session_key, identity_json) = match server_key {
        Some(private) => {
            let blob_len = wrapped_len(private);
            if rest.len() <= blob_len {
                return Err(CodecError::Handshake("missing wrapped key or identity".into()));
            }
            let (blob, sealed) = rest.split_at(blob_len);
            let key = unwrap_key(private, blob)?;
            let identity = decrypt(&key, iv_mode, sealed)?;
            (Some(key), identity)
        }
        None => (None, rest.to_vec()),
    };

    let identity: ClientIdentity = serde_json::from_slice(&identity_json)?;
    Ok(Handshake {
        short_name,
        connection_number,
        session_key,
        identity,
    })
}

/// Build an opening frame. `encryption` carries the server public key and
/// the session key to wrap for it.
pub fn build_handshake(
    short_name: &str,
    connection_number: u16,
    identity: &ClientIdentity,
    encryption: Option<(&RsaPublicKey, &SessionKey)>,
    iv_mode: IvMode,
) -> Result<Vec<u8>, CodecError> {
    if connection_number > 999 {
        return Err(CodecError::Handshake("connection number above 999".into()));
    }
    let mut frame = Vec::new();
    frame.extend_from_slice(&encode_short_name(short_name)?);
    frame.extend_from_slice(format!("{connection_number:03}").as_bytes());

    let identity_json = serde_json::to_vec(identity)?;
    match encryption {
        Some((server_public, key)) => {
            frame.extend_from_slice(&wrap_key(server_public, key)?);
            frame.extend_from_slice(&encrypt(key, iv_mode, &identity_json));
        }
        None => frame.extend_from_slice(&identity_json),
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::server_key;

    #[test]
    fn test_short_name_bias() {
        let encoded = encode_short_name("ab").unwrap();
        assert_eq!(encoded, [b'a' - 0x1F, b'b' - 0x1F, 0, 0]);
        assert_eq!(decode_short_name(&encoded).unwrap(), "ab");
    }

    #[test]
    fn test_short_name_too_long() {
        assert!(encode_short_name("abcde").is_err());
    }

    #[test]
    fn test_plain_handshake() {
        let mut identity = ClientIdentity::new(1_000);
        identity.network_type = Some("wifi".into());
        let frame = build_handshake("app", 7, &identity, None, IvMode::Fixed).unwrap();

        let parsed = parse_handshake(&frame, None, IvMode::Fixed).unwrap();
        assert_eq!(parsed.short_name, "app");
        assert_eq!(parsed.connection_number, 7);
        assert!(parsed.session_key.is_none());
        assert_eq!(parsed.identity, identity);
    }

    #[test]
    fn test_encrypted_handshake() {
        let private = server_key();
        let key = SessionKey::generate();
        let identity = ClientIdentity::new(42);
        let frame = build_handshake(
            "web",
            123,
            &identity,
            Some((&private.to_public_key(), &key)),
            IvMode::Fixed,
        )
        .unwrap();

        let parsed = parse_handshake(&frame, Some(private), IvMode::Fixed).unwrap();
        assert_eq!(parsed.connection_number, 123);
        assert_eq!(parsed.session_key, Some(key));
        assert_eq!(parsed.identity.now, 42);
    }

    #[test]
    fn test_truncated_handshake() {
        assert!(parse_handshake(b"ab1", None, IvMode::Fixed).is_err());
        assert!(parse_handshake(b"\x01\x02\x00\x00x12{}", None, IvMode::Fixed).is_err());
    }

    #[test]
    fn test_extra_identity_fields_kept() {
        let frame = [
            &encode_short_name("x").unwrap()[..],
            b"001",
            br#"{"now":5,"appVersion":"3.1"}"#,
        ]
        .concat();
        let parsed = parse_handshake(&frame, None, IvMode::Fixed).unwrap();
        assert_eq!(parsed.identity.extra["appVersion"], "3.1");
    }
}
