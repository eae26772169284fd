//! Authenticated server-to-server transport: `POST /s2s/{name}`.
//!
//! Checks run in this order and stop at the first failure:
//!
//! 1. `x-courier-client` names a known credential (`INVALID_CLIENT`)
//! 2. caller address is permitted (`UNAUTHORIZED`)
//! 3. `x-courier-version` matches exactly (`INVALID_VERSION`)
//! 4. `x-courier-ts` is signed by the client and inside the window (`INVALID_REQUEST_TS`)
//! 5. `x-courier-encoding` is supported (`INVALID_ENCODING`)
//! 6. the request was not seen before (`REQUEST_REPLAY`)
//! 7. the wrapped key opens the body (`DECRYPT_FAILED`)
//!
//! Failures before step 7 are answered in plaintext. Once the request is
//! open, the reply batch is sealed under a fresh key generated for this
//! reply. That key is wrapped with the caller's public key and returned in
//! `x-courier-key`, so only the holder of the caller's private key can read
//! the reply.

use crate::codec::{parse_batch, serialize_batch, CodecSettings};
use crate::domain::config::GatewayConfig;
use crate::domain::connection::{ConnectionInfo, ConnectionMeta};
use crate::domain::envelope::WireEnvelope;
use crate::domain::error::ApiError;
use crate::ports::CredentialRegistry;
use crate::router::RpcRouter;
use crate::transport::exchange::{batch_status, error_reply, run_exchange};
use crate::transport::pending::PendingExchangeStore;
use crate::transport::{ExchangeTransport, HttpReply, Transport};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde_json::Value;
use shared_bus::{KeyValueStore, ReplayGuard, ReplayKey};
use shared_crypto::{
    compress, decompress, decrypt, encrypt, unwrap_key, verify_timestamp, wrap_key, BodyEncoding,
    RsaPrivateKey, SessionKey,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Header names of the authenticated transport.
pub mod headers {
    pub const CLIENT: &str = "x-courier-client";
    pub const VERSION: &str = "x-courier-version";
    pub const TS: &str = "x-courier-ts";
    pub const TS_SIG: &str = "x-courier-ts-sig";
    pub const KEY: &str = "x-courier-key";
    pub const ENCODING: &str = "x-courier-encoding";
}

/// One inbound authenticated request. Headers live in `meta`.
#[derive(Debug, Clone)]
pub struct AuthenticatedRequest {
    pub meta: ConnectionMeta,
    pub api: String,
    pub body: Bytes,
}

fn header<'a>(req: &'a AuthenticatedRequest, name: &str) -> Option<&'a str> {
    req.meta.headers.get(name).map(String::as_str)
}

struct OpenedRequest {
    client_id: String,
    reply_key: SessionKey,
    wrapped_reply_key: String,
    request: WireEnvelope,
}

/// Seal a reply batch under `key`: JSON, compressed above the threshold,
/// then encrypted.
pub fn seal_body(
    key: &SessionKey,
    settings: &CodecSettings,
    json: &[u8],
) -> Result<(BodyEncoding, Vec<u8>), ApiError> {
    let encoding = BodyEncoding::for_len(json.len(), settings.compression_threshold);
    let compressed = compress(encoding, json).map_err(|e| ApiError::internal(e.to_string()))?;
    Ok((encoding, encrypt(key, settings.iv_mode, &compressed)))
}

/// Reverse of [`seal_body`].
pub fn open_body(
    key: &SessionKey,
    settings: &CodecSettings,
    encoding: BodyEncoding,
    sealed: &[u8],
) -> Result<Vec<u8>, ApiError> {
    let compressed = decrypt(key, settings.iv_mode, sealed).map_err(|e| ApiError::decrypt_failed(e.to_string()))?;
    decompress(encoding, &compressed, settings.max_body_bytes).map_err(|e| ApiError::decrypt_failed(e.to_string()))
}

pub struct AuthenticatedAdapter {
    router: Arc<RpcRouter>,
    pending: Arc<PendingExchangeStore>,
    credentials: Arc<dyn CredentialRegistry>,
    replay: ReplayGuard,
    private_key: Arc<RsaPrivateKey>,
    protocol_version: String,
    codec: CodecSettings,
}

impl AuthenticatedAdapter {
    pub fn new(
        router: Arc<RpcRouter>,
        pending: Arc<PendingExchangeStore>,
        credentials: Arc<dyn CredentialRegistry>,
        store: Arc<dyn KeyValueStore>,
        private_key: Arc<RsaPrivateKey>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            router,
            pending,
            credentials,
            replay: ReplayGuard::with_config(
                store,
                config.authenticated.replay_ttl,
                config.authenticated.timestamp_tolerance,
            ),
            private_key,
            protocol_version: config.authenticated.protocol_version.clone(),
            codec: CodecSettings::from(&config.codec),
        }
    }

    pub async fn handle(&self, req: AuthenticatedRequest) -> HttpReply {
        let now = self.router.now_ms();
        let opened = match self.open(&req, now).await {
            Ok(opened) => opened,
            Err(error) => {
                warn!(
                    api = %req.api,
                    client = header(&req, headers::CLIENT).unwrap_or("-"),
                    code = %error.code,
                    "Authenticated request rejected: {}",
                    error.message
                );
                return error_reply(&req.api, now, &error);
            }
        };

        let (transport, rx) = ExchangeTransport::new();
        let conn = ConnectionInfo::new(req.meta, Transport::HttpsAuthenticated(transport), now);
        conn.set_client_id(opened.client_id.as_str());
        debug!(conn = %conn.id(), client_id = %opened.client_id, api = %req.api, "Authenticated exchange");

        let request = opened.request.clone();
        let batch = run_exchange(&self.router, &self.pending, conn, rx, request)
            .await
            .unwrap_or_else(|| {
                vec![opened
                    .request
                    .respond_error(&ApiError::internal("exchange closed without a reply"))]
            });
        self.seal_reply(&opened.reply_key, &opened.wrapped_reply_key, &batch)
    }

    async fn open(&self, req: &AuthenticatedRequest, now: i64) -> Result<OpenedRequest, ApiError> {
        let client_id = header(req, headers::CLIENT).unwrap_or_default();
        let credential = self
            .credentials
            .get_credential(client_id)
            .await?
            .ok_or_else(|| ApiError::invalid_client(client_id))?;
        let public_key = credential
            .public_key
            .as_ref()
            .ok_or_else(|| ApiError::invalid_client(client_id))?;

        if !credential.permits(req.meta.ip) {
            return Err(ApiError::unauthorized(format!(
                "{client_id} may not call from {}",
                req.meta.ip.map_or_else(|| "unknown address".to_string(), |ip| ip.to_string())
            )));
        }

        let version = header(req, headers::VERSION).unwrap_or_default();
        if version != self.protocol_version {
            return Err(ApiError::invalid_version(version, &self.protocol_version));
        }

        let ts: i64 = header(req, headers::TS)
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| ApiError::invalid_request_ts("missing or non-numeric timestamp"))?;
        let signature = header(req, headers::TS_SIG)
            .and_then(|v| STANDARD.decode(v.trim()).ok())
            .ok_or_else(|| ApiError::invalid_request_ts("missing timestamp signature"))?;
        verify_timestamp(public_key, ts, &signature)
            .map_err(|_| ApiError::invalid_request_ts("timestamp signature does not verify"))?;
        self.replay.check_freshness(ts, now)?;

        let encoding_name = header(req, headers::ENCODING).unwrap_or("identity");
        let encoding: BodyEncoding = encoding_name
            .parse()
            .map_err(|_| ApiError::invalid_encoding(encoding_name))?;

        self.replay
            .validate_and_insert(&ReplayKey::new(ts, client_id, &req.api, &req.body), now)
            .await?;

        let wrapped = header(req, headers::KEY)
            .and_then(|v| STANDARD.decode(v.trim()).ok())
            .ok_or_else(|| ApiError::decrypt_failed("missing wrapped key"))?;
        let key = unwrap_key(&self.private_key, &wrapped).map_err(|e| ApiError::decrypt_failed(e.to_string()))?;

        let json = open_body(&key, &self.codec, encoding, &req.body)?;
        let params = if json.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&json).map_err(|e| ApiError::invalid_params(e.to_string()))?
        };

        let reply_key = SessionKey::generate();
        let wrapped_reply_key = wrap_key(public_key, &reply_key)
            .map(|wrapped| STANDARD.encode(wrapped))
            .map_err(|e| ApiError::internal(format!("cannot wrap reply key: {e}")))?;

        Ok(OpenedRequest {
            client_id: client_id.to_string(),
            reply_key,
            wrapped_reply_key,
            request: WireEnvelope::request(req.api.as_str(), ts, params),
        })
    }

    fn seal_reply(&self, key: &SessionKey, wrapped_key: &str, batch: &[WireEnvelope]) -> HttpReply {
        let sealed = serialize_batch(batch)
            .map_err(|e| ApiError::internal(e.to_string()))
            .and_then(|json| seal_body(key, &self.codec, &json));
        match sealed {
            Ok((encoding, body)) => HttpReply::new(batch_status(batch), body)
                .with_header("content-type", "application/octet-stream")
                .with_header(headers::KEY, wrapped_key)
                .with_header(headers::ENCODING, encoding.as_str()),
            Err(error) => HttpReply::json(500, &error),
        }
    }
}

/// Decode a reply produced by [`AuthenticatedAdapter`]: sealed when the
/// encoding header is present, plaintext JSON otherwise. A sealed reply's key
/// arrives in `key_header`, wrapped for `private_key`.
pub fn open_reply(
    private_key: &RsaPrivateKey,
    settings: &CodecSettings,
    key_header: Option<&str>,
    encoding_header: Option<&str>,
    body: &[u8],
) -> Result<Vec<WireEnvelope>, ApiError> {
    let json = match encoding_header {
        None => body.to_vec(),
        Some(name) => {
            let encoding: BodyEncoding = name.parse().map_err(|_| ApiError::invalid_encoding(name))?;
            let wrapped = key_header
                .and_then(|v| STANDARD.decode(v.trim()).ok())
                .ok_or_else(|| ApiError::decrypt_failed("missing reply key"))?;
            let key = unwrap_key(private_key, &wrapped).map_err(|e| ApiError::decrypt_failed(e.to_string()))?;
            open_body(&key, settings, encoding, body)?
        }
    };
    parse_batch(&json).map_err(|e| ApiError::invalid_params(format!("malformed reply: {e}")))
}
