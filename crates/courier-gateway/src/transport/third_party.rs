//! Lenient third-party transport: `ANY /tp/{marker}/{name}[/{params}]`.
//!
//! The optional last path segment is base64 AES ciphertext of a JSON object,
//! keyed by the marker's shared secret. Query and body parameters are merged
//! on top. Methods other than GET and POST are logged and processed with
//! only the path parameters. Handlers may redirect and set cookies; the
//! reply body is the handler's data (or an error object).

use crate::codec::CodecSettings;
use crate::domain::connection::{ConnectionInfo, ConnectionMeta};
use crate::domain::envelope::WireEnvelope;
use crate::domain::error::ApiError;
use crate::ports::CredentialRegistry;
use crate::router::RpcRouter;
use crate::transport::exchange::{batch_status, params_from_body, params_from_query, run_exchange};
use crate::transport::pending::PendingExchangeStore;
use crate::transport::{ExchangeTransport, HttpReply, ThirdPartyControls, ThirdPartyTransport, Transport};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use shared_crypto::{decrypt, encrypt, SessionKey};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ThirdPartyRequest {
    pub meta: ConnectionMeta,
    pub marker: String,
    pub api: String,
    /// Encrypted path parameters, already percent-decoded.
    pub blob: Option<String>,
    pub method: String,
    pub query: HashMap<String, String>,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Encrypt path parameters the way [`ThirdPartyAdapter`] expects them.
pub fn seal_path_params(secret: &str, settings: &CodecSettings, params: &Value) -> String {
    let key = SessionKey::derive_from_secret(secret);
    let json = serde_json::to_vec(params).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(encrypt(&key, settings.iv_mode, &json))
}

fn open_path_params(secret: &str, settings: &CodecSettings, blob: &str) -> Result<Map<String, Value>, ApiError> {
    let key = SessionKey::derive_from_secret(secret);
    let sealed = URL_SAFE_NO_PAD
        .decode(blob.trim_end_matches('='))
        .or_else(|_| STANDARD.decode(blob))
        .map_err(|e| ApiError::decrypt_failed(format!("path parameters are not base64: {e}")))?;
    let json = decrypt(&key, settings.iv_mode, &sealed).map_err(|e| ApiError::decrypt_failed(e.to_string()))?;
    match serde_json::from_slice(&json) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(ApiError::invalid_params("path parameters must be a JSON object")),
    }
}

fn error_body(status: u16, error: &ApiError) -> HttpReply {
    HttpReply::json(
        status,
        &json!({ "errorCode": error.code, "errorMessage": error.message }),
    )
}

pub struct ThirdPartyAdapter {
    router: Arc<RpcRouter>,
    pending: Arc<PendingExchangeStore>,
    credentials: Arc<dyn CredentialRegistry>,
    markers: HashSet<String>,
    codec: CodecSettings,
}

impl ThirdPartyAdapter {
    pub fn new(
        router: Arc<RpcRouter>,
        pending: Arc<PendingExchangeStore>,
        credentials: Arc<dyn CredentialRegistry>,
        markers: impl IntoIterator<Item = String>,
        codec: CodecSettings,
    ) -> Self {
        Self {
            router,
            pending,
            credentials,
            markers: markers.into_iter().collect(),
            codec,
        }
    }

    pub async fn handle(&self, req: ThirdPartyRequest) -> HttpReply {
        let now = self.router.now_ms();
        let params = match self.collect_params(&req).await {
            Ok(params) => params,
            Err(error) => {
                warn!(marker = %req.marker, api = %req.api, code = %error.code, "Third-party request rejected: {}", error.message);
                return error_body(error.http_status(), &error);
            }
        };

        let controls = Arc::new(Mutex::new(ThirdPartyControls::default()));
        let (exchange, rx) = ExchangeTransport::new();
        let transport = Transport::HttpsThirdParty(ThirdPartyTransport::new(exchange, Arc::clone(&controls)));
        let conn = ConnectionInfo::new(req.meta, transport, now);
        conn.set_client_id(req.marker.as_str());
        debug!(conn = %conn.id(), marker = %req.marker, api = %req.api, "Third-party exchange");

        let request = WireEnvelope::request(req.api.as_str(), now, Value::Object(params));
        let batch = run_exchange(&self.router, &self.pending, conn, rx, request).await;
        let controls = controls.lock().clone();

        let mut reply = match (&controls.redirect, batch) {
            (Some(location), _) => HttpReply::new(302, Vec::new()).with_header("location", location.as_str()),
            (None, Some(batch)) => {
                let status = batch_status(&batch);
                match batch.into_iter().next() {
                    Some(first) => match first.api_error() {
                        Some(error) => error_body(status, &error),
                        None => HttpReply::json(status, first.data()),
                    },
                    None => HttpReply::json(200, &Value::Null),
                }
            }
            (None, None) => error_body(500, &ApiError::internal("exchange closed without a reply")),
        };
        for cookie in controls.cookies {
            reply = reply.with_header("set-cookie", cookie);
        }
        reply
    }

    async fn collect_params(&self, req: &ThirdPartyRequest) -> Result<Map<String, Value>, ApiError> {
        if !self.markers.contains(&req.marker) {
            return Err(ApiError::invalid_client(&req.marker));
        }
        let credential = self.credentials.get_credential(&req.marker).await?;
        if let Some(credential) = &credential {
            if !credential.permits(req.meta.ip) {
                return Err(ApiError::unauthorized(format!("{} may not call from this address", req.marker)));
            }
        }

        let mut params = match &req.blob {
            Some(blob) => {
                let secret = credential
                    .as_ref()
                    .and_then(|c| c.shared_secret.as_deref())
                    .ok_or_else(|| ApiError::invalid_client(&req.marker))?;
                open_path_params(secret, &self.codec, blob)?
            }
            None => Map::new(),
        };

        match req.method.as_str() {
            "GET" => params.extend(params_from_query(&req.query)),
            "POST" => {
                params.extend(params_from_query(&req.query));
                params.extend(params_from_body(req.content_type.as_deref(), &req.body)?);
            }
            other => {
                warn!(marker = %req.marker, api = %req.api, method = other, "Unsupported method, processing without extra parameters");
            }
        }
        Ok(params)
    }
}
