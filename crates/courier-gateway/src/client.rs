//! Client side of the authenticated transport.
//!
//! Every call generates a fresh session key, wraps it for the target, signs
//! the current timestamp and seals the JSON parameters. The reply carries its
//! own key, wrapped for this server, which opens the reply batch.

use crate::codec::CodecSettings;
use crate::domain::config::GatewayConfig;
use crate::domain::connection::ConnectionMeta;
use crate::domain::envelope::{EnvelopeType, WireEnvelope};
use crate::domain::error::ApiError;
use crate::ports::{CredentialRegistry, SystemTimeSource, TimeSource};
use crate::transport::authenticated::{headers, open_reply, seal_body, AuthenticatedRequest};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use reqwest::Client;
use serde_json::Value;
use shared_crypto::{sign_timestamp, wrap_key, RsaPrivateKey, SessionKey};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors from an outgoing authenticated call.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Rejected locally or by the remote side.
    #[error("{0}")]
    Api(ApiError),
}

impl From<ApiError> for ClientError {
    fn from(error: ApiError) -> Self {
        Self::Api(error)
    }
}

/// Response data plus the events piggybacked on it.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    pub data: Value,
    pub events: Vec<WireEnvelope>,
}

/// A sealed request, ready to send.
#[derive(Debug)]
pub struct PreparedCall {
    pub url: String,
    pub api: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
    private_key: Arc<RsaPrivateKey>,
    codec: CodecSettings,
}

impl PreparedCall {
    /// The request as the receiving adapter sees it.
    pub fn to_request(&self, meta: ConnectionMeta) -> AuthenticatedRequest {
        let meta = self
            .headers
            .iter()
            .fold(meta, |meta, (name, value)| meta.with_header(name, value.as_str()));
        AuthenticatedRequest {
            meta,
            api: self.api.clone(),
            body: Bytes::from(self.body.clone()),
        }
    }

    /// Decode a reply from its `x-courier-key` and `x-courier-encoding`
    /// headers: the first envelope is the response, the rest are piggybacked
    /// events.
    pub fn open_reply(&self, key: Option<&str>, encoding: Option<&str>, body: &[u8]) -> Result<CallOutcome, ApiError> {
        let mut batch = open_reply(&self.private_key, &self.codec, key, encoding, body)?.into_iter();
        let response = batch
            .next()
            .ok_or_else(|| ApiError::internal(format!("empty reply to {}", self.api)))?;
        if let Some(error) = response.api_error() {
            return Err(error);
        }
        if response.kind() != EnvelopeType::RequestResponse {
            return Err(ApiError::internal(format!("reply to {} is not a response", self.api)));
        }
        Ok(CallOutcome {
            data: response.into_data(),
            events: batch.collect(),
        })
    }
}

/// Makes signed, encrypted calls to other servers.
pub struct AuthenticatedClient {
    http: Client,
    client_id: String,
    private_key: Arc<RsaPrivateKey>,
    credentials: Arc<dyn CredentialRegistry>,
    protocol_version: String,
    codec: CodecSettings,
    clock: Arc<dyn TimeSource>,
    scheme: &'static str,
}

impl AuthenticatedClient {
    /// `client_id` is how this server is known to its peers.
    pub fn new(
        client_id: impl Into<String>,
        private_key: Arc<RsaPrivateKey>,
        credentials: Arc<dyn CredentialRegistry>,
        config: &GatewayConfig,
    ) -> Result<Self, ClientError> {
        let http = Client::builder()
            .timeout(config.authenticated.request_timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            client_id: client_id.into(),
            private_key,
            credentials,
            protocol_version: config.authenticated.protocol_version.clone(),
            codec: CodecSettings::from(&config.codec),
            clock: Arc::new(SystemTimeSource),
            scheme: "http",
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Use `https` for target URLs.
    pub fn with_tls(mut self) -> Self {
        self.scheme = "https";
        self
    }

    /// Build the sealed request for `api` on `target`.
    pub async fn prepare(&self, target: &str, api: &str, params: &Value) -> Result<PreparedCall, ApiError> {
        let credential = self
            .credentials
            .get_credential(target)
            .await?
            .ok_or_else(|| ApiError::invalid_client(target))?;
        let public_key = credential
            .public_key
            .as_ref()
            .ok_or_else(|| ApiError::invalid_client(target))?;

        let ts = self.clock.now_ms();
        let signature = sign_timestamp(&self.private_key, ts).map_err(|e| ApiError::internal(e.to_string()))?;
        let key = SessionKey::generate();
        let wrapped = wrap_key(public_key, &key).map_err(|e| ApiError::internal(e.to_string()))?;
        let json = serde_json::to_vec(params).map_err(|e| ApiError::invalid_params(e.to_string()))?;
        let (encoding, body) = seal_body(&key, &self.codec, &json)?;

        Ok(PreparedCall {
            url: format!("{}://{}:{}/s2s/{}", self.scheme, credential.host, credential.port, api),
            api: api.to_string(),
            headers: vec![
                (headers::CLIENT, self.client_id.clone()),
                (headers::VERSION, self.protocol_version.clone()),
                (headers::TS, ts.to_string()),
                (headers::TS_SIG, STANDARD.encode(signature)),
                (headers::KEY, STANDARD.encode(wrapped)),
                (headers::ENCODING, encoding.as_str().to_string()),
            ],
            body,
            private_key: Arc::clone(&self.private_key),
            codec: self.codec,
        })
    }

    /// Call `api` on `target` and wait for its response.
    pub async fn call(&self, target: &str, api: &str, params: Value) -> Result<CallOutcome, ClientError> {
        let prepared = self.prepare(target, api, &params).await?;
        debug!(peer = target, api, url = %prepared.url, body_len = prepared.body.len(), "Authenticated call");

        let mut request = self
            .http
            .post(&prepared.url)
            .header("content-type", "application/octet-stream");
        for (name, value) in &prepared.headers {
            request = request.header(*name, value.as_str());
        }
        let response = request.body(prepared.body.clone()).send().await?;

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let (key, encoding) = (header(headers::KEY), header(headers::ENCODING));
        let body = response.bytes().await?;
        Ok(prepared.open_reply(key.as_deref(), encoding.as_deref(), &body)?)
    }
}
