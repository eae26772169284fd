//! Courier error types.
//!
//! [`ApiError`] is what crosses the wire: a stable string code plus a human
//! message, carried in the `errorCode` / `errorMessage` fields of a response
//! envelope. [`GatewayError`] covers failures of the gateway itself.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable error codes surfaced to clients.
pub mod codes {
    // Authenticated transport rejections
    pub const INVALID_CLIENT: &str = "INVALID_CLIENT";
    pub const INVALID_VERSION: &str = "INVALID_VERSION";
    pub const INVALID_REQUEST_TS: &str = "INVALID_REQUEST_TS";
    pub const INVALID_ENCODING: &str = "INVALID_ENCODING";
    pub const REQUEST_REPLAY: &str = "REQUEST_REPLAY";
    pub const REQUEST_TIMED_OUT: &str = "REQUEST_TIMED_OUT";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";

    // Plaintext transport
    pub const INVALID_REQUEST_METHOD: &str = "INVALID_REQUEST_METHOD";

    // Routing
    pub const UNKNOWN_API: &str = "UNKNOWN_API";
    pub const UNKNOWN_EVENT: &str = "UNKNOWN_EVENT";

    // Framing and session
    pub const INVALID_HANDSHAKE: &str = "INVALID_HANDSHAKE";
    pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
    pub const DECRYPT_FAILED: &str = "DECRYPT_FAILED";
    pub const VERIFICATION_FAILED: &str = "VERIFICATION_FAILED";

    // Server side
    pub const STORE_UNAVAILABLE: &str = "STORE_UNAVAILABLE";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Error returned by handlers and boundary checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    /// Stable error code (see [`codes`]).
    pub code: String,
    /// Human readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured detail.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn invalid_client(client_id: &str) -> Self {
        Self::new(codes::INVALID_CLIENT, format!("Unknown client: {client_id}"))
    }

    pub fn invalid_version(got: &str, expected: &str) -> Self {
        Self::new(
            codes::INVALID_VERSION,
            format!("Protocol version {got:?} does not match {expected:?}"),
        )
    }

    pub fn invalid_request_ts(details: impl Into<String>) -> Self {
        Self::new(codes::INVALID_REQUEST_TS, details.into())
    }

    pub fn invalid_encoding(encoding: &str) -> Self {
        Self::new(
            codes::INVALID_ENCODING,
            format!("Unsupported body encoding: {encoding}"),
        )
    }

    pub fn invalid_request_method(method: &str) -> Self {
        Self::new(
            codes::INVALID_REQUEST_METHOD,
            format!("Request method {method} is not supported"),
        )
    }

    pub fn request_replay() -> Self {
        Self::new(codes::REQUEST_REPLAY, "Request was already processed")
    }

    pub fn request_timed_out(api: &str) -> Self {
        Self::new(
            codes::REQUEST_TIMED_OUT,
            format!("No response produced for {api} in time"),
        )
    }

    pub fn unauthorized(details: impl Into<String>) -> Self {
        Self::new(codes::UNAUTHORIZED, details.into())
    }

    pub fn unknown_api(name: &str) -> Self {
        Self::new(codes::UNKNOWN_API, format!("Unknown API: {name}"))
    }

    pub fn unknown_event(name: &str) -> Self {
        Self::new(codes::UNKNOWN_EVENT, format!("Unknown event: {name}"))
    }

    pub fn invalid_handshake(details: impl Into<String>) -> Self {
        Self::new(codes::INVALID_HANDSHAKE, details.into())
    }

    pub fn invalid_params(details: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, details.into())
    }

    pub fn decrypt_failed(details: impl Into<String>) -> Self {
        Self::new(codes::DECRYPT_FAILED, details.into())
    }

    pub fn verification_failed(details: impl Into<String>) -> Self {
        Self::new(codes::VERIFICATION_FAILED, details.into())
    }

    pub fn store_unavailable(details: impl Into<String>) -> Self {
        Self::new(codes::STORE_UNAVAILABLE, details.into())
    }

    pub fn internal(details: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, details.into())
    }

    /// HTTP status used when this error is the whole reply of an exchange.
    pub fn http_status(&self) -> u16 {
        match self.code.as_str() {
            codes::INVALID_CLIENT | codes::UNAUTHORIZED => 401,
            codes::INVALID_REQUEST_METHOD => 405,
            codes::REQUEST_REPLAY => 409,
            codes::REQUEST_TIMED_OUT => 504,
            codes::UNKNOWN_API | codes::UNKNOWN_EVENT => 404,
            codes::STORE_UNAVAILABLE => 503,
            codes::INTERNAL_ERROR => 500,
            _ => 400,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

/// Failures of the gateway itself (startup, registration, I/O).
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::domain::config::ConfigError),

    #[error("{kind} handler already registered: {name}")]
    DuplicateHandler { kind: &'static str, name: String },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Server(String),

    #[error("Service already running")]
    AlreadyRunning,

    #[error(transparent)]
    Crypto(#[from] shared_crypto::CryptoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<shared_bus::ReplayError> for ApiError {
    fn from(err: shared_bus::ReplayError) -> Self {
        use shared_bus::ReplayError;
        match err {
            ReplayError::Replayed { .. } => ApiError::request_replay(),
            ReplayError::TimestampOutOfWindow { .. } => ApiError::invalid_request_ts(err.to_string()),
            ReplayError::StoreUnavailable(e) => ApiError::store_unavailable(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_bus::{ReplayError, StoreError};

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(ApiError::invalid_client("x").code, "INVALID_CLIENT");
        assert_eq!(ApiError::request_replay().code, "REQUEST_REPLAY");
        assert_eq!(ApiError::request_timed_out("a").code, "REQUEST_TIMED_OUT");
        assert_eq!(ApiError::unknown_api("nope").code, "UNKNOWN_API");
    }

    #[test]
    fn test_serialization_skips_empty_data() {
        let json = serde_json::to_value(ApiError::unauthorized("no")).unwrap();
        assert_eq!(json["code"], "UNAUTHORIZED");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn test_replay_error_mapping() {
        let replayed: ApiError = ReplayError::Replayed { key: "k".into() }.into();
        assert_eq!(replayed.code, codes::REQUEST_REPLAY);

        let stale: ApiError = ReplayError::TimestampOutOfWindow {
            timestamp: 0,
            skew_ms: 10,
            tolerance_ms: 5,
        }
        .into();
        assert_eq!(stale.code, codes::INVALID_REQUEST_TS);

        let down: ApiError = ReplayError::StoreUnavailable(StoreError::Unavailable("x".into())).into();
        assert_eq!(down.code, codes::STORE_UNAVAILABLE);
    }

    #[test]
    fn test_http_status() {
        assert_eq!(ApiError::invalid_client("c").http_status(), 401);
        assert_eq!(ApiError::request_timed_out("a").http_status(), 504);
        assert_eq!(ApiError::invalid_version("2", "1").http_status(), 400);
    }
}
