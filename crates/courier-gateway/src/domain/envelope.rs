//! Wire envelope: the one message shape every transport carries.

use crate::domain::error::ApiError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// System event names exchanged by the socket transport.
pub mod system {
    pub const PING: &str = "PING";
    pub const PONG: &str = "PONG";
    pub const CONFIG: &str = "CONFIG";
    pub const ERROR: &str = "ERROR";
}

/// Envelope kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeType {
    #[serde(rename = "REQUEST")]
    Request,
    #[serde(rename = "EVENT")]
    Event,
    #[serde(rename = "EPHEMERAL_EVENT")]
    EphemeralEvent,
    #[serde(rename = "REQ_RESP")]
    RequestResponse,
    #[serde(rename = "EVENT_RESP")]
    EventResponse,
    #[serde(rename = "SYSTEM_EVENT")]
    SystemEvent,
}

impl EnvelopeType {
    /// Response kind for an inbound kind, if it expects one.
    pub fn response_kind(self) -> Option<EnvelopeType> {
        match self {
            EnvelopeType::Request => Some(EnvelopeType::RequestResponse),
            EnvelopeType::Event => Some(EnvelopeType::EventResponse),
            _ => None,
        }
    }
}

/// One protocol message.
///
/// Immutable once built: fields are read through accessors and new envelopes
/// are produced by the constructors. `ts` of a response always echoes the
/// wire `ts` of the message it answers so the client can correlate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEnvelope {
    #[serde(rename = "type")]
    kind: EnvelopeType,
    name: String,
    ts: i64,
    #[serde(default)]
    data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    #[serde(skip)]
    binary: Option<Bytes>,
}

impl WireEnvelope {
    /// Build an envelope of any kind.
    pub fn new(kind: EnvelopeType, name: impl Into<String>, ts: i64, data: Value) -> Self {
        Self {
            kind,
            name: name.into(),
            ts,
            data,
            error_code: None,
            error_message: None,
            binary: None,
        }
    }

    pub fn request(name: impl Into<String>, ts: i64, data: Value) -> Self {
        Self::new(EnvelopeType::Request, name, ts, data)
    }

    pub fn event(name: impl Into<String>, ts: i64, data: Value) -> Self {
        Self::new(EnvelopeType::Event, name, ts, data)
    }

    pub fn ephemeral_event(name: impl Into<String>, ts: i64, data: Value) -> Self {
        Self::new(EnvelopeType::EphemeralEvent, name, ts, data)
    }

    pub fn system(name: impl Into<String>, ts: i64, data: Value) -> Self {
        Self::new(EnvelopeType::SystemEvent, name, ts, data)
    }

    /// Successful response to `self`.
    pub fn respond(&self, data: Value) -> Self {
        let kind = self.kind.response_kind().unwrap_or(EnvelopeType::RequestResponse);
        Self::new(kind, self.name.clone(), self.ts, data)
    }

    /// Error response to `self`.
    pub fn respond_error(&self, error: &ApiError) -> Self {
        let mut envelope = self.respond(error.data.clone().unwrap_or(Value::Null));
        envelope.error_code = Some(error.code.clone());
        envelope.error_message = Some(error.message.clone());
        envelope
    }

    /// System `ERROR` event carrying `error`.
    pub fn system_error(ts: i64, error: &ApiError) -> Self {
        let mut envelope = Self::system(system::ERROR, ts, Value::Null);
        envelope.error_code = Some(error.code.clone());
        envelope.error_message = Some(error.message.clone());
        envelope
    }

    /// Attach a raw binary payload (sent as a binary frame on sockets).
    pub fn with_binary(mut self, payload: impl Into<Bytes>) -> Self {
        self.binary = Some(payload.into());
        self
    }

    pub fn kind(&self) -> EnvelopeType {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ts(&self) -> i64 {
        self.ts
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error_code.as_deref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn binary(&self) -> Option<&Bytes> {
        self.binary.as_ref()
    }

    pub fn is_error(&self) -> bool {
        self.error_code.is_some()
    }

    /// The error carried by this envelope, if any.
    pub fn api_error(&self) -> Option<ApiError> {
        self.error_code.as_ref().map(|code| {
            let error = ApiError::new(code.clone(), self.error_message.clone().unwrap_or_default());
            if self.data.is_null() {
                error
            } else {
                error.with_data(self.data.clone())
            }
        })
    }

    pub fn is_system(&self, name: &str) -> bool {
        self.kind == EnvelopeType::SystemEvent && self.name == name
    }

    pub fn into_data(self) -> Value {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_field_names() {
        let env = WireEnvelope::request("ping", 1000, json!({"a": 1}));
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json, json!({"type": "REQUEST", "name": "ping", "ts": 1000, "data": {"a": 1}}));
    }

    #[test]
    fn test_response_echoes_ts_and_name() {
        let req = WireEnvelope::request("ping", 1000, Value::Null);
        let resp = req.respond(json!({"pong": true}));
        assert_eq!(resp.kind(), EnvelopeType::RequestResponse);
        assert_eq!(resp.name(), "ping");
        assert_eq!(resp.ts(), 1000);

        let ev = WireEnvelope::event("moved", 7, Value::Null);
        assert_eq!(ev.respond(Value::Null).kind(), EnvelopeType::EventResponse);
    }

    #[test]
    fn test_error_response_fields() {
        let req = WireEnvelope::request("nope", 5, Value::Null);
        let resp = req.respond_error(&ApiError::unknown_api("nope"));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["type"], "REQ_RESP");
        assert_eq!(json["errorCode"], "UNKNOWN_API");
        assert_eq!(json["ts"], 5);
        assert_eq!(resp.api_error().unwrap().code, "UNKNOWN_API");
    }

    #[test]
    fn test_missing_data_defaults_to_null() {
        let env: WireEnvelope =
            serde_json::from_str(r#"{"type":"SYSTEM_EVENT","name":"PING","ts":3}"#).unwrap();
        assert!(env.is_system(system::PING));
        assert!(env.data().is_null());
    }

    #[test]
    fn test_binary_is_not_serialized() {
        let env = WireEnvelope::event("file", 1, Value::Null).with_binary(vec![1u8, 2, 3]);
        let json = serde_json::to_string(&env).unwrap();
        assert!(!json.contains("binary"));
        assert_eq!(env.binary().map(|b| b.len()), Some(3));
    }
}
