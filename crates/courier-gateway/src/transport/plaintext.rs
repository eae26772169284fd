//! Plaintext HTTP transport: `GET|POST /api/{name}[/{id}]`.

use crate::domain::connection::{ConnectionInfo, ConnectionMeta};
use crate::domain::envelope::WireEnvelope;
use crate::domain::error::ApiError;
use crate::router::RpcRouter;
use crate::transport::exchange::{batch_status, error_reply, params_from_body, params_from_query, run_exchange};
use crate::transport::pending::PendingExchangeStore;
use crate::transport::{ExchangeTransport, HttpReply, Transport};
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// One inbound plaintext request.
#[derive(Debug, Clone)]
pub struct PlainRequest {
    pub meta: ConnectionMeta,
    pub api: String,
    /// Optional trailing path segment, exposed to the handler as `id`.
    pub id: Option<String>,
    pub method: String,
    pub query: HashMap<String, String>,
    pub content_type: Option<String>,
    pub body: Bytes,
}

pub struct PlaintextAdapter {
    router: Arc<RpcRouter>,
    pending: Arc<PendingExchangeStore>,
}

impl PlaintextAdapter {
    pub fn new(router: Arc<RpcRouter>, pending: Arc<PendingExchangeStore>) -> Self {
        Self { router, pending }
    }

    pub async fn handle(&self, req: PlainRequest) -> HttpReply {
        let now = self.router.now_ms();
        let mut params = match req.method.as_str() {
            "GET" => params_from_query(&req.query),
            "POST" => {
                let mut params = params_from_query(&req.query);
                match params_from_body(req.content_type.as_deref(), &req.body) {
                    Ok(body) => params.extend(body),
                    Err(error) => return error_reply(&req.api, now, &error),
                }
                params
            }
            other => {
                warn!(api = %req.api, method = other, "Rejected plaintext request method");
                return error_reply(&req.api, now, &ApiError::invalid_request_method(other));
            }
        };
        if let Some(id) = req.id {
            params.insert("id".into(), Value::String(id));
        }

        let request = WireEnvelope::request(req.api.as_str(), now, Value::Object(params));
        let (transport, rx) = ExchangeTransport::new();
        let conn = ConnectionInfo::new(req.meta, Transport::Http(transport), now);
        debug!(conn = %conn.id(), api = %req.api, "Plaintext exchange");

        match run_exchange(&self.router, &self.pending, conn, rx, request).await {
            Some(batch) => HttpReply::json(batch_status(&batch), &batch),
            None => error_reply(&req.api, now, &ApiError::internal("exchange closed without a reply")),
        }
    }
}
