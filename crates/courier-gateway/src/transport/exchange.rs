//! Shared plumbing for one-shot HTTP exchanges.

use crate::domain::connection::ConnectionInfo;
use crate::domain::envelope::WireEnvelope;
use crate::domain::error::ApiError;
use crate::ports::CloseReason;
use crate::router::RpcRouter;
use crate::transport::pending::PendingExchangeStore;
use crate::transport::HttpReply;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Dispatch `request` on `conn` and wait for the reply batch.
///
/// The exchange is tracked in `pending` while it runs and closed afterwards.
/// `None` means the connection was closed without a reply.
pub async fn run_exchange(
    router: &Arc<RpcRouter>,
    pending: &PendingExchangeStore,
    conn: Arc<ConnectionInfo>,
    reply: oneshot::Receiver<Vec<WireEnvelope>>,
    request: WireEnvelope,
) -> Option<Vec<WireEnvelope>> {
    pending.register(&conn, &request, router.now_ms());

    let task_router = Arc::clone(router);
    let task_conn = Arc::clone(&conn);
    tokio::spawn(async move {
        task_router.dispatch(&task_conn, request).await;
        // Release the waiter if dispatch produced nothing.
        task_conn.with_transport(|t| t.close());
    });

    let batch = reply.await.ok();
    pending.complete(conn.id());
    router.close_connection(&conn, CloseReason::Completed).await;
    batch
}

/// HTTP status for a reply batch: taken from the leading envelope's error.
pub fn batch_status(batch: &[WireEnvelope]) -> u16 {
    batch
        .first()
        .and_then(WireEnvelope::api_error)
        .map_or(200, |e| e.http_status())
}

/// Plain JSON reply carrying a single error envelope.
pub fn error_reply(api: &str, ts: i64, error: &ApiError) -> HttpReply {
    let envelope = WireEnvelope::request(api, ts, Value::Null).respond_error(error);
    HttpReply::json(error.http_status(), &[envelope])
}

pub fn params_from_query(query: &HashMap<String, String>) -> Map<String, Value> {
    query
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect()
}

/// Decode a request body by content type: JSON object or url-encoded form.
pub fn params_from_body(content_type: Option<&str>, body: &[u8]) -> Result<Map<String, Value>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|m| m.trim().to_ascii_lowercase())
        .unwrap_or_default();

    if mime == "application/x-www-form-urlencoded" {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(body)
            .map_err(|e| ApiError::invalid_params(format!("malformed form body: {e}")))?;
        return Ok(pairs.into_iter().map(|(k, v)| (k, Value::String(v))).collect());
    }

    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ApiError::invalid_params("JSON body must be an object")),
        Err(e) => Err(ApiError::invalid_params(format!("malformed JSON body: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::connection::{ConnectionMeta, TransportKind};
    use crate::domain::error::codes;
    use crate::transport::{ExchangeTransport, Transport};
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_form_and_json_bodies() {
        let form = params_from_body(Some("application/x-www-form-urlencoded; charset=utf-8"), b"a=1&b=two").unwrap();
        assert_eq!(form["b"], "two");

        let json = params_from_body(Some("application/json"), br#"{"n": 3}"#).unwrap();
        assert_eq!(json["n"], 3);

        assert!(params_from_body(None, b"").unwrap().is_empty());
        assert!(params_from_body(Some("application/json"), b"[1]").is_err());
    }

    #[test]
    fn test_batch_status() {
        let req = WireEnvelope::request("x", 1, Value::Null);
        assert_eq!(batch_status(&[req.respond(json!({}))]), 200);
        assert_eq!(batch_status(&[req.respond_error(&ApiError::unknown_api("x"))]), 404);
    }

    #[tokio::test]
    async fn test_exchange_round_trip() {
        let router = RpcRouter::builder("w1").build();
        router.register_api("echo", |ctx| async move { Ok(ctx.params().clone()) }).unwrap();
        let pending = PendingExchangeStore::new(Duration::from_secs(60));

        let (transport, rx) = ExchangeTransport::new();
        let conn = ConnectionInfo::new(ConnectionMeta::new(TransportKind::Http), Transport::Http(transport), 0);
        let batch = run_exchange(
            &router,
            &pending,
            conn.clone(),
            rx,
            WireEnvelope::request("echo", 5, json!({"k": "v"})),
        )
        .await
        .unwrap();

        assert_eq!(batch[0].data()["k"], "v");
        assert!(!conn.is_live());
        assert_eq!(pending.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_api_over_exchange() {
        let router = RpcRouter::builder("w1").build();
        let pending = PendingExchangeStore::new(Duration::from_secs(60));
        let (transport, rx) = ExchangeTransport::new();
        let conn = ConnectionInfo::new(ConnectionMeta::new(TransportKind::Http), Transport::Http(transport), 0);

        let batch = run_exchange(&router, &pending, conn, rx, WireEnvelope::request("nope", 1, Value::Null))
            .await
            .unwrap();
        assert_eq!(batch[0].error_code(), Some(codes::UNKNOWN_API));
    }
}
