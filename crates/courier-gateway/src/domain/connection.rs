//! Per-connection state shared by the transport that owns the connection and
//! the router tasks dispatching its messages.

use crate::domain::envelope::WireEnvelope;
use crate::domain::error::ApiError;
use crate::transport::Transport;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::OnceCell;
use tracing::debug;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Which transport accepted the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Socket,
    Http,
    HttpsAuthenticated,
    HttpsThirdParty,
}

impl TransportKind {
    /// Whether the connection outlives a single request.
    pub fn is_persistent(self) -> bool {
        matches!(self, TransportKind::Socket)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Socket => "socket",
            TransportKind::Http => "http",
            TransportKind::HttpsAuthenticated => "https-authenticated",
            TransportKind::HttpsThirdParty => "https-third-party",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable facts about a connection, known when it is accepted.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    pub kind: TransportKind,
    pub host: String,
    pub port: u16,
    pub url: String,
    /// Header names are lowercase.
    pub headers: HashMap<String, String>,
    pub ip: Option<IpAddr>,
    /// Private sockets must verify to a client id.
    pub private: bool,
}

impl ConnectionMeta {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            host: String::new(),
            port: 0,
            url: String::new(),
            headers: HashMap::new(),
            ip: None,
            private: false,
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }
}

/// Result of running the verification hook.
pub type VerificationOutcome = Result<(), ApiError>;

/// Live state of one connection.
///
/// The transport provider goes from attached to detached exactly once, in
/// [`detach`](Self::detach). Every send re-checks it, so nothing is written
/// to a connection after it has been closed.
pub struct ConnectionInfo {
    id: ConnectionId,
    meta: ConnectionMeta,
    /// Client clock correction, set once at handshake.
    ms_offset: OnceLock<i64>,
    /// Highest admitted event ts (wire clock).
    last_event_ts: AtomicI64,
    last_activity_ms: AtomicI64,
    client_id: RwLock<Option<String>>,
    custom_data: RwLock<Value>,
    verification: OnceCell<VerificationOutcome>,
    provider: Mutex<Option<Transport>>,
}

impl ConnectionInfo {
    pub fn new(meta: ConnectionMeta, transport: Transport, now_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::next(),
            meta,
            ms_offset: OnceLock::new(),
            last_event_ts: AtomicI64::new(i64::MIN),
            last_activity_ms: AtomicI64::new(now_ms),
            client_id: RwLock::new(None),
            custom_data: RwLock::new(Value::Null),
            verification: OnceCell::new(),
            provider: Mutex::new(Some(transport)),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.meta.kind
    }

    pub fn meta(&self) -> &ConnectionMeta {
        &self.meta
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.meta.ip
    }

    pub fn is_private(&self) -> bool {
        self.meta.private
    }

    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.meta.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Cookie value from the `cookie` request header.
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.header("cookie")?.split(';').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key.trim() == name).then(|| value.trim().to_string())
        })
    }

    /// Record the clock correction. Only the first call has an effect.
    pub fn set_ms_offset(&self, offset: i64) -> bool {
        self.ms_offset.set(offset).is_ok()
    }

    pub fn ms_offset(&self) -> i64 {
        self.ms_offset.get().copied().unwrap_or(0)
    }

    pub fn last_event_ts(&self) -> i64 {
        self.last_event_ts.load(Ordering::Acquire)
    }

    /// Raise the event watermark to `ts`; never lowers it.
    pub fn advance_event_watermark(&self, ts: i64) {
        self.last_event_ts.fetch_max(ts, Ordering::AcqRel);
    }

    pub fn touch(&self, now_ms: i64) {
        self.last_activity_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    pub fn client_id(&self) -> Option<String> {
        self.client_id.read().clone()
    }

    pub fn set_client_id(&self, client_id: impl Into<String>) {
        *self.client_id.write() = Some(client_id.into());
    }

    pub fn custom_data(&self) -> Value {
        self.custom_data.read().clone()
    }

    pub fn set_custom_data(&self, data: Value) {
        *self.custom_data.write() = data;
    }

    /// Run `verify` once; concurrent callers wait for the same outcome.
    pub async fn verified_with<F, Fut>(&self, verify: F) -> &VerificationOutcome
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = VerificationOutcome>,
    {
        self.verification.get_or_init(verify).await
    }

    /// Verification outcome if it has been decided.
    pub fn verification(&self) -> Option<&VerificationOutcome> {
        self.verification.get()
    }

    pub fn verification_failed(&self) -> bool {
        matches!(self.verification.get(), Some(Err(_)))
    }

    pub fn is_live(&self) -> bool {
        self.provider.lock().is_some()
    }

    /// Queue `batch` as one write. Returns false if nothing was queued.
    pub fn send(&self, batch: Vec<WireEnvelope>) -> bool {
        if batch.is_empty() {
            return true;
        }
        let provider = self.provider.lock();
        match provider.as_ref() {
            Some(transport) => match transport.send(batch) {
                Ok(()) => true,
                Err(e) => {
                    debug!(conn = %self.id, error = %e, "Transport refused batch");
                    false
                }
            },
            None => {
                debug!(conn = %self.id, envelopes = batch.len(), "Dropped batch for closed connection");
                false
            }
        }
    }

    /// Run `f` against the attached transport, if any.
    pub fn with_transport<R>(&self, f: impl FnOnce(&Transport) -> R) -> Option<R> {
        self.provider.lock().as_ref().map(f)
    }

    /// Detach the transport. Returns it to exactly one caller.
    pub fn detach(&self) -> Option<Transport> {
        self.provider.lock().take()
    }
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("id", &self.id)
            .field("kind", &self.meta.kind)
            .field("client_id", &self.client_id())
            .field("live", &self.is_live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTransport;
    use serde_json::json;

    fn connection() -> (Arc<ConnectionInfo>, RecordingTransport) {
        let recorder = RecordingTransport::new();
        let meta = ConnectionMeta::new(TransportKind::Socket)
            .with_header("Cookie", "session=abc; theme=dark");
        (ConnectionInfo::new(meta, recorder.transport(), 0), recorder)
    }

    #[test]
    fn test_ids_are_unique() {
        let (a, _) = connection();
        let (b, _) = connection();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_ms_offset_set_once() {
        let (conn, _) = connection();
        assert_eq!(conn.ms_offset(), 0);
        assert!(conn.set_ms_offset(250));
        assert!(!conn.set_ms_offset(-9));
        assert_eq!(conn.ms_offset(), 250);
    }

    #[test]
    fn test_watermark_only_moves_forward() {
        let (conn, _) = connection();
        conn.advance_event_watermark(500);
        conn.advance_event_watermark(100);
        assert_eq!(conn.last_event_ts(), 500);
    }

    #[test]
    fn test_cookie_lookup() {
        let (conn, _) = connection();
        assert_eq!(conn.cookie("theme").as_deref(), Some("dark"));
        assert_eq!(conn.cookie("missing"), None);
    }

    #[test]
    fn test_no_send_after_detach() {
        let (conn, recorder) = connection();
        assert!(conn.send(vec![WireEnvelope::event("a", 1, json!({}))]));
        assert!(conn.detach().is_some());
        assert!(conn.detach().is_none());
        assert!(!conn.send(vec![WireEnvelope::event("b", 2, json!({}))]));
        assert_eq!(recorder.batches().len(), 1);
        assert!(!conn.is_live());
    }
}
