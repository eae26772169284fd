//! RPC router: handler registries, dispatch and connection lifecycle.
//!
//! Transports hand every decoded envelope to [`RpcRouter::dispatch`]. The
//! router runs verification once per connection, looks up the handler, and
//! writes the response together with any piggybacked events as one batch.
//!
//! Event admission: an `EVENT` runs only if its `ts` is strictly greater than
//! the connection watermark read before the handler starts. The watermark
//! moves to the event `ts` after the response has been queued.

use crate::domain::connection::ConnectionInfo;
use crate::domain::envelope::{EnvelopeType, WireEnvelope};
use crate::domain::error::{ApiError, GatewayError};
use crate::domain::invocation::{Invocation, InvocationRecord};
use crate::ports::{CloseReason, ConnectionHooks, DefaultHooks, SystemTimeSource, TimeSource, VerifiedIdentity};
use crate::registry::ConnectionRegistry;
use crate::transport::Transport;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use shared_bus::{
    BusError, ChannelFilter, InMemoryKeyValueStore, InMemoryWorkerBus, KeyValueStore, KvCommand,
    StoreError, WorkerBus, WorkerMessage,
};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What a handler returns: response data or a wire error.
pub type HandlerResult = Result<Value, ApiError>;

type BoxedHandler = Arc<dyn Fn(CallContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Default lifetime of a presence key.
pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_secs(90);

/// Store key recording which worker holds a client.
pub fn presence_key(client_id: &str) -> String {
    format!("presence:{client_id}")
}

/// Everything a handler can reach during one invocation.
#[derive(Clone)]
pub struct CallContext {
    router: Arc<RpcRouter>,
    connection: Arc<ConnectionInfo>,
    invocation: Arc<Invocation>,
}

impl CallContext {
    pub fn record(&self) -> &InvocationRecord {
        self.invocation.record()
    }

    pub fn params(&self) -> &Value {
        &self.invocation.record().params
    }

    pub fn connection(&self) -> &Arc<ConnectionInfo> {
        &self.connection
    }

    pub fn router(&self) -> &Arc<RpcRouter> {
        &self.router
    }

    /// Queue an event that is written in the same batch as the response.
    /// Dropped if the handler fails.
    pub fn piggyback(&self, name: impl Into<String>, data: Value) {
        let envelope = WireEnvelope::event(name, self.router.now_ms(), data);
        self.invocation.queue_event(envelope);
    }

    /// Redirect the third-party caller. False on other transports.
    pub fn redirect(&self, location: impl Into<String>) -> bool {
        let location = location.into();
        self.connection
            .with_transport(|t| match t {
                Transport::HttpsThirdParty(tp) => {
                    tp.redirect(location);
                    true
                }
                _ => false,
            })
            .unwrap_or(false)
    }

    /// Set a cookie on the third-party reply. False on other transports.
    pub fn set_cookie(&self, cookie: impl Into<String>) -> bool {
        let cookie = cookie.into();
        self.connection
            .with_transport(|t| match t {
                Transport::HttpsThirdParty(tp) => {
                    tp.set_cookie(cookie);
                    true
                }
                _ => false,
            })
            .unwrap_or(false)
    }
}

/// Builder for [`RpcRouter`].
pub struct RouterBuilder {
    worker_id: String,
    hooks: Arc<dyn ConnectionHooks>,
    store: Arc<dyn KeyValueStore>,
    bus: Arc<dyn WorkerBus>,
    clock: Arc<dyn TimeSource>,
    presence_ttl: Duration,
}

impl RouterBuilder {
    pub fn hooks(mut self, hooks: Arc<dyn ConnectionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = store;
        self
    }

    pub fn bus(mut self, bus: Arc<dyn WorkerBus>) -> Self {
        self.bus = bus;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    pub fn presence_ttl(mut self, ttl: Duration) -> Self {
        self.presence_ttl = ttl;
        self
    }

    pub fn build(self) -> Arc<RpcRouter> {
        Arc::new(RpcRouter {
            worker_id: self.worker_id,
            apis: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
            hooks: self.hooks,
            clients: ConnectionRegistry::new(),
            store: self.store,
            bus: self.bus,
            clock: self.clock,
            presence_ttl: self.presence_ttl,
        })
    }
}

/// Central dispatcher shared by all transports of one worker.
pub struct RpcRouter {
    worker_id: String,
    apis: RwLock<HashMap<String, BoxedHandler>>,
    events: RwLock<HashMap<String, BoxedHandler>>,
    hooks: Arc<dyn ConnectionHooks>,
    clients: ConnectionRegistry,
    store: Arc<dyn KeyValueStore>,
    bus: Arc<dyn WorkerBus>,
    clock: Arc<dyn TimeSource>,
    presence_ttl: Duration,
}

impl RpcRouter {
    /// Start building a router for `worker_id` with in-memory collaborators.
    pub fn builder(worker_id: impl Into<String>) -> RouterBuilder {
        RouterBuilder {
            worker_id: worker_id.into(),
            hooks: Arc::new(DefaultHooks),
            store: Arc::new(InMemoryKeyValueStore::new()),
            bus: Arc::new(InMemoryWorkerBus::new()),
            clock: Arc::new(SystemTimeSource),
            presence_ttl: DEFAULT_PRESENCE_TTL,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn clock(&self) -> Arc<dyn TimeSource> {
        Arc::clone(&self.clock)
    }

    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.store)
    }

    pub fn clients(&self) -> &ConnectionRegistry {
        &self.clients
    }

    /// Register a request handler. A name can be registered once.
    pub fn register_api<F, Fut>(&self, name: &str, handler: F) -> Result<(), GatewayError>
    where
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self::register(&self.apis, "API", name, handler)
    }

    /// Register an event handler (used for both `EVENT` and `EPHEMERAL_EVENT`).
    pub fn register_event<F, Fut>(&self, name: &str, handler: F) -> Result<(), GatewayError>
    where
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self::register(&self.events, "Event", name, handler)
    }

    fn register<F, Fut>(
        registry: &RwLock<HashMap<String, BoxedHandler>>,
        kind: &'static str,
        name: &str,
        handler: F,
    ) -> Result<(), GatewayError>
    where
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let mut handlers = registry.write();
        if handlers.contains_key(name) {
            return Err(GatewayError::DuplicateHandler {
                kind,
                name: name.to_string(),
            });
        }
        let boxed: BoxedHandler = Arc::new(move |ctx| handler(ctx).boxed());
        handlers.insert(name.to_string(), boxed);
        debug!(kind, name, "Handler registered");
        Ok(())
    }

    pub fn has_api(&self, name: &str) -> bool {
        self.apis.read().contains_key(name)
    }

    fn api(&self, name: &str) -> Option<BoxedHandler> {
        self.apis.read().get(name).cloned()
    }

    fn event(&self, name: &str) -> Option<BoxedHandler> {
        self.events.read().get(name).cloned()
    }

    /// Route one inbound envelope from `conn`.
    pub async fn dispatch(self: &Arc<Self>, conn: &Arc<ConnectionInfo>, envelope: WireEnvelope) {
        match envelope.kind() {
            EnvelopeType::SystemEvent => {
                debug!(conn = %conn.id(), name = envelope.name(), "System event ignored by router");
                return;
            }
            EnvelopeType::RequestResponse | EnvelopeType::EventResponse => {
                warn!(conn = %conn.id(), name = envelope.name(), "Unexpected response envelope from peer");
                return;
            }
            EnvelopeType::Request | EnvelopeType::Event | EnvelopeType::EphemeralEvent => {}
        }

        if let Err(error) = self.verify_connection(conn).await {
            // Sockets were told once through a system event.
            if !conn.kind().is_persistent() && envelope.kind().response_kind().is_some() {
                conn.send(vec![envelope.respond_error(&error)]);
            }
            return;
        }

        match envelope.kind() {
            EnvelopeType::Request => {
                let batch = self.route_request(conn, &envelope).await;
                conn.send(batch);
            }
            EnvelopeType::Event => self.route_event(conn, &envelope).await,
            _ => self.route_ephemeral(conn, &envelope).await,
        }
    }

    /// Run the request handler and build the reply batch.
    pub async fn route_request(
        self: &Arc<Self>,
        conn: &Arc<ConnectionInfo>,
        envelope: &WireEnvelope,
    ) -> Vec<WireEnvelope> {
        match self.api(envelope.name()) {
            Some(handler) => self.execute(handler, conn, envelope).await,
            None => {
                warn!(conn = %conn.id(), api = envelope.name(), "Unknown API requested");
                vec![envelope.respond_error(&ApiError::unknown_api(envelope.name()))]
            }
        }
    }

    /// Admit, run and acknowledge one event.
    pub async fn route_event(self: &Arc<Self>, conn: &Arc<ConnectionInfo>, envelope: &WireEnvelope) {
        let watermark = conn.last_event_ts();
        if envelope.ts() <= watermark {
            debug!(
                conn = %conn.id(),
                event = envelope.name(),
                ts = envelope.ts(),
                watermark,
                "Stale event acknowledged without dispatch"
            );
            conn.send(vec![envelope.respond(Value::Null)]);
            return;
        }

        let batch = match self.event(envelope.name()) {
            Some(handler) => self.execute(handler, conn, envelope).await,
            None => {
                warn!(conn = %conn.id(), event = envelope.name(), "Unknown event");
                vec![envelope.respond_error(&ApiError::unknown_event(envelope.name()))]
            }
        };
        conn.send(batch);
        conn.advance_event_watermark(envelope.ts());
    }

    /// Run an ephemeral event. No watermark, no response, errors swallowed.
    pub async fn route_ephemeral(self: &Arc<Self>, conn: &Arc<ConnectionInfo>, envelope: &WireEnvelope) {
        let Some(handler) = self.event(envelope.name()) else {
            warn!(conn = %conn.id(), event = envelope.name(), "Unknown ephemeral event");
            return;
        };
        let (invocation, result) = self.invoke(handler, conn, envelope).await;
        match result {
            Ok(_) => {
                conn.send(invocation.take_events());
            }
            Err(error) => {
                warn!(conn = %conn.id(), event = envelope.name(), error = %error, "Ephemeral handler failed");
            }
        }
    }

    async fn execute(
        self: &Arc<Self>,
        handler: BoxedHandler,
        conn: &Arc<ConnectionInfo>,
        envelope: &WireEnvelope,
    ) -> Vec<WireEnvelope> {
        let (invocation, result) = self.invoke(handler, conn, envelope).await;
        match result {
            Ok(data) => {
                let mut batch = vec![envelope.respond(data)];
                batch.extend(invocation.take_events());
                batch
            }
            Err(error) => {
                let dropped = invocation.take_events().len();
                error!(
                    conn = %conn.id(),
                    name = envelope.name(),
                    code = %error.code,
                    dropped_events = dropped,
                    "Handler failed: {}",
                    error.message
                );
                vec![envelope.respond_error(&error)]
            }
        }
    }

    async fn invoke(
        self: &Arc<Self>,
        handler: BoxedHandler,
        conn: &Arc<ConnectionInfo>,
        envelope: &WireEnvelope,
    ) -> (Arc<Invocation>, HandlerResult) {
        let invocation = Arc::new(Invocation::new(InvocationRecord::from_envelope(
            envelope,
            conn.ms_offset(),
        )));
        let ctx = CallContext {
            router: Arc::clone(self),
            connection: Arc::clone(conn),
            invocation: Arc::clone(&invocation),
        };
        let result = match AssertUnwindSafe(handler(ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(ApiError::internal(format!("handler for {} panicked", envelope.name()))),
        };
        (invocation, result)
    }

    /// Run the verification hook once for `conn` and return its outcome.
    pub async fn verify_connection(self: &Arc<Self>, conn: &Arc<ConnectionInfo>) -> Result<(), ApiError> {
        conn.verified_with(|| async {
            let outcome = match self.hooks.verify(conn).await {
                Ok(identity) => self.admit(conn, identity).await,
                Err(error) => Err(error),
            };
            if let Err(error) = &outcome {
                warn!(conn = %conn.id(), code = %error.code, "Connection verification failed: {}", error.message);
                if conn.kind().is_persistent() {
                    conn.send(vec![WireEnvelope::system_error(self.now_ms(), error)]);
                }
            }
            outcome
        })
        .await
        .clone()
    }

    async fn admit(&self, conn: &Arc<ConnectionInfo>, identity: VerifiedIdentity) -> Result<(), ApiError> {
        if !identity.custom_data.is_null() {
            conn.set_custom_data(identity.custom_data);
        }
        let Some(client_id) = identity.client_id else {
            if conn.is_private() {
                return Err(ApiError::verification_failed("private connection requires a client id"));
            }
            return Ok(());
        };
        conn.set_client_id(client_id.as_str());

        if conn.kind().is_persistent() {
            self.clients.insert_if_absent(&client_id, conn);
            let key = presence_key(&client_id);
            let result = self
                .store
                .multi_exec(vec![
                    KvCommand::Set {
                        key: key.clone(),
                        value: self.worker_id.clone(),
                    },
                    KvCommand::Expire {
                        key,
                        ttl: self.presence_ttl,
                    },
                ])
                .await;
            if let Err(e) = result {
                warn!(client_id = %client_id, error = %e, "Presence not recorded");
            }
        }
        info!(conn = %conn.id(), client_id = %client_id, transport = %conn.kind(), "Connection verified");
        Ok(())
    }

    /// Extend the presence TTL of a verified socket client.
    pub async fn refresh_presence(&self, conn: &ConnectionInfo) {
        let Some(client_id) = conn.client_id() else {
            return;
        };
        if let Err(e) = self.store.expire(&presence_key(&client_id), self.presence_ttl).await {
            debug!(client_id = %client_id, error = %e, "Presence refresh failed");
        }
    }

    /// Whether any worker currently holds `client_id`.
    pub async fn is_client_online(&self, client_id: &str) -> Result<bool, StoreError> {
        self.store.exists(&presence_key(client_id)).await
    }

    /// Close `conn`. Only the first call per connection has any effect.
    pub async fn close_connection(&self, conn: &Arc<ConnectionInfo>, reason: CloseReason) -> bool {
        let Some(transport) = conn.detach() else {
            return false;
        };
        transport.close();
        if let Some(client_id) = conn.client_id() {
            self.clients.remove(&client_id, conn.id());
        }
        self.hooks.on_close(conn, reason).await;
        debug!(conn = %conn.id(), transport = %conn.kind(), %reason, "Connection closed");
        true
    }

    /// Push an event to a client connected to this worker.
    pub fn push_event(&self, client_id: &str, name: &str, params: Value) -> bool {
        match self.clients.get(client_id) {
            Some(conn) => conn.send(vec![WireEnvelope::event(name, self.now_ms(), params)]),
            None => {
                debug!(client_id, event = name, "Push target not connected to this worker");
                false
            }
        }
    }

    /// Push an event to a client held by `target_worker_id`.
    pub async fn publish_event(
        &self,
        target_worker_id: &str,
        client_id: &str,
        name: &str,
        params: Value,
    ) -> Result<bool, BusError> {
        if target_worker_id == self.worker_id {
            return Ok(self.push_event(client_id, name, params));
        }
        let receivers = self
            .bus
            .publish(WorkerMessage {
                target_worker_id: target_worker_id.to_string(),
                client_id: client_id.to_string(),
                event_name: name.to_string(),
                event_params: params,
            })
            .await?;
        Ok(receivers > 0)
    }

    /// Listen on this worker's channel and push what arrives.
    pub fn spawn_worker_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut subscription = self.bus.subscribe(ChannelFilter::worker(&self.worker_id));
        let router: Weak<Self> = Arc::downgrade(self);
        let worker_id = self.worker_id.clone();
        info!(worker_id = %worker_id, "Worker channel listener started");

        tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                let Some(router) = router.upgrade() else {
                    break;
                };
                router.push_event(&message.client_id, &message.event_name, message.event_params);
            }
            debug!(worker_id = %worker_id, "Worker channel listener stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::connection::{ConnectionMeta, TransportKind};
    use crate::domain::error::codes;
    use crate::ports::ManualClock;
    use crate::testing::RecordingTransport;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn socket_conn() -> (Arc<ConnectionInfo>, RecordingTransport) {
        let recorder = RecordingTransport::new();
        let conn = ConnectionInfo::new(ConnectionMeta::new(TransportKind::Socket), recorder.transport(), 0);
        (conn, recorder)
    }

    fn router() -> Arc<RpcRouter> {
        RpcRouter::builder("w1").clock(Arc::new(ManualClock::new(10_000))).build()
    }

    #[tokio::test]
    async fn test_ping_request_scenario() {
        let router = router();
        router
            .register_api("ping", |_ctx| async { Ok(json!({"pong": true})) })
            .unwrap();
        let (conn, recorder) = socket_conn();

        router.dispatch(&conn, WireEnvelope::request("ping", 1000, Value::Null)).await;

        let batches = recorder.batches();
        assert_eq!(batches.len(), 1);
        let resp = &batches[0][0];
        assert_eq!(resp.kind(), EnvelopeType::RequestResponse);
        assert_eq!(resp.name(), "ping");
        assert_eq!(resp.ts(), 1000);
        assert_eq!(resp.data(), &json!({"pong": true}));
    }

    #[tokio::test]
    async fn test_unknown_api() {
        let router = router();
        let (conn, recorder) = socket_conn();
        router.dispatch(&conn, WireEnvelope::request("missing", 1, Value::Null)).await;
        assert_eq!(recorder.batches()[0][0].error_code(), Some(codes::UNKNOWN_API));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let router = router();
        router.register_api("a", |_| async { Ok(Value::Null) }).unwrap();
        assert!(matches!(
            router.register_api("a", |_| async { Ok(Value::Null) }),
            Err(GatewayError::DuplicateHandler { .. })
        ));
        // Events have their own namespace
        assert!(router.register_event("a", |_| async { Ok(Value::Null) }).is_ok());
    }

    #[tokio::test]
    async fn test_piggyback_batched_with_response() {
        let router = router();
        router
            .register_api("work", |ctx| async move {
                ctx.piggyback("progress", json!({"n": 1}));
                ctx.piggyback("progress", json!({"n": 2}));
                Ok(json!("done"))
            })
            .unwrap();
        let (conn, recorder) = socket_conn();

        router.dispatch(&conn, WireEnvelope::request("work", 5, Value::Null)).await;

        let batches = recorder.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[0][0].kind(), EnvelopeType::RequestResponse);
        assert_eq!(batches[0][1].kind(), EnvelopeType::Event);
    }

    #[tokio::test]
    async fn test_piggyback_dropped_on_error() {
        let router = router();
        router
            .register_api("work", |ctx| async move {
                ctx.piggyback("progress", json!({"n": 1}));
                ctx.piggyback("progress", json!({"n": 2}));
                Err(ApiError::invalid_params("bad"))
            })
            .unwrap();
        let (conn, recorder) = socket_conn();

        router.dispatch(&conn, WireEnvelope::request("work", 5, Value::Null)).await;

        let batches = recorder.batches();
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].error_code(), Some(codes::INVALID_PARAMS));
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_error() {
        let router = router();
        router
            .register_api("boom", |_| async {
                let explode = true;
                if explode {
                    panic!("boom");
                }
                Ok(Value::Null)
            })
            .unwrap();
        let (conn, recorder) = socket_conn();
        router.dispatch(&conn, WireEnvelope::request("boom", 5, Value::Null)).await;
        assert_eq!(recorder.batches()[0][0].error_code(), Some(codes::INTERNAL_ERROR));
    }

    #[tokio::test]
    async fn test_stale_event_not_invoked() {
        let router = router();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        router
            .register_event("moved", move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            })
            .unwrap();
        let (conn, recorder) = socket_conn();
        conn.advance_event_watermark(500);

        router.dispatch(&conn, WireEnvelope::event("moved", 500, Value::Null)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.batches()[0][0].kind(), EnvelopeType::EventResponse);

        router.dispatch(&conn, WireEnvelope::event("moved", 501, Value::Null)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(conn.last_event_ts(), 501);
    }

    #[tokio::test]
    async fn test_event_admitted_against_watermark_before_running_handler() {
        let router = router();
        let started = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        {
            let (started, release, seen) = (started.clone(), release.clone(), seen.clone());
            router
                .register_event("moved", move |ctx| {
                    let (started, release, seen) = (started.clone(), release.clone(), seen.clone());
                    async move {
                        let ts = ctx.params()["ts"].as_i64().unwrap_or_default();
                        seen.lock().push(ts);
                        if ts == 100 {
                            started.notify_one();
                            release.notified().await;
                        }
                        Ok(Value::Null)
                    }
                })
                .unwrap();
        }
        let (conn, recorder) = socket_conn();

        let slow = {
            let (router, conn) = (router.clone(), conn.clone());
            tokio::spawn(async move {
                router.dispatch(&conn, WireEnvelope::event("moved", 100, json!({"ts": 100}))).await;
            })
        };
        started.notified().await;
        assert_eq!(conn.last_event_ts(), i64::MIN);

        router.dispatch(&conn, WireEnvelope::event("moved", 200, json!({"ts": 200}))).await;
        assert_eq!(*seen.lock(), vec![100, 200]);
        assert_eq!(conn.last_event_ts(), 200);

        release.notify_one();
        slow.await.unwrap();
        assert_eq!(conn.last_event_ts(), 200);
        let acks = recorder.batches();
        assert_eq!(acks.len(), 2);
        assert!(acks.iter().all(|batch| batch[0].kind() == EnvelopeType::EventResponse && !batch[0].is_error()));
    }

    #[tokio::test]
    async fn test_ephemeral_skips_watermark_and_swallows_errors() {
        let router = router();
        router
            .register_event("typing", |_| async { Err(ApiError::internal("nope")) })
            .unwrap();
        let (conn, recorder) = socket_conn();
        conn.advance_event_watermark(900);

        router
            .dispatch(&conn, WireEnvelope::ephemeral_event("typing", 1, Value::Null))
            .await;
        assert!(recorder.batches().is_empty());
        assert_eq!(conn.last_event_ts(), 900);
    }

    struct CountingHooks {
        closes: AtomicUsize,
        reject: bool,
    }

    #[async_trait]
    impl ConnectionHooks for CountingHooks {
        async fn verify(&self, _conn: &Arc<ConnectionInfo>) -> Result<VerifiedIdentity, ApiError> {
            if self.reject {
                return Err(ApiError::verification_failed("bad token"));
            }
            Ok(VerifiedIdentity {
                client_id: Some("client-1".into()),
                custom_data: json!({"tier": "gold"}),
            })
        }

        async fn on_close(&self, _conn: &Arc<ConnectionInfo>, _reason: CloseReason) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_verification_registers_client() {
        let hooks = Arc::new(CountingHooks {
            closes: AtomicUsize::new(0),
            reject: false,
        });
        let router = RpcRouter::builder("w1").hooks(hooks.clone()).build();
        router.register_api("ping", |_| async { Ok(json!({})) }).unwrap();
        let (conn, _recorder) = socket_conn();

        router.dispatch(&conn, WireEnvelope::request("ping", 1, Value::Null)).await;

        assert_eq!(conn.client_id().as_deref(), Some("client-1"));
        assert_eq!(conn.custom_data()["tier"], "gold");
        assert!(router.clients().get("client-1").is_some());
        assert!(router.is_client_online("client-1").await.unwrap());

        assert!(router.close_connection(&conn, CloseReason::Disconnected).await);
        assert!(!router.close_connection(&conn, CloseReason::IdleTimeout).await);
        assert_eq!(hooks.closes.load(Ordering::SeqCst), 1);
        assert!(router.clients().get("client-1").is_none());
    }

    #[tokio::test]
    async fn test_failed_verification_blocks_dispatch() {
        let hooks = Arc::new(CountingHooks {
            closes: AtomicUsize::new(0),
            reject: true,
        });
        let router = RpcRouter::builder("w1").hooks(hooks).build();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        router
            .register_api("ping", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(json!({})) }
            })
            .unwrap();
        let (conn, recorder) = socket_conn();

        router.dispatch(&conn, WireEnvelope::request("ping", 1, Value::Null)).await;
        router.dispatch(&conn, WireEnvelope::request("ping", 2, Value::Null)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(conn.verification_failed());
        let batches = recorder.batches();
        assert_eq!(batches.len(), 1, "socket is told once");
        assert_eq!(batches[0][0].kind(), EnvelopeType::SystemEvent);
        assert_eq!(batches[0][0].error_code(), Some(codes::VERIFICATION_FAILED));
    }

    #[tokio::test]
    async fn test_private_socket_requires_client_id() {
        let router = router();
        let recorder = RecordingTransport::new();
        let conn = ConnectionInfo::new(
            ConnectionMeta::new(TransportKind::Socket).private(true),
            recorder.transport(),
            0,
        );
        assert!(router.verify_connection(&conn).await.is_err());
    }

    #[tokio::test]
    async fn test_no_send_after_close() {
        let router = router();
        let (conn, recorder) = socket_conn();
        conn.set_client_id("c9");
        router.clients().insert_if_absent("c9", &conn);

        router.close_connection(&conn, CloseReason::Disconnected).await;
        assert!(!router.push_event("c9", "late", json!({})));
        assert!(!conn.send(vec![WireEnvelope::event("late", 1, Value::Null)]));
        assert!(recorder.batches().is_empty());
        assert!(recorder.closed());
    }

    #[tokio::test]
    async fn test_publish_across_workers() {
        let bus: Arc<dyn WorkerBus> = Arc::new(InMemoryWorkerBus::new());
        let sender = RpcRouter::builder("w1").bus(bus.clone()).build();
        let receiver = RpcRouter::builder("w2").bus(bus).build();
        let listener = receiver.spawn_worker_listener();

        let (conn, recorder) = socket_conn();
        receiver.clients().insert_if_absent("c1", &conn);

        assert!(sender.publish_event("w2", "c1", "notice", json!({"n": 7})).await.unwrap());
        tokio::time::timeout(Duration::from_secs(1), async {
            while recorder.batches().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let batches = recorder.batches();
        assert_eq!(batches[0][0].name(), "notice");
        assert_eq!(batches[0][0].data()["n"], 7);
        listener.abort();
    }

    #[tokio::test]
    async fn test_publish_to_self_is_local() {
        let router = router();
        let (conn, recorder) = socket_conn();
        router.clients().insert_if_absent("c1", &conn);
        assert!(router.publish_event("w1", "c1", "hi", json!({})).await.unwrap());
        assert_eq!(recorder.batches().len(), 1);
    }
}
