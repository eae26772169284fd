//! Socket sessions end to end: handshake, verification gate, liveness,
//! event admission and cross-worker push.

use async_trait::async_trait;
use courier_gateway::codec::{build_handshake, ClientIdentity};
use courier_gateway::domain::envelope::system;
use courier_gateway::ports::ManualClock;
use courier_gateway::testing::server_key;
use courier_gateway::transport::liveness::LivenessMonitor;
use courier_gateway::transport::socket::{SocketAdapter, SocketMode, SocketSession};
use courier_gateway::transport::OutboundFrame;
use courier_gateway::{
    codes, ApiError, CodecSettings, ConnectionHooks, ConnectionInfo, ConnectionMeta, EnvelopeType,
    FrameCodec, GatewayConfig, RpcRouter, TransportKind, VerifiedIdentity, WireEnvelope,
};
use serde_json::{json, Value};
use shared_bus::{InMemoryKeyValueStore, InMemoryWorkerBus};
use shared_crypto::{IvMode, SessionKey};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const START: i64 = 1_000_000;

/// Takes the client id from the `x-user` upgrade header.
struct HeaderHooks;

#[async_trait]
impl ConnectionHooks for HeaderHooks {
    async fn verify(&self, conn: &Arc<ConnectionInfo>) -> Result<VerifiedIdentity, ApiError> {
        Ok(VerifiedIdentity {
            client_id: conn.header("x-user").map(str::to_string),
            custom_data: Value::Null,
        })
    }
}

struct Client {
    session: SocketSession,
    frames: mpsc::UnboundedReceiver<OutboundFrame>,
    codec: FrameCodec,
}

impl Client {
    async fn connect(adapter: &Arc<SocketAdapter>, mode: SocketMode, meta: ConnectionMeta) -> Self {
        let (mut session, mut frames) = adapter.open(mode, meta);
        let key = SessionKey::generate();
        let identity = ClientIdentity::new(START);
        let handshake = if mode.encrypted {
            build_handshake("tst", 1, &identity, Some((&server_key().to_public_key(), &key)), IvMode::Fixed)
        } else {
            build_handshake("tst", 1, &identity, None, IvMode::Fixed)
        }
        .unwrap();
        session.on_frame(&handshake).await;

        let mut codec = if mode.encrypted {
            FrameCodec::encrypted(key, CodecSettings::default())
        } else {
            FrameCodec::plaintext(CodecSettings::default())
        };
        let Ok(OutboundFrame::Binary(bytes)) = frames.try_recv() else {
            panic!("no config push");
        };
        let config = codec.decode(&bytes).unwrap().remove(0);
        assert!(config.is_system(system::CONFIG));
        if let Some(next) = config.data()["key"].as_str() {
            codec.rotate(SessionKey::from_base64(next).unwrap());
        }
        Self { session, frames, codec }
    }

    async fn send(&mut self, batch: &[WireEnvelope]) {
        for frame in self.codec.encode(batch).unwrap() {
            self.session.on_frame(&frame).await;
        }
    }

    fn received(&mut self) -> Vec<WireEnvelope> {
        let mut out = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            if let OutboundFrame::Binary(bytes) = frame {
                out.extend(self.codec.decode(&bytes).unwrap());
            }
        }
        out
    }

    fn conn(&self) -> Arc<ConnectionInfo> {
        self.session.connection().cloned().unwrap()
    }
}

struct Worker {
    router: Arc<RpcRouter>,
    clock: Arc<ManualClock>,
    adapter: Arc<SocketAdapter>,
}

fn worker(id: &str, bus: Arc<InMemoryWorkerBus>, store: Arc<InMemoryKeyValueStore>) -> Worker {
    let clock = Arc::new(ManualClock::new(START));
    let router = RpcRouter::builder(id)
        .hooks(Arc::new(HeaderHooks))
        .clock(clock.clone())
        .bus(bus)
        .store(store)
        .build();
    router
        .register_api("whoami", |ctx| async move { Ok(json!({ "clientId": ctx.connection().client_id() })) })
        .unwrap();

    let config = GatewayConfig::default();
    let liveness = Arc::new(LivenessMonitor::new(&config.socket));
    let adapter = Arc::new(SocketAdapter::new(
        router.clone(),
        liveness,
        Arc::new(server_key().clone()),
        &config.socket,
        CodecSettings::default(),
    ));
    Worker { router, clock, adapter }
}

fn socket_meta(user: Option<&str>) -> ConnectionMeta {
    let meta = ConnectionMeta::new(TransportKind::Socket);
    match user {
        Some(user) => meta.with_header("x-user", user),
        None => meta,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_private_socket_verified_and_registered() {
    let store = Arc::new(InMemoryKeyValueStore::new());
    let w = worker("w1", Arc::new(InMemoryWorkerBus::new()), store);
    let mode = SocketMode::from_path("enc", "private").unwrap();
    let mut client = Client::connect(&w.adapter, mode, socket_meta(Some("u1"))).await;

    client.send(&[WireEnvelope::request("whoami", START + 1, Value::Null)]).await;
    settle().await;

    let replies = client.received();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].data()["clientId"], "u1");
    assert!(w.router.clients().get("u1").is_some());
    assert!(w.router.is_client_online("u1").await.unwrap());
}

#[tokio::test]
async fn test_private_socket_without_identity_is_reaped() {
    let store = Arc::new(InMemoryKeyValueStore::new());
    let w = worker("w1", Arc::new(InMemoryWorkerBus::new()), store);
    let mode = SocketMode::from_path("enc", "private").unwrap();
    let mut client = Client::connect(&w.adapter, mode, socket_meta(None)).await;
    let conn = client.conn();

    client.send(&[WireEnvelope::request("whoami", START + 1, Value::Null)]).await;
    settle().await;
    let replies = client.received();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].kind(), EnvelopeType::SystemEvent);
    assert_eq!(replies[0].error_code(), Some(codes::VERIFICATION_FAILED));

    // Still open so the client can read the error, but no longer refreshed.
    assert!(conn.is_live());
    w.clock.advance(30_000);
    client.send(&[WireEnvelope::request("whoami", START + 2, Value::Null)]).await;
    settle().await;
    assert!(client.received().is_empty());

    w.clock.advance(10_001);
    let closed = w.adapter.liveness().sweep_once(&w.router, w.router.now_ms()).await;
    assert_eq!(closed, 1);
    assert!(!conn.is_live());
}

#[tokio::test]
async fn test_ping_keeps_socket_alive() {
    let store = Arc::new(InMemoryKeyValueStore::new());
    let w = worker("w1", Arc::new(InMemoryWorkerBus::new()), store);
    let mode = SocketMode::from_path("plain", "public").unwrap();
    let mut client = Client::connect(&w.adapter, mode, socket_meta(None)).await;
    let conn = client.conn();

    for _ in 0..3 {
        w.clock.advance(25_000);
        client.send(&[WireEnvelope::system(system::PING, 0, Value::Null)]).await;
        assert!(client.received()[0].is_system(system::PONG));
        assert_eq!(w.adapter.liveness().sweep_once(&w.router, w.router.now_ms()).await, 0);
    }
    assert!(conn.is_live());
}

#[tokio::test]
async fn test_duplicate_event_acked_but_not_invoked_twice() {
    let store = Arc::new(InMemoryKeyValueStore::new());
    let w = worker("w1", Arc::new(InMemoryWorkerBus::new()), store);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    w.router
        .register_event("moved", move |_ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        })
        .unwrap();

    let mode = SocketMode::from_path("enc", "public").unwrap();
    let mut client = Client::connect(&w.adapter, mode, socket_meta(None)).await;

    client.send(&[WireEnvelope::event("moved", 100, json!({ "x": 1 }))]).await;
    settle().await;
    client.send(&[WireEnvelope::event("moved", 100, json!({ "x": 1 }))]).await;
    settle().await;
    client.send(&[WireEnvelope::event("moved", 99, json!({ "x": 0 }))]).await;
    settle().await;

    let acks = client.received();
    assert_eq!(acks.len(), 3);
    assert!(acks.iter().all(|a| a.kind() == EnvelopeType::EventResponse));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_events_in_one_frame_dispatched_in_order() {
    let store = Arc::new(InMemoryKeyValueStore::new());
    let w = worker("w1", Arc::new(InMemoryWorkerBus::new()), store);
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        w.router
            .register_event("moved", move |ctx| {
                let seen = seen.clone();
                async move {
                    seen.lock().push(ctx.params()["seq"].as_i64().unwrap_or_default());
                    Ok(Value::Null)
                }
            })
            .unwrap();
    }

    let adapter = w.adapter.clone();
    let acks = tokio::spawn(async move {
        let mode = SocketMode::from_path("plain", "public").unwrap();
        let mut client = Client::connect(&adapter, mode, socket_meta(None)).await;
        client
            .send(&[
                WireEnvelope::event("moved", 100, json!({ "seq": 1 })),
                WireEnvelope::event("moved", 200, json!({ "seq": 2 })),
            ])
            .await;

        let mut acks = Vec::new();
        for _ in 0..100 {
            acks.extend(client.received());
            if acks.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        acks
    })
    .await
    .unwrap();

    assert_eq!(acks.len(), 2);
    assert!(acks.iter().all(|a| a.kind() == EnvelopeType::EventResponse && !a.is_error()));
    assert_eq!(*seen.lock(), vec![1, 2]);
}

#[tokio::test]
async fn test_cross_worker_push_reaches_socket() {
    let bus = Arc::new(InMemoryWorkerBus::new());
    let store = Arc::new(InMemoryKeyValueStore::new());
    let a = worker("wA", bus.clone(), store.clone());
    let b = worker("wB", bus, store);
    let _listener = b.router.spawn_worker_listener();

    let mode = SocketMode::from_path("enc", "private").unwrap();
    let mut client = Client::connect(&b.adapter, mode, socket_meta(Some("u7"))).await;
    client.send(&[WireEnvelope::request("whoami", START + 1, Value::Null)]).await;
    settle().await;
    client.received();

    // Presence is shared, so the other worker sees the client online.
    assert!(a.router.is_client_online("u7").await.unwrap());
    assert!(a.router.publish_event("wB", "u7", "notice", json!({ "text": "hi" })).await.unwrap());
    settle().await;

    let pushed = client.received();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].kind(), EnvelopeType::Event);
    assert_eq!(pushed[0].name(), "notice");
    assert_eq!(pushed[0].data()["text"], "hi");
}

#[tokio::test]
async fn test_disconnect_unregisters_client() {
    let store = Arc::new(InMemoryKeyValueStore::new());
    let w = worker("w1", Arc::new(InMemoryWorkerBus::new()), store);
    let mode = SocketMode::from_path("plain", "private").unwrap();
    let mut client = Client::connect(&w.adapter, mode, socket_meta(Some("u2"))).await;
    client.send(&[WireEnvelope::request("whoami", START + 1, Value::Null)]).await;
    settle().await;
    assert!(w.router.clients().get("u2").is_some());

    client.session.on_disconnect().await;
    assert!(w.router.clients().get("u2").is_none());
    assert!(!w.router.push_event("u2", "late", Value::Null));
}
