//! Persistent duplex socket transport: `GET /socket/{enc|plain}/{public|private}`.
//!
//! The first inbound frame is the handshake. On encrypted sockets it carries
//! a session key wrapped for the server; the server answers with a `CONFIG`
//! system event sealed under that key, carrying the ping interval and a new
//! key, and switches to the new key for everything after it.
//!
//! Every later frame is decoded into envelopes. `PING` is answered with
//! `PONG` inline; everything else goes onto the connection's inbound queue,
//! which one task drains through the router in arrival order.

use crate::codec::{parse_handshake, CodecSettings, FrameCodec};
use crate::domain::config::SocketConfig;
use crate::domain::connection::{ConnectionInfo, ConnectionMeta};
use crate::domain::envelope::{system, EnvelopeType, WireEnvelope};
use crate::domain::error::ApiError;
use crate::ports::CloseReason;
use crate::router::RpcRouter;
use crate::transport::liveness::LivenessMonitor;
use crate::transport::{OutboundFrame, SocketTransport, Transport};
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use shared_crypto::{RsaPrivateKey, SessionKey};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Socket flavour selected by the upgrade path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketMode {
    pub encrypted: bool,
    /// Private sockets must be verified with a client id.
    pub private: bool,
}

impl SocketMode {
    /// Parse the two path segments, e.g. `("enc", "private")`.
    pub fn from_path(encryption: &str, scope: &str) -> Option<Self> {
        let encrypted = match encryption {
            "enc" => true,
            "plain" => false,
            _ => return None,
        };
        let private = match scope {
            "private" => true,
            "public" => false,
            _ => return None,
        };
        Some(Self { encrypted, private })
    }
}

/// What the reader loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStep {
    Continue,
    Close,
}

/// Shared socket machinery: one per server.
pub struct SocketAdapter {
    router: Arc<RpcRouter>,
    liveness: Arc<LivenessMonitor>,
    private_key: Arc<RsaPrivateKey>,
    ping_interval: Duration,
    codec: CodecSettings,
}

impl SocketAdapter {
    pub fn new(
        router: Arc<RpcRouter>,
        liveness: Arc<LivenessMonitor>,
        private_key: Arc<RsaPrivateKey>,
        socket: &SocketConfig,
        codec: CodecSettings,
    ) -> Self {
        Self {
            router,
            liveness,
            private_key,
            ping_interval: socket.ping_interval,
            codec,
        }
    }

    pub fn liveness(&self) -> &Arc<LivenessMonitor> {
        &self.liveness
    }

    /// Start a session. Frames for the peer arrive on the returned receiver.
    pub fn open(
        self: &Arc<Self>,
        mode: SocketMode,
        meta: ConnectionMeta,
    ) -> (SocketSession, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let session = SocketSession {
            adapter: Arc::clone(self),
            mode,
            meta: Some(meta.private(mode.private)),
            outbound,
            codec: Arc::new(RwLock::new(FrameCodec::plaintext(self.codec))),
            conn: None,
            inbound: None,
        };
        (session, rx)
    }

    /// Drive an upgraded websocket until either side closes.
    pub async fn serve(self: Arc<Self>, socket: WebSocket, mode: SocketMode, meta: ConnectionMeta) {
        let (mut sink, mut stream) = socket.split();
        let (mut session, mut outbound) = self.open(mode, meta);

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                let result = match frame {
                    OutboundFrame::Binary(bytes) => sink.send(Message::Binary(bytes)).await,
                    OutboundFrame::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = result {
                    debug!(error = %e, "Socket write failed");
                    break;
                }
            }
        });

        while let Some(result) = stream.next().await {
            let step = match result {
                Ok(Message::Binary(data)) => session.on_frame(&data).await,
                Ok(Message::Text(text)) => session.on_frame(text.as_bytes()).await,
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => SessionStep::Continue,
                Ok(Message::Close(_)) => {
                    debug!(conn = ?session.connection().map(|c| c.id()), "Socket close received");
                    SessionStep::Close
                }
                Err(e) => {
                    warn!(error = %e, "Socket error");
                    SessionStep::Close
                }
            };
            if step == SessionStep::Close {
                break;
            }
        }

        session.on_disconnect().await;
        writer.abort();
    }
}

/// State of one socket connection.
pub struct SocketSession {
    adapter: Arc<SocketAdapter>,
    mode: SocketMode,
    meta: Option<ConnectionMeta>,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    codec: Arc<RwLock<FrameCodec>>,
    conn: Option<Arc<ConnectionInfo>>,
    inbound: Option<mpsc::UnboundedSender<WireEnvelope>>,
}

impl SocketSession {
    /// The connection, once the handshake has been accepted.
    pub fn connection(&self) -> Option<&Arc<ConnectionInfo>> {
        self.conn.as_ref()
    }

    pub async fn on_frame(&mut self, frame: &[u8]) -> SessionStep {
        match self.conn.clone() {
            None => self.on_handshake(frame),
            Some(conn) => self.on_message(&conn, frame).await,
        }
    }

    fn on_handshake(&mut self, frame: &[u8]) -> SessionStep {
        let router = &self.adapter.router;
        let now = router.now_ms();
        let server_key = self.mode.encrypted.then(|| self.adapter.private_key.as_ref());
        let handshake = match parse_handshake(frame, server_key, self.adapter.codec.iv_mode) {
            Ok(handshake) => handshake,
            Err(e) => return self.reject_handshake(now, e.to_string()),
        };
        let Some(ms_offset) = now.checked_sub(handshake.identity.now) else {
            return self.reject_handshake(now, format!("client clock {} out of range", handshake.identity.now));
        };

        if let Some(key) = handshake.session_key {
            *self.codec.write() = FrameCodec::encrypted(key, self.adapter.codec);
        }
        let Some(meta) = self.meta.take() else {
            return SessionStep::Close;
        };
        let transport = Transport::Socket(SocketTransport::new(self.outbound.clone(), Arc::clone(&self.codec)));
        let conn = ConnectionInfo::new(meta, transport, now);
        conn.set_ms_offset(ms_offset);
        self.adapter.liveness.track(&conn);
        self.inbound = Some(spawn_dispatcher(Arc::clone(router), Arc::clone(&conn)));

        let next_key = self.mode.encrypted.then(SessionKey::generate);
        let mut config = json!({
            "pingInterval": u64::try_from(self.adapter.ping_interval.as_millis()).unwrap_or(u64::MAX),
        });
        if let Some(key) = &next_key {
            config["key"] = Value::String(key.to_base64());
        }
        conn.send(vec![WireEnvelope::system(system::CONFIG, now, config)]);
        if let Some(key) = next_key {
            self.codec.write().rotate(key);
        }

        info!(
            conn = %conn.id(),
            short_name = %handshake.short_name,
            connection_number = handshake.connection_number,
            encrypted = self.mode.encrypted,
            private = self.mode.private,
            "Socket opened"
        );
        self.conn = Some(conn);
        SessionStep::Continue
    }

    /// Answer a bad opening frame with a plaintext error and close.
    fn reject_handshake(&self, now: i64, reason: String) -> SessionStep {
        warn!(error = %reason, encrypted = self.mode.encrypted, "Rejected socket handshake");
        let error = ApiError::invalid_handshake(reason);
        let codec = self.codec.read();
        if let Ok(frames) = codec.encode(&[WireEnvelope::system_error(now, &error)]) {
            for frame in frames {
                let _ = self.outbound.send(OutboundFrame::Binary(frame));
            }
        }
        let _ = self.outbound.send(OutboundFrame::Close);
        SessionStep::Close
    }

    async fn on_message(&self, conn: &Arc<ConnectionInfo>, frame: &[u8]) -> SessionStep {
        let router = &self.adapter.router;
        let decoded = self.codec.read().decode(frame);
        let envelopes = match decoded {
            Ok(envelopes) => envelopes,
            Err(e) => {
                warn!(conn = %conn.id(), error = %e, "Undecodable socket frame");
                router.close_connection(conn, CloseReason::ProtocolError).await;
                return SessionStep::Close;
            }
        };

        let now = router.now_ms();
        // A failed connection is left for the sweep.
        if !conn.verification_failed() {
            conn.touch(now);
        }

        for envelope in envelopes {
            if envelope.is_system(system::PING) {
                conn.send(vec![WireEnvelope::system(system::PONG, now, Value::Null)]);
                router.refresh_presence(conn).await;
                continue;
            }
            if envelope.kind() == EnvelopeType::SystemEvent {
                debug!(conn = %conn.id(), name = envelope.name(), "Ignoring system event from peer");
                continue;
            }
            let queued = self.inbound.as_ref().is_some_and(|inbound| inbound.send(envelope).is_ok());
            if !queued {
                debug!(conn = %conn.id(), "Inbound queue closed; dropping message");
            }
        }
        SessionStep::Continue
    }

    /// Reader side is gone: close and forget the connection.
    pub async fn on_disconnect(&mut self) {
        // Queued messages still drain; their replies find no provider.
        self.inbound = None;
        if let Some(conn) = self.conn.take() {
            self.adapter.liveness.untrack(conn.id());
            if self.adapter.router.close_connection(&conn, CloseReason::Disconnected).await {
                info!(conn = %conn.id(), "Socket disconnected");
            }
        }
    }
}

/// Drain one connection's inbound queue, one dispatch at a time.
fn spawn_dispatcher(router: Arc<RpcRouter>, conn: Arc<ConnectionInfo>) -> mpsc::UnboundedSender<WireEnvelope> {
    let (tx, mut rx) = mpsc::unbounded_channel::<WireEnvelope>();
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            router.dispatch(&conn, envelope).await;
        }
        debug!(conn = %conn.id(), "Inbound queue drained");
    });
    tx
}
