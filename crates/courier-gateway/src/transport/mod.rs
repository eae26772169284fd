//! Transports: how envelopes reach a connection.
//!
//! Every connection owns one [`Transport`]. The router only ever calls
//! [`Transport::send`] with a whole batch and [`Transport::close`] once, so
//! each variant decides how a batch becomes bytes on its own wire.

pub mod authenticated;
pub mod exchange;
pub mod liveness;
pub mod pending;
pub mod plaintext;
pub mod socket;
pub mod third_party;

use crate::codec::{CodecError, FrameCodec};
use crate::domain::connection::TransportKind;
use crate::domain::envelope::WireEnvelope;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Errors from handing a batch to a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("exchange already answered")]
    AlreadyReplied,

    #[error("encoding failed: {0}")]
    Codec(#[from] CodecError),
}

/// Frames handed to a socket writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Binary(Vec<u8>),
    Close,
}

/// Socket provider: encodes with the socket's codec and queues frames for
/// the writer task.
#[derive(Debug)]
pub struct SocketTransport {
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    codec: Arc<RwLock<FrameCodec>>,
}

impl SocketTransport {
    pub fn new(outbound: mpsc::UnboundedSender<OutboundFrame>, codec: Arc<RwLock<FrameCodec>>) -> Self {
        Self { outbound, codec }
    }

    fn send(&self, batch: Vec<WireEnvelope>) -> Result<(), TransportError> {
        let frames = self.codec.read().encode(&batch)?;
        for frame in frames {
            self.outbound
                .send(OutboundFrame::Binary(frame))
                .map_err(|_| TransportError::Closed)?;
        }
        Ok(())
    }

    fn close(&self) {
        let _ = self.outbound.send(OutboundFrame::Close);
    }
}

/// Provider for one HTTP request/response exchange. The first batch is the
/// reply; later sends fail.
#[derive(Debug)]
pub struct ExchangeTransport {
    reply: Mutex<Option<oneshot::Sender<Vec<WireEnvelope>>>>,
}

impl ExchangeTransport {
    pub fn new() -> (Self, oneshot::Receiver<Vec<WireEnvelope>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                reply: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    fn send(&self, batch: Vec<WireEnvelope>) -> Result<(), TransportError> {
        let sender = self.reply.lock().take().ok_or(TransportError::AlreadyReplied)?;
        sender.send(batch).map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        self.reply.lock().take();
    }
}

/// Response controls a third-party handler may set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThirdPartyControls {
    pub redirect: Option<String>,
    /// Raw `Set-Cookie` values.
    pub cookies: Vec<String>,
}

/// Exchange provider that also carries redirect and cookie controls.
#[derive(Debug)]
pub struct ThirdPartyTransport {
    exchange: ExchangeTransport,
    controls: Arc<Mutex<ThirdPartyControls>>,
}

impl ThirdPartyTransport {
    pub fn new(
        exchange: ExchangeTransport,
        controls: Arc<Mutex<ThirdPartyControls>>,
    ) -> Self {
        Self { exchange, controls }
    }

    pub fn redirect(&self, location: impl Into<String>) {
        self.controls.lock().redirect = Some(location.into());
    }

    pub fn set_cookie(&self, cookie: impl Into<String>) {
        self.controls.lock().cookies.push(cookie.into());
    }
}

/// The transport attached to a connection.
#[derive(Debug)]
pub enum Transport {
    Socket(SocketTransport),
    Http(ExchangeTransport),
    HttpsAuthenticated(ExchangeTransport),
    HttpsThirdParty(ThirdPartyTransport),
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Socket(_) => TransportKind::Socket,
            Transport::Http(_) => TransportKind::Http,
            Transport::HttpsAuthenticated(_) => TransportKind::HttpsAuthenticated,
            Transport::HttpsThirdParty(_) => TransportKind::HttpsThirdParty,
        }
    }

    /// Hand a whole batch to the wire as one write.
    pub fn send(&self, batch: Vec<WireEnvelope>) -> Result<(), TransportError> {
        match self {
            Transport::Socket(socket) => socket.send(batch),
            Transport::Http(exchange) | Transport::HttpsAuthenticated(exchange) => exchange.send(batch),
            Transport::HttpsThirdParty(tp) => tp.exchange.send(batch),
        }
    }

    pub fn close(&self) {
        match self {
            Transport::Socket(socket) => socket.close(),
            Transport::Http(exchange) | Transport::HttpsAuthenticated(exchange) => exchange.close(),
            Transport::HttpsThirdParty(tp) => tp.exchange.close(),
        }
    }
}

/// A finished HTTP reply, independent of the web framework.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
        }
    }

    /// JSON body with a `content-type` header.
    pub fn json<T: Serialize + ?Sized>(status: u16, value: &T) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_else(|_| b"null".to_vec());
        Self::new(status, body).with_header("content-type", "application/json")
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}
