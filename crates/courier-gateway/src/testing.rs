//! Test support: shared RSA keys and a transport that records what it is sent.

use crate::codec::{CodecSettings, FrameCodec};
use crate::domain::envelope::WireEnvelope;
use crate::transport::{OutboundFrame, SocketTransport, Transport};
use parking_lot::{Mutex, RwLock};
use shared_crypto::{generate_private_key, RsaPrivateKey};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;

fn cached_key(slot: &'static OnceLock<RsaPrivateKey>) -> &'static RsaPrivateKey {
    slot.get_or_init(|| generate_private_key(1024).expect("generate test RSA key"))
}

/// Server RSA key, generated once per test binary.
pub fn server_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    cached_key(&KEY)
}

/// Peer RSA key, generated once per test binary.
pub fn client_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    cached_key(&KEY)
}

/// Socket-shaped transport whose frames are kept for inspection.
pub struct RecordingTransport {
    tx: mpsc::UnboundedSender<OutboundFrame>,
    rx: Mutex<mpsc::UnboundedReceiver<OutboundFrame>>,
    codec: Arc<RwLock<FrameCodec>>,
    log: Mutex<Vec<OutboundFrame>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            codec: Arc::new(RwLock::new(FrameCodec::plaintext(CodecSettings::default()))),
            log: Mutex::new(Vec::new()),
        }
    }

    /// A transport feeding this recorder.
    pub fn transport(&self) -> Transport {
        Transport::Socket(SocketTransport::new(self.tx.clone(), Arc::clone(&self.codec)))
    }

    fn drain(&self) {
        let mut rx = self.rx.lock();
        let mut log = self.log.lock();
        while let Ok(frame) = rx.try_recv() {
            log.push(frame);
        }
    }

    /// Every batch written so far, one entry per frame.
    pub fn batches(&self) -> Vec<Vec<WireEnvelope>> {
        self.drain();
        let codec = self.codec.read();
        self.log
            .lock()
            .iter()
            .filter_map(|frame| match frame {
                OutboundFrame::Binary(bytes) => codec.decode(bytes).ok(),
                OutboundFrame::Close => None,
            })
            .collect()
    }

    /// Whether the transport was closed.
    pub fn closed(&self) -> bool {
        self.drain();
        self.log.lock().iter().any(|f| *f == OutboundFrame::Close)
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}
