//! Connection lifecycle hooks supplied by the application.

use crate::domain::connection::ConnectionInfo;
use crate::domain::error::ApiError;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer went away.
    Disconnected,
    /// No activity within the ping interval plus grace.
    IdleTimeout,
    /// An HTTP exchange was answered.
    Completed,
    /// An HTTP exchange outlived the request timeout.
    TimedOut,
    /// A frame could not be decrypted or decoded.
    ProtocolError,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Disconnected => "disconnected",
            CloseReason::IdleTimeout => "idle-timeout",
            CloseReason::Completed => "completed",
            CloseReason::TimedOut => "timed-out",
            CloseReason::ProtocolError => "protocol-error",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Identity established by the verification hook.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerifiedIdentity {
    pub client_id: Option<String>,
    pub custom_data: Value,
}

/// Hooks the router calls around a connection's life.
#[async_trait]
pub trait ConnectionHooks: Send + Sync {
    /// Decide whether the connection may dispatch. Runs once, before the
    /// first non-system message.
    async fn verify(&self, conn: &Arc<ConnectionInfo>) -> Result<VerifiedIdentity, ApiError> {
        Ok(VerifiedIdentity {
            client_id: conn.client_id(),
            custom_data: conn.custom_data(),
        })
    }

    /// Runs once per connection after its transport is detached.
    async fn on_close(&self, _conn: &Arc<ConnectionInfo>, _reason: CloseReason) {}
}

/// Accepts every connection with whatever identity the transport established.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl ConnectionHooks for DefaultHooks {}
