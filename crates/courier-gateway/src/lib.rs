#![allow(missing_docs)]

//! Courier Gateway - RPC and event protocol engine.
//!
//! Named APIs and events travel over four transports and meet in one router.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            COURIER GATEWAY                           │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────┐  ┌───────────┐  ┌───────────────┐  ┌───────────────┐  │
//! │  │  Socket  │  │ Plaintext │  │ Authenticated │  │  Third-party  │  │
//! │  │ /socket  │  │   /api    │  │     /s2s      │  │      /tp      │  │
//! │  └────┬─────┘  └─────┬─────┘  └───────┬───────┘  └───────┬───────┘  │
//! │       │ frame codec  │   pending exchange store + sweep  │          │
//! │  ┌────┴──────────────┴────────────────┴──────────────────┴───────┐  │
//! │  │                         RPC Router                            │  │
//! │  │  verify once → route REQUEST / EVENT / EPHEMERAL_EVENT        │  │
//! │  │  response + piggybacked events → one batched write            │  │
//! │  └────────────┬──────────────────────────────┬───────────────────┘  │
//! │               │                              │                      │
//! │     Connection registry             Worker channel (bus)            │
//! └───────────────┼──────────────────────────────┼──────────────────────┘
//!                 ▼                              ▼
//!        Key-value store (presence,      Other workers
//!        replay guard)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use courier_gateway::{CourierService, GatewayConfig, RpcRouter, StaticCredentialRegistry};
//!
//! let router = RpcRouter::builder("worker-1").build();
//! router.register_api("ping", |_ctx| async { Ok(serde_json::json!({ "pong": true })) })?;
//!
//! let service = CourierService::new(config, router, credentials, private_key)?;
//! let listener = service.bind().await?;
//! service.run(listener, async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! ```

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod client;
pub mod codec;
pub mod domain;
pub mod ports;
pub mod registry;
pub mod router;
pub mod service;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// Re-exports for public API
pub use client::{AuthenticatedClient, CallOutcome, ClientError, PreparedCall};
pub use codec::{CodecError, CodecSettings, FrameCodec};
pub use domain::config::GatewayConfig;
pub use domain::connection::{ConnectionId, ConnectionInfo, ConnectionMeta, TransportKind};
pub use domain::envelope::{EnvelopeType, WireEnvelope};
pub use domain::error::{codes, ApiError, GatewayError};
pub use domain::invocation::InvocationRecord;
pub use ports::{
    CloseReason, ConnectionHooks, Credential, CredentialRegistry, DefaultHooks,
    StaticCredentialRegistry, TimeSource, VerifiedIdentity,
};
pub use registry::ConnectionRegistry;
pub use router::{CallContext, HandlerResult, RpcRouter};
pub use service::CourierService;
pub use transport::{HttpReply, Transport, TransportError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
