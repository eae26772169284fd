//! # Shared Bus - Collaborator Contracts
//!
//! The protocol engine reaches shared infrastructure only through the narrow
//! interfaces defined here:
//!
//! - **Key-value store** (`exists`/`set`/`expire`/`incr`/`multi_exec`): replay
//!   guard entries and client presence bookkeeping.
//! - **Worker bus** (channel-scoped publish/subscribe): delivering an event to
//!   a client whose connection lives in a different process.
//!
//! ```text
//! ┌──────────────┐   publish(worker.B)   ┌──────────────┐
//! │  Worker A    │ ────────┐             │  Worker B    │
//! │  (router)    │         ▼             │  (router)    │
//! └──────────────┘   ┌──────────────┐    └──────────────┘
//!                    │  Worker Bus  │ ──────────↑ subscribe(worker.B)
//!                    └──────────────┘
//! ```
//!
//! In-memory implementations back single-process deployments and tests.

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod events;
pub mod publisher;
pub mod replay_guard;
pub mod store;
pub mod subscriber;

// Re-export main types
pub use events::{worker_channel, ChannelFilter, ChannelMessage, WorkerMessage};
pub use publisher::{BusError, InMemoryWorkerBus, WorkerBus, WorkerPublisher};
pub use replay_guard::{ReplayError, ReplayGuard, ReplayKey};
pub use store::{InMemoryKeyValueStore, KeyValueStore, KvCommand, KvReply, StoreError};
pub use subscriber::{Subscription, SubscriptionError, WorkerSubscriber};

/// Maximum messages to buffer per subscriber before the slowest one lags.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Prefix of every per-worker channel name.
pub const WORKER_CHANNEL_PREFIX: &str = "courier.worker.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_capacity() {
        assert_eq!(DEFAULT_CHANNEL_CAPACITY, 1000);
    }

    #[test]
    fn test_channel_prefix() {
        assert!(worker_channel("w1").starts_with(WORKER_CHANNEL_PREFIX));
    }
}
