//! # Worker Publisher
//!
//! Defines the publishing side of the worker bus.

use crate::events::{ChannelFilter, ChannelMessage, WorkerMessage};
use crate::subscriber::{Subscription, WorkerSubscriber};
use crate::DEFAULT_CHANNEL_CAPACITY;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Errors from publishing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The backing transport is unreachable.
    #[error("worker bus unavailable: {0}")]
    Unavailable(String),
}

/// Trait for publishing worker messages.
#[async_trait]
pub trait WorkerPublisher: Send + Sync {
    /// Publish a message on `message.channel()`.
    ///
    /// # Returns
    ///
    /// The number of subscribers that received the message.
    async fn publish(&self, message: WorkerMessage) -> Result<usize, BusError>;

    /// Get the total number of messages published.
    fn messages_published(&self) -> u64;
}

/// Full bus contract: publish plus channel-scoped subscribe.
pub trait WorkerBus: WorkerPublisher + WorkerSubscriber {}

impl<T: WorkerPublisher + WorkerSubscriber> WorkerBus for T {}

/// In-memory implementation of the worker bus.
///
/// Uses `tokio::sync::broadcast` for multi-producer, multi-consumer semantics.
/// Suitable for a single process hosting several workers; multi-process
/// deployments plug in a networked implementation behind the same traits.
pub struct InMemoryWorkerBus {
    /// Broadcast sender for messages.
    sender: broadcast::Sender<ChannelMessage>,

    /// Total messages published.
    messages_published: AtomicU64,

    /// Channel capacity.
    capacity: usize,
}

impl InMemoryWorkerBus {
    /// Create a new in-memory bus with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new in-memory bus with specified capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            messages_published: AtomicU64::new(0),
            capacity,
        }
    }

    /// Get the number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Get the channel capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for InMemoryWorkerBus {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerSubscriber for InMemoryWorkerBus {
    fn subscribe(&self, filter: ChannelFilter) -> Subscription {
        let receiver = self.sender.subscribe();
        debug!(channels = ?filter.channels, "New worker subscription created");
        Subscription::new(receiver, filter)
    }
}

#[async_trait]
impl WorkerPublisher for InMemoryWorkerBus {
    async fn publish(&self, message: WorkerMessage) -> Result<usize, BusError> {
        let channel = message.channel();
        self.messages_published.fetch_add(1, Ordering::Relaxed);

        match self.sender.send(ChannelMessage {
            channel: channel.clone(),
            message,
        }) {
            Ok(receiver_count) => {
                debug!(channel = %channel, receivers = receiver_count, "Worker message published");
                Ok(receiver_count)
            }
            Err(_) => {
                // No receivers - the target worker is not listening
                warn!(channel = %channel, "Worker message dropped (no receivers)");
                Ok(0)
            }
        }
    }

    fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(worker: &str) -> WorkerMessage {
        WorkerMessage {
            target_worker_id: worker.into(),
            client_id: "c1".into(),
            event_name: "notify".into(),
            event_params: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_publish_no_subscribers() {
        let bus = InMemoryWorkerBus::new();
        let receivers = bus.publish(message("w1")).await.unwrap();
        assert_eq!(receivers, 0);
        assert_eq!(bus.messages_published(), 1);
    }

    #[tokio::test]
    async fn test_publish_with_subscriber() {
        let bus = InMemoryWorkerBus::new();
        let _sub = bus.subscribe(ChannelFilter::worker("w1"));

        let receivers = bus.publish(message("w1")).await.unwrap();
        assert_eq!(receivers, 1);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_default_bus() {
        let bus = InMemoryWorkerBus::default();
        assert_eq!(bus.capacity(), DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.messages_published(), 0);
    }
}
