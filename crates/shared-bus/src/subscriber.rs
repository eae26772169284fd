//! # Worker Subscriber
//!
//! Defines the subscription side of the worker bus.

use crate::events::{ChannelFilter, ChannelMessage, WorkerMessage};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

/// Errors from subscription operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The bus was closed.
    #[error("Worker bus closed")]
    Closed,
}

/// Trait for subscribing to worker channels.
pub trait WorkerSubscriber: Send + Sync {
    /// Subscribe to messages matching a filter.
    fn subscribe(&self, filter: ChannelFilter) -> Subscription;
}

/// A subscription handle for receiving worker messages.
///
/// Dropping it releases the underlying broadcast receiver.
pub struct Subscription {
    receiver: broadcast::Receiver<ChannelMessage>,
    filter: ChannelFilter,
}

impl Subscription {
    pub(crate) fn new(receiver: broadcast::Receiver<ChannelMessage>, filter: ChannelFilter) -> Self {
        Self { receiver, filter }
    }

    /// Receive the next message on a subscribed channel.
    ///
    /// # Returns
    ///
    /// - `Some(message)` - The next matching message
    /// - `None` - The bus was dropped
    pub async fn recv(&mut self) -> Option<WorkerMessage> {
        loop {
            let message = match self.receiver.recv().await {
                Ok(m) => m,
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    debug!(lagged = count, "Subscriber lagged, some worker messages dropped");
                    continue;
                }
            };

            if self.filter.matches(&message) {
                return Some(message.message);
            }
        }
    }

    /// Try to receive the next message without blocking.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(message))` - A matching message was available
    /// - `Ok(None)` - No message available
    /// - `Err(SubscriptionError::Closed)` - The bus was closed
    pub fn try_recv(&mut self) -> Result<Option<WorkerMessage>, SubscriptionError> {
        loop {
            let message = match self.receiver.try_recv() {
                Ok(m) => m,
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Err(SubscriptionError::Closed)
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            };

            if self.filter.matches(&message) {
                return Ok(Some(message.message));
            }
        }
    }

    /// Get the filter for this subscription.
    #[must_use]
    pub fn filter(&self) -> &ChannelFilter {
        &self.filter
    }
}
