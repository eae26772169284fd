//! # Worker Messages
//!
//! Messages carried between worker processes on the worker bus. Each worker
//! subscribes to its own channel; a router that wants to reach a client held
//! by another worker publishes on that worker's channel.

use crate::WORKER_CHANNEL_PREFIX;
use serde::{Deserialize, Serialize};

/// Name of the channel owned by `worker_id`.
pub fn worker_channel(worker_id: &str) -> String {
    format!("{WORKER_CHANNEL_PREFIX}{worker_id}")
}

/// An event addressed to a client connected to another worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerMessage {
    /// Worker that holds the client's connection.
    pub target_worker_id: String,
    /// Stable client id the event is for.
    pub client_id: String,
    /// Event name pushed to the client.
    pub event_name: String,
    /// Event payload.
    pub event_params: serde_json::Value,
}

impl WorkerMessage {
    /// Channel this message must be published on.
    pub fn channel(&self) -> String {
        worker_channel(&self.target_worker_id)
    }
}

/// A message as it travels on the bus, tagged with its channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// Channel name.
    pub channel: String,
    /// Payload.
    pub message: WorkerMessage,
}

/// Filter for channel subscriptions.
#[derive(Debug, Clone, Default)]
pub struct ChannelFilter {
    /// Channels to receive (empty = all).
    pub channels: Vec<String>,
}

impl ChannelFilter {
    /// Receive messages from every channel.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Receive messages from the listed channels only.
    #[must_use]
    pub fn channels(channels: Vec<String>) -> Self {
        Self { channels }
    }

    /// Receive messages addressed to one worker.
    #[must_use]
    pub fn worker(worker_id: &str) -> Self {
        Self::channels(vec![worker_channel(worker_id)])
    }

    /// Check if a message matches this filter.
    #[must_use]
    pub fn matches(&self, message: &ChannelMessage) -> bool {
        self.channels.is_empty() || self.channels.iter().any(|c| c == &message.channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(worker: &str) -> ChannelMessage {
        let message = WorkerMessage {
            target_worker_id: worker.into(),
            client_id: "client-7".into(),
            event_name: "orderShipped".into(),
            event_params: serde_json::json!({"orderId": 42}),
        };
        ChannelMessage {
            channel: message.channel(),
            message,
        }
    }

    #[test]
    fn test_filter_all() {
        assert!(ChannelFilter::all().matches(&message("w1")));
    }

    #[test]
    fn test_filter_by_worker() {
        let filter = ChannelFilter::worker("w1");
        assert!(filter.matches(&message("w1")));
        assert!(!filter.matches(&message("w2")));
    }

    #[test]
    fn test_wire_field_names() {
        let json = serde_json::to_value(&message("w1").message).unwrap();
        assert_eq!(json["targetWorkerId"], "w1");
        assert_eq!(json["clientId"], "client-7");
        assert_eq!(json["eventName"], "orderShipped");
        assert_eq!(json["eventParams"]["orderId"], 42);
    }
}
