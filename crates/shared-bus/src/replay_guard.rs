//! # Replay Guard
//!
//! Rejects authenticated requests that were already accepted once.
//!
//! ## Design
//!
//! - The composite key is `(timestamp, clientId, apiName, sha256(rawBody))`.
//! - Timestamps outside the freshness window are rejected before the store is
//!   touched, so the guard only ever has to remember one window of keys.
//! - Check and insert is a single `INCR key`. The first submitter observes 1;
//!   every later one observes a larger count. Only the first submitter sets
//!   `EXPIRE key ttl`, so replays never push the expiry out.
//! - A store failure rejects the request. The guard being reachable is a
//!   precondition for trusting the authenticated transport.

use crate::store::{KeyValueStore, StoreError};
use shared_crypto::sha256_hex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from replay checks.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplayError {
    /// The exact request was already accepted within the TTL.
    #[error("request {key} was already seen")]
    Replayed {
        /// Store key of the duplicate.
        key: String,
    },

    /// The request timestamp is outside the freshness window.
    #[error("request timestamp {timestamp} is {skew_ms}ms away from now (tolerance {tolerance_ms}ms)")]
    TimestampOutOfWindow {
        /// Declared request timestamp (ms).
        timestamp: i64,
        /// Absolute distance from the receiver clock (ms).
        skew_ms: u64,
        /// Allowed distance (ms).
        tolerance_ms: u64,
    },

    /// The store could not be consulted.
    #[error("replay store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

/// Composite identity of one authenticated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayKey {
    /// Declared request timestamp (ms).
    pub timestamp: i64,
    /// Sending client id.
    pub client_id: String,
    /// Invoked API name.
    pub api_name: String,
    /// SHA-256 of the raw request body.
    pub body_hash: String,
}

impl ReplayKey {
    /// Build a key from the raw request parts.
    pub fn new(timestamp: i64, client_id: &str, api_name: &str, raw_body: &[u8]) -> Self {
        Self {
            timestamp,
            client_id: client_id.to_string(),
            api_name: api_name.to_string(),
            body_hash: sha256_hex(raw_body),
        }
    }

    /// Store key for this request.
    pub fn store_key(&self) -> String {
        format!(
            "replay:{}:{}:{}:{}",
            self.timestamp, self.client_id, self.api_name, self.body_hash
        )
    }
}

/// Replay guard over a shared key-value store.
pub struct ReplayGuard {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
    tolerance: Duration,
}

impl ReplayGuard {
    /// Default entry lifetime.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

    /// Default freshness window on either side of the receiver clock.
    pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(15 * 60);

    /// Create a guard with default TTL and tolerance.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_config(store, Self::DEFAULT_TTL, Self::DEFAULT_TOLERANCE)
    }

    /// Create a guard with custom settings.
    pub fn with_config(store: Arc<dyn KeyValueStore>, ttl: Duration, tolerance: Duration) -> Self {
        Self {
            store,
            ttl,
            tolerance,
        }
    }

    /// Entry lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Reject timestamps further than the tolerance from `now_ms`.
    pub fn check_freshness(&self, timestamp: i64, now_ms: i64) -> Result<(), ReplayError> {
        let tolerance_ms = u64::try_from(self.tolerance.as_millis()).unwrap_or(u64::MAX);
        let skew_ms = now_ms.abs_diff(timestamp);
        if skew_ms > tolerance_ms {
            return Err(ReplayError::TimestampOutOfWindow {
                timestamp,
                skew_ms,
                tolerance_ms,
            });
        }
        Ok(())
    }

    /// Validate freshness, then record the key, rejecting duplicates.
    ///
    /// # Errors
    ///
    /// - `ReplayError::TimestampOutOfWindow` - stale or future timestamp
    /// - `ReplayError::Replayed` - key already recorded and unexpired
    /// - `ReplayError::StoreUnavailable` - the store failed
    pub async fn validate_and_insert(&self, key: &ReplayKey, now_ms: i64) -> Result<(), ReplayError> {
        self.check_freshness(key.timestamp, now_ms)?;

        let store_key = key.store_key();
        let count = self.store.incr(&store_key).await.map_err(store_failure)?;
        if count > 1 {
            warn!(client_id = %key.client_id, api = %key.api_name, count, "Replayed request rejected");
            return Err(ReplayError::Replayed { key: store_key });
        }

        self.store
            .expire(&store_key, self.ttl)
            .await
            .map_err(store_failure)?;
        debug!(key = %store_key, "Replay guard entry recorded");
        Ok(())
    }
}

fn store_failure(error: StoreError) -> ReplayError {
    warn!(error = %error, "Replay guard store failure");
    ReplayError::StoreUnavailable(error)
}
