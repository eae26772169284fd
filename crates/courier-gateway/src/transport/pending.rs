//! Outstanding request store for HTTP exchanges.
//!
//! Every exchange is registered when its request is dispatched and completed
//! when the reply is written. A periodic sweep answers exchanges that outlive
//! the request timeout with `REQUEST_TIMED_OUT` and closes them.

use crate::domain::connection::{ConnectionId, ConnectionInfo};
use crate::domain::envelope::WireEnvelope;
use crate::domain::error::ApiError;
use crate::ports::CloseReason;
use crate::router::RpcRouter;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// An exchange waiting for its reply
struct PendingExchange {
    conn: Arc<ConnectionInfo>,
    /// Name and ts of the request, for the timeout reply
    request: WireEnvelope,
    started_ms: i64,
}

/// Statistics for the pending store
#[derive(Debug, Default)]
pub struct PendingStats {
    /// Total exchanges registered
    pub total_registered: AtomicU64,
    /// Total exchanges answered in time
    pub total_completed: AtomicU64,
    /// Total exchanges timed out
    pub total_timeouts: AtomicU64,
}

/// Pending exchange store keyed by connection id.
pub struct PendingExchangeStore {
    pending: DashMap<ConnectionId, PendingExchange>,
    timeout: Duration,
    stats: PendingStats,
}

impl PendingExchangeStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            timeout,
            stats: PendingStats::default(),
        }
    }

    /// Register an exchange whose request is about to be dispatched.
    pub fn register(&self, conn: &Arc<ConnectionInfo>, request: &WireEnvelope, now_ms: i64) {
        self.pending.insert(
            conn.id(),
            PendingExchange {
                conn: Arc::clone(conn),
                request: WireEnvelope::request(request.name(), request.ts(), Value::Null),
                started_ms: now_ms,
            },
        );
        self.stats.total_registered.fetch_add(1, Ordering::Relaxed);
        debug!(conn = %conn.id(), api = request.name(), "Registered pending exchange");
    }

    /// Forget a finished exchange. False if the sweep already took it.
    pub fn complete(&self, id: ConnectionId) -> bool {
        if self.pending.remove(&id).is_some() {
            self.stats.total_completed.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Answer and close every exchange older than the timeout.
    ///
    /// Returns the number of exchanges timed out.
    pub async fn remove_expired(&self, router: &RpcRouter, now_ms: i64) -> usize {
        let timeout_ms = i64::try_from(self.timeout.as_millis()).unwrap_or(i64::MAX);
        let mut expired = Vec::new();
        self.pending.retain(|id, exchange| {
            let elapsed = now_ms.saturating_sub(exchange.started_ms);
            if elapsed > timeout_ms {
                warn!(
                    conn = %id,
                    api = exchange.request.name(),
                    elapsed_ms = elapsed,
                    timeout_ms,
                    "Timing out pending exchange"
                );
                expired.push((Arc::clone(&exchange.conn), exchange.request.clone()));
                false
            } else {
                true
            }
        });

        let removed = expired.len();
        for (conn, request) in expired {
            self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
            conn.send(vec![request.respond_error(&ApiError::request_timed_out(request.name()))]);
            router.close_connection(&conn, CloseReason::TimedOut).await;
        }
        removed
    }

    /// Get number of currently pending exchanges
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: ConnectionId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn stats(&self) -> &PendingStats {
        &self.stats
    }
}

/// Background task sweeping expired exchanges
pub async fn sweep_task(store: Arc<PendingExchangeStore>, router: Arc<RpcRouter>, interval: Duration) {
    let mut sweep_interval = tokio::time::interval(interval);
    sweep_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        sweep_interval.tick().await;
        let removed = store.remove_expired(&router, router.now_ms()).await;
        if removed > 0 {
            debug!(removed, "Timed out pending exchanges");
        }
    }
}
