//! Socket liveness sweep.
//!
//! Clients ping at the advertised interval. Every `ping / 3` the sweep
//! force-closes sockets silent for longer than `ping + grace`.

use crate::domain::config::SocketConfig;
use crate::domain::connection::{ConnectionId, ConnectionInfo};
use crate::ports::CloseReason;
use crate::router::RpcRouter;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Tracks open sockets for the idle sweep.
#[derive(Debug)]
pub struct LivenessMonitor {
    sockets: DashMap<ConnectionId, Arc<ConnectionInfo>>,
    idle_limit: Duration,
    sweep_interval: Duration,
}

impl LivenessMonitor {
    pub fn new(config: &SocketConfig) -> Self {
        Self {
            sockets: DashMap::new(),
            idle_limit: config.idle_limit(),
            sweep_interval: config.sweep_interval(),
        }
    }

    pub fn track(&self, conn: &Arc<ConnectionInfo>) {
        self.sockets.insert(conn.id(), Arc::clone(conn));
    }

    pub fn untrack(&self, id: ConnectionId) {
        self.sockets.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// Close idle sockets and forget closed ones. Returns how many were
    /// force-closed.
    pub async fn sweep_once(&self, router: &RpcRouter, now_ms: i64) -> usize {
        let idle_limit_ms = i64::try_from(self.idle_limit.as_millis()).unwrap_or(i64::MAX);
        let mut idle = Vec::new();
        self.sockets.retain(|_, conn| {
            if !conn.is_live() {
                return false;
            }
            if now_ms.saturating_sub(conn.last_activity_ms()) > idle_limit_ms {
                idle.push(Arc::clone(conn));
                return false;
            }
            true
        });

        let mut closed = 0;
        for conn in idle {
            info!(
                conn = %conn.id(),
                idle_ms = now_ms - conn.last_activity_ms(),
                "Closing idle socket"
            );
            if router.close_connection(&conn, CloseReason::IdleTimeout).await {
                closed += 1;
            }
        }
        closed
    }

    /// Close every tracked socket, e.g. on shutdown.
    pub async fn close_all(&self, router: &RpcRouter, reason: CloseReason) -> usize {
        let sockets: Vec<_> = self.sockets.iter().map(|entry| Arc::clone(entry.value())).collect();
        self.sockets.clear();
        let mut closed = 0;
        for conn in sockets {
            if router.close_connection(&conn, reason).await {
                closed += 1;
            }
        }
        closed
    }
}

/// Background task running the liveness sweep.
pub async fn liveness_task(monitor: Arc<LivenessMonitor>, router: Arc<RpcRouter>) {
    let mut sweep_interval = tokio::time::interval(monitor.sweep_interval());
    sweep_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        sweep_interval.tick().await;
        let closed = monitor.sweep_once(&router, router.now_ms()).await;
        if closed > 0 {
            debug!(closed, remaining = monitor.len(), "Liveness sweep closed idle sockets");
        }
    }
}
