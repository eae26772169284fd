//! Client id to live connection map used for pushes.

use crate::domain::connection::{ConnectionId, ConnectionInfo};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Registry of verified connections keyed by client id.
///
/// Insertion never overwrites a live mapping. A mapping whose connection is
/// already closed counts as absent.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    clients: DashMap<String, Arc<ConnectionInfo>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `client_id` to `conn` unless a live connection already holds it.
    pub fn insert_if_absent(&self, client_id: &str, conn: &Arc<ConnectionInfo>) -> bool {
        match self.clients.entry(client_id.to_string()) {
            Entry::Occupied(mut existing) => {
                if Arc::ptr_eq(existing.get(), conn) {
                    return true;
                }
                if existing.get().is_live() {
                    warn!(
                        client_id,
                        held_by = %existing.get().id(),
                        rejected = %conn.id(),
                        "Client already mapped to a live connection"
                    );
                    return false;
                }
                existing.insert(Arc::clone(conn));
                debug!(client_id, conn = %conn.id(), "Replaced stale client mapping");
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(conn));
                debug!(client_id, conn = %conn.id(), "Client registered");
                true
            }
        }
    }

    /// Remove the mapping only if it still points at `conn_id`.
    pub fn remove(&self, client_id: &str, conn_id: ConnectionId) -> bool {
        self.clients
            .remove_if(client_id, |_, held| held.id() == conn_id)
            .is_some()
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<ConnectionInfo>> {
        self.clients.get(client_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
