//! # Key-Value Store
//!
//! The narrow store contract the protocol engine depends on. Semantics follow
//! the familiar remote-store commands:
//!
//! - `exists` / `set` / `expire` / `incr` act on a single key.
//! - `multi_exec` runs a command list as one unit; no other command observes
//!   a partially applied list.
//! - An expired key behaves exactly like a missing key.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors from store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A command was applied to a value of the wrong kind.
    #[error("value at {key} is not an integer")]
    NotAnInteger {
        /// Key holding the value.
        key: String,
    },
}

/// One command inside a `multi_exec` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvCommand {
    /// Set a string value (clears any TTL).
    Set {
        /// Key.
        key: String,
        /// Value.
        value: String,
    },
    /// Attach a TTL to an existing key.
    Expire {
        /// Key.
        key: String,
        /// Time to live.
        ttl: Duration,
    },
    /// Increment an integer value, creating it at 0 first.
    Incr {
        /// Key.
        key: String,
    },
}

/// Reply to one command of a `multi_exec` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvReply {
    /// `Set` acknowledged.
    Ok,
    /// `Expire` result: whether the key existed.
    Bool(bool),
    /// `Incr` result: the new value.
    Int(i64),
}

/// Store contract used for replay protection and presence bookkeeping.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Whether `key` holds an unexpired value.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Set `key` to `value`, clearing any TTL.
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Attach `ttl` to `key`. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Increment the integer at `key` and return the new value.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Run `commands` as one unit and return one reply per command.
    async fn multi_exec(&self, commands: Vec<KvCommand>) -> Result<Vec<KvReply>, StoreError>;
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Single-process store backed by a mutex-guarded map.
///
/// Expired keys are dropped lazily on access and by [`purge_expired`].
///
/// [`purge_expired`]: InMemoryKeyValueStore::purge_expired
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    entries: Mutex<HashMap<String, Entry>>,
    offline: AtomicBool,
}

impl InMemoryKeyValueStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store becoming unreachable (or reachable again).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|e| e.is_live(now)).count()
    }

    /// Whether the store holds no live keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store marked offline".into()));
        }
        Ok(())
    }

    fn apply(
        entries: &mut HashMap<String, Entry>,
        command: KvCommand,
        now: Instant,
    ) -> Result<KvReply, StoreError> {
        // Drop a stale entry first so every command sees expiry consistently.
        let key = match &command {
            KvCommand::Set { key, .. } | KvCommand::Expire { key, .. } | KvCommand::Incr { key } => {
                key.clone()
            }
        };
        if entries.get(&key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(&key);
        }

        match command {
            KvCommand::Set { key, value } => {
                entries.insert(key, Entry { value, expires_at: None });
                Ok(KvReply::Ok)
            }
            KvCommand::Expire { key, ttl } => match entries.get_mut(&key) {
                Some(entry) => {
                    entry.expires_at = Some(now + ttl);
                    Ok(KvReply::Bool(true))
                }
                None => Ok(KvReply::Bool(false)),
            },
            KvCommand::Incr { key } => {
                let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                    value: "0".into(),
                    expires_at: None,
                });
                let current: i64 = entry
                    .value
                    .parse()
                    .map_err(|_| StoreError::NotAnInteger { key })?;
                let next = current + 1;
                entry.value = next.to_string();
                Ok(KvReply::Int(next))
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_online()?;
        let now = Instant::now();
        Ok(self.entries.lock().get(key).is_some_and(|e| e.is_live(now)))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.multi_exec(vec![KvCommand::Set {
            key: key.into(),
            value: value.into(),
        }])
        .await
        .map(|_| ())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let replies = self
            .multi_exec(vec![KvCommand::Expire { key: key.into(), ttl }])
            .await?;
        Ok(matches!(replies.first(), Some(KvReply::Bool(true))))
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let replies = self.multi_exec(vec![KvCommand::Incr { key: key.into() }]).await?;
        match replies.first() {
            Some(KvReply::Int(n)) => Ok(*n),
            _ => Err(StoreError::NotAnInteger { key: key.into() }),
        }
    }

    async fn multi_exec(&self, commands: Vec<KvCommand>) -> Result<Vec<KvReply>, StoreError> {
        self.ensure_online()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        commands
            .into_iter()
            .map(|command| Self::apply(&mut entries, command, now))
            .collect()
    }
}
