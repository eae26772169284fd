//! Outbound ports for the gateway.

use crate::domain::config::CredentialConfig;
use crate::domain::error::ApiError;
use async_trait::async_trait;
use shared_crypto::{public_key_from_pem, CryptoError, RsaPublicKey};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, Ordering};

/// Time source trait for testability
pub trait TimeSource: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// System time implementation
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            // Clock before Unix epoch - return 0 rather than panic
            .unwrap_or(0)
    }
}

/// Manually driven clock.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by_ms: i64) {
        self.now.fetch_add(by_ms, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// What the gateway knows about a remote party.
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub client_id: String,
    /// Verifies timestamp signatures; wraps keys sent to this party.
    pub public_key: Option<RsaPublicKey>,
    /// Derives the third-party session key.
    pub shared_secret: Option<String>,
    pub host: String,
    pub port: u16,
    /// Empty means any address.
    pub permitted_ips: Vec<IpAddr>,
}

impl Credential {
    /// Whether a caller at `ip` may use this credential.
    pub fn permits(&self, ip: Option<IpAddr>) -> bool {
        if self.permitted_ips.is_empty() {
            return true;
        }
        ip.is_some_and(|ip| self.permitted_ips.contains(&ip))
    }

    pub fn from_config(config: &CredentialConfig) -> Result<Self, CryptoError> {
        let public_key = config
            .public_key_pem
            .as_deref()
            .map(public_key_from_pem)
            .transpose()?;
        Ok(Self {
            client_id: config.client_id.clone(),
            public_key,
            shared_secret: config.shared_secret.clone(),
            host: config.host.clone(),
            port: config.port,
            permitted_ips: config.permitted_ips.clone(),
        })
    }
}

/// Credential lookup (key registry, directory service, database...).
#[async_trait]
pub trait CredentialRegistry: Send + Sync {
    /// `Ok(None)` when the client id is unknown.
    async fn get_credential(&self, client_id: &str) -> Result<Option<Credential>, ApiError>;
}

/// Registry over a fixed credential set.
#[derive(Debug, Default)]
pub struct StaticCredentialRegistry {
    credentials: HashMap<String, Credential>,
}

impl StaticCredentialRegistry {
    pub fn new(credentials: impl IntoIterator<Item = Credential>) -> Self {
        Self {
            credentials: credentials
                .into_iter()
                .map(|c| (c.client_id.clone(), c))
                .collect(),
        }
    }

    pub fn from_config(entries: &[CredentialConfig]) -> Result<Self, CryptoError> {
        let credentials = entries
            .iter()
            .map(Credential::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(credentials))
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

#[async_trait]
impl CredentialRegistry for StaticCredentialRegistry {
    async fn get_credential(&self, client_id: &str) -> Result<Option<Credential>, ApiError> {
        Ok(self.credentials.get(client_id).cloned())
    }
}
