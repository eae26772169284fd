//! Gateway configuration with validation.

use serde::{Deserialize, Serialize};
use shared_crypto::IvMode;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener address
    pub http: HttpConfig,
    /// Socket transport liveness
    pub socket: SocketConfig,
    /// Frame and body codec
    pub codec: CodecConfig,
    /// Server-to-server transport
    pub authenticated: AuthenticatedConfig,
    /// Lenient third-party transport
    pub third_party: ThirdPartyConfig,
    /// Worker identity for cross-process push
    pub worker: WorkerConfig,
    /// Server key material
    pub keys: KeysConfig,
    /// Static credential entries
    pub credentials: Vec<CredentialConfig>,
}

impl GatewayConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socket.ping_interval < Duration::from_secs(1) {
            return Err(ConfigError::InvalidTimeout(
                "socket.ping_interval must be at least 1s".into(),
            ));
        }

        if self.authenticated.request_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "authenticated.request_timeout cannot be 0".into(),
            ));
        }

        if self.authenticated.sweep_interval.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "authenticated.sweep_interval cannot be 0".into(),
            ));
        }

        if self.authenticated.replay_ttl.is_zero() || self.authenticated.timestamp_tolerance.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "replay ttl and timestamp tolerance must be positive".into(),
            ));
        }

        if self.authenticated.protocol_version.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "authenticated.protocol_version cannot be empty".into(),
            ));
        }

        if self.codec.max_body_bytes == 0 {
            return Err(ConfigError::InvalidLimit("codec.max_body_bytes cannot be 0".into()));
        }

        if self.worker.id.trim().is_empty() {
            return Err(ConfigError::Invalid("worker.id cannot be empty".into()));
        }

        for credential in &self.credentials {
            if credential.client_id.trim().is_empty() {
                return Err(ConfigError::Invalid("credential with empty client_id".into()));
            }
        }

        Ok(())
    }

    /// Listener socket address
    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.http.host, self.http.port)
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: IpAddr,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 7400,
        }
    }
}

/// Socket liveness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Interval clients are told to ping at
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,
    /// Extra silence tolerated past the ping interval
    #[serde(with = "humantime_serde")]
    pub grace: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            grace: Duration::from_secs(10),
        }
    }
}

impl SocketConfig {
    /// How often the liveness sweep runs.
    pub fn sweep_interval(&self) -> Duration {
        self.ping_interval / 3
    }

    /// Silence after which a socket is force-closed.
    pub fn idle_limit(&self) -> Duration {
        self.ping_interval + self.grace
    }
}

/// IV selection as written in config files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IvModeConfig {
    #[default]
    Fixed,
    Random,
}

impl From<IvModeConfig> for IvMode {
    fn from(mode: IvModeConfig) -> Self {
        match mode {
            IvModeConfig::Fixed => IvMode::Fixed,
            IvModeConfig::Random => IvMode::Random,
        }
    }
}

/// Codec configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Bodies longer than this are compressed
    pub compression_threshold: usize,
    /// IV selection for AES-CBC
    pub iv_mode: IvModeConfig,
    /// Upper bound for a decompressed body
    pub max_body_bytes: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression_threshold: 1024,
            iv_mode: IvModeConfig::Fixed,
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Authenticated server-to-server transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthenticatedConfig {
    /// Exact protocol version callers must declare
    pub protocol_version: String,
    /// Allowed clock distance for signed timestamps
    #[serde(with = "humantime_serde")]
    pub timestamp_tolerance: Duration,
    /// Replay guard entry lifetime
    #[serde(with = "humantime_serde")]
    pub replay_ttl: Duration,
    /// Outstanding request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Outstanding request sweep cadence
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for AuthenticatedConfig {
    fn default() -> Self {
        Self {
            protocol_version: "1".into(),
            timestamp_tolerance: Duration::from_secs(15 * 60),
            replay_ttl: Duration::from_secs(30 * 60),
            request_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

/// Third-party transport
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThirdPartyConfig {
    /// URL markers accepted on `/tp/{marker}/...`
    pub markers: Vec<String>,
}

/// Worker identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub id: String,
    /// Lifetime of a presence key without a refreshing ping
    #[serde(with = "humantime_serde")]
    pub presence_ttl: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: "worker-1".into(),
            presence_ttl: Duration::from_secs(90),
        }
    }
}

/// Server key material
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// PKCS#8 PEM private key; a throwaway key is generated when absent
    pub private_key_path: Option<PathBuf>,
}

/// One static credential entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    pub client_id: String,
    /// SPKI PEM public key (authenticated transport)
    pub public_key_pem: Option<String>,
    /// Shared secret (third-party transport)
    pub shared_secret: Option<String>,
    pub host: String,
    pub port: u16,
    /// Empty means any address
    pub permitted_ips: Vec<IpAddr>,
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Invalid size or count limit
    #[error("invalid limit: {0}")]
    InvalidLimit(String),
    /// Invalid timeout value
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
    /// Unusable key material
    #[error("invalid key: {0}")]
    InvalidKey(String),
    /// General configuration error
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.socket.ping_interval, Duration::from_secs(30));
        assert_eq!(config.socket.sweep_interval(), Duration::from_secs(10));
        assert_eq!(config.socket.idle_limit(), Duration::from_secs(40));
        assert_eq!(config.authenticated.protocol_version, "1");
        assert_eq!(config.codec.compression_threshold, 1024);
        assert_eq!(config.codec.iv_mode, IvModeConfig::Fixed);
    }

    #[test]
    fn test_short_ping_rejected() {
        let mut config = GatewayConfig::default();
        config.socket.ping_interval = Duration::from_millis(500);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTimeout(_))));
    }

    #[test]
    fn test_empty_version_rejected() {
        let mut config = GatewayConfig::default();
        config.authenticated.protocol_version = " ".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_request_timeout_rejected() {
        let mut config = GatewayConfig::default();
        config.authenticated.request_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: GatewayConfig = serde_json::from_value(serde_json::json!({
            "socket": { "ping_interval": "5s" },
            "codec": { "iv_mode": "random" },
            "third_party": { "markers": ["acme"] }
        }))
        .unwrap();
        assert_eq!(config.socket.ping_interval, Duration::from_secs(5));
        assert_eq!(config.socket.grace, Duration::from_secs(10));
        assert_eq!(IvMode::from(config.codec.iv_mode), IvMode::Random);
        assert_eq!(config.third_party.markers, vec!["acme".to_string()]);
        assert_eq!(config.http_addr().port(), 7400);
    }
}
