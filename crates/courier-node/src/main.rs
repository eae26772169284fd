//! # Courier Node
//!
//! Runs one gateway worker.
//!
//! ## Startup Sequence
//!
//! 1. Load configuration (`COURIER_CONFIG` TOML file, defaults otherwise)
//! 2. Load or generate the server RSA key
//! 3. Build the credential registry and the router
//! 4. Serve until Ctrl+C, then close every socket

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use courier_gateway::{CourierService, GatewayConfig, RpcRouter, StaticCredentialRegistry};
use serde_json::json;
use shared_crypto::{generate_private_key, private_key_from_pem, RsaPrivateKey};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CONFIG_ENV: &str = "COURIER_CONFIG";
const GENERATED_KEY_BITS: usize = 2048;

fn load_config() -> Result<GatewayConfig> {
    let Ok(path) = std::env::var(CONFIG_ENV) else {
        info!("{CONFIG_ENV} not set, using default configuration");
        return Ok(GatewayConfig::default());
    };
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading config file {path}"))?;
    let config: GatewayConfig = toml::from_str(&text).with_context(|| format!("parsing config file {path}"))?;
    info!(path = %path, "Loaded configuration");
    Ok(config)
}

fn load_private_key(path: Option<&Path>) -> Result<RsaPrivateKey> {
    match path {
        Some(path) => {
            let pem = std::fs::read_to_string(path)
                .with_context(|| format!("reading private key {}", path.display()))?;
            private_key_from_pem(&pem).with_context(|| format!("parsing private key {}", path.display()))
        }
        None => {
            warn!("No keys.private_key_path configured; generating a throwaway {GENERATED_KEY_BITS}-bit key");
            generate_private_key(GENERATED_KEY_BITS).context("generating private key")
        }
    }
}

fn build_router(config: &GatewayConfig) -> Result<Arc<RpcRouter>> {
    let router = RpcRouter::builder(config.worker.id.as_str())
        .presence_ttl(config.worker.presence_ttl)
        .build();
    router.register_api("ping", |_ctx| async { Ok(json!({ "pong": true })) })?;
    Ok(router)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let config = load_config()?;
    let private_key = load_private_key(config.keys.private_key_path.as_deref())?;
    let credentials = StaticCredentialRegistry::from_config(&config.credentials)
        .context("loading credential entries")?;
    info!(count = credentials.len(), "Credential registry ready");

    let router = build_router(&config)?;
    let service = CourierService::new(config, router, Arc::new(credentials), Arc::new(private_key))?;
    let listener = service.bind().await?;

    info!("Courier node v{} running. Press Ctrl+C to stop.", courier_gateway::VERSION);
    service
        .run(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Ctrl+C handler failed; shutting down");
            }
        })
        .await?;

    info!("Courier node stopped");
    Ok(())
}
