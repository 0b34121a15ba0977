//! formseal server
//!
//! Loads `config.toml` (or the path given as the first argument), validates
//! it once and serves the submission endpoint.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use formseal::configs::AppConfig;
use formseal::gateway::Gateway;
use formseal::session::MemorySessionStore;
use formseal::webserver;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("formseal=info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => AppConfig::from_file(&path),
        None => AppConfig::load(),
    }
    .context("Failed to load configuration")?;

    if config.server.debug {
        info!("debug mode: error responses include request details");
    }
    if !formseal::entropy::platform_available() {
        tracing::warn!("platform RNG unavailable, session keys use degraded entropy");
    }

    let gateway = Arc::new(Gateway::new(&config, Arc::new(MemorySessionStore::new())));
    info!(
        rsa_bits = config.keys.rsa_bits,
        digest = ?config.integrity.digest,
        "gateway initialized"
    );
    webserver::start_webserver(config, gateway)
}
