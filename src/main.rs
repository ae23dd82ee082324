//! Media Delivery Server
//!
//! Loads configuration, sets up logging, opens the caches and serves HTTP
//! until Ctrl-C.

use anyhow::Context;
use media_delivery::{AppState, DeliveryConfig, DeliveryServer};
use std::env;
use tracing::info;

/// # Usage
/// ```bash
/// # Start with default config (media_delivery.yaml)
/// media-delivery
///
/// # Start with custom config
/// media-delivery /path/to/config.yaml
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Media Delivery Server");

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "media_delivery.yaml".to_string());

    info!("Loading configuration from: {}", config_path);
    let config = DeliveryConfig::from_file(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path))?;

    info!("Configuration loaded successfully");
    info!("  - Bucket: {}", config.store.bucket);
    info!("  - Store endpoint: {}", config.store.endpoint);
    info!(
        "  - Metadata cache: capacity={}, ttl={}s",
        config.metadata_cache.capacity, config.metadata_cache.ttl_secs
    );
    info!(
        "  - Content cache: dir={}, max_size={} MB",
        config.content_cache.cache_dir.display(),
        config.content_cache.max_size_mb
    );
    info!(
        "  - Chunk size: {} bytes ({} KB)",
        config.streaming.chunk_size,
        config.streaming.chunk_size / 1024
    );

    let addr = config.listen_addr().context("invalid listen address")?;
    let state = AppState::from_config(config)
        .await
        .context("failed to initialize delivery service")?;

    DeliveryServer::new(state)
        .run(addr)
        .await
        .context("server terminated with an error")?;

    info!("Media Delivery Server stopped");
    Ok(())
}
