//! Media Delivery
//!
//! A caching layer in front of a remote object store that serves media
//! objects over HTTP with full Range support, so browser players can seek.
//!
//! # Overview
//!
//! A request for `/stream/{path}` goes through two caches before it reaches the
//! store:
//!
//! 1. The object's metadata (size, content type, etag) comes from the
//!    [`ObjectMetadataCache`], a bounded LRU with a per-entry TTL. On a miss
//!    the store is asked and the answer cached.
//! 2. The requested bytes come from the [`ContentCache`], a disk-backed LRU of
//!    byte ranges keyed by `(path, start, end)`. On a miss exactly that range
//!    is read from the store and written to disk.
//!
//! Full-body requests are streamed in `chunk_size` pieces, each fetched
//! through the content cache, so memory stays bounded for large objects.
//!
//! The [`StoreClient`] owns the store connection. When the store reports that
//! our credentials expired it drops the connection, clears the metadata cache,
//! reconnects and retries the failed call once.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use media_delivery::{AppState, DeliveryConfig, DeliveryServer};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DeliveryConfig::from_file("media_delivery.yaml")?;
//! let addr = config.listen_addr()?;
//! let state = AppState::from_config(config).await?;
//! DeliveryServer::new(state).run(addr).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! ```yaml
//! listen_address: "0.0.0.0:8000"
//! store:
//!   bucket: "media"
//!   request_timeout_secs: 30
//! metadata_cache:
//!   capacity: 1000
//!   ttl_secs: 300
//! content_cache:
//!   cache_dir: "/tmp/video_cache"
//!   max_size_mb: 1000
//! streaming:
//!   chunk_size: 1048576
//!   max_open_range_bytes: 20971520
//! ```
//!
//! See [`DeliveryConfig`] for every option.
//!
//! # Error Handling
//!
//! All fallible operations return [`DeliveryError`]. Clients only ever see
//! the status code from [`DeliveryError::to_http_status`] and a fixed message
//! from [`DeliveryError::client_message`]; details go to the log.

pub mod config;
pub mod content_cache;
pub mod error;
pub mod health_check;
pub mod metadata_cache;
pub mod metrics;
pub mod models;
pub mod request_analyzer;
pub mod response_assembler;
pub mod server;
pub mod store;
pub mod stream_handler;

// Re-export commonly used types
pub use config::DeliveryConfig;
pub use content_cache::{ContentCache, ContentCacheStats, DetailedContentStats};
pub use error::{DeliveryError, Result};
pub use health_check::{HealthReport, HealthStatus};
pub use metadata_cache::{MetadataCacheStats, ObjectMetadataCache, TimeProvider};
pub use metrics::DeliveryMetrics;
pub use models::{ByteRange, CacheStatus, ObjectMetadata};
pub use request_analyzer::{RangeOutcome, RequestAnalyzer};
pub use response_assembler::ResponseAssembler;
pub use server::{AppState, DeliveryServer};
pub use store::{StoreClient, StoreStatus};
pub use stream_handler::{ResponseBody, StreamHandler};
