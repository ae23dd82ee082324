//! Configuration management for the media delivery service

use crate::error::{DeliveryError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for the delivery service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Address the HTTP server binds to (default: "0.0.0.0:8000")
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub metadata_cache: MetadataCacheConfig,

    #[serde(default)]
    pub content_cache: ContentCacheConfig,

    #[serde(default)]
    pub streaming: StreamingConfig,
}

/// HTTP server transport settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Seconds allowed for a client to send request headers (default: 30)
    #[serde(default = "default_header_read_timeout")]
    pub header_read_timeout_secs: u64,
}

/// Remote object store settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Bucket holding the media objects
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Base URL of the storage JSON API (default: "https://storage.googleapis.com")
    #[serde(default = "default_store_endpoint")]
    pub endpoint: String,

    /// Base URL used to build public object links
    #[serde(default = "default_store_endpoint")]
    pub public_base_url: String,

    /// File holding a bearer token for the service account (optional).
    /// Re-read on every reconnect.
    #[serde(default)]
    pub credentials_path: Option<PathBuf>,

    /// Environment variable consulted for a token when no credentials file is set
    #[serde(default = "default_access_token_env")]
    pub access_token_env: String,

    /// Per-operation timeout for store calls in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Object metadata cache settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataCacheConfig {
    /// Maximum number of cached objects (default: 1000)
    #[serde(default = "default_metadata_capacity")]
    pub capacity: usize,

    /// Entry lifetime in seconds (default: 300)
    #[serde(default = "default_metadata_ttl")]
    pub ttl_secs: u64,
}

/// Byte-range content cache settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentCacheConfig {
    /// Directory holding chunk and sidecar files (default: /tmp/video_cache)
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Capacity in megabytes (default: 1000)
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,

    /// Fraction of capacity eviction shrinks the cache to (default: 0.8)
    #[serde(default = "default_eviction_target_ratio")]
    pub eviction_target_ratio: f64,

    /// Number of entries listed by the detailed stats view (default: 10)
    #[serde(default = "default_detailed_stats_limit")]
    pub detailed_stats_limit: usize,
}

/// Range handling and streaming settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamingConfig {
    /// Size of each piece of a streamed full body (default: 1MB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Upper bound on the bytes served for an open-ended range
    /// such as `bytes=100-` (default: 20MB, `null` disables the cap)
    #[serde(default = "default_max_open_range")]
    pub max_open_range_bytes: Option<u64>,

    /// max-age advertised in Cache-Control (default: 3600)
    #[serde(default = "default_cache_max_age")]
    pub cache_max_age_secs: u64,
}

// Default value functions for serde
fn default_listen_address() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_header_read_timeout() -> u64 {
    30
}

fn default_bucket() -> String {
    "media".to_string()
}

fn default_store_endpoint() -> String {
    "https://storage.googleapis.com".to_string()
}

fn default_access_token_env() -> String {
    "GCS_ACCESS_TOKEN".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_metadata_capacity() -> usize {
    1000
}

fn default_metadata_ttl() -> u64 {
    300 // 5 minutes
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/tmp/video_cache")
}

fn default_max_size_mb() -> u64 {
    1000
}

fn default_eviction_target_ratio() -> f64 {
    0.8
}

fn default_detailed_stats_limit() -> usize {
    10
}

fn default_chunk_size() -> u64 {
    1024 * 1024 // 1MB
}

fn default_max_open_range() -> Option<u64> {
    Some(20 * 1024 * 1024) // 20MB
}

fn default_cache_max_age() -> u64 {
    3600 // 1 hour
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            header_read_timeout_secs: default_header_read_timeout(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            endpoint: default_store_endpoint(),
            public_base_url: default_store_endpoint(),
            credentials_path: None,
            access_token_env: default_access_token_env(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl StoreConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for MetadataCacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_metadata_capacity(),
            ttl_secs: default_metadata_ttl(),
        }
    }
}

impl MetadataCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for ContentCacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            max_size_mb: default_max_size_mb(),
            eviction_target_ratio: default_eviction_target_ratio(),
            detailed_stats_limit: default_detailed_stats_limit(),
        }
    }
}

impl ContentCacheConfig {
    /// Capacity in bytes
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(1024 * 1024)
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_open_range_bytes: default_max_open_range(),
            cache_max_age_secs: default_cache_max_age(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig {
            listen_address: default_listen_address(),
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            metadata_cache: MetadataCacheConfig::default(),
            content_cache: ContentCacheConfig::default(),
            streaming: StreamingConfig::default(),
        }
    }
}

impl DeliveryConfig {
    /// Load configuration from a YAML file
    ///
    /// # Arguments
    /// * `path` - Path to the YAML configuration file
    ///
    /// # Returns
    /// * `Ok(DeliveryConfig)` if loading and validation succeed
    /// * `Err(DeliveryError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            DeliveryError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: DeliveryConfig = serde_yaml::from_str(content).map_err(|e| {
            DeliveryError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - listen_address must be a socket address
    /// - bucket and endpoint must not be empty
    /// - request timeout, metadata capacity and TTL must be > 0
    /// - max_size_mb must be > 0 and fit in bytes as a u64
    /// - eviction_target_ratio must be in (0, 1]
    /// - chunk_size must be between 64KB and 16MB
    /// - max_open_range_bytes, if set, must be > 0
    pub fn validate(&self) -> Result<()> {
        const MIN_CHUNK_SIZE: u64 = 64 * 1024; // 64KB
        const MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024; // 16MB

        self.listen_addr()?;

        if self.store.bucket.trim().is_empty() {
            return Err(DeliveryError::ConfigError(
                "store.bucket must not be empty".to_string(),
            ));
        }

        if self.store.endpoint.trim().is_empty() {
            return Err(DeliveryError::ConfigError(
                "store.endpoint must not be empty".to_string(),
            ));
        }

        if self.store.request_timeout_secs == 0 {
            return Err(DeliveryError::ConfigError(
                "store.request_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.metadata_cache.capacity == 0 {
            return Err(DeliveryError::ConfigError(
                "metadata_cache.capacity must be greater than 0".to_string(),
            ));
        }

        if self.metadata_cache.ttl_secs == 0 {
            return Err(DeliveryError::ConfigError(
                "metadata_cache.ttl_secs must be greater than 0".to_string(),
            ));
        }

        if self.content_cache.max_size_mb == 0 {
            return Err(DeliveryError::ConfigError(
                "content_cache.max_size_mb must be greater than 0".to_string(),
            ));
        }

        if self.content_cache.max_size_mb.checked_mul(1024 * 1024).is_none() {
            return Err(DeliveryError::ConfigError(format!(
                "content_cache.max_size_mb is too large: {}",
                self.content_cache.max_size_mb
            )));
        }

        let ratio = self.content_cache.eviction_target_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(DeliveryError::ConfigError(format!(
                "content_cache.eviction_target_ratio must be in (0, 1], got {}",
                ratio
            )));
        }

        if self.streaming.chunk_size < MIN_CHUNK_SIZE
            || self.streaming.chunk_size > MAX_CHUNK_SIZE
        {
            return Err(DeliveryError::ConfigError(format!(
                "streaming.chunk_size must be between {}KB and {}MB, got {} bytes",
                MIN_CHUNK_SIZE / 1024,
                MAX_CHUNK_SIZE / (1024 * 1024),
                self.streaming.chunk_size
            )));
        }

        if self.streaming.max_open_range_bytes == Some(0) {
            return Err(DeliveryError::ConfigError(
                "streaming.max_open_range_bytes must be greater than 0 when set".to_string(),
            ));
        }

        Ok(())
    }

    /// Parsed listen address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen_address.parse().map_err(|e| {
            DeliveryError::ConfigError(format!(
                "Invalid listen_address '{}': {}",
                self.listen_address, e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DeliveryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.metadata_cache.capacity, 1000);
        assert_eq!(config.metadata_cache.ttl_secs, 300);
        assert_eq!(config.content_cache.max_size_bytes(), 1000 * 1024 * 1024);
        assert_eq!(config.streaming.chunk_size, 1024 * 1024);
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let mut config = DeliveryConfig::default();
        config.metadata_cache.ttl_secs = 0;
        assert!(matches!(config.validate(), Err(DeliveryError::ConfigError(_))));
    }

    #[test]
    fn test_oversized_cache_rejected() {
        let mut config = DeliveryConfig::default();
        config.content_cache.max_size_mb = u64::MAX;
        assert_eq!(config.content_cache.max_size_bytes(), u64::MAX);
        assert!(matches!(config.validate(), Err(DeliveryError::ConfigError(_))));

        config.content_cache.max_size_mb = u64::MAX / (1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ratio_bounds() {
        let mut config = DeliveryConfig::default();
        config.content_cache.eviction_target_ratio = 0.0;
        assert!(config.validate().is_err());

        config.content_cache.eviction_target_ratio = 1.5;
        assert!(config.validate().is_err());

        config.content_cache.eviction_target_ratio = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_open_range_cap_can_be_disabled() {
        let config =
            DeliveryConfig::from_yaml("streaming:\n  max_open_range_bytes: null\n").unwrap();
        assert_eq!(config.streaming.max_open_range_bytes, None);
    }

    #[test]
    fn test_bad_listen_address() {
        let mut config = DeliveryConfig::default();
        config.listen_address = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }
}
