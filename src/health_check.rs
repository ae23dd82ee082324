//! Health reporting
//!
//! `/health` is plain liveness. `/health/full` probes the object store and
//! reports both caches alongside it.

use crate::content_cache::{ContentCache, ContentCacheStats};
use crate::metadata_cache::{MetadataCacheStats, ObjectMetadataCache};
use crate::store::{StoreClient, StoreStatus};
use http::StatusCode;
use serde::{Serialize, Serializer};
use tracing::warn;

/// Health status of the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Store reachable, ready to serve
    Healthy,
    /// Serving, but something needs attention
    Degraded,
    /// Store unreachable
    Unhealthy,
}

impl HealthStatus {
    /// Convert health status to HTTP status code
    pub fn to_status_code(&self) -> StatusCode {
        match self {
            HealthStatus::Healthy => StatusCode::OK,
            HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

impl Serialize for HealthStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Store section of the full report
#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    pub reachable: bool,
    #[serde(flatten)]
    pub status: StoreStatus,
}

/// Body of `GET /health/full`
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub store: StoreHealth,
    pub metadata_cache: MetadataCacheStats,
    pub content_cache: ContentCacheStats,
}

impl HealthReport {
    /// Probe the store and snapshot both caches
    ///
    /// A reachable store whose content cache is full to capacity reports
    /// `Degraded`; an unreachable store reports `Unhealthy`.
    pub async fn collect(
        store: &StoreClient,
        metadata_cache: &ObjectMetadataCache,
        content_cache: &ContentCache,
    ) -> Self {
        let reachable = store.health_check().await;
        let content_stats = content_cache.stats();

        let status = if !reachable {
            warn!("Full health check: object store unreachable");
            HealthStatus::Unhealthy
        } else if content_stats.size_bytes >= content_stats.max_size_bytes {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            store: StoreHealth {
                reachable,
                status: store.status().await,
            },
            metadata_cache: metadata_cache.stats(),
            content_cache: content_stats,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.status.to_status_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryBackend, MemoryConnector};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_health_status_to_status_code() {
        assert_eq!(HealthStatus::Healthy.to_status_code(), StatusCode::OK);
        assert_eq!(HealthStatus::Degraded.to_status_code(), StatusCode::OK);
        assert_eq!(HealthStatus::Unhealthy.to_status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_health_status_serializes_as_str() {
        assert_eq!(serde_json::to_string(&HealthStatus::Degraded).unwrap(), "\"degraded\"");
    }

    #[tokio::test]
    async fn test_report_tracks_store_reachability() {
        let temp_dir = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let connector = Arc::new(MemoryConnector::new("media", Arc::clone(&backend)));
        let store = StoreClient::new(connector, Duration::from_secs(5));
        let metadata_cache = ObjectMetadataCache::new(10, Duration::from_secs(60)).unwrap();
        let content_cache = ContentCache::with_capacity(temp_dir.path(), 1024 * 1024)
            .await
            .unwrap();

        let report = HealthReport::collect(&store, &metadata_cache, &content_cache).await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.store.reachable);
        assert_eq!(report.status_code(), StatusCode::OK);

        backend.fail_unavailable(1);
        let report = HealthReport::collect(&store, &metadata_cache, &content_cache).await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(report.store.status.last_error.is_some());
    }
}
