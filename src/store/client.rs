//! Reconnecting store client
//!
//! Wraps a [`BackendConnector`] with a two-state connection handle. The handle
//! is built on first use and replaced wholesale when the store reports that
//! our credentials expired; the failed operation is then retried exactly once.

use super::{BackendConnector, ObjectBackend};
use crate::error::{DeliveryError, Result};
use crate::metrics::DeliveryMetrics;
use crate::models::{ByteRange, ObjectMetadata};
use bytes::Bytes;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Something that holds state derived from the current store connection
/// and must drop it when the connection is replaced.
pub trait ReconnectListener: Send + Sync {
    fn on_reconnect(&self);
}

enum ConnectionState {
    Invalidated,
    Live(Arc<dyn ObjectBackend>),
}

/// Snapshot of the client's connection state
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub initialized: bool,
    pub bucket: String,
    pub endpoint: String,
    pub using_service_account: bool,
    pub reconnects: u64,
    pub last_error: Option<String>,
}

/// Store client that reconnects once on credential expiry
pub struct StoreClient {
    connector: Arc<dyn BackendConnector>,
    state: RwLock<ConnectionState>,
    listeners: Vec<Arc<dyn ReconnectListener>>,
    operation_timeout: Duration,
    reconnects: AtomicU64,
    last_error: Mutex<Option<String>>,
    metrics: Option<Arc<DeliveryMetrics>>,
}

impl StoreClient {
    /// Create a new client; no connection is made until the first operation
    ///
    /// # Arguments
    /// * `connector` - Builds backend connections
    /// * `operation_timeout` - Upper bound for every single store call
    pub fn new(connector: Arc<dyn BackendConnector>, operation_timeout: Duration) -> Self {
        StoreClient {
            connector,
            state: RwLock::new(ConnectionState::Invalidated),
            listeners: Vec::new(),
            operation_timeout,
            reconnects: AtomicU64::new(0),
            last_error: Mutex::new(None),
            metrics: None,
        }
    }

    /// Register state to be dropped whenever the connection is replaced
    pub fn with_listener(mut self, listener: Arc<dyn ReconnectListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<DeliveryMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Check whether an object exists
    pub async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.head_metadata(path).await?.is_some())
    }

    /// Fetch object metadata; `None` means the object does not exist
    pub async fn head_metadata(&self, path: &str) -> Result<Option<ObjectMetadata>> {
        self.with_reconnect("head", path, move |backend| async move {
            backend.head(path).await
        })
        .await
    }

    /// Read an inclusive byte range of an object
    pub async fn read_range(&self, path: &str, range: ByteRange) -> Result<Bytes> {
        self.with_reconnect("read_range", path, move |backend| async move {
            backend.read_range(path, range).await
        })
        .await
    }

    /// List objects under a prefix
    pub async fn list_by_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<ObjectMetadata>> {
        self.with_reconnect("list", prefix, move |backend| async move {
            backend.list(prefix, limit).await
        })
        .await
    }

    pub fn public_url(&self, path: &str) -> String {
        self.connector.public_url(path)
    }

    /// Probe the store with a listing bounded to a single result
    pub async fn health_check(&self) -> bool {
        match self.list_by_prefix("", 1).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Store health check failed: {}", e);
                false
            }
        }
    }

    pub async fn is_initialized(&self) -> bool {
        matches!(*self.state.read().await, ConnectionState::Live(_))
    }

    pub async fn status(&self) -> StoreStatus {
        let initialized = self.is_initialized().await;
        let last_error = self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        StoreStatus {
            initialized,
            bucket: self.connector.bucket().to_string(),
            endpoint: self.connector.endpoint().to_string(),
            using_service_account: self.connector.uses_service_account(),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_error,
        }
    }

    /// Number of times the connection was dropped after credential expiry
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Current backend, connecting if the handle is invalidated
    async fn backend(&self) -> Result<Arc<dyn ObjectBackend>> {
        if let ConnectionState::Live(backend) = &*self.state.read().await {
            return Ok(Arc::clone(backend));
        }

        let mut state = self.state.write().await;
        if let ConnectionState::Live(backend) = &*state {
            return Ok(Arc::clone(backend));
        }

        let backend = self.connector.connect().await.map_err(|e| {
            self.remember_error(&e);
            e
        })?;
        info!(
            "Connected to object store: bucket={}, endpoint={}, service_account={}",
            self.connector.bucket(),
            self.connector.endpoint(),
            self.connector.uses_service_account()
        );
        *state = ConnectionState::Live(Arc::clone(&backend));
        Ok(backend)
    }

    /// Drop the connection `stale` if it is still the live one
    async fn invalidate(&self, stale: &Arc<dyn ObjectBackend>) {
        let mut state = self.state.write().await;
        let is_current =
            matches!(&*state, ConnectionState::Live(current) if Arc::ptr_eq(current, stale));
        if !is_current {
            debug!("Store connection already replaced by a concurrent request");
            return;
        }

        *state = ConnectionState::Invalidated;
        drop(state);

        self.reconnects.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.record_reconnect();
        }
        for listener in &self.listeners {
            listener.on_reconnect();
        }
    }

    async fn with_reconnect<T, F, Fut>(&self, op: &'static str, path: &str, call: F) -> Result<T>
    where
        F: Fn(Arc<dyn ObjectBackend>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let backend = self.backend().await?;
        let result = match self.bounded(op, call(Arc::clone(&backend))).await {
            Err(e) if e.is_auth_expired() => {
                warn!(
                    "Store credentials expired: op={}, path={}, reconnecting and retrying once",
                    op, path
                );
                self.invalidate(&backend).await;
                let backend = self.backend().await?;
                self.bounded(op, call(backend)).await
            }
            other => other,
        };

        self.record(op, &result);
        result
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.operation_timeout, call)
            .await
            .map_err(|_| {
                DeliveryError::Timeout(format!(
                    "store {} exceeded {}s",
                    op,
                    self.operation_timeout.as_secs_f64()
                ))
            })?
    }

    fn record<T>(&self, op: &'static str, result: &Result<T>) {
        let outcome = match result {
            Ok(_) => "ok",
            Err(DeliveryError::NotFound(_)) => "not_found",
            Err(e) => {
                warn!("Store {} failed: {}", op, e);
                self.remember_error(e);
                "error"
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_store_operation(op, outcome);
        }
    }

    fn remember_error(&self, err: &DeliveryError) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryBackend, MemoryConnector};
    use std::sync::atomic::AtomicUsize;

    struct CountingListener(AtomicUsize);

    impl ReconnectListener for CountingListener {
        fn on_reconnect(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn client_with(backend: Arc<MemoryBackend>) -> (StoreClient, Arc<CountingListener>) {
        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        let connector = Arc::new(MemoryConnector::new("media", backend));
        let client = StoreClient::new(connector, Duration::from_secs(5))
            .with_listener(Arc::clone(&listener) as Arc<dyn ReconnectListener>);
        (client, listener)
    }

    #[tokio::test]
    async fn test_lazy_connect() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put_object("a.mp4", vec![1u8; 10], Some("video/mp4"));
        let (client, _) = client_with(backend);

        assert!(!client.is_initialized().await);
        assert!(client.exists("a.mp4").await.unwrap());
        assert!(client.is_initialized().await);
    }

    #[tokio::test]
    async fn test_single_expiry_is_retried() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put_object("a.mp4", vec![7u8; 10], None);
        backend.expire_auth(1);
        let (client, listener) = client_with(Arc::clone(&backend));

        let data = client.read_range("a.mp4", ByteRange::new(0, 3).unwrap()).await.unwrap();
        assert_eq!(&data[..], &[7u8; 4]);
        assert_eq!(client.reconnect_count(), 1);
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_expiry_surfaces() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put_object("a.mp4", vec![7u8; 10], None);
        backend.expire_auth(2);
        let (client, _) = client_with(backend);

        let err = client.head_metadata("a.mp4").await.unwrap_err();
        assert!(err.is_auth_expired());
        assert_eq!(client.reconnect_count(), 1);
        assert!(client.status().await.last_error.is_some());
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_unavailable(1);
        let (client, listener) = client_with(Arc::clone(&backend));

        let err = client.head_metadata("a.mp4").await.unwrap_err();
        assert!(matches!(err, DeliveryError::StoreUnavailable(_)));
        assert_eq!(client.reconnect_count(), 0);
        assert_eq!(listener.0.load(Ordering::SeqCst), 0);
        assert_eq!(backend.head_calls(), 1);
    }
}
