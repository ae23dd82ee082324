//! In-process object store
//!
//! Used for tests and local demos. Supports injecting credential expiry and
//! unavailability so the reconnect path can be exercised without a network.

use super::{BackendConnector, ObjectBackend};
use crate::error::{DeliveryError, Result};
use crate::models::{ByteRange, ObjectMetadata};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

struct StoredObject {
    data: Bytes,
    metadata: ObjectMetadata,
}

/// Object store held entirely in memory
#[derive(Default)]
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    pending_auth_failures: AtomicUsize,
    pending_unavailable: AtomicUsize,
    head_calls: AtomicUsize,
    read_calls: AtomicUsize,
    list_calls: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or overwrite) an object
    pub fn put_object(&self, path: &str, data: impl Into<Bytes>, content_type: Option<&str>) {
        let data = data.into();
        let mut metadata = ObjectMetadata::new(path, data.len() as u64)
            .with_etag(format!("\"{:08x}\"", crc32fast::hash(&data)));
        metadata.content_type = content_type.map(str::to_string);

        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string(), StoredObject { data, metadata });
    }

    pub fn remove_object(&self, path: &str) -> bool {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path)
            .is_some()
    }

    /// Make the next `times` calls fail with `AuthExpired`
    pub fn expire_auth(&self, times: usize) {
        self.pending_auth_failures.store(times, Ordering::SeqCst);
    }

    /// Make the next `times` calls fail with `StoreUnavailable`
    pub fn fail_unavailable(&self, times: usize) {
        self.pending_unavailable.store(times, Ordering::SeqCst);
    }

    pub fn head_calls(&self) -> usize {
        self.head_calls.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn take_fault(&self) -> Result<()> {
        if take_one(&self.pending_auth_failures) {
            return Err(DeliveryError::AuthExpired("injected credential expiry".to_string()));
        }
        if take_one(&self.pending_unavailable) {
            return Err(DeliveryError::StoreUnavailable("injected outage".to_string()));
        }
        Ok(())
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    async fn head(&self, path: &str) -> Result<Option<ObjectMetadata>> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        self.take_fault()?;

        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        Ok(objects.get(path).map(|o| o.metadata.clone()))
    }

    async fn read_range(&self, path: &str, range: ByteRange) -> Result<Bytes> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        self.take_fault()?;

        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        let object = objects
            .get(path)
            .ok_or_else(|| DeliveryError::NotFound(path.to_string()))?;

        let size = object.data.len() as u64;
        if range.start >= size {
            return Err(DeliveryError::InvalidRange(format!(
                "start {} beyond object size {}",
                range.start, size
            )));
        }
        let end = range.end.min(size - 1);
        Ok(object.data.slice(range.start as usize..=end as usize))
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<ObjectMetadata>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.take_fault()?;

        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        Ok(objects
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .take(limit)
            .map(|(_, o)| o.metadata.clone())
            .collect())
    }
}

/// Connector handing out the same in-memory backend on every connect
pub struct MemoryConnector {
    bucket: String,
    backend: Arc<MemoryBackend>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(bucket: impl Into<String>, backend: Arc<MemoryBackend>) -> Self {
        MemoryConnector {
            bucket: bucket.into(),
            backend,
            connects: AtomicUsize::new(0),
        }
    }

    /// Number of connections established so far
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendConnector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn ObjectBackend>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(&self.backend) as Arc<dyn ObjectBackend>)
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn endpoint(&self) -> &str {
        "memory"
    }

    fn public_url(&self, path: &str) -> String {
        format!("memory://{}/{}", self.bucket, path)
    }

    fn uses_service_account(&self) -> bool {
        false
    }
}
