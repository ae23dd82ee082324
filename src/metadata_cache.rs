//! Object metadata cache
//!
//! A bounded LRU map from object path to store metadata, with a fixed
//! time-to-live per entry. An expired entry is never returned: it is removed
//! on the lookup that finds it and the lookup counts as a miss.

use crate::config::MetadataCacheConfig;
use crate::error::{DeliveryError, Result};
use crate::models::{ObjectMetadata, ObjectMetadataEntry};
use crate::store::ReconnectListener;
use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Source of the current instant, swappable in tests
pub trait TimeProvider: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Counters and sizing reported by [`ObjectMetadataCache::stats`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub capacity: usize,
    pub hit_rate: f64,
    pub ttl_secs: u64,
}

struct MetadataCacheState {
    entries: LruCache<String, ObjectMetadataEntry>,
    hits: u64,
    misses: u64,
}

/// TTL + LRU cache of per-object metadata
pub struct ObjectMetadataCache {
    state: Mutex<MetadataCacheState>,
    capacity: NonZeroUsize,
    ttl: Duration,
    time_provider: Arc<dyn TimeProvider>,
}

impl ObjectMetadataCache {
    /// Create a cache holding at most `capacity` entries for `ttl` each
    ///
    /// # Returns
    /// * `Err(DeliveryError::ConfigError)` if capacity or ttl is zero
    pub fn new(capacity: usize, ttl: Duration) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            DeliveryError::ConfigError("metadata cache capacity must be greater than 0".to_string())
        })?;
        if ttl.is_zero() {
            return Err(DeliveryError::ConfigError(
                "metadata cache ttl must be greater than 0".to_string(),
            ));
        }

        Ok(ObjectMetadataCache {
            state: Mutex::new(MetadataCacheState {
                entries: LruCache::new(capacity),
                hits: 0,
                misses: 0,
            }),
            capacity,
            ttl,
            time_provider: Arc::new(SystemTimeProvider),
        })
    }

    pub fn from_config(config: &MetadataCacheConfig) -> Result<Self> {
        Self::new(config.capacity, config.ttl())
    }

    pub fn with_time_provider(mut self, provider: Arc<dyn TimeProvider>) -> Self {
        self.time_provider = provider;
        self
    }

    /// Look up an object's metadata
    ///
    /// Promotes the entry to most-recently-used on a hit.
    pub fn get(&self, key: &str) -> Option<Arc<ObjectMetadata>> {
        let now = self.time_provider.now();
        let mut guard = self.lock();
        let state = &mut *guard;

        let (fetched_at, metadata) = match state.entries.get(key) {
            Some(entry) => (entry.fetched_at, Arc::clone(&entry.metadata)),
            None => {
                state.misses += 1;
                return None;
            }
        };

        if now.saturating_duration_since(fetched_at) > self.ttl {
            state.entries.pop(key);
            state.misses += 1;
            debug!("Metadata cache entry expired: key={}", key);
            return None;
        }

        state.hits += 1;
        Some(metadata)
    }

    /// Insert or replace an entry, evicting the least recently used one at capacity
    pub fn set(&self, key: &str, metadata: ObjectMetadata) -> Arc<ObjectMetadata> {
        let metadata = Arc::new(metadata);
        let entry = ObjectMetadataEntry {
            metadata: Arc::clone(&metadata),
            fetched_at: self.time_provider.now(),
        };

        let mut state = self.lock();
        if let Some((evicted, _)) = state.entries.push(key.to_string(), entry) {
            if evicted != key {
                debug!("Metadata cache evicted: key={}", evicted);
            }
        }
        metadata
    }

    /// Remove one entry; returns whether it was present
    pub fn invalidate(&self, key: &str) -> bool {
        self.lock().entries.pop(key).is_some()
    }

    /// Remove every entry whose key starts with `prefix`; returns the count
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut state = self.lock();
        let doomed: Vec<String> = state
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            state.entries.pop(key);
        }
        doomed.len()
    }

    /// Drop all entries and reset the hit/miss counters
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.hits = 0;
        state.misses = 0;
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> MetadataCacheStats {
        let state = self.lock();
        let lookups = state.hits + state.misses;
        MetadataCacheStats {
            hits: state.hits,
            misses: state.misses,
            size: state.entries.len(),
            capacity: self.capacity.get(),
            hit_rate: if lookups > 0 {
                state.hits as f64 / lookups as f64
            } else {
                0.0
            },
            ttl_secs: self.ttl.as_secs(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetadataCacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ReconnectListener for ObjectMetadataCache {
    /// Drops the entries but keeps the hit/miss history
    fn on_reconnect(&self) {
        let dropped = {
            let mut state = self.lock();
            let dropped = state.entries.len();
            state.entries.clear();
            dropped
        };
        info!("Store reconnected, metadata cache cleared: entries={}", dropped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockTimeProvider {
        base: Instant,
        offset: Mutex<Duration>,
    }

    impl MockTimeProvider {
        fn new() -> Self {
            Self {
                base: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
            }
        }

        fn inc(&self, duration: Duration) {
            *self.offset.lock().unwrap() += duration;
        }
    }

    impl TimeProvider for MockTimeProvider {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock().unwrap()
        }
    }

    fn cache_with_clock(
        capacity: usize,
        ttl: Duration,
    ) -> (ObjectMetadataCache, Arc<MockTimeProvider>) {
        let clock = Arc::new(MockTimeProvider::new());
        let cache = ObjectMetadataCache::new(capacity, ttl)
            .unwrap()
            .with_time_provider(Arc::clone(&clock) as Arc<dyn TimeProvider>);
        (cache, clock)
    }

    #[test]
    fn test_hit_before_ttl_miss_after() {
        let (cache, clock) = cache_with_clock(10, Duration::from_secs(300));
        cache.set("a.mp4", ObjectMetadata::new("a.mp4", 1000));

        clock.inc(Duration::from_secs(299));
        assert_eq!(cache.get("a.mp4").unwrap().size, 1000);

        clock.inc(Duration::from_secs(2));
        assert!(cache.get("a.mp4").is_none());
        assert_eq!(cache.len(), 0);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_reconnect_keeps_counters() {
        let (cache, _clock) = cache_with_clock(10, Duration::from_secs(300));
        cache.set("a.mp4", ObjectMetadata::new("a.mp4", 1));
        assert!(cache.get("a.mp4").is_some());
        assert!(cache.get("b.mp4").is_none());

        cache.on_reconnect();
        assert!(cache.is_empty());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);

        cache.clear();
        assert_eq!(cache.stats().hits, 0);
    }

    #[test]
    fn test_set_refreshes_fetch_time() {
        let (cache, clock) = cache_with_clock(10, Duration::from_secs(10));
        cache.set("a.mp4", ObjectMetadata::new("a.mp4", 1));
        clock.inc(Duration::from_secs(8));
        cache.set("a.mp4", ObjectMetadata::new("a.mp4", 2));
        clock.inc(Duration::from_secs(8));

        assert_eq!(cache.get("a.mp4").unwrap().size, 2);
    }

    #[test]
    fn test_lru_eviction_respects_access_order() {
        let (cache, _) = cache_with_clock(2, Duration::from_secs(60));
        cache.set("a", ObjectMetadata::new("a", 1));
        cache.set("b", ObjectMetadata::new("b", 2));

        // Touch "a" so "b" becomes the eviction candidate.
        assert!(cache.get("a").is_some());
        cache.set("c", ObjectMetadata::new("c", 3));

        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_invalidate_prefix() {
        let (cache, _) = cache_with_clock(10, Duration::from_secs(60));
        cache.set("videos/a.mp4", ObjectMetadata::new("videos/a.mp4", 1));
        cache.set("videos/b.mp4", ObjectMetadata::new("videos/b.mp4", 1));
        cache.set("images/c.png", ObjectMetadata::new("images/c.png", 1));

        assert_eq!(cache.invalidate_prefix("videos/"), 2);
        assert!(cache.invalidate("images/c.png"));
        assert!(!cache.invalidate("images/c.png"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear_resets_counters() {
        let (cache, _) = cache_with_clock(10, Duration::from_secs(60));
        cache.set("a", ObjectMetadata::new("a", 1));
        cache.get("a");
        cache.get("missing");

        cache.clear();
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (0, 0, 0));
        assert_eq!(stats.capacity, 10);
        assert_eq!(stats.ttl_secs, 60);
    }

    #[test]
    fn test_zero_capacity_or_ttl_rejected() {
        assert!(ObjectMetadataCache::new(0, Duration::from_secs(1)).is_err());
        assert!(ObjectMetadataCache::new(1, Duration::ZERO).is_err());
    }

    #[test]
    fn test_reconnect_clears() {
        let (cache, _) = cache_with_clock(10, Duration::from_secs(60));
        cache.set("a", ObjectMetadata::new("a", 1));
        cache.on_reconnect();
        assert!(cache.is_empty());
    }
}
