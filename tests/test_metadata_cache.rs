use media_delivery::metadata_cache::{ObjectMetadataCache, TimeProvider};
use media_delivery::ObjectMetadata;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Clock advanced by hand
struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    fn new() -> Arc<Self> {
        Arc::new(ManualClock {
            now: Mutex::new(Instant::now()),
        })
    }

    fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl TimeProvider for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }
}

fn cache_with_clock(capacity: usize, ttl_secs: u64) -> (ObjectMetadataCache, Arc<ManualClock>) {
    let clock = ManualClock::new();
    let cache = ObjectMetadataCache::new(capacity, Duration::from_secs(ttl_secs))
        .unwrap()
        .with_time_provider(Arc::clone(&clock) as Arc<dyn TimeProvider>);
    (cache, clock)
}

#[test]
fn test_entry_lives_exactly_ttl() {
    let (cache, clock) = cache_with_clock(10, 300);
    cache.set("a.mp4", ObjectMetadata::new("a.mp4", 1000));

    clock.advance(Duration::from_secs(300));
    assert_eq!(cache.get("a.mp4").map(|m| m.size), Some(1000));

    clock.advance(Duration::from_secs(1));
    assert!(cache.get("a.mp4").is_none());
    // The expired entry is gone, not just hidden
    assert!(cache.is_empty());

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
}

#[test]
fn test_set_refreshes_ttl() {
    let (cache, clock) = cache_with_clock(10, 60);
    cache.set("a.mp4", ObjectMetadata::new("a.mp4", 1));
    clock.advance(Duration::from_secs(50));
    cache.set("a.mp4", ObjectMetadata::new("a.mp4", 2));
    clock.advance(Duration::from_secs(50));

    assert_eq!(cache.get("a.mp4").map(|m| m.size), Some(2));
}

#[test]
fn test_capacity_bound_evicts_lru() {
    let (cache, _) = cache_with_clock(3, 300);
    for name in ["a", "b", "c"] {
        cache.set(name, ObjectMetadata::new(name, 1));
    }
    // Reading a makes b the least recently used
    assert!(cache.get("a").is_some());
    cache.set("d", ObjectMetadata::new("d", 1));

    assert_eq!(cache.len(), 3);
    assert!(cache.get("b").is_none());
    assert!(cache.get("a").is_some());
    assert!(cache.get("c").is_some());
    assert!(cache.get("d").is_some());
}

#[test]
fn test_invalidate_prefix_leaves_other_keys() {
    let (cache, _) = cache_with_clock(10, 300);
    for name in ["shows/s1/e1.mp4", "shows/s1/e2.mp4", "shows/s2/e1.mp4", "movies/m.mp4"] {
        cache.set(name, ObjectMetadata::new(name, 1));
    }

    assert_eq!(cache.invalidate_prefix("shows/s1/"), 2);
    assert_eq!(cache.len(), 2);
    assert!(cache.get("shows/s2/e1.mp4").is_some());
    assert!(cache.invalidate("movies/m.mp4"));
    assert!(!cache.invalidate("movies/m.mp4"));
}

#[test]
fn test_stats_report_configuration() {
    let (cache, _) = cache_with_clock(42, 90);
    cache.set("a", ObjectMetadata::new("a", 1));
    cache.get("a");
    cache.get("missing");

    let stats = cache.stats();
    assert_eq!(stats.capacity, 42);
    assert_eq!(stats.ttl_secs, 90);
    assert_eq!(stats.size, 1);
    assert_eq!(stats.hit_rate, 0.5);

    cache.clear();
    let stats = cache.stats();
    assert_eq!((stats.size, stats.hits, stats.misses), (0, 0, 0));
}
