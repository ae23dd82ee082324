//! Disk-backed byte-range content cache
//!
//! Each cached range lives in two files inside the cache directory:
//!
//! - `{key}.chunk` holds the raw bytes
//! - `{key}.meta` is a JSON sidecar recording the source object, range,
//!   size and CRC32 of the chunk
//!
//! The in-memory index is an LRU ordered map from key to entry plus a
//! reverse index from source object to its keys, both guarded by one mutex.
//! File I/O never happens while the mutex is held. On start-up the index is
//! rebuilt by scanning the directory, so the cache survives restarts.
//!
//! Entries whose chunk file turns out to be missing, short or failing its
//! checksum are purged on access and reported as a miss.

use crate::config::ContentCacheConfig;
use crate::error::{DeliveryError, Result};
use bytes::Bytes;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::Xxh3;

const CHUNK_EXT: &str = "chunk";
const SIDECAR_EXT: &str = "meta";
const TEMP_EXT: &str = "tmp";

/// Identity of one cached range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentKey<'a> {
    pub object_path: &'a str,
    pub start: u64,
    pub end: u64,
}

impl<'a> ContentKey<'a> {
    pub fn new(object_path: &'a str, start: u64, end: u64) -> Self {
        ContentKey {
            object_path,
            start,
            end,
        }
    }

    /// Stable 128-bit digest rendered as 32 hex digits
    ///
    /// The path is length-prefixed so no two distinct keys share an encoding.
    pub fn digest(&self) -> String {
        let mut hasher = Xxh3::new();
        hasher.update(&(self.object_path.len() as u64).to_le_bytes());
        hasher.update(self.object_path.as_bytes());
        hasher.update(&self.start.to_le_bytes());
        hasher.update(&self.end.to_le_bytes());
        format!("{:032x}", hasher.digest128())
    }
}

/// Persisted next to each chunk so the index can be rebuilt
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkSidecar {
    source_path: String,
    start: u64,
    end: u64,
    size_bytes: u64,
    checksum: u32,
    created_at: u64,
}

#[derive(Debug, Clone)]
struct ContentEntry {
    source_path: String,
    start: u64,
    end: u64,
    size_bytes: u64,
    checksum: u32,
    created_at: SystemTime,
    last_access: SystemTime,
    hit_count: u64,
    generation: u64,
}

struct ContentIndex {
    entries: LruCache<String, ContentEntry>,
    by_source: HashMap<String, HashSet<String>>,
    total_bytes: u64,
    hits: u64,
    misses: u64,
    next_generation: u64,
}

impl ContentIndex {
    fn new() -> Self {
        ContentIndex {
            entries: LruCache::unbounded(),
            by_source: HashMap::new(),
            total_bytes: 0,
            hits: 0,
            misses: 0,
            next_generation: 0,
        }
    }

    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Insert at most-recently-used position, keeping both indices in step
    fn insert(&mut self, key: String, entry: ContentEntry) {
        self.remove(&key);
        self.total_bytes += entry.size_bytes;
        self.by_source
            .entry(entry.source_path.clone())
            .or_default()
            .insert(key.clone());
        self.entries.push(key, entry);
    }

    fn remove(&mut self, key: &str) -> Option<ContentEntry> {
        let entry = self.entries.pop(key)?;
        self.unlink(key, &entry);
        Some(entry)
    }

    fn unlink(&mut self, key: &str, entry: &ContentEntry) {
        self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
        if let Some(keys) = self.by_source.get_mut(&entry.source_path) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_source.remove(&entry.source_path);
            }
        }
    }

    /// Pop least-recently-used entries until the total is at most `target`
    fn evict_until(&mut self, target: u64) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.total_bytes > target {
            let Some((key, entry)) = self.entries.pop_lru() else {
                break;
            };
            self.unlink(&key, &entry);
            debug!(
                "Content cache evicted: key={}, source={}, size={}",
                key, entry.source_path, entry.size_bytes
            );
            evicted.push(key);
        }
        evicted
    }

    fn remove_source(&mut self, source_path: &str) -> Vec<String> {
        let keys: Vec<String> = self
            .by_source
            .remove(source_path)
            .map(|keys| keys.into_iter().collect())
            .unwrap_or_default();
        for key in &keys {
            if let Some(entry) = self.entries.pop(key) {
                self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
            }
        }
        keys
    }

    fn drain(&mut self) -> Vec<String> {
        let keys: Vec<String> = self.entries.iter().map(|(k, _)| k.clone()).collect();
        self.entries.clear();
        self.by_source.clear();
        self.total_bytes = 0;
        keys
    }
}

/// Summary counters for the content cache
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentCacheStats {
    pub items: usize,
    pub unique_objects: usize,
    pub size_bytes: u64,
    pub size_mb: f64,
    pub max_size_bytes: u64,
    pub max_size_mb: f64,
    pub utilization_pct: f64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub cache_dir: String,
}

/// One row of the detailed view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentEntrySummary {
    pub key: String,
    pub source_path: String,
    pub start: u64,
    pub end: u64,
    pub size_bytes: u64,
    pub hits: u64,
    pub age_secs: u64,
    pub last_access_secs_ago: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetailedContentStats {
    #[serde(flatten)]
    pub summary: ContentCacheStats,
    pub top_entries: Vec<ContentEntrySummary>,
}

/// Disk-backed LRU cache of byte ranges
pub struct ContentCache {
    cache_dir: PathBuf,
    max_size_bytes: u64,
    target_ratio: f64,
    detailed_limit: usize,
    index: Mutex<ContentIndex>,
}

impl ContentCache {
    /// Open (or create) the cache described by `config`
    pub async fn open(config: &ContentCacheConfig) -> Result<Self> {
        Self::open_with(
            &config.cache_dir,
            config.max_size_bytes(),
            config.eviction_target_ratio,
            config.detailed_stats_limit,
        )
        .await
    }

    /// Open a cache directory with the default eviction ratio and detail limit
    pub async fn with_capacity(cache_dir: impl AsRef<Path>, max_size_bytes: u64) -> Result<Self> {
        let defaults = ContentCacheConfig::default();
        Self::open_with(
            cache_dir.as_ref(),
            max_size_bytes,
            defaults.eviction_target_ratio,
            defaults.detailed_stats_limit,
        )
        .await
    }

    async fn open_with(
        cache_dir: &Path,
        max_size_bytes: u64,
        target_ratio: f64,
        detailed_limit: usize,
    ) -> Result<Self> {
        if max_size_bytes == 0 {
            return Err(DeliveryError::ConfigError(
                "content cache capacity must be greater than 0".to_string(),
            ));
        }

        fs::create_dir_all(cache_dir).await.map_err(|e| {
            DeliveryError::CacheError(format!(
                "Failed to create cache directory {}: {}",
                cache_dir.display(),
                e
            ))
        })?;

        let cache = ContentCache {
            cache_dir: cache_dir.to_path_buf(),
            max_size_bytes,
            target_ratio,
            detailed_limit,
            index: Mutex::new(ContentIndex::new()),
        };
        cache.rebuild().await?;
        Ok(cache)
    }

    /// Look up a cached range
    ///
    /// # Returns
    /// * `Some(bytes)` on a verified hit
    /// * `None` on a miss, including entries found corrupt (which are purged)
    pub async fn get(&self, source_path: &str, start: u64, end: u64) -> Option<Bytes> {
        let key = ContentKey::new(source_path, start, end).digest();
        let found = {
            let mut guard = self.lock();
            let index = &mut *guard;
            match index.entries.get_mut(&key) {
                Some(entry) => {
                    entry.last_access = SystemTime::now();
                    entry.hit_count += 1;
                    Some((entry.size_bytes, entry.checksum, entry.generation))
                }
                None => {
                    index.misses += 1;
                    None
                }
            }
        };

        let Some((size_bytes, checksum, generation)) = found else {
            debug!("Content cache miss: source={}, range={}-{}", source_path, start, end);
            return None;
        };

        match self.read_verified(&key, size_bytes, checksum).await {
            Ok(data) => {
                self.lock().hits += 1;
                debug!("Content cache hit: source={}, range={}-{}", source_path, start, end);
                Some(data)
            }
            Err(e) => {
                warn!(
                    "Dropping unreadable cache entry: key={}, source={}, error={}",
                    key, source_path, e
                );
                self.purge(&key, generation).await;
                self.lock().misses += 1;
                None
            }
        }
    }

    /// Cache a fully read range
    ///
    /// Evicts least-recently-used entries first when the insertion would
    /// exceed capacity. A payload larger than the whole cache is skipped.
    pub async fn put(&self, source_path: &str, start: u64, end: u64, data: Bytes) -> Result<()> {
        let size_bytes = data.len() as u64;
        if end < start || end - start + 1 != size_bytes {
            return Err(DeliveryError::CacheError(format!(
                "payload of {} bytes does not match range {}-{}",
                size_bytes, start, end
            )));
        }
        if size_bytes > self.max_size_bytes {
            debug!(
                "Skipping cache insert larger than capacity: source={}, size={}",
                source_path, size_bytes
            );
            return Ok(());
        }

        let key = ContentKey::new(source_path, start, end).digest();

        let (victims, generation) = {
            let mut index = self.lock();
            index.remove(&key);
            let victims = if index.total_bytes + size_bytes > self.max_size_bytes {
                let target = self.eviction_target().min(self.max_size_bytes - size_bytes);
                index.evict_until(target)
            } else {
                Vec::new()
            };
            (victims, index.next_generation())
        };
        self.evicted(&victims).await;

        let now = SystemTime::now();
        let checksum = crc32fast::hash(&data);
        let sidecar = ChunkSidecar {
            source_path: source_path.to_string(),
            start,
            end,
            size_bytes,
            checksum,
            created_at: unix_secs(now),
        };
        if let Err(e) = self.write_files(&key, generation, &sidecar, &data).await {
            // The previous version of this range is no longer indexed.
            if !self.lock().entries.contains(&key) {
                self.delete_files(&[key]).await;
            }
            return Err(e);
        }

        let victims = {
            let mut index = self.lock();
            index.insert(
                key.clone(),
                ContentEntry {
                    source_path: source_path.to_string(),
                    start,
                    end,
                    size_bytes,
                    checksum,
                    created_at: now,
                    last_access: now,
                    hit_count: 0,
                    generation,
                },
            );
            // Concurrent inserts may have filled the room made above.
            index.evict_until(self.max_size_bytes)
        };
        self.evicted(&victims).await;

        debug!(
            "Content cache stored: key={}, source={}, range={}-{}, size={}",
            key, source_path, start, end, size_bytes
        );
        Ok(())
    }

    /// Remove every cached range of one object; returns the number removed
    pub async fn invalidate(&self, source_path: &str) -> usize {
        let keys = self.lock().remove_source(source_path);
        self.delete_files(&keys).await;
        if !keys.is_empty() {
            info!(
                "Content cache invalidated: source={}, entries={}",
                source_path,
                keys.len()
            );
        }
        keys.len()
    }

    /// Remove everything; returns the number of entries removed
    pub async fn clear(&self) -> usize {
        let keys = self.lock().drain();
        self.delete_files(&keys).await;
        info!("Content cache cleared: entries={}", keys.len());
        keys.len()
    }

    pub fn contains(&self, source_path: &str, start: u64, end: u64) -> bool {
        let key = ContentKey::new(source_path, start, end).digest();
        self.lock().entries.contains(&key)
    }

    /// Number of cached ranges recorded for one object in the reverse index
    pub fn entries_for(&self, source_path: &str) -> usize {
        self.lock()
            .by_source
            .get(source_path)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.lock().total_bytes
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    pub fn stats(&self) -> ContentCacheStats {
        let index = self.lock();
        self.summarize(&index)
    }

    /// Summary plus the most frequently hit entries
    pub fn detailed_stats(&self) -> DetailedContentStats {
        let index = self.lock();
        let now = SystemTime::now();

        let mut rows: Vec<(&String, &ContentEntry)> = index.entries.iter().collect();
        rows.sort_by(|a, b| b.1.hit_count.cmp(&a.1.hit_count));

        let top_entries = rows
            .into_iter()
            .take(self.detailed_limit)
            .map(|(key, entry)| ContentEntrySummary {
                key: key.chars().take(16).collect(),
                source_path: entry.source_path.clone(),
                start: entry.start,
                end: entry.end,
                size_bytes: entry.size_bytes,
                hits: entry.hit_count,
                age_secs: elapsed_secs(now, entry.created_at),
                last_access_secs_ago: elapsed_secs(now, entry.last_access),
            })
            .collect();

        DetailedContentStats {
            summary: self.summarize(&index),
            top_entries,
        }
    }

    fn summarize(&self, index: &ContentIndex) -> ContentCacheStats {
        const MB: f64 = 1024.0 * 1024.0;
        let lookups = index.hits + index.misses;
        ContentCacheStats {
            items: index.entries.len(),
            unique_objects: index.by_source.len(),
            size_bytes: index.total_bytes,
            size_mb: index.total_bytes as f64 / MB,
            max_size_bytes: self.max_size_bytes,
            max_size_mb: self.max_size_bytes as f64 / MB,
            utilization_pct: index.total_bytes as f64 / self.max_size_bytes as f64 * 100.0,
            hits: index.hits,
            misses: index.misses,
            hit_rate: if lookups > 0 {
                index.hits as f64 / lookups as f64
            } else {
                0.0
            },
            cache_dir: self.cache_dir.display().to_string(),
        }
    }

    fn eviction_target(&self) -> u64 {
        (self.max_size_bytes as f64 * self.target_ratio) as u64
    }

    fn lock(&self) -> MutexGuard<'_, ContentIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn chunk_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.{}", key, CHUNK_EXT))
    }

    fn sidecar_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.{}", key, SIDECAR_EXT))
    }

    async fn read_verified(&self, key: &str, size_bytes: u64, checksum: u32) -> Result<Bytes> {
        let data = fs::read(self.chunk_path(key)).await?;
        if data.len() as u64 != size_bytes {
            return Err(DeliveryError::CorruptCacheEntry(format!(
                "expected {} bytes, found {}",
                size_bytes,
                data.len()
            )));
        }
        if crc32fast::hash(&data) != checksum {
            return Err(DeliveryError::CorruptCacheEntry("checksum mismatch".to_string()));
        }
        Ok(Bytes::from(data))
    }

    /// Drop an entry found corrupt, unless a newer write already replaced it
    async fn purge(&self, key: &str, generation: u64) {
        let removed = {
            let mut index = self.lock();
            let current = index
                .entries
                .peek(key)
                .map(|entry| entry.generation == generation)
                .unwrap_or(false);
            current && index.remove(key).is_some()
        };
        if removed {
            self.delete_files(&[key.to_string()]).await;
        }
    }

    async fn write_files(
        &self,
        key: &str,
        generation: u64,
        sidecar: &ChunkSidecar,
        data: &Bytes,
    ) -> Result<()> {
        let chunk_tmp = self
            .cache_dir
            .join(format!("{}.{}.{}.{}", key, generation, CHUNK_EXT, TEMP_EXT));
        let sidecar_tmp = self
            .cache_dir
            .join(format!("{}.{}.{}.{}", key, generation, SIDECAR_EXT, TEMP_EXT));

        let result = async {
            let mut file = fs::File::create(&chunk_tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;

            fs::write(&sidecar_tmp, serde_json::to_vec(sidecar)?).await?;

            fs::rename(&sidecar_tmp, self.sidecar_path(key)).await?;
            fs::rename(&chunk_tmp, self.chunk_path(key)).await?;
            Ok::<(), DeliveryError>(())
        }
        .await;

        if let Err(e) = result {
            remove_quietly(&chunk_tmp).await;
            remove_quietly(&sidecar_tmp).await;
            return Err(DeliveryError::CacheError(format!(
                "Failed to write cache entry {}: {}",
                key, e
            )));
        }
        Ok(())
    }

    async fn evicted(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        self.delete_files(keys).await;
        info!(
            "Content cache eviction: removed={}, size_mb={:.1}, max_mb={:.1}",
            keys.len(),
            self.total_bytes() as f64 / (1024.0 * 1024.0),
            self.max_size_bytes as f64 / (1024.0 * 1024.0)
        );
    }

    async fn delete_files(&self, keys: &[String]) {
        for key in keys {
            remove_quietly(&self.chunk_path(key)).await;
            remove_quietly(&self.sidecar_path(key)).await;
        }
    }

    /// Rebuild the index from the files on disk
    async fn rebuild(&self) -> Result<()> {
        let mut dir = fs::read_dir(&self.cache_dir).await?;
        let mut chunks = Vec::new();
        let mut sidecars = HashSet::new();
        let mut stray = Vec::new();

        let temp_suffix = format!(".{}", TEMP_EXT);
        let chunk_suffix = format!(".{}", CHUNK_EXT);
        let sidecar_suffix = format!(".{}", SIDECAR_EXT);

        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(&temp_suffix) {
                stray.push(path.clone());
            } else if let Some(key) = name.strip_suffix(&chunk_suffix) {
                let modified = item
                    .metadata()
                    .await
                    .and_then(|m| m.modified())
                    .unwrap_or(UNIX_EPOCH);
                chunks.push((key.to_string(), modified));
            } else if let Some(key) = name.strip_suffix(&sidecar_suffix) {
                sidecars.insert(key.to_string());
            }
        }

        let mut restored = Vec::new();
        for (key, modified) in chunks {
            sidecars.remove(&key);
            match self.load_entry(&key, modified).await {
                Some(entry) => restored.push((key, entry)),
                None => {
                    warn!("Removing cache chunk without a valid sidecar: key={}", key);
                    stray.push(self.chunk_path(&key));
                    stray.push(self.sidecar_path(&key));
                }
            }
        }
        for key in sidecars {
            stray.push(self.sidecar_path(&key));
        }
        for path in &stray {
            remove_quietly(path).await;
        }

        // Oldest first so the most recently touched chunks end up most-recently-used.
        restored.sort_by_key(|(_, entry)| entry.last_access);

        let victims = {
            let mut index = self.lock();
            for (key, mut entry) in restored {
                entry.generation = index.next_generation();
                index.insert(key, entry);
            }
            if index.total_bytes > self.max_size_bytes {
                index.evict_until(self.eviction_target())
            } else {
                Vec::new()
            }
        };
        self.evicted(&victims).await;

        let stats = self.stats();
        info!(
            "Content cache loaded: dir={}, items={}, size_mb={:.1}, max_mb={:.1}",
            stats.cache_dir, stats.items, stats.size_mb, stats.max_size_mb
        );
        Ok(())
    }

    async fn load_entry(&self, key: &str, modified: SystemTime) -> Option<ContentEntry> {
        let raw = fs::read(self.sidecar_path(key)).await.ok()?;
        let sidecar: ChunkSidecar = serde_json::from_slice(&raw).ok()?;

        let expected = ContentKey::new(&sidecar.source_path, sidecar.start, sidecar.end).digest();
        if expected != key {
            return None;
        }
        let on_disk = fs::metadata(self.chunk_path(key)).await.ok()?.len();
        if on_disk != sidecar.size_bytes {
            return None;
        }

        Some(ContentEntry {
            source_path: sidecar.source_path,
            start: sidecar.start,
            end: sidecar.end,
            size_bytes: sidecar.size_bytes,
            checksum: sidecar.checksum,
            created_at: UNIX_EPOCH + Duration::from_secs(sidecar.created_at),
            last_access: modified,
            hit_count: 0,
            generation: 0,
        })
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to delete cache file {}: {}", path.display(), e);
        }
    }
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn elapsed_secs(now: SystemTime, then: SystemTime) -> u64 {
    now.duration_since(then).unwrap_or_default().as_secs()
}
