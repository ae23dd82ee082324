use bytes::Bytes;
use media_delivery::content_cache::{ContentCache, ContentKey};
use std::path::Path;
use tempfile::TempDir;

fn payload(byte: u8, len: usize) -> Bytes {
    Bytes::from(vec![byte; len])
}

fn chunk_file(dir: &Path, path: &str, start: u64, end: u64) -> std::path::PathBuf {
    dir.join(format!("{}.chunk", ContentKey::new(path, start, end).digest()))
}

fn files_in(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

#[tokio::test]
async fn test_eviction_drops_least_recently_used() {
    let temp_dir = TempDir::new().unwrap();
    let cache = ContentCache::with_capacity(temp_dir.path(), 1000).await.unwrap();

    cache.put("a.mp4", 0, 299, payload(1, 300)).await.unwrap();
    cache.put("b.mp4", 0, 299, payload(2, 300)).await.unwrap();
    cache.put("c.mp4", 0, 299, payload(3, 300)).await.unwrap();

    // Touch a so b becomes the oldest
    assert!(cache.get("a.mp4", 0, 299).await.is_some());

    cache.put("d.mp4", 0, 299, payload(4, 300)).await.unwrap();

    assert!(cache.contains("a.mp4", 0, 299));
    assert!(!cache.contains("b.mp4", 0, 299));
    assert!(cache.contains("c.mp4", 0, 299));
    assert!(cache.contains("d.mp4", 0, 299));
    assert_eq!(cache.total_bytes(), 900);
    assert!(!chunk_file(temp_dir.path(), "b.mp4", 0, 299).exists());
}

#[tokio::test]
async fn test_total_never_exceeds_capacity() {
    let temp_dir = TempDir::new().unwrap();
    let cache = ContentCache::with_capacity(temp_dir.path(), 4096).await.unwrap();

    for i in 0..40u64 {
        let start = i * 500;
        cache
            .put("long.mp4", start, start + 499, payload(i as u8, 500))
            .await
            .unwrap();
        assert!(cache.total_bytes() <= cache.max_size_bytes());
    }

    let stats = cache.stats();
    assert!(stats.size_bytes <= 4096);
    assert_eq!(stats.items as u64 * 500, stats.size_bytes);
    assert_eq!(files_in(temp_dir.path()), stats.items * 2);
}

#[tokio::test]
async fn test_eviction_shrinks_to_target_ratio() {
    let temp_dir = TempDir::new().unwrap();
    let cache = ContentCache::with_capacity(temp_dir.path(), 4096).await.unwrap();

    for i in 0..8u64 {
        let start = i * 500;
        cache
            .put("long.mp4", start, start + 499, payload(i as u8, 500))
            .await
            .unwrap();
    }
    assert_eq!(cache.total_bytes(), 4000);

    // 4000 + 500 overflows: shrink to 80% of 4096 (3276), then insert
    cache.put("long.mp4", 4000, 4499, payload(8, 500)).await.unwrap();
    let stats = cache.stats();
    assert_eq!(stats.size_bytes, 3500);
    assert_eq!(stats.items, 7);
    assert!(!cache.contains("long.mp4", 0, 499));
    assert!(!cache.contains("long.mp4", 500, 999));
    assert!(cache.contains("long.mp4", 1000, 1499));
    assert!(cache.contains("long.mp4", 4000, 4499));
    assert_eq!(files_in(temp_dir.path()), 14);
}

#[tokio::test]
async fn test_large_insert_evicts_below_room_needed() {
    let temp_dir = TempDir::new().unwrap();
    let cache = ContentCache::with_capacity(temp_dir.path(), 4096).await.unwrap();

    for i in 0..4u64 {
        let start = i * 500;
        cache
            .put("small.mp4", start, start + 499, payload(i as u8, 500))
            .await
            .unwrap();
    }

    // Room for 3000 bytes means shrinking to 1096, well under the 80% mark
    cache.put("big.mp4", 0, 2999, payload(9, 3000)).await.unwrap();
    let stats = cache.stats();
    assert_eq!(stats.size_bytes, 4000);
    assert_eq!(stats.items, 3);
    assert_eq!(cache.entries_for("small.mp4"), 2);
    assert!(cache.contains("small.mp4", 1000, 1499));
    assert!(cache.contains("small.mp4", 1500, 1999));
    assert!(cache.contains("big.mp4", 0, 2999));
}

#[tokio::test]
async fn test_invalidate_uses_reverse_index() {
    let temp_dir = TempDir::new().unwrap();
    let cache = ContentCache::with_capacity(temp_dir.path(), 1024 * 1024).await.unwrap();

    cache.put("videos/a.mp4", 0, 99, payload(1, 100)).await.unwrap();
    cache.put("videos/a.mp4", 100, 199, payload(2, 100)).await.unwrap();
    cache.put("videos/b.mp4", 0, 99, payload(3, 100)).await.unwrap();
    assert_eq!(cache.entries_for("videos/a.mp4"), 2);
    assert_eq!(cache.stats().unique_objects, 2);

    assert_eq!(cache.invalidate("videos/a.mp4").await, 2);
    assert_eq!(cache.entries_for("videos/a.mp4"), 0);
    assert!(cache.get("videos/a.mp4", 0, 99).await.is_none());
    assert_eq!(cache.get("videos/b.mp4", 0, 99).await, Some(payload(3, 100)));
    assert_eq!(cache.total_bytes(), 100);
    assert_eq!(files_in(temp_dir.path()), 2);

    // Nothing left to remove
    assert_eq!(cache.invalidate("videos/a.mp4").await, 0);
}

#[tokio::test]
async fn test_clear_removes_everything() {
    let temp_dir = TempDir::new().unwrap();
    let cache = ContentCache::with_capacity(temp_dir.path(), 1024 * 1024).await.unwrap();

    cache.put("a.mp4", 0, 9, payload(1, 10)).await.unwrap();
    cache.put("b.mp4", 0, 9, payload(2, 10)).await.unwrap();

    assert_eq!(cache.clear().await, 2);
    assert!(cache.is_empty());
    assert_eq!(cache.total_bytes(), 0);
    assert_eq!(files_in(temp_dir.path()), 0);
}

#[tokio::test]
async fn test_corrupt_chunk_is_purged() {
    let temp_dir = TempDir::new().unwrap();
    let cache = ContentCache::with_capacity(temp_dir.path(), 1024 * 1024).await.unwrap();

    cache.put("a.mp4", 0, 99, payload(7, 100)).await.unwrap();
    // Same length, different bytes: only the checksum catches it
    std::fs::write(chunk_file(temp_dir.path(), "a.mp4", 0, 99), vec![8u8; 100]).unwrap();

    assert!(cache.get("a.mp4", 0, 99).await.is_none());
    assert!(!cache.contains("a.mp4", 0, 99));
    assert_eq!(cache.total_bytes(), 0);
    assert_eq!(files_in(temp_dir.path()), 0);

    // The range can be cached again afterwards
    cache.put("a.mp4", 0, 99, payload(7, 100)).await.unwrap();
    assert_eq!(cache.get("a.mp4", 0, 99).await, Some(payload(7, 100)));
}

#[tokio::test]
async fn test_missing_chunk_is_purged() {
    let temp_dir = TempDir::new().unwrap();
    let cache = ContentCache::with_capacity(temp_dir.path(), 1024 * 1024).await.unwrap();

    cache.put("a.mp4", 0, 99, payload(7, 100)).await.unwrap();
    std::fs::remove_file(chunk_file(temp_dir.path(), "a.mp4", 0, 99)).unwrap();

    assert!(cache.get("a.mp4", 0, 99).await.is_none());
    assert!(cache.is_empty());
    assert_eq!(cache.entries_for("a.mp4"), 0);
    assert_eq!(cache.stats().misses, 1);
}

#[tokio::test]
async fn test_restart_restores_entries() {
    let temp_dir = TempDir::new().unwrap();
    {
        let cache = ContentCache::with_capacity(temp_dir.path(), 1024 * 1024).await.unwrap();
        cache.put("videos/a.mp4", 0, 99, payload(1, 100)).await.unwrap();
        cache.put("videos/a.mp4", 100, 149, payload(2, 50)).await.unwrap();
    }

    let cache = ContentCache::with_capacity(temp_dir.path(), 1024 * 1024).await.unwrap();
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.total_bytes(), 150);
    assert_eq!(cache.entries_for("videos/a.mp4"), 2);
    assert_eq!(cache.get("videos/a.mp4", 100, 149).await, Some(payload(2, 50)));
}

#[tokio::test]
async fn test_restart_discards_stray_files() {
    let temp_dir = TempDir::new().unwrap();
    {
        let cache = ContentCache::with_capacity(temp_dir.path(), 1024 * 1024).await.unwrap();
        cache.put("a.mp4", 0, 9, payload(1, 10)).await.unwrap();
    }

    let dir = temp_dir.path();
    std::fs::write(dir.join("0123.5.chunk.tmp"), b"partial").unwrap();
    std::fs::write(dir.join("feedface.chunk"), b"no sidecar").unwrap();
    std::fs::write(dir.join("deadbeef.meta"), b"{}").unwrap();

    let cache = ContentCache::with_capacity(dir, 1024 * 1024).await.unwrap();
    assert_eq!(cache.len(), 1);
    assert!(!dir.join("0123.5.chunk.tmp").exists());
    assert!(!dir.join("feedface.chunk").exists());
    assert!(!dir.join("deadbeef.meta").exists());
    assert_eq!(files_in(dir), 2);
}

#[tokio::test]
async fn test_restart_with_smaller_capacity_evicts() {
    let temp_dir = TempDir::new().unwrap();
    {
        let cache = ContentCache::with_capacity(temp_dir.path(), 1024 * 1024).await.unwrap();
        for i in 0..3u64 {
            cache
                .put("a.mp4", i * 300, i * 300 + 299, payload(i as u8, 300))
                .await
                .unwrap();
        }
    }

    let cache = ContentCache::with_capacity(temp_dir.path(), 500).await.unwrap();
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.total_bytes(), 300);
    assert_eq!(files_in(temp_dir.path()), 2);
}

#[tokio::test]
async fn test_restart_matches_whole_extensions() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path();
    std::fs::write(dir.join("0123.1.meta.tmp"), b"partial").unwrap();
    std::fs::write(dir.join("playlist.htmp"), b"not ours").unwrap();
    std::fs::write(dir.join("archive.xchunk"), b"not ours").unwrap();

    let cache = ContentCache::with_capacity(dir, 1024 * 1024).await.unwrap();
    assert_eq!(cache.len(), 0);
    assert!(!dir.join("0123.1.meta.tmp").exists());
    assert!(dir.join("playlist.htmp").exists());
    assert!(dir.join("archive.xchunk").exists());
}

#[tokio::test]
async fn test_failed_rewrite_leaves_no_orphan_files() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path();
    let cache = ContentCache::with_capacity(dir, 1024 * 1024).await.unwrap();
    cache.put("a.mp4", 0, 99, payload(1, 100)).await.unwrap();

    // A directory in place of the chunk makes the final rename fail
    let chunk = chunk_file(dir, "a.mp4", 0, 99);
    std::fs::remove_file(&chunk).unwrap();
    std::fs::create_dir(&chunk).unwrap();
    std::fs::write(chunk.join("blocker"), b"x").unwrap();

    assert!(cache.put("a.mp4", 0, 99, payload(2, 100)).await.is_err());
    assert!(!cache.contains("a.mp4", 0, 99));
    assert_eq!(cache.total_bytes(), 0);
    assert_eq!(cache.entries_for("a.mp4"), 0);
    assert!(!chunk.with_extension("meta").exists());
    assert!(!std::fs::read_dir(dir)
        .unwrap()
        .any(|e| e.unwrap().file_name().to_string_lossy().ends_with(".tmp")));
}
