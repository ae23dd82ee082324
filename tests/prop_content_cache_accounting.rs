// Property: content cache byte accounting
//
// For any sequence of inserts, the recorded total equals the sum of the live
// entries, stays within capacity, and every live entry has exactly one chunk
// and one sidecar on disk.

use bytes::Bytes;
use media_delivery::content_cache::ContentCache;
use proptest::prelude::*;
use std::collections::HashSet;
use tempfile::TempDir;
use tokio::runtime::Runtime;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(30))]

    #[test]
    fn prop_total_matches_live_entries(
        capacity in 1_000u64..20_000,
        inserts in prop::collection::vec((0usize..4, 0u64..20, 1u64..3_000), 1..40),
    ) {
        let rt = Runtime::new().unwrap();

        let result: Result<(), TestCaseError> = rt.block_on(async {
            let temp_dir = TempDir::new().unwrap();
            let cache = ContentCache::with_capacity(temp_dir.path(), capacity).await.unwrap();
            let objects = ["a.mp4", "b.mp4", "c.webm", "d/e.ts"];

            for (object, slot, len) in &inserts {
                let start = slot * 3_000;
                let end = start + len - 1;
                let data = Bytes::from(vec![*slot as u8; *len as usize]);
                cache.put(objects[*object], start, end, data).await.unwrap();
                prop_assert!(cache.total_bytes() <= capacity);
            }

            let unique: HashSet<(usize, u64, u64)> = inserts
                .iter()
                .map(|(object, slot, len)| (*object, slot * 3_000, slot * 3_000 + len - 1))
                .collect();
            let mut live_bytes = 0u64;
            let mut live_entries = 0usize;
            for (object, start, end) in &unique {
                if cache.contains(objects[*object], *start, *end) {
                    live_bytes += end - start + 1;
                    live_entries += 1;
                }
            }

            let stats = cache.stats();
            prop_assert_eq!(stats.items, live_entries);
            prop_assert_eq!(stats.size_bytes, live_bytes);
            prop_assert_eq!(stats.items * 2, std::fs::read_dir(temp_dir.path()).unwrap().count());

            let per_object: usize = objects.iter().map(|o| cache.entries_for(o)).sum();
            prop_assert_eq!(per_object, stats.items);
            Ok(())
        });
        result?;
    }
}
