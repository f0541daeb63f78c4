//! Behavioral tests for the block and chunk caches

mod common;

#[cfg(test)]
mod tests {
    use super::common::{CountingFetcher, memory_store, params};
    use rangecache::cache::{BlockCache, ChunkCache, RangeCache};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concrete_block_scenario() {
        let fetcher = CountingFetcher::new(100);
        let store = memory_store();
        let cache = BlockCache::new(params(&fetcher, 100, &store, "scenario").with_block_size(25))
            .unwrap();

        let bytes = cache.read(Some(10), Some(60)).await.unwrap();

        assert_eq!(bytes.len(), 50);
        assert_eq!(bytes, fetcher.expected(10, 60));
        assert_eq!(fetcher.calls(), vec![(0, 25), (25, 50), (50, 75)]);
    }

    #[tokio::test]
    async fn test_empty_requests_touch_nothing() {
        let fetcher = CountingFetcher::new(50);
        let store = memory_store();
        let block = BlockCache::new(params(&fetcher, 50, &store, "b").with_block_size(10)).unwrap();
        let chunk = ChunkCache::new(params(&fetcher, 50, &store, "c"));

        for (start, stop) in [(50, 60), (70, 80), (20, 20), (30, 10), (50, 50)] {
            assert!(block.read(Some(start), Some(stop)).await.unwrap().is_empty());
            assert!(chunk.read(Some(start), Some(stop)).await.unwrap().is_empty());
        }
        assert!(block.read(Some(50), None).await.unwrap().is_empty());

        assert_eq!(fetcher.count(), 0);
        assert!(store.keys_with_prefix("b-").await.unwrap().is_empty());
        assert!(store.keys_with_prefix("c-").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_length_matches_clamped_request() {
        let size = 97;
        let fetcher = CountingFetcher::new(size);
        let store = memory_store();
        let block =
            BlockCache::new(params(&fetcher, size, &store, "len").with_block_size(16)).unwrap();
        let chunk = ChunkCache::new(params(&fetcher, size, &store, "len-chunk"));

        for start in [0u64, 1, 15, 16, 17, 63, 96] {
            for stop in [start + 1, start + 16, start + 33, 97, 150] {
                let expected_len = stop.min(size) - start;
                let from_block = block.read(Some(start), Some(stop)).await.unwrap();
                let from_chunk = chunk.read(Some(start), Some(stop)).await.unwrap();

                assert_eq!(from_block.len() as u64, expected_len, "block [{start}, {stop})");
                assert_eq!(from_block, fetcher.expected(start, stop.min(size)));
                assert_eq!(from_chunk, from_block, "chunk [{start}, {stop})");
            }
        }
    }

    #[tokio::test]
    async fn test_second_read_is_a_full_hit() {
        let fetcher = CountingFetcher::new(200);
        let store = memory_store();
        let cache =
            BlockCache::new(params(&fetcher, 200, &store, "idem").with_block_size(32)).unwrap();

        let first = cache.read(Some(5), Some(150)).await.unwrap();
        let fetched = fetcher.count();
        let second = cache.read(Some(5), Some(150)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(fetcher.count(), fetched);
        assert_eq!(cache.stats().hits, fetched as u64);
    }

    #[tokio::test]
    async fn test_adjacent_blocks_fetch_once_each_in_any_order() {
        for reverse in [false, true] {
            let fetcher = CountingFetcher::new(100);
            let store = memory_store();
            let cache =
                BlockCache::new(params(&fetcher, 100, &store, "align").with_block_size(10))
                    .unwrap();

            let mut reads = vec![(0, 10), (10, 20)];
            if reverse {
                reads.reverse();
            }
            for (start, stop) in reads {
                cache.read(Some(start), Some(stop)).await.unwrap();
            }

            let mut calls = fetcher.calls();
            calls.sort();
            assert_eq!(calls, vec![(0, 10), (10, 20)]);
        }
    }

    #[tokio::test]
    async fn test_sub_block_slicing() {
        let fetcher = CountingFetcher::new(100);
        let store = memory_store();
        let cache =
            BlockCache::new(params(&fetcher, 100, &store, "slice").with_block_size(10)).unwrap();

        let bytes = cache.read(Some(3), Some(7)).await.unwrap();

        assert_eq!(bytes, fetcher.expected(3, 7));
        assert_eq!(fetcher.calls(), vec![(0, 10)]);
    }

    #[tokio::test]
    async fn test_chunk_cache_does_not_reuse_sub_ranges() {
        let fetcher = CountingFetcher::new(100);
        let store = memory_store();
        let chunk = ChunkCache::new(params(&fetcher, 100, &store, "chunk"));
        chunk.read(Some(0), Some(5)).await.unwrap();
        chunk.read(Some(0), Some(10)).await.unwrap();
        assert_eq!(fetcher.count(), 2);

        let fetcher = CountingFetcher::new(100);
        let block =
            BlockCache::new(params(&fetcher, 100, &store, "block").with_block_size(10)).unwrap();
        block.read(Some(0), Some(5)).await.unwrap();
        block.read(Some(0), Some(10)).await.unwrap();
        assert_eq!(fetcher.count(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let fetcher = CountingFetcher::new(100);
        let store = memory_store();
        let cache =
            BlockCache::new(params(&fetcher, 100, &store, "inv").with_block_size(20)).unwrap();

        cache.read(Some(0), Some(50)).await.unwrap();
        assert_eq!(cache.cached_keys().await.unwrap().len(), 3);

        assert_eq!(cache.invalidate().await.unwrap(), 3);
        assert!(cache.cached_keys().await.unwrap().is_empty());

        fetcher.reset();
        cache.read(Some(0), Some(10)).await.unwrap();
        assert_eq!(fetcher.calls(), vec![(0, 20)]);
    }

    #[tokio::test]
    async fn test_caches_share_one_store() {
        let store = memory_store();
        let first = CountingFetcher::new(100);
        let second = CountingFetcher::new(100);

        let a = BlockCache::new(params(&first, 100, &store, "shared").with_block_size(25)).unwrap();
        let b = BlockCache::new(params(&second, 100, &store, "shared").with_block_size(25)).unwrap();

        a.read(None, None).await.unwrap();
        let bytes = b.read(Some(30), Some(70)).await.unwrap();

        assert_eq!(bytes, second.expected(30, 70));
        assert_eq!(first.count(), 4);
        assert_eq!(second.count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_misses_both_fetch() {
        let fetcher = CountingFetcher::slow(100, Duration::from_millis(50));
        let store = memory_store();
        let cache = Arc::new(
            BlockCache::new(params(&fetcher, 100, &store, "race").with_block_size(100)).unwrap(),
        );

        let (left, right) = tokio::join!(
            cache.read(Some(0), Some(10)),
            cache.read(Some(20), Some(30))
        );

        assert_eq!(left.unwrap(), fetcher.expected(0, 10));
        assert_eq!(right.unwrap(), fetcher.expected(20, 30));
        assert_eq!(fetcher.calls(), vec![(0, 100), (0, 100)]);
        assert_eq!(store.keys_with_prefix("race-").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_parallel_block_fetch() {
        let fetcher = CountingFetcher::slow(1000, Duration::from_millis(20));
        let store = memory_store();
        let cache = BlockCache::new(
            params(&fetcher, 1000, &store, "par")
                .with_block_size(100)
                .with_concurrency(8),
        )
        .unwrap();

        let bytes = cache.read(Some(50), Some(950)).await.unwrap();

        assert_eq!(bytes, fetcher.expected(50, 950));
        assert_eq!(fetcher.count(), 10);
    }

    #[tokio::test]
    async fn test_expiry_is_applied_to_entries() {
        let fetcher = CountingFetcher::new(10);
        let store = Arc::new(rangecache::store::MemoryStore::default());
        let shared: rangecache::SharedStore = store.clone();
        let cache = BlockCache::new(
            params(&fetcher, 10, &shared, "ttl")
                .with_block_size(10)
                .with_expiry(Some(1)),
        )
        .unwrap();

        cache.read(None, None).await.unwrap();
        assert!(store.ttl("ttl-0").unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        cache.read(None, None).await.unwrap();
        assert_eq!(fetcher.count(), 2);
    }
}
