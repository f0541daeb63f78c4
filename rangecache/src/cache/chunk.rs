use super::{CacheAside, CacheParams, KeyNamespace, RangeCache, RangeFetcher};
use crate::core::{ByteRange, CacheStats, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Store-backed cache of exact chunks.
///
/// Each read is cached verbatim under `"{source}-{start}-{stop}"`. Reads with different bounds
/// never share an entry, even when they overlap, which suits sources that cannot serve
/// arbitrary sub-ranges cheaply.
pub struct ChunkCache {
    size: u64,
    namespace: KeyNamespace,
    fetcher: Arc<dyn RangeFetcher>,
    aside: CacheAside,
}

impl ChunkCache {
    pub fn new(params: CacheParams) -> Self {
        Self {
            size: params.size,
            namespace: KeyNamespace::new(params.source.clone()),
            fetcher: params.fetcher.clone(),
            aside: params.cache_aside(),
        }
    }
}

impl fmt::Debug for ChunkCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkCache")
            .field("size", &self.size)
            .field("source", &self.namespace.prefix())
            .finish()
    }
}

#[async_trait]
impl RangeCache for ChunkCache {
    fn name(&self) -> &'static str {
        "chunk"
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn read(&self, start: Option<u64>, stop: Option<u64>) -> Result<Bytes> {
        let Some(range) = ByteRange::resolve(start, stop, self.size) else {
            return Ok(Bytes::new());
        };

        let key = self.namespace.chunk_key(range.start, range.end);
        self.aside
            .fetch_or_cache(&key, range, self.fetcher.as_ref())
            .await
    }

    async fn invalidate(&self) -> Result<usize> {
        self.namespace.invalidate(self.aside.store().as_ref()).await
    }

    async fn cached_keys(&self) -> Result<BTreeSet<String>> {
        self.namespace.cached_keys(self.aside.store().as_ref()).await
    }

    fn stats(&self) -> CacheStats {
        self.aside.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fetcher_fn;
    use crate::core::RangeCacheError;
    use crate::store::{MemoryStore, SharedStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_cache(size: u64) -> (ChunkCache, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let fetcher = fetcher_fn(move |start, end| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                Ok::<_, RangeCacheError>(Bytes::from(
                    (start..end).map(|b| b as u8).collect::<Vec<u8>>(),
                ))
            }
        });
        let store: SharedStore = Arc::new(MemoryStore::default());
        (
            ChunkCache::new(CacheParams::new("chunks", size, fetcher, store)),
            calls,
        )
    }

    #[tokio::test]
    async fn test_exact_chunk_round_trip() {
        let (cache, calls) = counting_cache(100);

        let first = cache.read(Some(7), Some(19)).await.unwrap();
        let second = cache.read(Some(7), Some(19)).await.unwrap();

        assert_eq!(first.len(), 12);
        assert_eq!(first[0], 7);
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_overlapping_chunks_do_not_share() {
        let (cache, calls) = counting_cache(100);

        cache.read(Some(0), Some(5)).await.unwrap();
        cache.read(Some(0), Some(10)).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let keys: Vec<String> = cache.cached_keys().await.unwrap().into_iter().collect();
        assert_eq!(
            keys,
            vec!["chunks-0-10".to_string(), "chunks-0-5".to_string()]
        );
    }

    #[tokio::test]
    async fn test_defaults_and_short_circuit() {
        let (cache, calls) = counting_cache(20);

        assert_eq!(cache.read(None, None).await.unwrap().len(), 20);
        assert!(cache.read(Some(20), None).await.unwrap().is_empty());
        assert!(cache.read(Some(9), Some(3)).await.unwrap().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.cached_keys().await.unwrap().contains("chunks-0-20"));
    }

    #[tokio::test]
    async fn test_stop_past_end_is_clamped() {
        let (cache, _) = counting_cache(20);

        let bytes = cache.read(Some(15), Some(500)).await.unwrap();
        assert_eq!(bytes.len(), 5);
        assert!(cache.cached_keys().await.unwrap().contains("chunks-15-20"));
    }
}
