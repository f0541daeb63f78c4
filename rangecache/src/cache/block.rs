use super::{CacheAside, CacheParams, KeyNamespace, RangeCache, RangeFetcher};
use crate::core::{ByteRange, CacheStats, RangeCacheError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Store-backed block cache.
///
/// The source is split into zero-indexed blocks of `block_size` bytes, stored under
/// `"{source}-{index}"`. A read fetches (or loads) every block it overlaps, in index order,
/// and slices the concatenation down to the requested bytes.
pub struct BlockCache {
    block_size: u64,
    size: u64,
    namespace: KeyNamespace,
    fetcher: Arc<dyn RangeFetcher>,
    aside: CacheAside,
    concurrency: usize,
}

impl BlockCache {
    pub fn new(params: CacheParams) -> Result<Self> {
        if params.block_size == 0 {
            return Err(RangeCacheError::InvalidConfig(
                "block size must be positive".to_string(),
            ));
        }

        Ok(Self {
            block_size: params.block_size,
            size: params.size,
            namespace: KeyNamespace::new(params.source.clone()),
            fetcher: params.fetcher.clone(),
            aside: params.cache_aside(),
            concurrency: params.concurrency.max(1),
        })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Number of blocks covering the source
    pub fn block_count(&self) -> u64 {
        self.size.div_ceil(self.block_size)
    }

    /// Byte range of block `index`, clipped to the source size
    pub fn block_range(&self, index: u64) -> ByteRange {
        let start = index * self.block_size;
        ByteRange::new(start, (start + self.block_size).min(self.size))
    }

    /// Inclusive span of block indices overlapping `range`
    pub fn block_span(&self, range: ByteRange) -> (u64, u64) {
        (
            range.start / self.block_size,
            (range.end - 1) / self.block_size,
        )
    }

    async fn fetch_block(&self, index: u64) -> Result<Bytes> {
        let key = self.namespace.block_key(index);
        self.aside
            .fetch_or_cache(&key, self.block_range(index), self.fetcher.as_ref())
            .await
    }
}

impl fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCache")
            .field("block_size", &self.block_size)
            .field("size", &self.size)
            .field("nblocks", &self.block_count())
            .field("source", &self.namespace.prefix())
            .finish()
    }
}

#[async_trait]
impl RangeCache for BlockCache {
    fn name(&self) -> &'static str {
        "block"
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn read(&self, start: Option<u64>, stop: Option<u64>) -> Result<Bytes> {
        let Some(range) = ByteRange::resolve(start, stop, self.size) else {
            return Ok(Bytes::new());
        };

        let (first, last) = self.block_span(range);
        let start_offset = (range.start % self.block_size) as usize;
        debug!(
            "Block read {} of {} -> blocks {}..={}",
            range,
            self.namespace.prefix(),
            first,
            last
        );

        // `buffered` yields in input order, whatever order the fetches complete in
        let fetches: Vec<_> = (first..=last).map(|index| self.fetch_block(index)).collect();
        let blocks: Vec<Bytes> = stream::iter(fetches)
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        let total: usize = blocks.iter().map(Bytes::len).sum();
        let mut buffer = BytesMut::with_capacity(total);
        for block in &blocks {
            buffer.extend_from_slice(block);
        }
        let buffer = buffer.freeze();

        let begin = start_offset.min(buffer.len());
        let end = (start_offset + range.len() as usize).min(buffer.len());
        Ok(buffer.slice(begin..end))
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
