//! Byte-range cache engine
//!
//! Two strategies share the [`RangeCache`] contract:
//! - [`BlockCache`] splits the source into fixed-size blocks and caches each block on its own,
//!   so overlapping reads reuse blocks even when their bounds differ.
//! - [`ChunkCache`] caches exactly the requested interval, for sources that can only be read in
//!   caller-chosen chunks.

pub mod block;
pub mod chunk;
pub mod fetch;
pub mod keys;

use crate::core::{CacheStats, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub use block::BlockCache;
pub use chunk::ChunkCache;
pub use fetch::{CacheAside, FnFetcher, PostFetch, RangeFetcher, StorePolicy, fetcher_fn};
pub use keys::KeyNamespace;

use crate::core::RangeCacheError;
use crate::store::SharedStore;

/// Default block size (5 MiB)
pub const DEFAULT_BLOCK_SIZE: u64 = 5 * 1024 * 1024;

/// Read contract shared by the block and chunk caches
#[async_trait]
pub trait RangeCache: Send + Sync {
    /// Cache type name
    fn name(&self) -> &'static str;

    /// Total addressable length of the source
    fn size(&self) -> u64;

    /// Read `[start, stop)`. `start` defaults to 0 and `stop` to the source size.
    ///
    /// Returns an empty buffer without touching the store when `start >= size` or
    /// `start >= stop`.
    async fn read(&self, start: Option<u64>, stop: Option<u64>) -> Result<Bytes>;

    /// Delete every entry under this cache's key prefix
    async fn invalidate(&self) -> Result<usize>;

    /// Keys currently stored under this cache's key prefix
    async fn cached_keys(&self) -> Result<BTreeSet<String>>;

    fn stats(&self) -> CacheStats;
}

/// Which caching strategy to install
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    #[default]
    Block,
    Chunk,
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block => f.write_str("block"),
            Self::Chunk => f.write_str("chunk"),
        }
    }
}

impl FromStr for CacheKind {
    type Err = RangeCacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "chunk" => Ok(Self::Chunk),
            other => Err(RangeCacheError::InvalidConfig(format!(
                "unknown cache kind '{}', expected 'block' or 'chunk'",
                other
            ))),
        }
    }
}

/// Construction parameters for either cache
#[derive(Clone)]
pub struct CacheParams {
    /// Bytes per block; ignored by the chunk cache
    pub block_size: u64,
    /// Total addressable length of the source
    pub size: u64,
    /// Stable identifier of the source, used as the key prefix
    pub source: String,
    /// Seconds before stored entries expire; `None` or 0 disables expiry
    pub expiry_secs: Option<u64>,
    pub fetcher: Arc<dyn RangeFetcher>,
    pub store: SharedStore,
    pub policy: StorePolicy,
    /// Blocks fetched concurrently per read; 1 fetches sequentially
    pub concurrency: usize,
}

impl CacheParams {
    pub fn new(
        source: impl Into<String>,
        size: u64,
        fetcher: Arc<dyn RangeFetcher>,
        store: SharedStore,
    ) -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            size,
            source: source.into(),
            expiry_secs: None,
            fetcher,
            store,
            policy: StorePolicy::default(),
            concurrency: 1,
        }
    }

    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_expiry(mut self, expiry_secs: Option<u64>) -> Self {
        self.expiry_secs = expiry_secs;
        self
    }

    pub fn with_policy(mut self, policy: StorePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub(crate) fn cache_aside(&self) -> CacheAside {
        CacheAside::new(self.store.clone(), self.expiry_secs).with_policy(self.policy)
    }
}

/// Build the cache selected by `kind`
pub fn build_cache(kind: CacheKind, params: CacheParams) -> Result<Box<dyn RangeCache>> {
    Ok(match kind {
        CacheKind::Block => Box::new(BlockCache::new(params)?),
        CacheKind::Chunk => Box::new(ChunkCache::new(params)),
    })
}
