//! Cache-aside fetch protocol shared by the block and chunk caches

use crate::core::{ByteRange, CacheStats, RangeCacheError, Result, effective_ttl};
use crate::store::SharedStore;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Backing fetch: retrieves `[start, end)` straight from the source, bypassing any cache
#[async_trait]
pub trait RangeFetcher: Send + Sync {
    async fn fetch(&self, start: u64, end: u64) -> Result<Bytes>;
}

/// Adapter turning an async closure into a [`RangeFetcher`]
pub struct FnFetcher<F>(F);

#[async_trait]
impl<F, Fut> RangeFetcher for FnFetcher<F>
where
    F: Fn(u64, u64) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Bytes>> + Send,
{
    async fn fetch(&self, start: u64, end: u64) -> Result<Bytes> {
        (self.0)(start, end).await
    }
}

/// Wrap an async closure as a shared fetcher
pub fn fetcher_fn<F, Fut>(f: F) -> Arc<dyn RangeFetcher>
where
    F: Fn(u64, u64) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes>> + Send + 'static,
{
    Arc::new(FnFetcher(f))
}

/// Transform applied to a freshly fetched payload before it is stored and returned.
///
/// Hits are returned as stored, so the transform runs once per cached entry.
pub trait PostFetch: Send + Sync {
    fn apply(&self, source: &str, payload: Bytes) -> Result<Bytes>;
}

impl<F> PostFetch for F
where
    F: Fn(&str, Bytes) -> Result<Bytes> + Send + Sync,
{
    fn apply(&self, source: &str, payload: Bytes) -> Result<Bytes> {
        self(source, payload)
    }
}

/// What to do when the cache store fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorePolicy {
    /// Return the store error to the caller
    #[default]
    Propagate,
    /// Log a warning and serve straight from the backing fetch
    Bypass,
}

/// Check the store, fetch on miss, store with expiry, return.
///
/// The lookup and the write are not atomic: two concurrent misses on one key both fetch and
/// both write, and the later write wins. No lock is held while fetching.
pub struct CacheAside {
    store: SharedStore,
    ttl_secs: Option<u64>,
    policy: StorePolicy,
    post_fetch: Option<Arc<dyn PostFetch>>,
    stats: RwLock<CacheStats>,
}

impl CacheAside {
    /// `expiry_secs` of `None` or `Some(0)` stores entries without expiry
    pub fn new(store: SharedStore, expiry_secs: Option<u64>) -> Self {
        Self {
            store,
            ttl_secs: effective_ttl(expiry_secs),
            policy: StorePolicy::default(),
            post_fetch: None,
            stats: RwLock::new(CacheStats::default()),
        }
    }

    pub fn with_policy(mut self, policy: StorePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_post_fetch(mut self, hook: Arc<dyn PostFetch>) -> Self {
        self.post_fetch = Some(hook);
        self
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn ttl_secs(&self) -> Option<u64> {
        self.ttl_secs
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.read().clone()
    }

    /// Serve `key` from the store, or fetch `range` with `fetcher` and store it.
    ///
    /// Fetch errors are returned unchanged and nothing is written for the range.
    pub async fn fetch_or_cache(
        &self,
        key: &str,
        range: ByteRange,
        fetcher: &dyn RangeFetcher,
    ) -> Result<Bytes> {
        self.get_or_fetch(key, key, || fetcher.fetch(range.start, range.end))
            .await
    }

    /// Generalized form of [`fetch_or_cache`](Self::fetch_or_cache) for fetches that are not
    /// plain byte ranges. `source` is handed to the post-fetch hook.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, source: &str, fetch: F) -> Result<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes>>,
    {
        match self.store.get(key).await {
            Ok(Some(payload)) => {
                debug!("Cache hit: {}", key);
                self.stats.write().hits += 1;
                return Ok(payload);
            }
            Ok(None) => {}
            Err(e) => self.on_store_error("get", key, e)?,
        }

        debug!("Cache miss: {}", key);
        let mut payload = fetch().await?;
        if let Some(hook) = &self.post_fetch {
            payload = hook.apply(source, payload)?;
        }

        {
            let mut stats = self.stats.write();
            stats.misses += 1;
            stats.fetched_bytes += payload.len() as u64;
        }

        if let Err(e) = self.store.set(key, payload.clone(), self.ttl_secs).await {
            self.on_store_error("set", key, e)?;
        }
        Ok(payload)
    }

    fn on_store_error(&self, op: &str, key: &str, error: RangeCacheError) -> Result<()> {
        match self.policy {
            StorePolicy::Propagate => Err(error),
            StorePolicy::Bypass => {
                warn!(error = %error, "Store {} failed for {}, bypassing cache", op, key);
                self.stats.write().bypassed += 1;
                Ok(())
            }
        }
    }
}
