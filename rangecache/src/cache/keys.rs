//! Store key derivation and namespace-wide invalidation

use crate::core::Result;
use crate::store::CacheStore;
use std::collections::BTreeSet;
use tracing::info;

/// Maps a source identifier plus a block index, chunk bounds or request bounds to store keys.
///
/// Every key derived from a namespace starts with `"{prefix}-"`. [`KeyNamespace::invalidate`]
/// deletes everything under that prefix, which covers every source sharing the prefix and not
/// only the one a cache was built for. Make the prefix source-specific when that matters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyNamespace {
    prefix: String,
}

impl KeyNamespace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `"{prefix}-{index}"`
    pub fn block_key(&self, index: u64) -> String {
        format!("{}-{}", self.prefix, index)
    }

    /// `"{prefix}-{start}-{stop}"`
    pub fn chunk_key(&self, start: u64, stop: u64) -> String {
        format!("{}-{}-{}", self.prefix, start, stop)
    }

    /// `"{prefix}-{source}"`, with `-{start}` and `-{end}` appended only when supplied.
    ///
    /// A bounded and an unbounded request for the same source never share a key.
    pub fn request_key(&self, source: &str, start: Option<u64>, end: Option<u64>) -> String {
        let mut key = format!("{}-{}", self.prefix, source);
        if let Some(start) = start {
            key.push_str(&format!("-{}", start));
        }
        if let Some(end) = end {
            key.push_str(&format!("-{}", end));
        }
        key
    }

    /// Prefix shared by every key of this namespace
    pub fn scan_prefix(&self) -> String {
        format!("{}-", self.prefix)
    }

    /// Glob form of [`scan_prefix`](Self::scan_prefix), for display
    pub fn pattern(&self) -> String {
        format!("{}-*", self.prefix)
    }

    /// Keys currently stored under this namespace
    pub async fn cached_keys(&self, store: &dyn CacheStore) -> Result<BTreeSet<String>> {
        store.keys_with_prefix(&self.scan_prefix()).await
    }

    /// Delete every key under this namespace in one batch
    pub async fn invalidate(&self, store: &dyn CacheStore) -> Result<usize> {
        let keys: Vec<String> = self.cached_keys(store).await?.into_iter().collect();
        if keys.is_empty() {
            return Ok(0);
        }
        let deleted = store.delete(&keys).await?;
        info!("Invalidated {} keys matching {}", deleted, self.pattern());
        Ok(deleted)
    }
}
