use super::caching::DEFAULT_KEY_PREFIX;
use super::{
    FileHandle, FileInfo, FileSystem, OpenMode, SharedFileSystem, TargetOptions, resolve_store,
    resolve_target,
};
use crate::cache::{CacheAside, KeyNamespace, PostFetch, StorePolicy};
use crate::core::{CacheStats, DEFAULT_EXPIRY_SECS, Result};
use crate::store::{SharedStore, StoreConfig};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Construction options for [`RequestCachingFileSystem`]
#[derive(Clone)]
pub struct RequestCachingConfig {
    pub fs: Option<SharedFileSystem>,
    pub target_protocol: Option<String>,
    pub target_options: TargetOptions,
    pub store: Option<SharedStore>,
    pub store_config: StoreConfig,
    /// Seconds before cached responses expire; 0 disables expiry
    pub expiry_secs: u64,
    pub key_prefix: String,
    /// Applied to each fetched response before it is stored
    pub post_fetch: Option<Arc<dyn PostFetch>>,
    pub on_store_error: StorePolicy,
}

impl Default for RequestCachingConfig {
    fn default() -> Self {
        Self {
            fs: None,
            target_protocol: None,
            target_options: TargetOptions::new(),
            store: None,
            store_config: StoreConfig::default(),
            expiry_secs: DEFAULT_EXPIRY_SECS,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            post_fetch: None,
            on_store_error: StorePolicy::default(),
        }
    }
}

impl RequestCachingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fs(mut self, fs: SharedFileSystem) -> Self {
        self.fs = Some(fs);
        self
    }

    pub fn with_target_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.target_protocol = Some(protocol.into());
        self
    }

    pub fn with_target_options(mut self, options: TargetOptions) -> Self {
        self.target_options = options;
        self
    }

    pub fn with_store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_store_config(mut self, config: StoreConfig) -> Self {
        self.store_config = config;
        self
    }

    pub fn with_expiry(mut self, expiry_secs: u64) -> Self {
        self.expiry_secs = expiry_secs;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_post_fetch(mut self, hook: Arc<dyn PostFetch>) -> Self {
        self.post_fetch = Some(hook);
        self
    }

    pub fn with_store_policy(mut self, policy: StorePolicy) -> Self {
        self.on_store_error = policy;
        self
    }
}

/// Whole-response caching wrapper
///
/// `cat_file(path, start, end)` is cached as one entry under
/// `"{key_prefix}-{path}[-{start}][-{end}]"`; bounds only appear in the key when supplied, so a
/// bounded and an unbounded read of the same path never share an entry. Opens and every other
/// operation are forwarded to the target.
pub struct RequestCachingFileSystem {
    target: SharedFileSystem,
    namespace: KeyNamespace,
    aside: CacheAside,
}

impl RequestCachingFileSystem {
    pub async fn new(config: RequestCachingConfig) -> Result<Self> {
        let (target, protocol) = resolve_target(
            config.fs.as_ref(),
            config.target_protocol.as_deref(),
            &config.target_options,
        )?;
        let store = resolve_store(config.store.as_ref(), &config.store_config).await?;

        info!(
            "Request caching filesystem over {} (prefix={}, expiry={}s, store={})",
            protocol,
            config.key_prefix,
            config.expiry_secs,
            store.name()
        );

        let mut aside =
            CacheAside::new(store, Some(config.expiry_secs)).with_policy(config.on_store_error);
        if let Some(hook) = config.post_fetch {
            aside = aside.with_post_fetch(hook);
        }

        Ok(Self {
            target,
            namespace: KeyNamespace::new(config.key_prefix),
            aside,
        })
    }

    pub fn target(&self) -> &SharedFileSystem {
        &self.target
    }

    pub fn store(&self) -> &SharedStore {
        self.aside.store()
    }

    /// Store key for one request
    pub fn cache_key(&self, path: &str, start: Option<u64>, end: Option<u64>) -> String {
        self.namespace.request_key(path, start, end)
    }

    pub async fn cached_keys(&self) -> Result<BTreeSet<String>> {
        self.namespace.cached_keys(self.store().as_ref()).await
    }

    /// Delete every key under the prefix, across all paths
    pub async fn invalidate_cache(&self) -> Result<usize> {
        self.namespace.invalidate(self.store().as_ref()).await
    }

    pub fn stats(&self) -> CacheStats {
        self.aside.stats()
    }

    pub async fn close(&self) -> Result<()> {
        self.store().close().await
    }
}

#[async_trait]
impl FileSystem for RequestCachingFileSystem {
    fn protocol(&self) -> &str {
        "requestcache"
    }

    fn strip_protocol(&self, path: &str) -> String {
        let path = path.strip_prefix("requestcache://").unwrap_or(path);
        self.target.strip_protocol(path)
    }

    async fn info(&self, path: &str) -> Result<FileInfo> {
        self.target.info(&self.strip_protocol(path)).await
    }

    async fn ls(&self, path: &str) -> Result<Vec<FileInfo>> {
        self.target.ls(&self.strip_protocol(path)).await
    }

    async fn cat_file(&self, path: &str, start: Option<u64>, end: Option<u64>) -> Result<Bytes> {
        let path = self.strip_protocol(path);
        let key = self.cache_key(&path, start, end);
        self.aside
            .get_or_fetch(&key, &path, || self.target.cat_file(&path, start, end))
            .await
    }

    async fn pipe_file(&self, path: &str, data: Bytes) -> Result<()> {
        self.target.pipe_file(&self.strip_protocol(path), data).await
    }

    async fn cp_file(&self, from: &str, to: &str) -> Result<()> {
        self.target
            .cp_file(&self.strip_protocol(from), &self.strip_protocol(to))
            .await
    }

    async fn rm_file(&self, path: &str) -> Result<()> {
        self.target.rm_file(&self.strip_protocol(path)).await
    }

    async fn mkdir(&self, path: &str, create_parents: bool) -> Result<()> {
        self.target
            .mkdir(&self.strip_protocol(path), create_parents)
            .await
    }

    async fn makedirs(&self, path: &str, exist_ok: bool) -> Result<()> {
        self.target
            .makedirs(&self.strip_protocol(path), exist_ok)
            .await
    }

    async fn get_file(&self, rpath: &str, lpath: &Path) -> Result<()> {
        self.target.get_file(&self.strip_protocol(rpath), lpath).await
    }

    async fn put_file(&self, lpath: &Path, rpath: &str) -> Result<()> {
        self.target.put_file(lpath, &self.strip_protocol(rpath)).await
    }

    async fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn FileHandle>> {
        self.target.open(&self.strip_protocol(path), mode).await
    }
}
