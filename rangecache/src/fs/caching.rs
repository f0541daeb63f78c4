use super::mapper::hash_path;
use super::{
    FileHandle, FileInfo, FileSystem, KeyMapper, OpenMode, ReadFile, SharedFileSystem,
    TargetFetcher, TargetOptions, resolve_store, resolve_target,
};
use crate::cache::{
    CacheKind, CacheParams, DEFAULT_BLOCK_SIZE, KeyNamespace, RangeCache, StorePolicy,
    build_cache,
};
use crate::core::{CacheStats, DEFAULT_EXPIRY_SECS, RangeCacheError, Result};
use crate::store::{SharedStore, StoreConfig};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Default prefix for every key written by the filesystem wrappers
pub const DEFAULT_KEY_PREFIX: &str = "rangecache";

/// Construction options for [`CachingFileSystem`]
///
/// Exactly one of `fs` and `target_protocol` must be set. When `store` is `None` a connection
/// is opened from `store_config`.
#[derive(Clone)]
pub struct CachingConfig {
    pub fs: Option<SharedFileSystem>,
    pub target_protocol: Option<String>,
    /// Passed to the registry when the target is built from `target_protocol`
    pub target_options: TargetOptions,
    pub store: Option<SharedStore>,
    pub store_config: StoreConfig,
    pub kind: CacheKind,
    pub block_size: u64,
    /// Seconds before cached blocks expire; 0 disables expiry
    pub expiry_secs: u64,
    pub key_prefix: String,
    pub concurrency: usize,
    /// Include a unique key derived from the target's file metadata in every source identifier
    pub check_files: bool,
    /// Shorthand for a basename (`true`) or hash (`false`) key mapper
    pub same_names: Option<bool>,
    pub cache_mapper: Option<KeyMapper>,
    /// Recorded for equality only; payloads are never transformed
    pub compression: Option<String>,
    pub on_store_error: StorePolicy,
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            fs: None,
            target_protocol: None,
            target_options: TargetOptions::new(),
            store: None,
            store_config: StoreConfig::default(),
            kind: CacheKind::default(),
            block_size: DEFAULT_BLOCK_SIZE,
            expiry_secs: DEFAULT_EXPIRY_SECS,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            concurrency: 1,
            check_files: false,
            same_names: None,
            cache_mapper: None,
            compression: None,
            on_store_error: StorePolicy::default(),
        }
    }
}

impl fmt::Debug for CachingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingConfig")
            .field("fs", &self.fs.as_ref().map(|fs| fs.protocol().to_string()))
            .field("target_protocol", &self.target_protocol)
            .field("store", &self.store.as_ref().map(|store| store.name()))
            .field("store_config", &self.store_config)
            .field("kind", &self.kind)
            .field("block_size", &self.block_size)
            .field("expiry_secs", &self.expiry_secs)
            .field("key_prefix", &self.key_prefix)
            .field("check_files", &self.check_files)
            .finish_non_exhaustive()
    }
}

impl CachingConfig {
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

    pub fn with_kind(mut self, kind: CacheKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
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

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_check_files(mut self, check_files: bool) -> Self {
        self.check_files = check_files;
        self
    }

    pub fn with_same_names(mut self, same_names: bool) -> Self {
        self.same_names = Some(same_names);
        self
    }

    pub fn with_cache_mapper(mut self, mapper: KeyMapper) -> Self {
        self.cache_mapper = Some(mapper);
        self
    }

    pub fn with_compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    pub fn with_store_policy(mut self, policy: StorePolicy) -> Self {
        self.on_store_error = policy;
        self
    }

    /// Check option combinations and pick the key mapper
    fn resolve_mapper(&self) -> Result<KeyMapper> {
        if self.block_size == 0 {
            return Err(RangeCacheError::InvalidConfig(
                "block size must be positive".to_string(),
            ));
        }
        match (self.same_names, self.cache_mapper) {
            (Some(_), Some(_)) => Err(RangeCacheError::InvalidConfig(
                "cannot specify both same_names and cache_mapper".to_string(),
            )),
            (_, Some(mapper)) => Ok(mapper),
            (same_names, None) => Ok(KeyMapper::from_same_names(same_names.unwrap_or(false))),
        }
    }
}

/// Caching wrapper over a target filesystem
///
/// Read-mode opens (and `cat_file`) go through a block or chunk cache whose backing fetch is
/// the target's own range read and whose source identifier is
/// `"{key_prefix}-{mapped path}"`, suffixed with a unique file key when `check_files` is set.
/// Every other operation is forwarded to the target unchanged.
///
/// Two instances compare equal when their configuration matches, whatever store they use.
pub struct CachingFileSystem {
    target: SharedFileSystem,
    target_protocol: String,
    target_options: TargetOptions,
    store: SharedStore,
    mapper: KeyMapper,
    namespace: KeyNamespace,
    kind: CacheKind,
    block_size: u64,
    expiry_secs: u64,
    concurrency: usize,
    check_files: bool,
    compression: Option<String>,
    policy: StorePolicy,
    /// Current cache per target path
    caches: RwLock<HashMap<String, InstalledCache>>,
    /// Counters of caches replaced after their file changed
    retired: RwLock<CacheStats>,
}

struct InstalledCache {
    source: String,
    cache: Arc<dyn RangeCache>,
}

impl CachingFileSystem {
    /// Validate the configuration, then resolve the target and connect the store
    pub async fn new(config: CachingConfig) -> Result<Self> {
        let mapper = config.resolve_mapper()?;
        let (target, target_protocol) = resolve_target(
            config.fs.as_ref(),
            config.target_protocol.as_deref(),
            &config.target_options,
        )?;
        let store = resolve_store(config.store.as_ref(), &config.store_config).await?;

        info!(
            "Caching filesystem over {} ({} cache, block_size={}, expiry={}s, store={})",
            target_protocol,
            config.kind,
            config.block_size,
            config.expiry_secs,
            store.name()
        );

        Ok(Self {
            target,
            target_protocol,
            target_options: config.target_options,
            store,
            mapper,
            namespace: KeyNamespace::new(config.key_prefix),
            kind: config.kind,
            block_size: config.block_size,
            expiry_secs: config.expiry_secs,
            concurrency: config.concurrency,
            check_files: config.check_files,
            compression: config.compression,
            policy: config.on_store_error,
            caches: RwLock::new(HashMap::new()),
            retired: RwLock::new(CacheStats::default()),
        })
    }

    pub fn target(&self) -> &SharedFileSystem {
        &self.target
    }

    pub fn target_protocol(&self) -> &str {
        &self.target_protocol
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn mapper(&self) -> KeyMapper {
        self.mapper
    }

    pub fn key_prefix(&self) -> &str {
        self.namespace.prefix()
    }

    /// Name a target path maps to inside cache keys
    pub fn hash_name(&self, path: &str) -> String {
        self.mapper.map(&self.strip_protocol(path))
    }

    /// Source identifier used as the key prefix of one file's cache
    pub fn source_id(&self, path: &str, info: &FileInfo) -> String {
        let mut id = format!("{}-{}", self.namespace.prefix(), self.mapper.map(path));
        if self.check_files {
            id.push('-');
            id.push_str(&file_ukey(info));
        }
        id
    }

    /// Cache installed for `path`, built on first use
    ///
    /// A path holds one cache at a time. When its source identifier or size changes the old
    /// cache is replaced and its counters are kept in the filesystem totals.
    pub async fn cache_for(&self, path: &str) -> Result<Arc<dyn RangeCache>> {
        let info = self.target.info(path).await?;
        if info.is_dir() {
            return Err(RangeCacheError::Unsupported(format!(
                "{} is a directory",
                path
            )));
        }

        let source = self.source_id(path, &info);
        if let Some(installed) = self.caches.read().get(path) {
            if installed.source == source && installed.cache.size() == info.size {
                return Ok(installed.cache.clone());
            }
        }

        let fetcher = Arc::new(TargetFetcher::new(self.target.clone(), path));
        let params = CacheParams::new(source.clone(), info.size, fetcher, self.store.clone())
            .with_block_size(self.block_size)
            .with_expiry(Some(self.expiry_secs))
            .with_policy(self.policy)
            .with_concurrency(self.concurrency);
        let cache: Arc<dyn RangeCache> = Arc::from(build_cache(self.kind, params)?);

        debug!(
            "Installed {} cache for {} (size={})",
            cache.name(),
            source,
            info.size
        );
        let replaced = self.caches.write().insert(
            path.to_string(),
            InstalledCache {
                source,
                cache: cache.clone(),
            },
        );
        if let Some(old) = replaced {
            debug!("Retired cache {} for {}", old.source, path);
            self.retired.write().accumulate(&old.cache.stats());
        }
        Ok(cache)
    }

    /// Number of files with a cache currently installed
    pub fn installed_caches(&self) -> usize {
        self.caches.read().len()
    }

    /// Keys stored under this filesystem's prefix
    pub async fn cached_keys(&self) -> Result<BTreeSet<String>> {
        self.namespace.cached_keys(self.store.as_ref()).await
    }

    /// Delete every key under this filesystem's prefix, including keys written by other
    /// instances sharing the prefix
    pub async fn invalidate_cache(&self) -> Result<usize> {
        self.namespace.invalidate(self.store.as_ref()).await
    }

    /// Hit/miss counters summed over every cache installed so far
    pub fn stats(&self) -> CacheStats {
        let mut total = self.retired.read().clone();
        for installed in self.caches.read().values() {
            total.accumulate(&installed.cache.stats());
        }
        total
    }

    pub async fn close(&self) -> Result<()> {
        {
            let mut caches = self.caches.write();
            let mut retired = self.retired.write();
            for (_, old) in caches.drain() {
                retired.accumulate(&old.cache.stats());
            }
        }
        self.store.close().await
    }

    fn identity(&self) -> Identity<'_> {
        (
            self.target_protocol.as_str(),
            &self.target_options,
            self.kind,
            self.block_size,
            self.expiry_secs,
            self.check_files,
            self.compression.as_deref(),
            self.mapper,
            self.namespace.prefix(),
        )
    }
}

/// Configuration fields that define equality
type Identity<'a> = (
    &'a str,
    &'a TargetOptions,
    CacheKind,
    u64,
    u64,
    bool,
    Option<&'a str>,
    KeyMapper,
    &'a str,
);

/// Short digest of the metadata that changes when a file is rewritten
fn file_ukey(info: &FileInfo) -> String {
    let mut key = hash_path(&format!(
        "{}:{}:{}",
        info.size,
        info.etag.as_deref().unwrap_or_default(),
        info.modified.unwrap_or_default()
    ));
    key.truncate(16);
    key
}

impl PartialEq for CachingFileSystem {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other) || self.identity() == other.identity()
    }
}

impl Eq for CachingFileSystem {}

impl Hash for CachingFileSystem {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl fmt::Debug for CachingFileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingFileSystem")
            .field("target_protocol", &self.target_protocol)
            .field("kind", &self.kind)
            .field("block_size", &self.block_size)
            .field("key_prefix", &self.namespace.prefix())
            .field("store", &self.store.name())
            .finish()
    }
}

#[async_trait]
impl FileSystem for CachingFileSystem {
    fn protocol(&self) -> &str {
        "rangecache"
    }

    fn strip_protocol(&self, path: &str) -> String {
        let path = path.strip_prefix("rangecache://").unwrap_or(path);
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
        self.cache_for(&path).await?.read(start, end).await
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

    async fn put_file(&self, lpath: &Path, rpath: &str) -> Result<()> {
        self.target.put_file(lpath, &self.strip_protocol(rpath)).await
    }

    async fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn FileHandle>> {
        let path = self.strip_protocol(path);
        if !mode.is_read() {
            return self.target.open(&path, mode).await;
        }
        let cache = self.cache_for(&path).await?;
        Ok(Box::new(ReadFile::cached(path, cache)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFileSystem;
    use crate::store::MemoryStore;
    use std::hash::DefaultHasher;

    async fn memory_target() -> MemoryFileSystem {
        let fs = MemoryFileSystem::new();
        fs.pipe_file("/data/a.bin", Bytes::from((0u8..100).collect::<Vec<u8>>()))
            .await
            .unwrap();
        fs
    }

    fn fresh_store() -> SharedStore {
        Arc::new(MemoryStore::default())
    }

    fn config(fs: &MemoryFileSystem, store: &SharedStore) -> CachingConfig {
        CachingConfig::new()
            .with_fs(Arc::new(fs.clone()))
            .with_store(store.clone())
            .with_block_size(10)
    }

    fn hash_of(fs: &CachingFileSystem) -> u64 {
        let mut hasher = DefaultHasher::new();
        fs.hash(&mut hasher);
        hasher.finish()
    }

    #[tokio::test]
    async fn test_rejects_conflicting_options() {
        let fs: SharedFileSystem = Arc::new(MemoryFileSystem::new());
        let store: SharedStore = Arc::new(MemoryStore::default());

        let neither = CachingConfig::new().with_store(store.clone());
        assert!(matches!(
            CachingFileSystem::new(neither).await,
            Err(RangeCacheError::InvalidConfig(_))
        ));

        let both = CachingConfig::new()
            .with_fs(fs.clone())
            .with_target_protocol("memory")
            .with_store(store.clone());
        assert!(matches!(
            CachingFileSystem::new(both).await,
            Err(RangeCacheError::InvalidConfig(_))
        ));

        let mappers = CachingConfig::new()
            .with_fs(fs)
            .with_store(store)
            .with_same_names(true)
            .with_cache_mapper(KeyMapper::Hash);
        assert!(matches!(
            CachingFileSystem::new(mappers).await,
            Err(RangeCacheError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_read_goes_through_block_cache() {
        let target = memory_target().await;
        let store: SharedStore = Arc::new(MemoryStore::default());
        let fs = CachingFileSystem::new(config(&target, &store).with_same_names(true))
            .await
            .unwrap();

        let mut file = fs.open("rangecache://data/a.bin", OpenMode::Read).await.unwrap();
        file.seek(std::io::SeekFrom::Start(15)).unwrap();
        let bytes = file.read(Some(10)).await.unwrap();
        assert_eq!(&bytes[..], &(15u8..25).collect::<Vec<u8>>()[..]);

        let keys: Vec<String> = fs.cached_keys().await.unwrap().into_iter().collect();
        assert_eq!(
            keys,
            vec!["rangecache-a.bin-1".to_string(), "rangecache-a.bin-2".to_string()]
        );

        fs.cat_file("/data/a.bin", Some(12), Some(18)).await.unwrap();
        let stats = fs.stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_write_mode_passes_through() {
        let target = memory_target().await;
        let store: SharedStore = Arc::new(MemoryStore::default());
        let fs = CachingFileSystem::new(config(&target, &store)).await.unwrap();

        let mut file = fs.open("/data/new.txt", OpenMode::Write).await.unwrap();
        file.write(b"fresh").unwrap();
        file.close().await.unwrap();

        assert_eq!(
            target.cat_file("/data/new.txt", None, None).await.unwrap(),
            Bytes::from_static(b"fresh")
        );
        assert!(fs.cached_keys().await.unwrap().is_empty());

        fs.mkdir("/other", false).await.unwrap();
        assert!(target.info("/other").await.unwrap().is_dir());
        assert_eq!(fs.ls("/data").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_equality_ignores_store() {
        let target = memory_target().await;
        let a = CachingFileSystem::new(config(&target, &fresh_store()))
            .await
            .unwrap();
        let b = CachingFileSystem::new(config(&target, &fresh_store()))
            .await
            .unwrap();
        let c = CachingFileSystem::new(config(&target, &fresh_store()).with_expiry(60))
            .await
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_hash_name_and_check_files() {
        let target = memory_target().await;
        let store: SharedStore = Arc::new(MemoryStore::default());
        let fs = CachingFileSystem::new(config(&target, &store).with_check_files(true))
            .await
            .unwrap();

        assert_eq!(fs.hash_name("rangecache://data/a.bin").len(), 64);
        assert_eq!(fs.mapper(), KeyMapper::Hash);

        let before = fs.source_id("/data/a.bin", &target.info("/data/a.bin").await.unwrap());
        target
            .pipe_file("/data/a.bin", Bytes::from(vec![7u8; 100]))
            .await
            .unwrap();
        let after = fs.source_id("/data/a.bin", &target.info("/data/a.bin").await.unwrap());
        assert_ne!(before, after);
        assert!(before.starts_with("rangecache-"));

        assert_eq!(
            fs.cat_file("/data/a.bin", Some(0), Some(3)).await.unwrap(),
            Bytes::from(vec![7u8; 3])
        );
    }

    #[tokio::test]
    async fn test_rewrites_replace_the_installed_cache() {
        let target = memory_target().await;
        let store = fresh_store();
        let fs = CachingFileSystem::new(config(&target, &store).with_check_files(true))
            .await
            .unwrap();

        for round in 0u8..20 {
            target
                .pipe_file("/data/a.bin", Bytes::from(vec![round; 30 + round as usize]))
                .await
                .unwrap();
            assert_eq!(
                fs.cat_file("/data/a.bin", Some(0), Some(2)).await.unwrap(),
                Bytes::from(vec![round; 2])
            );
            assert_eq!(fs.installed_caches(), 1);
        }

        // Counters of replaced caches are not lost
        assert_eq!(fs.stats().misses, 20);

        for i in 0..5 {
            let path = format!("/data/other-{}.bin", i);
            target.pipe_file(&path, Bytes::from_static(b"x")).await.unwrap();
            fs.cat_file(&path, None, None).await.unwrap();
        }
        assert_eq!(fs.installed_caches(), 6);

        fs.close().await.unwrap();
        assert_eq!(fs.installed_caches(), 0);
        assert_eq!(fs.stats().misses, 25);
    }

    #[tokio::test]
    async fn test_unchanged_file_reuses_cache() {
        let target = memory_target().await;
        let store = fresh_store();
        let fs = CachingFileSystem::new(config(&target, &store).with_check_files(true))
            .await
            .unwrap();

        let first = fs.cache_for("/data/a.bin").await.unwrap();
        let second = fs.cache_for("/data/a.bin").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fs.installed_caches(), 1);
    }

    #[tokio::test]
    async fn test_directory_open_is_rejected() {
        let target = memory_target().await;
        let store: SharedStore = Arc::new(MemoryStore::default());
        let fs = CachingFileSystem::new(config(&target, &store)).await.unwrap();

        assert!(matches!(
            fs.open("/data", OpenMode::Read).await,
            Err(RangeCacheError::Unsupported(_))
        ));
    }
}
