//! Reference-manifest filesystem
//!
//! A manifest maps logical paths to byte ranges of other files, in the kerchunk JSON layout:
//!
//! ```json
//! {
//!   "version": 1,
//!   "templates": {"u": "/data/archive.nc"},
//!   "refs": {
//!     ".zgroup": "{\"zarr_format\": 2}",
//!     "temp/0.0": ["{{u}}", 2048, 512],
//!     "temp/0.1": ["/data/part.bin"],
//!     "mask/0": "base64:AAEC"
//!   }
//! }
//! ```
//!
//! A bare object without `refs` is read as version 0, where the object itself is the
//! reference table.

use super::caching::DEFAULT_KEY_PREFIX;
use super::mapper::hash_path;
use super::{
    FileHandle, FileInfo, FileSystem, LocalFileSystem, OpenMode, ReadFile, SharedFileSystem,
    TargetOptions, filesystem, resolve_store,
};
use crate::cache::{CacheAside, KeyNamespace, StorePolicy};
use crate::core::{ByteRange, CacheStats, DEFAULT_EXPIRY_SECS, RangeCacheError, Result};
use crate::store::{SharedStore, StoreConfig};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where the manifest comes from
#[derive(Debug, Clone, PartialEq)]
pub enum ManifestSource {
    /// Path on the target filesystem
    Path(String),
    /// Manifest supplied in memory
    Inline(Value),
}

/// One resolved manifest entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// Literal content stored in the manifest
    Inline(Bytes),
    /// Whole target file
    Whole { url: String },
    /// `length` bytes of a target file starting at `offset`
    Range {
        url: String,
        offset: u64,
        length: u64,
    },
}

impl Reference {
    fn parse(key: &str, value: &Value, templates: &BTreeMap<String, String>) -> Result<Self> {
        match value {
            Value::String(text) => match text.strip_prefix("base64:") {
                Some(encoded) => Ok(Self::Inline(Bytes::from(STANDARD.decode(encoded)?))),
                None => Ok(Self::Inline(Bytes::from(text.clone().into_bytes()))),
            },
            Value::Array(items) => {
                let url = items
                    .first()
                    .and_then(Value::as_str)
                    .map(|url| expand_templates(url, templates))
                    .ok_or_else(|| {
                        RangeCacheError::InvalidReference(format!("{}: missing url", key))
                    })?;
                match items.len() {
                    1 => Ok(Self::Whole { url }),
                    3 => {
                        let offset = items[1].as_u64();
                        let length = items[2].as_u64();
                        match (offset, length) {
                            (Some(offset), Some(length)) => Ok(Self::Range {
                                url,
                                offset,
                                length,
                            }),
                            _ => Err(RangeCacheError::InvalidReference(format!(
                                "{}: offset and length must be non-negative integers",
                                key
                            ))),
                        }
                    }
                    n => Err(RangeCacheError::InvalidReference(format!(
                        "{}: expected [url] or [url, offset, length], got {} items",
                        key, n
                    ))),
                }
            }
            // Version 0 manifests may embed JSON documents directly
            other => Ok(Self::Inline(Bytes::from(serde_json::to_vec(other)?))),
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Inline(_) => None,
            Self::Whole { url } | Self::Range { url, .. } => Some(url.as_str()),
        }
    }
}

fn expand_templates(url: &str, templates: &BTreeMap<String, String>) -> String {
    if !url.contains("{{") {
        return url.to_string();
    }
    templates.iter().fold(url.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{{{}}}}}", name), value)
    })
}

/// Parse a manifest document into its reference table
pub fn parse_manifest(manifest: &Value) -> Result<BTreeMap<String, Reference>> {
    let Value::Object(root) = manifest else {
        return Err(RangeCacheError::InvalidReference(
            "manifest must be a JSON object".to_string(),
        ));
    };

    let (table, templates) = match root.get("refs") {
        Some(Value::Object(refs)) => {
            let templates: BTreeMap<String, String> = root
                .get("templates")
                .and_then(Value::as_object)
                .map(|t| {
                    t.iter()
                        .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                        .collect()
                })
                .unwrap_or_default();
            (refs, templates)
        }
        Some(_) => {
            return Err(RangeCacheError::InvalidReference(
                "refs must be a JSON object".to_string(),
            ));
        }
        None => (root, BTreeMap::new()),
    };

    table
        .iter()
        .map(|(key, value)| {
            Reference::parse(key, value, &templates).map(|reference| (key.clone(), reference))
        })
        .collect()
}

/// Construction options for [`ReferenceFileSystem`]
#[derive(Clone)]
pub struct ReferenceConfig {
    pub manifest: ManifestSource,
    /// Filesystem holding the manifest and the referenced files
    pub fs: Option<SharedFileSystem>,
    pub target_protocol: Option<String>,
    pub target_options: TargetOptions,
    pub store: Option<SharedStore>,
    pub store_config: StoreConfig,
    pub expiry_secs: u64,
    pub key_prefix: String,
    pub on_store_error: StorePolicy,
}

impl ReferenceConfig {
    pub fn new(manifest: ManifestSource) -> Self {
        Self {
            manifest,
            fs: None,
            target_protocol: None,
            target_options: TargetOptions::new(),
            store: None,
            store_config: StoreConfig::default(),
            expiry_secs: DEFAULT_EXPIRY_SECS,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            on_store_error: StorePolicy::default(),
        }
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

    pub fn with_store_policy(mut self, policy: StorePolicy) -> Self {
        self.on_store_error = policy;
        self
    }

    /// Stable identifier of the manifest: its path, or the SHA-256 of its canonical JSON
    pub fn source_id(&self) -> Result<String> {
        match &self.manifest {
            ManifestSource::Path(path) => Ok(path.clone()),
            ManifestSource::Inline(value) => Ok(hash_path(&serde_json::to_string(value)?)),
        }
    }
}

/// Read-only filesystem over a reference manifest
///
/// Resolved references are cached under `"{key_prefix}-{source}-{path}"`. A manifest loaded
/// from a path is cached under `"{key_prefix}-{source}"`. On construction every reference is
/// checked against the target; if that fails the prefix is invalidated and setup is retried
/// once, so a manifest cached before the target changed is reloaded.
pub struct ReferenceFileSystem {
    target: SharedFileSystem,
    manifest: ManifestSource,
    source: String,
    namespace: KeyNamespace,
    aside: CacheAside,
    refs: BTreeMap<String, Reference>,
}

impl ReferenceFileSystem {
    pub async fn new(config: ReferenceConfig) -> Result<Self> {
        let target: SharedFileSystem = match (&config.fs, &config.target_protocol) {
            (Some(_), Some(_)) => {
                return Err(RangeCacheError::InvalidConfig(
                    "fs and target_protocol may not both be given".to_string(),
                ));
            }
            (Some(fs), None) => fs.clone(),
            (None, Some(protocol)) => filesystem(protocol, &config.target_options)?,
            (None, None) => Arc::new(LocalFileSystem::from_options(&config.target_options)?),
        };
        let source = config.source_id()?;
        let store = resolve_store(config.store.as_ref(), &config.store_config).await?;
        let aside =
            CacheAside::new(store, Some(config.expiry_secs)).with_policy(config.on_store_error);

        let mut fs = Self {
            target,
            manifest: config.manifest,
            source,
            namespace: KeyNamespace::new(config.key_prefix),
            aside,
            refs: BTreeMap::new(),
        };

        fs.refs = match fs.load().await {
            Ok(refs) => refs,
            Err(e) => {
                warn!(
                    error = %e,
                    "Reference setup failed for {}, invalidating {} and retrying",
                    fs.source,
                    fs.namespace.pattern()
                );
                fs.invalidate_cache().await?;
                fs.load().await?
            }
        };

        info!(
            "Reference filesystem {} ready with {} references",
            fs.source,
            fs.refs.len()
        );
        Ok(fs)
    }

    async fn load(&self) -> Result<BTreeMap<String, Reference>> {
        let refs = match &self.manifest {
            ManifestSource::Inline(value) => parse_manifest(value)?,
            ManifestSource::Path(path) => {
                let key = self.namespace.request_key(&self.source, None, None);
                let raw = self
                    .aside
                    .get_or_fetch(&key, path, || self.target.cat_file(path, None, None))
                    .await?;
                parse_manifest(&serde_json::from_slice(&raw)?)?
            }
        };
        self.validate(&refs).await?;
        Ok(refs)
    }

    /// Every referenced file must exist and be long enough for its ranges
    async fn validate(&self, refs: &BTreeMap<String, Reference>) -> Result<()> {
        let mut required: BTreeMap<&str, u64> = BTreeMap::new();
        for reference in refs.values() {
            match reference {
                Reference::Inline(_) => {}
                Reference::Whole { url } => {
                    required.entry(url.as_str()).or_insert(0);
                }
                Reference::Range {
                    url,
                    offset,
                    length,
                } => {
                    let end = offset.saturating_add(*length);
                    let needed = required.entry(url.as_str()).or_insert(0);
                    *needed = (*needed).max(end);
                }
            }
        }

        for (url, needed) in required {
            let info = self.target.info(url).await.map_err(|e| {
                RangeCacheError::InvalidReference(format!("{}: {}", url, e))
            })?;
            if info.size < needed {
                return Err(RangeCacheError::InvalidReference(format!(
                    "{} has {} bytes but references need {}",
                    url, info.size, needed
                )));
            }
        }
        Ok(())
    }

    fn normalize(&self, path: &str) -> String {
        self.strip_protocol(path)
            .trim_start_matches('/')
            .trim_end_matches('/')
            .to_string()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn references(&self) -> &BTreeMap<String, Reference> {
        &self.refs
    }

    pub fn target(&self) -> &SharedFileSystem {
        &self.target
    }

    /// Store key for one logical path
    pub fn cache_key(&self, path: &str) -> String {
        let path = self.normalize(path);
        self.namespace
            .request_key(&format!("{}-{}", self.source, path), None, None)
    }

    /// Content of one logical path, through the cache
    pub async fn cat(&self, path: &str) -> Result<Bytes> {
        let path = self.normalize(path);
        let reference = self
            .refs
            .get(&path)
            .ok_or_else(|| RangeCacheError::NotFound(path.clone()))?;

        let key = self.cache_key(&path);
        self.aside
            .get_or_fetch(&key, &path, || self.resolve(reference))
            .await
    }

    async fn resolve(&self, reference: &Reference) -> Result<Bytes> {
        match reference {
            Reference::Inline(data) => Ok(data.clone()),
            Reference::Whole { url } => self.target.cat_file(url, None, None).await,
            Reference::Range {
                url,
                offset,
                length,
            } => {
                debug!("Resolving {} bytes at {} of {}", length, offset, url);
                self.target
                    .cat_file(url, Some(*offset), Some(offset + length))
                    .await
            }
        }
    }

    pub async fn cached_keys(&self) -> Result<BTreeSet<String>> {
        self.namespace.cached_keys(self.aside.store().as_ref()).await
    }

    /// Delete every key under the prefix, including other manifests sharing it
    pub async fn invalidate_cache(&self) -> Result<usize> {
        self.namespace.invalidate(self.aside.store().as_ref()).await
    }

    pub fn stats(&self) -> CacheStats {
        self.aside.stats()
    }

    pub async fn close(&self) -> Result<()> {
        self.aside.store().close().await
    }

    fn read_only(&self, op: &str) -> RangeCacheError {
        RangeCacheError::Unsupported(format!("{} on read-only reference filesystem", op))
    }
}

impl fmt::Debug for ReferenceFileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceFileSystem")
            .field("target_protocol", &self.target.protocol())
            .field("manifest", &self.manifest)
            .field("source", &self.source)
            .field("key_prefix", &self.namespace.prefix())
            .field("refs", &self.refs.len())
            .finish()
    }
}

#[async_trait]
impl FileSystem for ReferenceFileSystem {
    fn protocol(&self) -> &str {
        "reference"
    }

    async fn info(&self, path: &str) -> Result<FileInfo> {
        let path = self.normalize(path);
        if path.is_empty() {
            return Ok(FileInfo::directory(path));
        }
        match self.refs.get(&path) {
            Some(Reference::Inline(data)) => Ok(FileInfo::file(path, data.len() as u64)),
            Some(Reference::Range { length, .. }) => Ok(FileInfo::file(path, *length)),
            Some(Reference::Whole { url }) => {
                let size = self.target.info(url).await?.size;
                Ok(FileInfo::file(path, size))
            }
            None => {
                let prefix = format!("{}/", path);
                if self.refs.keys().any(|key| key.starts_with(&prefix)) {
                    Ok(FileInfo::directory(path))
                } else {
                    Err(RangeCacheError::NotFound(path))
                }
            }
        }
    }

    async fn ls(&self, path: &str) -> Result<Vec<FileInfo>> {
        let path = self.normalize(path);
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };

        let mut entries: BTreeMap<String, FileInfo> = BTreeMap::new();
        for key in self.refs.keys() {
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            let entry = match rest.split_once('/') {
                None => self.info(key).await?,
                Some((child, _)) => FileInfo::directory(format!("{}{}", prefix, child)),
            };
            entries.entry(entry.name.clone()).or_insert(entry);
        }

        if entries.is_empty() && !path.is_empty() {
            return Err(RangeCacheError::NotFound(path));
        }
        Ok(entries.into_values().collect())
    }

    async fn cat_file(&self, path: &str, start: Option<u64>, end: Option<u64>) -> Result<Bytes> {
        let data = self.cat(path).await?;
        Ok(match ByteRange::resolve(start, end, data.len() as u64) {
            Some(range) => data.slice(range.start as usize..range.end as usize),
            None => Bytes::new(),
        })
    }

    async fn pipe_file(&self, _path: &str, _data: Bytes) -> Result<()> {
        Err(self.read_only("pipe_file"))
    }

    async fn rm_file(&self, _path: &str) -> Result<()> {
        Err(self.read_only("rm_file"))
    }

    async fn mkdir(&self, _path: &str, _create_parents: bool) -> Result<()> {
        Err(self.read_only("mkdir"))
    }

    async fn makedirs(&self, _path: &str, _exist_ok: bool) -> Result<()> {
        Err(self.read_only("makedirs"))
    }

    async fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn FileHandle>> {
        if !mode.is_read() {
            return Err(self.read_only("open for writing"));
        }
        let path = self.normalize(path);
        let data = self.cat(&path).await?;
        Ok(Box::new(ReadFile::from_bytes(path, data)))
    }
}
