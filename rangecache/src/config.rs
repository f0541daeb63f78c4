use crate::cache::{CacheKind, DEFAULT_BLOCK_SIZE, StorePolicy};
use crate::core::DEFAULT_EXPIRY_SECS;
use crate::fs::caching::DEFAULT_KEY_PREFIX;
use crate::fs::{CachingConfig, KeyMapper, TargetOptions};
use crate::store::StoreConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeCacheConfig {
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub target: TargetConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub kind: CacheKind,
    pub block_size: u64,
    /// 0 disables expiry
    pub expiry_secs: u64,
    pub key_prefix: String,
    pub concurrency: usize,
    pub check_files: bool,
    pub same_names: Option<bool>,
    pub cache_mapper: Option<KeyMapper>,
    pub on_store_error: StorePolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            kind: CacheKind::Block,
            block_size: DEFAULT_BLOCK_SIZE,
            expiry_secs: DEFAULT_EXPIRY_SECS,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            concurrency: 1,
            check_files: false,
            same_names: None,
            cache_mapper: None,
            on_store_error: StorePolicy::Propagate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub protocol: String,
    pub options: TargetOptions,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            protocol: "file".to_string(),
            options: TargetOptions::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `json` or `text`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl RangeCacheConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: RangeCacheConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Options for a [`CachingFileSystem`](crate::fs::CachingFileSystem) over the configured
    /// target and store
    pub fn caching_config(&self) -> CachingConfig {
        let cache = &self.cache;
        let mut config = CachingConfig::new()
            .with_target_protocol(self.target.protocol.clone())
            .with_target_options(self.target.options.clone())
            .with_store_config(self.store.clone())
            .with_kind(cache.kind)
            .with_block_size(cache.block_size)
            .with_expiry(cache.expiry_secs)
            .with_key_prefix(cache.key_prefix.clone())
            .with_concurrency(cache.concurrency)
            .with_check_files(cache.check_files)
            .with_store_policy(cache.on_store_error);
        config.same_names = cache.same_names;
        config.cache_mapper = cache.cache_mapper;
        config
    }
}
