//! Cache store backends
//!
//! The engine only ever talks to a store through [`CacheStore`]: point lookups, writes with an
//! optional expiry, prefix enumeration and batch deletion. The store is the single point of
//! sharing between readers; no backend is assumed to be the only writer.

pub mod memory;
pub mod redis;
pub mod synap;

use crate::core::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

pub use self::memory::{MemoryStore, MemoryStoreConfig};
pub use self::redis::RedisStore;
pub use self::synap::{SynapStore, SynapStoreConfig};

/// Shared key/value store used to persist fetched byte ranges
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Short backend name used in logs
    fn name(&self) -> &'static str;

    /// Look up a key. `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Write a key, overwriting any previous value. `ttl_secs = None` never expires.
    async fn set(&self, key: &str, value: Bytes, ttl_secs: Option<u64>) -> Result<()>;

    /// All live keys starting with `prefix`
    async fn keys_with_prefix(&self, prefix: &str) -> Result<BTreeSet<String>>;

    /// Delete keys in one batch, returning how many existed
    async fn delete(&self, keys: &[String]) -> Result<usize>;

    /// Release the underlying connection
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Store handle shared by many caches
pub type SharedStore = Arc<dyn CacheStore>;

/// Which store to connect to when no handle is injected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Process-local store; only shared between caches in the same process
    Memory(MemoryStoreConfig),
    Redis {
        host: String,
        port: u16,
        #[serde(default)]
        db: i64,
    },
    Synap(SynapStoreConfig),
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Redis {
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
        }
    }
}

impl StoreConfig {
    /// Open a connection to the configured store
    pub async fn connect(&self) -> Result<SharedStore> {
        let store: SharedStore = match self {
            Self::Memory(config) => {
                let store = MemoryStore::new(config.clone());
                store.start_ttl_cleanup();
                Arc::new(store)
            }
            Self::Redis { host, port, db } => Arc::new(RedisStore::connect(host, *port, *db).await?),
            Self::Synap(config) => Arc::new(SynapStore::new(config.clone())?),
        };
        info!("Connected to {} cache store", store.name());
        Ok(store)
    }
}
