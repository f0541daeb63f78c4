use super::CacheStore;
use crate::core::{Result, StoreStats, StoredValue};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use radix_trie::{Trie, TrieCommon};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Configuration for the in-process store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStoreConfig {
    /// TTL cleanup interval in milliseconds
    pub ttl_cleanup_interval_ms: u64,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            ttl_cleanup_interval_ms: 100,
        }
    }
}

type KeyTrie = Trie<String, StoredValue>;

/// Handle of the background TTL sweep, aborted when the last store clone goes away
#[derive(Default)]
struct Sweeper(Mutex<Option<JoinHandle<()>>>);

impl Sweeper {
    fn replace(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.0.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop(&self) -> bool {
        match self.0.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    fn is_running(&self) -> bool {
        self.0
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Key-value store using a radix trie so prefix scans stay cheap
#[derive(Clone)]
pub struct MemoryStore {
    data: Arc<RwLock<KeyTrie>>,
    stats: Arc<RwLock<StoreStats>>,
    sweeper: Arc<Sweeper>,
    config: MemoryStoreConfig,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(MemoryStoreConfig::default())
    }
}

impl MemoryStore {
    pub fn new(config: MemoryStoreConfig) -> Self {
        debug!(
            "Initializing memory store with ttl_cleanup_interval={}ms",
            config.ttl_cleanup_interval_ms
        );

        Self {
            data: Arc::new(RwLock::new(Trie::new())),
            stats: Arc::new(RwLock::new(StoreStats::default())),
            sweeper: Arc::new(Sweeper::default()),
            config,
        }
    }

    /// Start background TTL cleanup task
    ///
    /// The task runs until [`CacheStore::close`] or until the last clone of the store is
    /// dropped. Starting it again replaces the running task.
    pub fn start_ttl_cleanup(&self) {
        let interval_ms = self.config.ttl_cleanup_interval_ms.max(1);
        info!("Starting TTL cleanup task (interval={}ms)", interval_ms);

        let data: Weak<RwLock<KeyTrie>> = Arc::downgrade(&self.data);
        let stats: Weak<RwLock<StoreStats>> = Arc::downgrade(&self.stats);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));

            loop {
                interval.tick().await;
                let (Some(data), Some(stats)) = (data.upgrade(), stats.upgrade()) else {
                    break;
                };
                sweep_expired(&data, &stats);
            }
            debug!("TTL cleanup task stopped");
        });
        self.sweeper.replace(handle);
    }

    /// Whether the background TTL cleanup task is running
    pub fn is_sweeping(&self) -> bool {
        self.sweeper.is_running()
    }

    /// Get statistics
    pub fn stats(&self) -> StoreStats {
        self.stats.read().clone()
    }

    /// Remaining TTL of a live key; the inner `None` means it never expires
    pub fn ttl(&self, key: &str) -> Option<Option<u64>> {
        let data = self.data.read();
        data.get(key)
            .filter(|value| !value.is_expired())
            .map(StoredValue::remaining_ttl_secs)
    }

    /// Number of stored keys, expired ones included until the next sweep
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clean up expired keys
    pub fn cleanup_expired(&self) -> usize {
        sweep_expired(&self.data, &self.stats)
    }

    fn estimate_entry_size(key: &str, value: &StoredValue) -> usize {
        key.len() + value.data.len() + std::mem::size_of::<StoredValue>()
    }
}

fn sweep_expired(data: &RwLock<KeyTrie>, stats: &RwLock<StoreStats>) -> usize {
    let mut data = data.write();

    let expired: Vec<(String, usize)> = data
        .iter()
        .filter(|(_, v)| v.is_expired())
        .map(|(k, v)| (k.clone(), MemoryStore::estimate_entry_size(k, v)))
        .collect();

    let count = expired.len();
    if count > 0 {
        debug!("Cleaning up {} expired keys", count);
        let mut stats = stats.write();
        for (key, size) in expired {
            data.remove(&key);
            stats.total_memory_bytes = stats.total_memory_bytes.saturating_sub(size);
        }
        stats.total_keys = stats.total_keys.saturating_sub(count);
    }
    count
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut data = self.data.write();
        let mut stats = self.stats.write();
        stats.gets += 1;

        let expired = match data.get(key) {
            Some(value) if !value.is_expired() => {
                stats.hits += 1;
                return Ok(Some(value.data.clone()));
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            debug!("Key expired: {}", key);
            if let Some(value) = data.remove(key) {
                stats.total_keys = stats.total_keys.saturating_sub(1);
                stats.total_memory_bytes = stats
                    .total_memory_bytes
                    .saturating_sub(Self::estimate_entry_size(key, &value));
            }
        }
        stats.misses += 1;
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl_secs: Option<u64>) -> Result<()> {
        debug!("SET key={}, size={}, ttl={:?}", key, value.len(), ttl_secs);

        let stored = StoredValue::new(value, ttl_secs);
        let entry_size = Self::estimate_entry_size(key, &stored);

        let mut data = self.data.write();
        let previous = data.insert(key.to_string(), stored);

        let mut stats = self.stats.write();
        stats.sets += 1;
        match previous {
            Some(old) => {
                stats.total_memory_bytes = stats
                    .total_memory_bytes
                    .saturating_sub(Self::estimate_entry_size(key, &old))
                    + entry_size;
            }
            None => {
                stats.total_keys += 1;
                stats.total_memory_bytes += entry_size;
            }
        }

        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<BTreeSet<String>> {
        debug!("SCAN prefix={}", prefix);

        let data = self.data.read();
        let keys = data
            .get_raw_descendant(prefix)
            .map(|subtrie| {
                subtrie
                    .iter()
                    .filter(|(k, v)| k.starts_with(prefix) && !v.is_expired())
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default();

        Ok(keys)
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        debug!("MDEL count={}", keys.len());

        let mut data = self.data.write();
        let mut stats = self.stats.write();
        let mut count = 0;
        for key in keys {
            if let Some(value) = data.remove(key) {
                count += 1;
                stats.dels += 1;
                stats.total_keys = stats.total_keys.saturating_sub(1);
                stats.total_memory_bytes = stats
                    .total_memory_bytes
                    .saturating_sub(Self::estimate_entry_size(key, &value));
            }
        }

        Ok(count)
    }

    async fn close(&self) -> Result<()> {
        if self.sweeper.stop() {
            debug!("Stopped TTL cleanup task");
        }
        Ok(())
    }
}
