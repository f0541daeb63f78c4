//! Common test utilities

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rangecache::core::{RangeCacheError, Result};
use rangecache::fs::{FileHandle, FileInfo, FileSystem, MemoryFileSystem, OpenMode};
use rangecache::store::{
    CacheStore, MemoryStore, SharedStore, SynapStore, SynapStoreConfig,
};
use rangecache::{CacheParams, RangeFetcher};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Route log output through the test harness; `RUST_LOG` selects the level
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}

/// Deterministic source content: byte `i` is `i % 251`
#[allow(dead_code)]
pub fn source_bytes(size: u64) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

#[allow(dead_code)]
pub fn memory_store() -> SharedStore {
    Arc::new(MemoryStore::default())
}

/// Synap store pointed at a fresh mock server
#[allow(dead_code)]
pub async fn setup_synap_store() -> (SynapStore, mockito::ServerGuard) {
    let server = mockito::Server::new_async().await;
    let store = SynapStore::new(SynapStoreConfig::new(server.url())).unwrap();
    (store, server)
}

/// Backing fetch over an in-memory source that records every requested range
#[allow(dead_code)]
pub struct CountingFetcher {
    data: Bytes,
    delay: Option<Duration>,
    calls: Mutex<Vec<(u64, u64)>>,
}

#[allow(dead_code)]
impl CountingFetcher {
    pub fn new(size: u64) -> Arc<Self> {
        Arc::new(Self {
            data: Bytes::from(source_bytes(size)),
            delay: None,
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Every fetch sleeps for `delay` before answering
    pub fn slow(size: u64, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            data: Bytes::from(source_bytes(size)),
            delay: Some(delay),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<(u64, u64)> {
        self.calls.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn reset(&self) {
        self.calls.lock().clear();
    }

    pub fn expected(&self, start: u64, stop: u64) -> Bytes {
        self.data.slice(start as usize..stop as usize)
    }
}

#[async_trait]
impl RangeFetcher for CountingFetcher {
    async fn fetch(&self, start: u64, end: u64) -> Result<Bytes> {
        self.calls.lock().push((start, end));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.data.slice(start as usize..end as usize))
    }
}

/// Cache parameters wired to a counting fetcher
#[allow(dead_code)]
pub fn params(
    fetcher: &Arc<CountingFetcher>,
    size: u64,
    store: &SharedStore,
    source: &str,
) -> CacheParams {
    let fetcher: Arc<dyn RangeFetcher> = fetcher.clone();
    CacheParams::new(source, size, fetcher, store.clone())
}

/// Store whose every operation fails
#[allow(dead_code)]
pub struct FailingStore;

#[async_trait]
impl CacheStore for FailingStore {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn get(&self, _key: &str) -> Result<Option<Bytes>> {
        Err(RangeCacheError::Store("connection refused".to_string()))
    }

    async fn set(&self, _key: &str, _value: Bytes, _ttl_secs: Option<u64>) -> Result<()> {
        Err(RangeCacheError::Store("connection refused".to_string()))
    }

    async fn keys_with_prefix(&self, _prefix: &str) -> Result<BTreeSet<String>> {
        Err(RangeCacheError::Store("connection refused".to_string()))
    }

    async fn delete(&self, _keys: &[String]) -> Result<usize> {
        Err(RangeCacheError::Store("connection refused".to_string()))
    }
}

/// Memory target that counts range reads
#[allow(dead_code)]
#[derive(Default)]
pub struct CountingFileSystem {
    inner: MemoryFileSystem,
    cat_calls: AtomicUsize,
}

#[allow(dead_code)]
impl CountingFileSystem {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inner(&self) -> &MemoryFileSystem {
        &self.inner
    }

    pub fn cat_calls(&self) -> usize {
        self.cat_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileSystem for CountingFileSystem {
    fn protocol(&self) -> &str {
        "memory"
    }

    async fn info(&self, path: &str) -> Result<FileInfo> {
        self.inner.info(path).await
    }

    async fn ls(&self, path: &str) -> Result<Vec<FileInfo>> {
        self.inner.ls(path).await
    }

    async fn cat_file(&self, path: &str, start: Option<u64>, end: Option<u64>) -> Result<Bytes> {
        self.cat_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.cat_file(path, start, end).await
    }

    async fn pipe_file(&self, path: &str, data: Bytes) -> Result<()> {
        self.inner.pipe_file(path, data).await
    }

    async fn rm_file(&self, path: &str) -> Result<()> {
        self.inner.rm_file(path).await
    }

    async fn mkdir(&self, path: &str, create_parents: bool) -> Result<()> {
        self.inner.mkdir(path, create_parents).await
    }

    async fn makedirs(&self, path: &str, exist_ok: bool) -> Result<()> {
        self.inner.makedirs(path, exist_ok).await
    }

    async fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn FileHandle>> {
        self.inner.open(path, mode).await
    }
}
