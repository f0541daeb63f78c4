//! # rangecache
//!
//! Shared byte-range read cache for remote files.
//!
//! Readers ask for arbitrary `[start, end)` intervals of a named object. Fetched bytes are kept
//! in an out-of-process key/value store so every process reading the same object benefits from
//! every other process's fetches.
//!
//! ## Features
//!
//! - **Block cache**: fixed-size blocks cached independently, reused across overlapping reads
//! - **Chunk cache**: exact intervals cached verbatim
//! - **Stores**: Redis, Synap (HTTP) and an in-process store with TTL
//! - **Filesystem wrappers**: read-through caching over any target, whole-response caching,
//!   and a reference-manifest filesystem with stale-manifest recovery
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rangecache::fs::{CachingConfig, CachingFileSystem, FileSystem};
//! use rangecache::store::StoreConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CachingConfig::new()
//!         .with_target_protocol("file")
//!         .with_store_config(StoreConfig::Redis {
//!             host: "localhost".to_string(),
//!             port: 6379,
//!             db: 0,
//!         })
//!         .with_block_size(1024 * 1024);
//!     let fs = CachingFileSystem::new(config).await?;
//!
//!     // First read fetches blocks 0..=2 from disk, the second is served from Redis
//!     let bytes = fs.cat_file("/data/archive.nc", Some(100), Some(2_500_000)).await?;
//!     let again = fs.cat_file("/data/archive.nc", Some(100), Some(2_500_000)).await?;
//!     assert_eq!(bytes, again);
//!
//!     fs.close().await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod core;
pub mod fs;
pub mod store;

pub use cache::{
    BlockCache, CacheKind, CacheParams, ChunkCache, PostFetch, RangeCache, RangeFetcher,
    StorePolicy, build_cache, fetcher_fn,
};
pub use config::RangeCacheConfig;
pub use crate::core::{ByteRange, CacheStats, RangeCacheError, Result};
pub use fs::{
    CachingConfig, CachingFileSystem, FileSystem, ReferenceConfig, ReferenceFileSystem,
    RequestCachingConfig, RequestCachingFileSystem,
};
pub use store::{CacheStore, SharedStore, StoreConfig};
