//! Filesystem surface
//!
//! [`FileSystem`] is the target abstraction the caches sit in front of. Two targets ship with
//! the crate ([`LocalFileSystem`] and [`MemoryFileSystem`]), and three wrappers layer the store on
//! top of any target:
//! - [`CachingFileSystem`] installs a block or chunk cache on every read-mode open
//! - [`RequestCachingFileSystem`] caches whole `cat_file` responses
//! - [`ReferenceFileSystem`] serves a JSON reference manifest and caches each resolved reference

pub mod caching;
pub mod file;
pub mod local;
pub mod mapper;
pub mod memory;
pub mod reference;
pub mod request;

use crate::cache::RangeFetcher;
use crate::core::{RangeCacheError, Result};
use crate::store::{SharedStore, StoreConfig};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

pub use caching::{CachingConfig, CachingFileSystem};
pub use file::{FileHandle, ReadFile, WriteFile};
pub use local::LocalFileSystem;
pub use mapper::KeyMapper;
pub use memory::MemoryFileSystem;
pub use reference::{ManifestSource, Reference, ReferenceConfig, ReferenceFileSystem};
pub use request::{RequestCachingConfig, RequestCachingFileSystem};

/// Entry type reported by [`FileSystem::info`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// Metadata for a single path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Opaque content version, when the target tracks one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// Modification time in milliseconds since the Unix epoch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<u64>,
}

impl FileInfo {
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            kind: EntryKind::File,
            etag: None,
            modified: None,
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: 0,
            kind: EntryKind::Directory,
            etag: None,
            modified: None,
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// How a file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenMode {
    Read,
    Write,
    Append,
}

impl OpenMode {
    pub fn is_read(&self) -> bool {
        matches!(self, Self::Read)
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("rb"),
            Self::Write => f.write_str("wb"),
            Self::Append => f.write_str("ab"),
        }
    }
}

impl FromStr for OpenMode {
    type Err = RangeCacheError;

    /// Accepts `r`, `w` and `a` mode strings, with or without `b`
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "r" | "rb" => Ok(Self::Read),
            "w" | "wb" => Ok(Self::Write),
            "a" | "ab" => Ok(Self::Append),
            other => Err(RangeCacheError::InvalidConfig(format!(
                "unsupported open mode '{}'",
                other
            ))),
        }
    }
}

/// Target filesystem
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Protocol name, used as the `{protocol}://` URL scheme
    fn protocol(&self) -> &str;

    /// Remove this filesystem's `{protocol}://` prefix from a path
    fn strip_protocol(&self, path: &str) -> String {
        let scheme = format!("{}://", self.protocol());
        path.strip_prefix(&scheme).unwrap_or(path).to_string()
    }

    async fn info(&self, path: &str) -> Result<FileInfo>;

    /// Entries directly under `path`
    async fn ls(&self, path: &str) -> Result<Vec<FileInfo>>;

    /// Read `[start, end)` of a file. Missing bounds mean "from the beginning" and
    /// "to the end"; `end` past the end of the file is clamped.
    async fn cat_file(&self, path: &str, start: Option<u64>, end: Option<u64>) -> Result<Bytes>;

    /// Write a whole file, replacing any previous content
    async fn pipe_file(&self, path: &str, data: Bytes) -> Result<()>;

    async fn cp_file(&self, from: &str, to: &str) -> Result<()> {
        let data = self.cat_file(from, None, None).await?;
        self.pipe_file(to, data).await
    }

    async fn rm_file(&self, path: &str) -> Result<()>;

    async fn mkdir(&self, path: &str, create_parents: bool) -> Result<()>;

    async fn makedirs(&self, path: &str, exist_ok: bool) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool> {
        match self.info(path).await {
            Ok(_) => Ok(true),
            Err(RangeCacheError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Copy a file from this filesystem to local disk
    async fn get_file(&self, rpath: &str, lpath: &Path) -> Result<()> {
        let data = self.cat_file(rpath, None, None).await?;
        tokio::fs::write(lpath, &data).await?;
        Ok(())
    }

    /// Copy a local file onto this filesystem
    async fn put_file(&self, lpath: &Path, rpath: &str) -> Result<()> {
        let data = tokio::fs::read(lpath).await?;
        self.pipe_file(rpath, Bytes::from(data)).await
    }

    async fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn FileHandle>>;
}

/// Filesystem handle shared between wrappers
pub type SharedFileSystem = Arc<dyn FileSystem>;

/// Construction options passed to [`filesystem`]
pub type TargetOptions = BTreeMap<String, String>;

/// Instantiate a target filesystem by protocol name
pub fn filesystem(protocol: &str, options: &TargetOptions) -> Result<SharedFileSystem> {
    match protocol {
        "file" | "local" => Ok(Arc::new(LocalFileSystem::from_options(options)?)),
        "memory" => Ok(Arc::new(MemoryFileSystem::new())),
        other => Err(RangeCacheError::Unsupported(format!(
            "no filesystem registered for protocol '{}'",
            other
        ))),
    }
}

/// Resolve the wrapped target from exactly one of an instance or a protocol name
pub(crate) fn resolve_target(
    fs: Option<&SharedFileSystem>,
    target_protocol: Option<&str>,
    target_options: &TargetOptions,
) -> Result<(SharedFileSystem, String)> {
    match (fs, target_protocol) {
        (None, None) => Err(RangeCacheError::InvalidConfig(
            "provide a filesystem instance (fs) or target_protocol".to_string(),
        )),
        (Some(_), Some(_)) => Err(RangeCacheError::InvalidConfig(
            "fs and target_protocol may not both be given".to_string(),
        )),
        (Some(fs), None) => Ok((fs.clone(), fs.protocol().to_string())),
        (None, Some(protocol)) => Ok((
            filesystem(protocol, target_options)?,
            protocol.to_string(),
        )),
    }
}

/// Use the injected store, or connect one from configuration
pub(crate) async fn resolve_store(
    store: Option<&SharedStore>,
    config: &StoreConfig,
) -> Result<SharedStore> {
    match store {
        Some(store) => Ok(store.clone()),
        None => config.connect().await,
    }
}

/// Backing fetch that reads a byte range of one path from a target filesystem
pub struct TargetFetcher {
    fs: SharedFileSystem,
    path: String,
}

impl TargetFetcher {
    pub fn new(fs: SharedFileSystem, path: impl Into<String>) -> Self {
        Self {
            fs,
            path: path.into(),
        }
    }
}

#[async_trait]
impl RangeFetcher for TargetFetcher {
    async fn fetch(&self, start: u64, end: u64) -> Result<Bytes> {
        self.fs.cat_file(&self.path, Some(start), Some(end)).await
    }
}
