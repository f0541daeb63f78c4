use super::{FileHandle, FileInfo, FileSystem, OpenMode, ReadFile, SharedFileSystem, WriteFile};
use crate::core::{ByteRange, RangeCacheError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
struct MemoryFile {
    data: Bytes,
    generation: u64,
    modified: u64,
}

#[derive(Debug, Default)]
struct MemoryTree {
    files: BTreeMap<String, MemoryFile>,
    dirs: BTreeSet<String>,
    generation: u64,
}

impl MemoryTree {
    fn is_dir(&self, path: &str) -> bool {
        if path == "/" || self.dirs.contains(path) {
            return true;
        }
        let prefix = format!("{}/", path);
        self.files.keys().any(|name| name.starts_with(&prefix))
    }

    fn add_parents(&mut self, path: &str) {
        let mut current = parent(path);
        while let Some(dir) = current {
            if dir == "/" {
                break;
            }
            self.dirs.insert(dir.to_string());
            current = parent(dir);
        }
    }
}

fn parent(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Process-local target (`memory` protocol)
///
/// Every write bumps a generation counter reported as the file's etag, so a rewritten file is
/// distinguishable from the original even when the length is unchanged. Clones share contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryFileSystem {
    tree: Arc<RwLock<MemoryTree>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absolute path without protocol or trailing slash
    fn normalize(&self, path: &str) -> String {
        let path = self.strip_protocol(path);
        let trimmed = path.trim_end_matches('/');
        if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{}", trimmed)
        }
    }

    fn file_info(name: &str, file: &MemoryFile) -> FileInfo {
        FileInfo {
            etag: Some(format!("{:x}", file.generation)),
            modified: Some(file.modified),
            ..FileInfo::file(name, file.data.len() as u64)
        }
    }

    fn snapshot(&self, path: &str) -> Result<Bytes> {
        self.tree
            .read()
            .files
            .get(path)
            .map(|file| file.data.clone())
            .ok_or_else(|| RangeCacheError::NotFound(path.to_string()))
    }
}

#[async_trait]
impl FileSystem for MemoryFileSystem {
    fn protocol(&self) -> &str {
        "memory"
    }

    async fn info(&self, path: &str) -> Result<FileInfo> {
        let path = self.normalize(path);
        let tree = self.tree.read();
        if let Some(file) = tree.files.get(&path) {
            return Ok(Self::file_info(&path, file));
        }
        if tree.is_dir(&path) {
            return Ok(FileInfo::directory(path));
        }
        Err(RangeCacheError::NotFound(path))
    }

    async fn ls(&self, path: &str) -> Result<Vec<FileInfo>> {
        let path = self.normalize(path);
        let tree = self.tree.read();
        if tree.files.contains_key(&path) {
            return Err(RangeCacheError::Unsupported(format!(
                "{} is not a directory",
                path
            )));
        }
        if !tree.is_dir(&path) {
            return Err(RangeCacheError::NotFound(path));
        }

        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        let mut entries: BTreeMap<String, FileInfo> = BTreeMap::new();

        for (name, file) in tree.files.range(prefix.clone()..) {
            let Some(rest) = name.strip_prefix(&prefix) else {
                break;
            };
            match rest.split_once('/') {
                None => {
                    entries.insert(name.clone(), Self::file_info(name, file));
                }
                Some((child, _)) => {
                    let dir = format!("{}{}", prefix, child);
                    entries
                        .entry(dir.clone())
                        .or_insert_with(|| FileInfo::directory(dir));
                }
            }
        }
        for dir in &tree.dirs {
            if let Some(rest) = dir.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    entries
                        .entry(dir.clone())
                        .or_insert_with(|| FileInfo::directory(dir.clone()));
                }
            }
        }

        Ok(entries.into_values().collect())
    }

    async fn cat_file(&self, path: &str, start: Option<u64>, end: Option<u64>) -> Result<Bytes> {
        let path = self.normalize(path);
        let data = self.snapshot(&path)?;
        Ok(
            match ByteRange::resolve(start, end, data.len() as u64) {
                Some(range) => data.slice(range.start as usize..range.end as usize),
                None => Bytes::new(),
            },
        )
    }

    async fn pipe_file(&self, path: &str, data: Bytes) -> Result<()> {
        let path = self.normalize(path);
        let mut tree = self.tree.write();
        if tree.dirs.contains(&path) {
            return Err(RangeCacheError::AlreadyExists(path));
        }
        tree.generation += 1;
        let file = MemoryFile {
            data,
            generation: tree.generation,
            modified: now_millis(),
        };
        tree.add_parents(&path);
        tree.files.insert(path, file);
        Ok(())
    }

    async fn rm_file(&self, path: &str) -> Result<()> {
        let path = self.normalize(path);
        match self.tree.write().files.remove(&path) {
            Some(_) => Ok(()),
            None => Err(RangeCacheError::NotFound(path)),
        }
    }

    async fn mkdir(&self, path: &str, create_parents: bool) -> Result<()> {
        let path = self.normalize(path);
        let mut tree = self.tree.write();
        if tree.files.contains_key(&path) || tree.is_dir(&path) {
            return Err(RangeCacheError::AlreadyExists(path));
        }
        if let Some(parent) = parent(&path) {
            if !create_parents && !tree.is_dir(parent) {
                return Err(RangeCacheError::NotFound(parent.to_string()));
            }
        }
        tree.add_parents(&path);
        tree.dirs.insert(path);
        Ok(())
    }

    async fn makedirs(&self, path: &str, exist_ok: bool) -> Result<()> {
        let path = self.normalize(path);
        let mut tree = self.tree.write();
        if tree.files.contains_key(&path) {
            return Err(RangeCacheError::AlreadyExists(path));
        }
        if tree.is_dir(&path) {
            return if exist_ok {
                Ok(())
            } else {
                Err(RangeCacheError::AlreadyExists(path))
            };
        }
        tree.add_parents(&path);
        tree.dirs.insert(path);
        Ok(())
    }

    async fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn FileHandle>> {
        let path = self.normalize(path);
        if mode.is_read() {
            let data = self.snapshot(&path)?;
            return Ok(Box::new(ReadFile::from_bytes(path, data)));
        }

        let shared: SharedFileSystem = Arc::new(self.clone());
        Ok(Box::new(WriteFile::open(shared, path, mode).await?))
    }
}
