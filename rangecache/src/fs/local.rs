use super::{
    EntryKind, FileHandle, FileInfo, FileSystem, OpenMode, ReadFile, SharedFileSystem,
    TargetFetcher, TargetOptions, WriteFile,
};
use crate::core::{RangeCacheError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Local disk target (`file` protocol)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalFileSystem {
    /// Create missing parent directories when writing a file
    pub auto_mkdir: bool,
}

impl LocalFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recognized options: `auto_mkdir` (`true`/`false`)
    pub fn from_options(options: &TargetOptions) -> Result<Self> {
        let auto_mkdir = match options.get("auto_mkdir").map(String::as_str) {
            None | Some("false") => false,
            Some("true") => true,
            Some(other) => {
                return Err(RangeCacheError::InvalidConfig(format!(
                    "auto_mkdir must be true or false, got '{}'",
                    other
                )));
            }
        };
        Ok(Self { auto_mkdir })
    }
}

/// Map `NotFound` to [`RangeCacheError::NotFound`] so callers can tell a missing path apart
fn io_error(path: &str, e: std::io::Error) -> RangeCacheError {
    match e.kind() {
        std::io::ErrorKind::NotFound => RangeCacheError::NotFound(path.to_string()),
        std::io::ErrorKind::AlreadyExists => RangeCacheError::AlreadyExists(path.to_string()),
        _ => RangeCacheError::Io(e),
    }
}

fn to_info(path: &str, meta: &std::fs::Metadata) -> FileInfo {
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64);

    FileInfo {
        name: path.to_string(),
        size: if meta.is_dir() { 0 } else { meta.len() },
        kind: if meta.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        },
        etag: None,
        modified,
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    fn protocol(&self) -> &str {
        "file"
    }

    async fn info(&self, path: &str) -> Result<FileInfo> {
        let path = self.strip_protocol(path);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_error(&path, e))?;
        Ok(to_info(&path, &meta))
    }

    async fn ls(&self, path: &str) -> Result<Vec<FileInfo>> {
        let path = self.strip_protocol(path);
        let mut entries = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| io_error(&path, e))?;

        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            let name = entry.path().to_string_lossy().into_owned();
            out.push(to_info(&name, &meta));
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn cat_file(&self, path: &str, start: Option<u64>, end: Option<u64>) -> Result<Bytes> {
        let path = self.strip_protocol(path);
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| io_error(&path, e))?;

        let start = start.unwrap_or(0);
        if start > 0 {
            file.seek(SeekFrom::Start(start)).await?;
        }

        let mut buf = Vec::new();
        match end {
            Some(end) => {
                file.take(end.saturating_sub(start))
                    .read_to_end(&mut buf)
                    .await?;
            }
            None => {
                file.read_to_end(&mut buf).await?;
            }
        }
        Ok(Bytes::from(buf))
    }

    async fn pipe_file(&self, path: &str, data: Bytes) -> Result<()> {
        let path = self.strip_protocol(path);
        if self.auto_mkdir {
            if let Some(parent) = Path::new(&path).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| io_error(&path, e))
    }

    async fn cp_file(&self, from: &str, to: &str) -> Result<()> {
        let from = self.strip_protocol(from);
        let to = self.strip_protocol(to);
        tokio::fs::copy(&from, &to)
            .await
            .map_err(|e| io_error(&from, e))?;
        Ok(())
    }

    async fn rm_file(&self, path: &str) -> Result<()> {
        let path = self.strip_protocol(path);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| io_error(&path, e))
    }

    async fn mkdir(&self, path: &str, create_parents: bool) -> Result<()> {
        let path = self.strip_protocol(path);
        let result = if create_parents {
            tokio::fs::create_dir_all(&path).await
        } else {
            tokio::fs::create_dir(&path).await
        };
        result.map_err(|e| io_error(&path, e))
    }

    async fn makedirs(&self, path: &str, exist_ok: bool) -> Result<()> {
        let stripped = self.strip_protocol(path);
        if !exist_ok && self.exists(&stripped).await? {
            return Err(RangeCacheError::AlreadyExists(stripped));
        }
        tokio::fs::create_dir_all(&stripped)
            .await
            .map_err(|e| io_error(&stripped, e))
    }

    async fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn FileHandle>> {
        let path = self.strip_protocol(path);
        let shared: SharedFileSystem = Arc::new(self.clone());

        if mode.is_read() {
            let info = self.info(&path).await?;
            if info.is_dir() {
                return Err(RangeCacheError::Unsupported(format!(
                    "{} is a directory",
                    path
                )));
            }
            let fetcher = Arc::new(TargetFetcher::new(shared, path.clone()));
            return Ok(Box::new(ReadFile::direct(path, info.size, fetcher)));
        }

        Ok(Box::new(WriteFile::open(shared, path, mode).await?))
    }
}
