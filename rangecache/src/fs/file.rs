//! File handles returned by [`FileSystem::open`](super::FileSystem::open)

use super::{OpenMode, SharedFileSystem};
use crate::cache::{RangeCache, RangeFetcher, fetcher_fn};
use crate::core::{ByteRange, RangeCacheError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io::SeekFrom;
use std::sync::Arc;
use tracing::debug;

/// Open file
#[async_trait]
pub trait FileHandle: Send {
    fn path(&self) -> &str;

    fn mode(&self) -> OpenMode;

    /// File length for readers, bytes buffered so far for writers
    fn size(&self) -> u64;

    /// Current position
    fn tell(&self) -> u64;

    fn seek(&mut self, pos: SeekFrom) -> Result<u64>;

    /// Read up to `len` bytes from the current position, or to the end of file when `None`
    async fn read(&mut self, len: Option<u64>) -> Result<Bytes>;

    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Flush pending writes. Further writes fail.
    async fn close(&mut self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

enum ReadSource {
    Direct(Arc<dyn RangeFetcher>),
    Cached(Arc<dyn RangeCache>),
}

/// Read-only handle
///
/// Bytes come either straight from the backing fetch or through an installed range cache.
pub struct ReadFile {
    path: String,
    size: u64,
    pos: u64,
    source: ReadSource,
    closed: bool,
}

impl ReadFile {
    /// Read through `fetcher` with no caching
    pub fn direct(path: impl Into<String>, size: u64, fetcher: Arc<dyn RangeFetcher>) -> Self {
        Self::with_source(path, size, ReadSource::Direct(fetcher))
    }

    /// Read through a range cache
    pub fn cached(path: impl Into<String>, cache: Arc<dyn RangeCache>) -> Self {
        let size = cache.size();
        Self::with_source(path, size, ReadSource::Cached(cache))
    }

    /// Read from a snapshot held in memory
    pub fn from_bytes(path: impl Into<String>, data: Bytes) -> Self {
        let size = data.len() as u64;
        let fetcher = fetcher_fn(move |start, end| {
            let data = data.clone();
            async move { Ok::<_, RangeCacheError>(data.slice(start as usize..end as usize)) }
        });
        Self::direct(path, size, fetcher)
    }

    fn with_source(path: impl Into<String>, size: u64, source: ReadSource) -> Self {
        Self {
            path: path.into(),
            size,
            pos: 0,
            source,
            closed: false,
        }
    }

    /// Name of the installed cache, if any
    pub fn cache_name(&self) -> Option<&'static str> {
        match &self.source {
            ReadSource::Direct(_) => None,
            ReadSource::Cached(cache) => Some(cache.name()),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(RangeCacheError::Unsupported(format!(
                "I/O on closed file {}",
                self.path
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl FileHandle for ReadFile {
    fn path(&self) -> &str {
        &self.path
    }

    fn mode(&self) -> OpenMode {
        OpenMode::Read
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.ensure_open()?;
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => self.size.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            RangeCacheError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of file",
            ))
        })?;
        self.pos = target;
        Ok(target)
    }

    async fn read(&mut self, len: Option<u64>) -> Result<Bytes> {
        self.ensure_open()?;
        let stop = match len {
            Some(len) => self.pos.saturating_add(len),
            None => self.size,
        };

        let data = match &self.source {
            ReadSource::Cached(cache) => cache.read(Some(self.pos), Some(stop)).await?,
            ReadSource::Direct(fetcher) => {
                match ByteRange::resolve(Some(self.pos), Some(stop), self.size) {
                    Some(range) => fetcher.fetch(range.start, range.end).await?,
                    None => Bytes::new(),
                }
            }
        };

        self.pos += data.len() as u64;
        Ok(data)
    }

    fn write(&mut self, _data: &[u8]) -> Result<usize> {
        Err(RangeCacheError::Unsupported(format!(
            "{} is not open for writing",
            self.path
        )))
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Buffered write handle
///
/// Data is held in memory and committed to the target with a single `pipe_file` on close.
/// Dropping the handle without closing it discards the buffer.
pub struct WriteFile {
    path: String,
    mode: OpenMode,
    fs: SharedFileSystem,
    buffer: BytesMut,
    closed: bool,
}

impl WriteFile {
    /// Open for writing. In append mode the existing content, if any, is loaded first.
    pub async fn open(fs: SharedFileSystem, path: impl Into<String>, mode: OpenMode) -> Result<Self> {
        let path = path.into();
        let mut buffer = BytesMut::new();
        if mode == OpenMode::Append && fs.exists(&path).await? {
            buffer.extend_from_slice(&fs.cat_file(&path, None, None).await?);
        }

        Ok(Self {
            path,
            mode,
            fs,
            buffer,
            closed: false,
        })
    }
}

#[async_trait]
impl FileHandle for WriteFile {
    fn path(&self) -> &str {
        &self.path
    }

    fn mode(&self) -> OpenMode {
        self.mode
    }

    fn size(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn tell(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn seek(&mut self, _pos: SeekFrom) -> Result<u64> {
        Err(RangeCacheError::Unsupported(format!(
            "seek on write handle {}",
            self.path
        )))
    }

    async fn read(&mut self, _len: Option<u64>) -> Result<Bytes> {
        Err(RangeCacheError::Unsupported(format!(
            "{} is not open for reading",
            self.path
        )))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(RangeCacheError::Unsupported(format!(
                "write to closed file {}",
                self.path
            )));
        }
        self.buffer.extend_from_slice(data);
        Ok(data.len())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let data = self.buffer.split().freeze();
        debug!("Committing {} bytes to {}", data.len(), self.path);
        self.fs.pipe_file(&self.path, data).await?;
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
