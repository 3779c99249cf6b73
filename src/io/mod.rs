//! Bounded random-access byte sources.
//!
//! Parsing and export read through the [`ByteSource`] trait so that headers
//! and mapped bytes may come from different stores (a shared dylib cache, a
//! slice of a fat file, an in-memory buffer). `SafeReader` memory-maps a file
//! and enforces strict resource limits to prevent DoS from malicious files.

pub mod error;

use crate::io::error::{IoError, Result};
use bytes::Bytes;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Random byte-range reads over some backing store.
pub trait ByteSource: Send + Sync {
    /// Total size of the source in bytes.
    fn size(&self) -> u64;

    /// Reads up to `len` bytes at `offset`. Reads that run past the end are
    /// truncated; reads starting at or past the end return an empty buffer.
    fn read_at(&self, offset: u64, len: u64) -> Result<Bytes>;

    /// Reads exactly `len` bytes at `offset`.
    fn read_exact_at(&self, offset: u64, len: u64) -> Result<Bytes> {
        let data = self.read_at(offset, len)?;
        if (data.len() as u64) < len {
            return Err(IoError::OutOfBounds {
                offset,
                len,
                size: self.size(),
            });
        }
        Ok(data)
    }
}

/// Defines the resource limits for I/O operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IOLimits {
    /// The absolute maximum file size that can be opened.
    pub max_file_size: u64,
    /// The maximum total number of bytes that can be read from the file across all operations.
    pub max_read_bytes: u64,
}

impl Default for IOLimits {
    fn default() -> Self {
        Self {
            max_file_size: 4 * 1024 * 1024 * 1024, // 4GB, shared caches are large
            max_read_bytes: 1024 * 1024 * 1024,    // 1GB
        }
    }
}

/// A safe, bounded file reader that uses memory-mapping for efficient access.
///
/// The caller owns the reader; dropping it unmaps the file.
pub struct SafeReader {
    path: PathBuf,
    // None when the file size is zero; memmap cannot map empty files.
    mmap: Option<Mmap>,
    limits: IOLimits,
    bytes_read: AtomicU64,
    file_size: u64,
}

impl SafeReader {
    /// Opens a file, memory-maps it, and wraps it in a `SafeReader`.
    ///
    /// This function will fail if the file size exceeds `limits.max_file_size`.
    pub fn open<P: AsRef<Path>>(path: P, limits: IOLimits) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();

        debug!(
            path = %path.display(),
            size = file_size,
            limits.max_file_size = limits.max_file_size,
            "Opening file for safe reading"
        );

        if file_size > limits.max_file_size {
            warn!(
                path = %path.display(),
                size = file_size,
                limit = limits.max_file_size,
                "File is too large"
            );
            return Err(IoError::FileTooLarge {
                limit: limits.max_file_size,
                found: file_size,
            });
        }

        let mmap = if file_size == 0 {
            None
        } else {
            // Safety: The file is backed by a real file on disk and we only request a read-only map.
            Some(unsafe { Mmap::map(&file)? })
        };

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            limits,
            bytes_read: AtomicU64::new(0),
            file_size,
        })
    }

    /// Returns the total number of bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Returns the `IOLimits` enforced by this reader.
    pub fn limits(&self) -> &IOLimits {
        &self.limits
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Consumes the reader into a shareable source handle.
    pub fn into_source(self) -> Arc<dyn ByteSource> {
        Arc::new(self)
    }
}

impl ByteSource for SafeReader {
    fn size(&self) -> u64 {
        self.file_size
    }

    /// # Errors
    ///
    /// Returns `IoError::ReadLimitExceeded` if the requested read would cause the
    /// total number of bytes read to exceed `limits.max_read_bytes`.
    fn read_at(&self, offset: u64, len: u64) -> Result<Bytes> {
        let map = match &self.mmap {
            Some(m) => m,
            None => return Ok(Bytes::new()),
        };
        let start = offset as usize;
        if start >= map.len() {
            return Ok(Bytes::new());
        }
        let end = std::cmp::min(start.saturating_add(len as usize), map.len());
        let actual_len = (end - start) as u64;

        let limit = self.limits.max_read_bytes;
        let previous = self
            .bytes_read
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                let next = current.saturating_add(actual_len);
                (next <= limit).then_some(next)
            })
            .map_err(|current| {
                warn!(
                    path = %self.path.display(),
                    current_read = current,
                    requested = actual_len,
                    limit,
                    "Read limit exceeded"
                );
                IoError::ReadLimitExceeded { limit, current }
            })?;

        trace!(
            path = %self.path.display(),
            offset,
            len = actual_len,
            total_read = previous + actual_len,
            "Performed read"
        );

        Ok(Bytes::copy_from_slice(&map[start..end]))
    }
}

/// An in-memory byte source.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn into_source(self) -> Arc<dyn ByteSource> {
        Arc::new(self)
    }
}

impl ByteSource for MemorySource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, len: u64) -> Result<Bytes> {
        let size = self.data.len();
        let start = std::cmp::min(offset, size as u64) as usize;
        let end = std::cmp::min(offset.saturating_add(len), size as u64) as usize;
        Ok(self.data.slice(start..end))
    }
}

/// A window onto a sub-range of another source, such as one architecture of
/// a universal binary.
#[derive(Clone)]
pub struct SliceSource {
    inner: Arc<dyn ByteSource>,
    base: u64,
    len: u64,
}

impl SliceSource {
    pub fn new(inner: Arc<dyn ByteSource>, base: u64, len: u64) -> Result<Self> {
        if base.saturating_add(len) > inner.size() {
            return Err(IoError::OutOfBounds {
                offset: base,
                len,
                size: inner.size(),
            });
        }
        Ok(Self { inner, base, len })
    }
}

impl ByteSource for SliceSource {
    fn size(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, len: u64) -> Result<Bytes> {
        if offset >= self.len {
            return Ok(Bytes::new());
        }
        let len = std::cmp::min(len, self.len - offset);
        self.inner.read_at(self.base + offset, len)
    }
}
