//! Blob sources.
//!
//! The differ never downloads a blob itself. It asks a [`BlobSource`] for a
//! list of byte ranges and receives one stream per range, in request order.
//! Registry clients, local files and test doubles all plug in here.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::error::{ChunkedError, Result};
use crate::readatreader::ReadAtReader;

/// A byte range of the compressed blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageSourceChunk {
    /// Start of the range.
    pub offset: u64,
    /// Number of bytes.
    pub length: u64,
}

impl ImageSourceChunk {
    /// Create a range.
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end of the range.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// One delivered range.
pub type BlobStream = Box<dyn Read + Send>;

/// Streams returned by [`BlobSource::get_blob_at`].
pub type BlobStreams<'a> = Box<dyn Iterator<Item = Result<BlobStream>> + 'a>;

/// Random access to a compressed blob.
pub trait BlobSource: Send + Sync {
    /// Open one stream per requested range.
    ///
    /// An `Err` return means nothing could be fetched. Otherwise the iterator
    /// yields exactly one item per range, in request order; an `Err` item
    /// fails that range. Every delivered stream must produce exactly
    /// `length` bytes.
    fn get_blob_at(&self, chunks: &[ImageSourceChunk]) -> Result<BlobStreams<'_>>;
}

/// A blob stored in a local file.
#[derive(Debug, Clone)]
pub struct FileBlobSource {
    file: Arc<File>,
    size: u64,
}

impl FileBlobSource {
    /// Open the blob at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_file(File::open(path)?)
    }

    /// Use an already open file.
    pub fn from_file(file: File) -> Result<Self> {
        let size = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            size,
        })
    }

    /// Size of the blob in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl BlobSource for FileBlobSource {
    fn get_blob_at(&self, chunks: &[ImageSourceChunk]) -> Result<BlobStreams<'_>> {
        let streams: Vec<Result<BlobStream>> = chunks
            .iter()
            .map(|c| {
                if c.offset.checked_add(c.length).is_none_or(|end| end > self.size) {
                    return Err(ChunkedError::RemoteFetch(format!(
                        "range {}+{} is outside the blob ({} bytes)",
                        c.offset, c.length, self.size
                    )));
                }
                let reader = ReadAtReader::with_range(Arc::clone(&self.file), c.offset, c.length);
                Ok(Box::new(reader) as BlobStream)
            })
            .collect();
        Ok(Box::new(streams.into_iter()))
    }
}

/// A blob held in memory.
#[derive(Debug, Clone)]
pub struct MemoryBlobSource {
    data: Arc<[u8]>,
}

impl MemoryBlobSource {
    /// Wrap the blob bytes.
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }

    /// Size of the blob in bytes.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

struct SharedSlice {
    data: Arc<[u8]>,
    pos: usize,
    end: usize,
}

impl Read for SharedSlice {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = buf.len().min(self.end - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl BlobSource for MemoryBlobSource {
    fn get_blob_at(&self, chunks: &[ImageSourceChunk]) -> Result<BlobStreams<'_>> {
        let len = self.data.len() as u64;
        let streams: Vec<Result<BlobStream>> = chunks
            .iter()
            .map(|c| {
                if c.offset.checked_add(c.length).is_none_or(|end| end > len) {
                    return Err(ChunkedError::RemoteFetch(format!(
                        "range {}+{} is outside the blob ({} bytes)",
                        c.offset, c.length, len
                    )));
                }
                Ok(Box::new(SharedSlice {
                    data: Arc::clone(&self.data),
                    pos: c.offset as usize,
                    end: c.end() as usize,
                }) as BlobStream)
            })
            .collect();
        Ok(Box::new(streams.into_iter()))
    }
}
