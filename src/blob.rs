//! Blob identifiers, descriptors and the storage capability traits
//!
//! Every backend implements [`BlobStore`]. Backends that can stream a
//! retrieval straight from the remote side also implement
//! [`PassthroughGet`], which the HTTP layer tries first.

use crate::error::{Result, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::SeekFrom;
use std::str::FromStr;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Locally generated blob identifier (random UUID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobId(Uuid);

impl BlobId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for BlobId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| StorageError::InvalidId(s.to_string()))
    }
}

/// What Describe reports about a blob
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Descriptor {
    pub id: BlobId,
    /// Measured bytes written, never the caller-declared length
    pub size: u64,
    pub modification_time: DateTime<Utc>,
    #[serde(default)]
    pub replicas: Vec<Replica>,
}

/// Replication state held by one storage provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Replica {
    pub provider: String,
    pub pieces: Vec<Piece>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Piece {
    pub status: String,
    pub piece_cid: String,
    pub expiration: DateTime<Utc>,
    pub last_verified: Option<DateTime<Utc>>,
}

/// Byte source handed to Put
pub type BlobSource = Box<dyn AsyncRead + Send + Unpin>;

/// Streamed response body
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Random-access reader over a stored blob.
///
/// `read` fills the whole buffer unless the blob ends first; a return of 0
/// means end of blob.
#[async_trait]
pub trait BlobReader: Send {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Move the logical offset. Targets outside `[0, size]` fail.
    async fn seek(&mut self, pos: SeekFrom) -> Result<u64>;

    fn size(&self) -> u64;

    async fn close(&mut self) -> Result<()>;
}

/// The capability every backend provides
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store the source fully and return its descriptor.
    ///
    /// A cancelled token aborts the Put with [`StorageError::Cancelled`].
    async fn put(&self, source: BlobSource, cancel: &CancellationToken) -> Result<Descriptor>;

    async fn get(&self, id: &BlobId) -> Result<Box<dyn BlobReader>>;

    async fn describe(&self, id: &BlobId) -> Result<Descriptor>;
}

/// A retrieval streamed directly from the remote side
pub struct PassthroughResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub content_range: Option<String>,
    pub body: ByteStream,
}

impl fmt::Debug for PassthroughResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassthroughResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .field("content_range", &self.content_range)
            .finish_non_exhaustive()
    }
}

/// Optional capability for backends that can stream retrieval directly.
#[async_trait]
pub trait PassthroughGet: Send + Sync {
    /// `Ok(None)` means the caller should fall back to the generic reader.
    async fn pass_get(&self, id: &BlobId, range: Option<&str>)
        -> Result<Option<PassthroughResponse>>;
}

/// Resolve a seek request against the current offset and blob size.
pub fn resolve_seek(pos: SeekFrom, offset: u64, size: u64) -> Result<u64> {
    let target = match pos {
        SeekFrom::Start(n) => i128::from(n),
        SeekFrom::Current(delta) => i128::from(offset) + i128::from(delta),
        SeekFrom::End(delta) => i128::from(size) + i128::from(delta),
    };
    if target < 0 {
        return Err(StorageError::InvalidSeek(format!(
            "offset {target} is before the start of the blob"
        )));
    }
    if target > i128::from(size) {
        return Err(StorageError::InvalidSeek(format!(
            "offset {target} is past the end of a {size} byte blob"
        )));
    }
    Ok(target as u64)
}

/// Inclusive byte range resolved against a known size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered, always at least one
    pub fn byte_count(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value for a `Content-Range` response header
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }

    /// Parse a single-range `Range` header (`bytes=a-b`, `bytes=a-`, `bytes=-n`).
    ///
    /// Returns `Ok(None)` for headers this parser does not understand (the
    /// caller serves the whole blob) and `Err` when the range cannot be
    /// satisfied.
    pub fn parse(header: &str, size: u64) -> std::result::Result<Option<Self>, RangeNotSatisfiable> {
        let Some(ranges) = header.trim().strip_prefix("bytes=") else {
            return Ok(None);
        };
        if ranges.contains(',') {
            return Ok(None);
        }
        let Some((first, last)) = ranges.split_once('-') else {
            return Ok(None);
        };
        let (first, last) = (first.trim(), last.trim());

        if first.is_empty() {
            let Ok(suffix) = last.parse::<u64>() else {
                return Ok(None);
            };
            if suffix == 0 || size == 0 {
                return Err(RangeNotSatisfiable);
            }
            let start = size.saturating_sub(suffix);
            return Ok(Some(Self { start, end: size - 1 }));
        }

        let Ok(start) = first.parse::<u64>() else {
            return Ok(None);
        };
        if start >= size {
            return Err(RangeNotSatisfiable);
        }
        let end = if last.is_empty() {
            size - 1
        } else {
            match last.parse::<u64>() {
                Ok(end) if end >= start => end.min(size - 1),
                Ok(_) => return Err(RangeNotSatisfiable),
                Err(_) => return Ok(None),
            }
        };
        Ok(Some(Self { start, end }))
    }
}

/// A `Range` header that does not overlap the blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeNotSatisfiable;

/// Read a reader to its end. Handy for small blobs and tests.
pub async fn read_to_end(reader: &mut dyn BlobReader) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(reader.size().min(64 << 20) as usize);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    Ok(out)
}
