//! Content-addressed chunk backend
//!
//! Blobs are split into fixed-size chunks stored under their SHA-256
//! digest, with one JSON index per blob listing the chunk digests in order.
//! Identical chunks are stored once.
//!
//! A Put writes its new chunks into a private staging directory and only
//! moves them under `chunks/` once the whole blob was accepted. A rejected,
//! cancelled or dropped Put leaves `chunks/` untouched.
//!
//! ```text
//! <dir>/
//! ├── chunks/
//! │   └── 3a7b/3a7bd3e2360a3d...   # first 4 hex chars as subdir
//! ├── index/
//! │   └── <blob id>.json
//! └── staging/
//!     └── <uuid>/                   # chunks of one in-flight Put
//! ```

use crate::blob::{resolve_seek, BlobId, BlobReader, BlobSource, BlobStore, Descriptor};
use crate::error::{Result, StorageError};
use crate::local_store::RemoveOnDrop;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default chunk size (1MB)
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ChunkStoreConfig {
    pub dir: PathBuf,
    pub chunk_size: usize,
    /// Puts larger than this fail with `TooLarge`
    pub max_blob_size: u64,
}

/// Per-blob chunk list
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkIndex {
    #[serde(flatten)]
    descriptor: Descriptor,
    chunk_size: u64,
    chunks: Vec<String>,
}

/// Chunk that owns `offset` and the distance into it
pub fn chunk_position(offset: u64, chunk_size: u64) -> (usize, u64) {
    ((offset / chunk_size) as usize, offset % chunk_size)
}

/// Compute SHA256 hex digest of data
pub fn compute_digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub struct ChunkStore {
    root_dir: PathBuf,
    chunk_size: usize,
    max_blob_size: u64,
}

impl ChunkStore {
    pub async fn new(config: ChunkStoreConfig) -> Result<Self> {
        if config.chunk_size == 0 {
            return Err(StorageError::Config("chunk size must be positive".into()));
        }
        fs::create_dir_all(config.dir.join("chunks")).await?;
        fs::create_dir_all(config.dir.join("index")).await?;
        // Leftovers of Puts interrupted by a crash
        match fs::remove_dir_all(config.dir.join("staging")).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(config.dir.join("staging")).await?;

        info!(
            path = %config.dir.display(),
            chunk_size = config.chunk_size,
            "Initialized chunk store"
        );

        Ok(Self {
            root_dir: config.dir,
            chunk_size: config.chunk_size,
            max_blob_size: config.max_blob_size,
        })
    }

    fn chunk_path(&self, digest: &str) -> PathBuf {
        chunk_path(&self.root_dir, digest)
    }

    fn index_path(&self, id: &BlobId) -> PathBuf {
        self.root_dir.join("index").join(format!("{id}.json"))
    }

    pub async fn put(&self, mut source: BlobSource, cancel: &CancellationToken) -> Result<Descriptor> {
        let staging = RemoveOnDrop::new(
            self.root_dir
                .join("staging")
                .join(uuid::Uuid::new_v4().to_string()),
        );
        fs::create_dir_all(staging.path()).await?;

        let mut chunks = Vec::new();
        let mut staged = HashSet::new();
        let mut size = 0u64;
        let mut buf = vec![0u8; self.chunk_size];

        loop {
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
                n = fill(&mut source, &mut buf) => n?,
            };
            if n == 0 {
                break;
            }
            size += n as u64;
            if size > self.max_blob_size {
                return Err(StorageError::TooLarge {
                    limit: self.max_blob_size,
                });
            }

            chunks.push(self.stage_chunk(staging.path(), &mut staged, &buf[..n]).await?);
            if n < buf.len() {
                break;
            }
        }

        for digest in &staged {
            self.publish_chunk(staging.path(), digest).await?;
        }

        let index = ChunkIndex {
            descriptor: Descriptor {
                id: BlobId::generate(),
                size,
                modification_time: Utc::now(),
                replicas: Vec::new(),
            },
            chunk_size: self.chunk_size as u64,
            chunks,
        };
        self.write_index(&index).await?;
        drop(staging);

        info!(
            id = %index.descriptor.id,
            size,
            chunks = index.chunks.len(),
            "Stored chunked blob"
        );
        Ok(index.descriptor)
    }

    /// Write a chunk into `staging` unless the store or this Put has it.
    async fn stage_chunk(
        &self,
        staging: &Path,
        staged: &mut HashSet<String>,
        data: &[u8],
    ) -> Result<String> {
        let digest = compute_digest(data);
        if staged.contains(&digest) {
            return Ok(digest);
        }
        if fs::metadata(self.chunk_path(&digest)).await.is_ok() {
            debug!(digest = %digest, "Chunk already exists");
            return Ok(digest);
        }

        let mut file = fs::File::create(staging.join(&digest)).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        staged.insert(digest.clone());
        Ok(digest)
    }

    /// Move a staged chunk into the shared chunk tree
    async fn publish_chunk(&self, staging: &Path, digest: &str) -> Result<()> {
        let path = self.chunk_path(digest);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Renaming over a chunk another Put just published is harmless,
        // the content is identical.
        fs::rename(staging.join(digest), &path).await?;
        Ok(())
    }

    async fn write_index(&self, index: &ChunkIndex) -> Result<()> {
        let json = serde_json::to_vec(index)?;
        write_atomic(&self.index_path(&index.descriptor.id), &json).await?;
        Ok(())
    }

    async fn load_index(&self, id: &BlobId) -> Result<ChunkIndex> {
        let content = match fs::read(self.index_path(id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::BlobNotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&content)?)
    }

    pub async fn get(&self, id: &BlobId) -> Result<ChunkReader> {
        let index = self.load_index(id).await?;
        Ok(ChunkReader {
            root_dir: self.root_dir.clone(),
            index,
            offset: 0,
            cached: None,
        })
    }

    pub async fn describe(&self, id: &BlobId) -> Result<Descriptor> {
        Ok(self.load_index(id).await?.descriptor)
    }
}

#[async_trait]
impl BlobStore for ChunkStore {
    async fn put(&self, source: BlobSource, cancel: &CancellationToken) -> Result<Descriptor> {
        ChunkStore::put(self, source, cancel).await
    }

    async fn get(&self, id: &BlobId) -> Result<Box<dyn BlobReader>> {
        Ok(Box::new(ChunkStore::get(self, id).await?))
    }

    async fn describe(&self, id: &BlobId) -> Result<Descriptor> {
        ChunkStore::describe(self, id).await
    }
}

/// Reader that loads one chunk at a time and verifies its digest
pub struct ChunkReader {
    root_dir: PathBuf,
    index: ChunkIndex,
    offset: u64,
    /// Index and bytes of the chunk last loaded
    cached: Option<(usize, Bytes)>,
}

impl ChunkReader {
    async fn chunk(&mut self, chunk_index: usize) -> Result<Bytes> {
        if let Some((cached_index, data)) = &self.cached {
            if *cached_index == chunk_index {
                return Ok(data.clone());
            }
        }

        let digest = self.index.chunks.get(chunk_index).ok_or_else(|| {
            StorageError::Internal(format!(
                "chunk {chunk_index} missing from index of {}",
                self.index.descriptor.id
            ))
        })?;
        let data = Bytes::from(fs::read(chunk_path(&self.root_dir, digest)).await?);

        let actual = compute_digest(&data);
        if actual != *digest {
            return Err(StorageError::HashMismatch {
                expected: digest.clone(),
                actual,
            });
        }

        self.cached = Some((chunk_index, data.clone()));
        Ok(data)
    }
}

#[async_trait]
impl BlobReader for ChunkReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let size = self.index.descriptor.size;
        if self.offset >= size {
            return Ok(0);
        }
        let want = buf
            .len()
            .min(usize::try_from(size - self.offset).unwrap_or(usize::MAX));
        let mut filled = 0;

        while filled < want {
            let (chunk_index, within) = chunk_position(self.offset, self.index.chunk_size);
            let chunk = self.chunk(chunk_index).await?;
            let within = within as usize;
            if within >= chunk.len() {
                return Err(StorageError::ShortRead {
                    expected: (want - filled) as u64,
                    actual: 0,
                });
            }

            let n = (chunk.len() - within).min(want - filled);
            buf[filled..filled + n].copy_from_slice(&chunk[within..within + n]);
            filled += n;
            self.offset += n as u64;
        }

        Ok(filled)
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let target = resolve_seek(pos, self.offset, self.index.descriptor.size)?;
        let (target_chunk, _) = chunk_position(target, self.index.chunk_size);
        if self.cached.as_ref().is_some_and(|(i, _)| *i != target_chunk) {
            self.cached = None;
        }
        self.offset = target;
        Ok(target)
    }

    fn size(&self) -> u64 {
        self.index.descriptor.size
    }

    async fn close(&mut self) -> Result<()> {
        self.cached = None;
        Ok(())
    }
}

fn chunk_path(root_dir: &Path, digest: &str) -> PathBuf {
    let subdir = &digest[..4.min(digest.len())];
    root_dir.join("chunks").join(subdir).join(digest)
}

/// Read until `buf` is full or the source ends
async fn fill<R: AsyncRead + Unpin + ?Sized>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let temp = RemoveOnDrop::new(path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4())));
    let mut file = fs::File::create(temp.path()).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    fs::rename(temp.path(), path).await?;
    temp.disarm();
    Ok(())
}
