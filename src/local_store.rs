//! Local staging store
//!
//! Blobs live as flat files named `<blob id>.bin` in a single directory.
//! Writes go to a hidden temp file first and are renamed into place once
//! complete, so a listing never sees a partial blob.
//!
//! Admission control: when `min_free_space` is non-zero, Put refuses to
//! start if the disk is already at or below that headroom, and bounds the
//! copy to `free - min_free_space` bytes.
//!
//! A Put that fails or is dropped midway deletes its temp file. Temp files
//! left by a crash are removed when the store is opened.

use crate::blob::{resolve_seek, BlobId, BlobReader, BlobSource, BlobStore, Descriptor};
use crate::error::{Result, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::Disks;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BLOB_EXTENSION: &str = "bin";

/// Reports free bytes on the filesystem holding a path
pub trait SpaceProbe: Send + Sync {
    fn available_space(&self, path: &Path) -> io::Result<u64>;
}

/// Probe backed by the mounted disk list
///
/// Picks the disk whose mount point is the longest prefix of the
/// canonicalised path.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskSpaceProbe;

impl SpaceProbe for DiskSpaceProbe {
    fn available_space(&self, path: &Path) -> io::Result<u64> {
        let path = path.canonicalize()?;
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no mounted disk contains {}", path.display()),
                )
            })
    }
}

/// Probe that always reports the same value
#[derive(Debug, Clone, Copy)]
pub struct StaticSpaceProbe(pub u64);

impl SpaceProbe for StaticSpaceProbe {
    fn available_space(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.0)
    }
}

#[derive(Debug, Clone)]
pub struct LocalStoreConfig {
    pub dir: PathBuf,
    /// Free bytes that must remain after a Put (0 disables the check)
    pub min_free_space: u64,
}

/// Flat-file blob store with free-space admission control
pub struct LocalStore {
    dir: PathBuf,
    min_free_space: u64,
    probe: Arc<dyn SpaceProbe>,
}

impl LocalStore {
    /// Create a store rooted at `config.dir`, creating the directory.
    pub async fn new(config: LocalStoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir).await?;
        let stale = remove_stale_temp_files(&config.dir).await?;

        info!(
            path = %config.dir.display(),
            min_free_space = config.min_free_space,
            stale_temp_files = stale,
            "Initialized local staging store"
        );

        Ok(Self {
            dir: config.dir,
            min_free_space: config.min_free_space,
            probe: Arc::new(DiskSpaceProbe),
        })
    }

    /// Replace the free-space probe
    pub fn with_space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Final path of a staged blob
    pub fn path(&self, id: &BlobId) -> PathBuf {
        self.dir.join(format!("{id}.{BLOB_EXTENSION}"))
    }

    /// File name of a staged blob relative to the store directory
    pub fn file_name(id: &BlobId) -> String {
        format!("{id}.{BLOB_EXTENSION}")
    }

    pub async fn contains(&self, id: &BlobId) -> bool {
        fs::metadata(self.path(id)).await.is_ok()
    }

    async fn available_space(&self) -> Result<u64> {
        let probe = Arc::clone(&self.probe);
        let dir = self.dir.clone();
        let available = tokio::task::spawn_blocking(move || probe.available_space(&dir))
            .await
            .map_err(|e| StorageError::Internal(format!("space probe task failed: {e}")))??;
        Ok(available)
    }

    /// Write the source fully, then rename it into place.
    pub async fn put(&self, source: BlobSource, cancel: &CancellationToken) -> Result<Descriptor> {
        let limit = if self.min_free_space > 0 {
            let available = self.available_space().await?;
            if available <= self.min_free_space {
                warn!(
                    available,
                    minimum = self.min_free_space,
                    "Refusing Put: staging disk below free space minimum"
                );
                return Err(StorageError::InsufficientSpace {
                    available,
                    minimum: self.min_free_space,
                });
            }
            Some(available - self.min_free_space)
        } else {
            None
        };

        let temp = RemoveOnDrop::new(
            self.dir
                .join(format!(".{}.{BLOB_EXTENSION}.tmp", uuid::Uuid::new_v4())),
        );
        let written = self.write_temp(temp.path(), source, limit, cancel).await?;

        let id = BlobId::generate();
        let final_path = self.path(&id);
        fs::rename(temp.path(), &final_path).await?;
        temp.disarm();

        let metadata = fs::metadata(&final_path).await?;
        let modification_time = DateTime::<Utc>::from(metadata.modified()?);

        debug!(id = %id, size = written, "Staged blob");

        Ok(Descriptor {
            id,
            size: written,
            modification_time,
            replicas: Vec::new(),
        })
    }

    async fn write_temp(
        &self,
        temp_path: &Path,
        source: BlobSource,
        limit: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut file = File::create(temp_path).await?;

        let copy = async {
            match limit {
                Some(limit) => {
                    let mut limited = source.take(limit);
                    tokio::io::copy(&mut limited, &mut file).await
                }
                None => {
                    let mut source = source;
                    tokio::io::copy(&mut source, &mut file).await
                }
            }
        };
        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StorageError::Cancelled),
            copied = copy => copied?,
        };

        // Exhausting the bound means the source had at least that much more.
        if let Some(limit) = limit {
            if written == limit {
                return Err(StorageError::TooLarge { limit });
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    /// Open a staged blob for reading
    pub async fn get(&self, id: &BlobId) -> Result<FileReader> {
        let file = File::open(self.path(id)).await.map_err(|e| not_found(e, id))?;
        let size = file.metadata().await?.len();
        Ok(FileReader {
            file,
            offset: 0,
            size,
        })
    }

    pub async fn describe(&self, id: &BlobId) -> Result<Descriptor> {
        let metadata = fs::metadata(self.path(id)).await.map_err(|e| not_found(e, id))?;
        Ok(Descriptor {
            id: *id,
            size: metadata.len(),
            modification_time: DateTime::<Utc>::from(metadata.modified()?),
            replicas: Vec::new(),
        })
    }

    /// IDs of every staged blob. Temp files and foreign names are skipped.
    pub async fn list(&self) -> Result<Vec<BlobId>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".bin") else { continue };
            match stem.parse::<BlobId>() {
                Ok(id) => ids.push(id),
                Err(_) => debug!(name, "Ignoring unrecognised file in staging directory"),
            }
        }
        Ok(ids)
    }

    /// Delete a staged blob. Missing blobs are not an error.
    pub async fn remove(&self, id: &BlobId) -> Result<()> {
        match fs::remove_file(self.path(id)).await {
            Ok(()) => {
                debug!(id = %id, "Removed staged blob");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BlobStore for LocalStore {
    async fn put(&self, source: BlobSource, cancel: &CancellationToken) -> Result<Descriptor> {
        LocalStore::put(self, source, cancel).await
    }

    async fn get(&self, id: &BlobId) -> Result<Box<dyn BlobReader>> {
        Ok(Box::new(LocalStore::get(self, id).await?))
    }

    async fn describe(&self, id: &BlobId) -> Result<Descriptor> {
        LocalStore::describe(self, id).await
    }
}

/// Seekable reader over a staged file
#[derive(Debug)]
pub struct FileReader {
    file: File,
    offset: u64,
    size: u64,
}

#[async_trait]
impl BlobReader for FileReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.offset += filled as u64;
        Ok(filled)
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let target = resolve_seek(pos, self.offset, self.size)?;
        self.file.seek(SeekFrom::Start(target)).await?;
        self.offset = target;
        Ok(target)
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn not_found(e: io::Error, id: &BlobId) -> StorageError {
    if e.kind() == io::ErrorKind::NotFound {
        StorageError::BlobNotFound(id.to_string())
    } else {
        e.into()
    }
}

/// Deletes its paths when dropped, unless disarmed first.
///
/// Covers early returns and futures dropped mid-write. Removal is
/// synchronous since `Drop` cannot await.
pub(crate) struct RemoveOnDrop {
    paths: Vec<PathBuf>,
}

impl RemoveOnDrop {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { paths: vec![path] }
    }

    pub(crate) fn with(mut self, path: PathBuf) -> Self {
        self.paths.push(path);
        self
    }

    /// First guarded path
    pub(crate) fn path(&self) -> &Path {
        &self.paths[0]
    }

    /// Keep the paths
    pub(crate) fn disarm(mut self) {
        self.paths.clear();
    }
}

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        for path in self.paths.drain(..) {
            let removed = match std::fs::symlink_metadata(&path) {
                Ok(metadata) if metadata.is_dir() => std::fs::remove_dir_all(&path),
                Ok(_) => std::fs::remove_file(&path),
                Err(e) => Err(e),
            };
            match removed {
                Ok(()) => debug!(path = %path.display(), "Removed abandoned file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove abandoned file"),
            }
        }
    }
}

/// Delete hidden `*.tmp` files left behind by an interrupted write
async fn remove_stale_temp_files(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !(name.starts_with('.') && name.ends_with(".tmp")) {
            continue;
        }
        match fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(name, error = %e, "Failed to remove stale temp file"),
        }
    }
    Ok(removed)
}
