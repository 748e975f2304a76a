//! Durable blob ID to remote file ID mapping
//!
//! One small file per blob, `<dir>/<blob id>.id`, holding the remote file
//! identifier as decimal ASCII. Entries are written through a temp file and
//! renamed into place so a crash never leaves a half-written mapping.

use crate::blob::BlobId;
use crate::error::{Result, StorageError};
use crate::local_store::RemoveOnDrop;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub struct IdMap {
    dir: PathBuf,
}

impl IdMap {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self, id: &BlobId) -> PathBuf {
        self.dir.join(format!("{id}.id"))
    }

    /// Persist `blob_id -> remote_id`, replacing any previous entry.
    pub async fn insert(&self, blob_id: &BlobId, remote_id: u64) -> Result<()> {
        let temp = RemoveOnDrop::new(self.dir.join(format!(".{}.id.tmp", uuid::Uuid::new_v4())));

        write_synced(temp.path(), remote_id.to_string().as_bytes()).await?;
        fs::rename(temp.path(), self.path(blob_id)).await?;
        temp.disarm();

        debug!(id = %blob_id, remote_id, "Recorded identifier mapping");
        Ok(())
    }

    /// Remote file ID for a blob.
    ///
    /// An unparsable entry is a hard error for that blob.
    pub async fn get(&self, blob_id: &BlobId) -> Result<u64> {
        let content = match fs::read_to_string(self.path(blob_id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::BlobNotFound(blob_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        content
            .parse::<u64>()
            .map_err(|e| StorageError::CorruptMapping {
                blob: blob_id.to_string(),
                reason: format!("{e}: {content:?}"),
            })
    }

    /// Drop a mapping. Only used to roll back a failed Put.
    pub async fn remove(&self, blob_id: &BlobId) -> Result<()> {
        match fs::remove_file(self.path(blob_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn write_synced(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await
}
