//! Backend selection
//!
//! The HTTP layer holds a [`Backend`] and talks to it through the
//! [`BlobStore`] capability. Only the aggregated variant has background
//! machinery or a passthrough retrieval path.

use crate::aggregated_store::AggregatedStore;
use crate::aggregator::AggregatorClient;
use crate::blob::{BlobId, BlobReader, BlobSource, BlobStore, Descriptor, PassthroughGet};
use crate::chunk_store::ChunkStore;
use crate::config::{BackendKind, Config};
use crate::error::Result;
use crate::local_store::LocalStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone)]
pub enum Backend {
    Local(Arc<LocalStore>),
    Chunked(Arc<ChunkStore>),
    Aggregated(Arc<AggregatedStore>),
}

impl Backend {
    /// Build the configured backend. Nothing remote is contacted until
    /// [`Backend::start`].
    pub async fn from_config(config: &Config) -> Result<Self> {
        let backend = match config.backend {
            BackendKind::Local => Backend::Local(Arc::new(LocalStore::new(config.local_store_config()).await?)),
            BackendKind::Chunked => {
                Backend::Chunked(Arc::new(ChunkStore::new(config.chunk_store_config()).await?))
            }
            BackendKind::Aggregated => {
                let local = Arc::new(LocalStore::new(config.local_store_config()).await?);
                let client = Arc::new(AggregatorClient::new(config.aggregator_config())?);
                Backend::Aggregated(Arc::new(AggregatedStore::new(
                    config.aggregated_store_config(),
                    local,
                    client,
                )))
            }
        };
        info!(backend = %backend.kind(), "Blob store ready");
        Ok(backend)
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Local(_) => BackendKind::Local,
            Backend::Chunked(_) => BackendKind::Chunked,
            Backend::Aggregated(_) => BackendKind::Aggregated,
        }
    }

    fn store(&self) -> &dyn BlobStore {
        match self {
            Backend::Local(store) => store.as_ref(),
            Backend::Chunked(store) => store.as_ref(),
            Backend::Aggregated(store) => store.as_ref(),
        }
    }

    /// The passthrough retrieval capability, if this backend has one
    pub fn passthrough(&self) -> Option<&dyn PassthroughGet> {
        match self {
            Backend::Aggregated(store) => Some(store.as_ref()),
            _ => None,
        }
    }

    pub async fn start(&self) -> Result<()> {
        match self {
            Backend::Aggregated(store) => store.start().await,
            _ => Ok(()),
        }
    }

    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        match self {
            Backend::Aggregated(store) => store.shutdown(deadline).await,
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl BlobStore for Backend {
    async fn put(&self, source: BlobSource, cancel: &CancellationToken) -> Result<Descriptor> {
        self.store().put(source, cancel).await
    }

    async fn get(&self, id: &BlobId) -> Result<Box<dyn BlobReader>> {
        self.store().get(id).await
    }

    async fn describe(&self, id: &BlobId) -> Result<Descriptor> {
        self.store().describe(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir, kind: BackendKind) -> Config {
        let mut config = Config::default();
        config.storage_dir = dir.path().to_path_buf();
        config.backend = kind;
        config
    }

    #[tokio::test]
    async fn test_local_and_chunked_round_trip() {
        for kind in [BackendKind::Local, BackendKind::Chunked] {
            let temp_dir = TempDir::new().unwrap();
            let backend = Backend::from_config(&config(&temp_dir, kind)).await.unwrap();
            assert_eq!(backend.kind(), kind);
            assert!(backend.passthrough().is_none());
            backend.start().await.unwrap();

            let source: BlobSource = Box::new(std::io::Cursor::new(b"abc".to_vec()));
            let desc = backend.put(source, &CancellationToken::new()).await.unwrap();
            let mut reader = backend.get(&desc.id).await.unwrap();
            assert_eq!(crate::blob::read_to_end(reader.as_mut()).await.unwrap(), b"abc");
            assert_eq!(backend.describe(&desc.id).await.unwrap().size, 3);

            backend.shutdown(Duration::from_secs(1)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_aggregated_builds_without_contacting_remote() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = config(&temp_dir, BackendKind::Aggregated);
        config.aggregator.url = "http://127.0.0.1:9".into();
        config.aggregator.wallet_key = "key".into();

        let backend = Backend::from_config(&config).await.unwrap();
        assert_eq!(backend.kind(), BackendKind::Aggregated);
        assert!(backend.passthrough().is_some());
        // Not started, so shutdown has nothing to stop
        backend.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}
