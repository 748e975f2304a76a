//! Aggregator-backed blob store
//!
//! Put stages bytes locally, pushes the staged file to the aggregator,
//! records the blob to file mapping, and hands the file to the packing
//! pipeline. Reads are served from the local cache while the blob is still
//! staged and from remote range requests after cleanup has evicted it.
//!
//! `start` must run before Put: it establishes the dataset, the source
//! storage pointing at the staging directory, and the wallet, then starts
//! the background pipeline, cleanup scheduler and schedule reconciliation.

use crate::aggregator::{
    epoch_to_time, Aggregator, CreateDatasetRequest, CreateSourceRequest, Dataset, DealRecord,
    Source,
};
use crate::blob::{
    BlobId, BlobReader, BlobSource, BlobStore, Descriptor, PassthroughGet, PassthroughResponse,
    Piece, Replica,
};
use crate::cleanup::{CleanupConfig, CleanupPredicate, CleanupScheduler, SweepReport};
use crate::error::{Result, StorageError};
use crate::id_map::IdMap;
use crate::local_store::{LocalStore, RemoveOnDrop};
use crate::pack_pipeline::{PackPipeline, PackPipelineConfig};
use crate::range_reader::RemoteRangeReader;
use crate::schedule::{ReconcileReport, ScheduleConfig, ScheduleReconciler};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct AggregatedStoreConfig {
    pub dataset_name: String,
    pub source_name: String,
    pub max_car_size: String,
    pub wallet_key: String,
    pub pack: PackPipelineConfig,
    pub cleanup: CleanupConfig,
    pub schedule: ScheduleConfig,
    /// `None` reconciles schedules at startup only
    pub reconcile_interval: Option<Duration>,
    pub read_ahead: u64,
}

/// Background machinery that exists once `start` has succeeded
struct Running {
    source_id: u64,
    pipeline: PackPipeline,
    cleanup: CleanupScheduler,
    reconciler: ScheduleReconciler,
}

pub struct AggregatedStore {
    config: AggregatedStoreConfig,
    local: Arc<LocalStore>,
    id_map: Arc<IdMap>,
    aggregator: Arc<dyn Aggregator>,
    running: OnceLock<Running>,
}

impl AggregatedStore {
    /// Identifier map entries live next to the staged blobs.
    pub fn new(
        config: AggregatedStoreConfig,
        local: Arc<LocalStore>,
        aggregator: Arc<dyn Aggregator>,
    ) -> Self {
        let id_map = Arc::new(IdMap::new(local.dir()));
        Self {
            config,
            local,
            id_map,
            aggregator,
            running: OnceLock::new(),
        }
    }

    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    /// Source the staged files are pushed to, once started
    pub fn source_id(&self) -> Option<u64> {
        self.running.get().map(|r| r.source_id)
    }

    fn running(&self) -> Result<&Running> {
        self.running
            .get()
            .ok_or_else(|| StorageError::Internal("aggregated store has not been started".into()))
    }

    /// Establish remote state and start the background tasks.
    ///
    /// Dataset, source and wallet failures are fatal `Startup` errors.
    pub async fn start(&self) -> Result<()> {
        if self.running.get().is_some() {
            return Err(StorageError::Internal("aggregated store already started".into()));
        }

        let dataset = self
            .ensure_dataset()
            .await
            .map_err(|e| StorageError::Startup(format!("dataset {}: {e}", self.config.dataset_name)))?;
        let source = self
            .ensure_source(&dataset)
            .await
            .map_err(|e| StorageError::Startup(format!("source {}: {e}", self.config.source_name)))?;
        self.ensure_wallet(&dataset)
            .await
            .map_err(|e| StorageError::Startup(format!("wallet: {e}")))?;

        info!(
            dataset = %dataset.name,
            source_id = source.id,
            path = %source.path,
            "Aggregator dataset ready"
        );

        let reconciler = ScheduleReconciler::new(self.config.schedule.clone(), Arc::clone(&self.aggregator));
        match reconciler.reconcile().await {
            Ok(report) if !report.is_clean() => {
                warn!(failed = report.failed.len(), "Some replication schedules could not be reconciled")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Replication schedule reconciliation failed"),
        }
        if let Some(every) = self.config.reconcile_interval {
            reconciler.start_polling(every)?;
        }

        let pipeline = PackPipeline::new(self.config.pack.clone(), source.id, Arc::clone(&self.aggregator));
        pipeline.start()?;

        let predicate = Arc::new(ReplicationCheck {
            id_map: Arc::clone(&self.id_map),
            aggregator: Arc::clone(&self.aggregator),
            providers: self.config.schedule.providers.clone(),
        });
        let cleanup = CleanupScheduler::new(self.config.cleanup.clone(), Arc::clone(&self.local), predicate);
        cleanup.start()?;

        let running = Running {
            source_id: source.id,
            pipeline,
            cleanup,
            reconciler,
        };
        if let Err(running) = self.running.set(running) {
            // Lost a race with a concurrent start; stop the duplicate tasks.
            let deadline = Duration::from_secs(5);
            let _ = running.pipeline.shutdown(deadline).await;
            let _ = running.cleanup.shutdown(deadline).await;
            let _ = running.reconciler.shutdown(deadline).await;
            return Err(StorageError::Internal("aggregated store already started".into()));
        }
        Ok(())
    }

    async fn ensure_dataset(&self) -> Result<Dataset> {
        let name = &self.config.dataset_name;
        if let Some(dataset) = self.find_dataset(name).await? {
            return Ok(dataset);
        }

        let request = CreateDatasetRequest {
            name: name.clone(),
            max_size: self.config.max_car_size.clone(),
        };
        match self.aggregator.create_dataset(&request).await {
            Ok(dataset) => {
                info!(dataset = %name, "Created dataset");
                Ok(dataset)
            }
            Err(StorageError::Conflict(_)) => self
                .find_dataset(name)
                .await?
                .ok_or_else(|| StorageError::Internal(format!("dataset {name} conflicts but is not listed"))),
            Err(e) => Err(e),
        }
    }

    async fn find_dataset(&self, name: &str) -> Result<Option<Dataset>> {
        let datasets = self.aggregator.list_datasets().await?;
        Ok(datasets.into_iter().find(|d| d.name == name))
    }

    async fn ensure_source(&self, dataset: &Dataset) -> Result<Source> {
        let name = &self.config.source_name;
        if let Some(source) = self.find_source(dataset, name).await? {
            return Ok(source);
        }

        let path = self.local.dir().canonicalize()?;
        let request = CreateSourceRequest {
            name: name.clone(),
            path: path.display().to_string(),
        };
        match self.aggregator.create_source(&dataset.name, &request).await {
            Ok(source) => {
                info!(source = %name, path = %source.path, "Created source storage");
                Ok(source)
            }
            Err(StorageError::Conflict(_)) => self
                .find_source(dataset, name)
                .await?
                .ok_or_else(|| StorageError::Internal(format!("source {name} conflicts but is not listed"))),
            Err(e) => Err(e),
        }
    }

    async fn find_source(&self, dataset: &Dataset, name: &str) -> Result<Option<Source>> {
        let sources = self.aggregator.list_sources(&dataset.name).await?;
        Ok(sources.into_iter().find(|s| s.name == name))
    }

    async fn ensure_wallet(&self, dataset: &Dataset) -> Result<()> {
        let key = &self.config.wallet_key;
        let known = self
            .aggregator
            .list_wallets()
            .await?
            .into_iter()
            .find(|w| w.private_key.as_deref() == Some(key.as_str()));
        let wallet = match known {
            Some(wallet) => wallet,
            None => {
                let wallet = self.aggregator.import_wallet(key).await?;
                info!(address = %wallet.address, "Imported wallet");
                wallet
            }
        };

        let attached = self.aggregator.list_attached_wallets(&dataset.name).await?;
        if !attached.iter().any(|w| w.address == wallet.address) {
            self.aggregator.attach_wallet(&dataset.name, &wallet.address).await?;
            info!(address = %wallet.address, dataset = %dataset.name, "Attached wallet to dataset");
        }
        Ok(())
    }

    pub async fn put(&self, source: BlobSource, cancel: &CancellationToken) -> Result<Descriptor> {
        let running = self.running()?;
        let descriptor = self.local.put(source, cancel).await?;
        // Cleanup never evicts an unmapped blob, so a dropped Put removes its own.
        let staged = RemoveOnDrop::new(self.local.path(&descriptor.id))
            .with(self.id_map.path(&descriptor.id));

        match self.register(&descriptor.id, running, cancel).await {
            Ok(file_id) => {
                staged.disarm();
                info!(id = %descriptor.id, file_id, size = descriptor.size, "Stored blob");
                Ok(descriptor)
            }
            Err((e, pushed)) => {
                self.roll_back(&descriptor.id, pushed).await;
                Err(e)
            }
        }
    }

    /// Push, map and enqueue. On failure also reports the remote file ID if
    /// the push already happened.
    async fn register(
        &self,
        id: &BlobId,
        running: &Running,
        cancel: &CancellationToken,
    ) -> std::result::Result<u64, (StorageError, Option<u64>)> {
        let path = LocalStore::file_name(id);
        if cancel.is_cancelled() {
            return Err((StorageError::Cancelled, None));
        }
        let file = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(
                    id = %id,
                    path = %path,
                    "Put cancelled during push; the aggregator may keep an orphaned entry"
                );
                return Err((StorageError::Cancelled, None));
            }
            pushed = self.aggregator.push_file(running.source_id, &path) => pushed.map_err(|e| (e, None))?,
        };

        self.id_map
            .insert(id, file.id)
            .await
            .map_err(|e| (e, Some(file.id)))?;
        running
            .pipeline
            .enqueue(file.id, cancel)
            .await
            .map_err(|e| (e, Some(file.id)))?;
        Ok(file.id)
    }

    async fn roll_back(&self, id: &BlobId, pushed: Option<u64>) {
        if let Err(e) = self.id_map.remove(id).await {
            warn!(id = %id, error = %e, "Failed to remove identifier mapping during rollback");
        }
        if let Err(e) = self.local.remove(id).await {
            warn!(id = %id, error = %e, "Failed to remove staged blob during rollback");
        }
        if let Some(file_id) = pushed {
            warn!(id = %id, file_id, "Put failed after the file was pushed; remote entry is orphaned");
        }
    }

    pub async fn get(&self, id: &BlobId) -> Result<Box<dyn BlobReader>> {
        let file_id = self.id_map.get(id).await?;

        match self.local.get(id).await {
            Ok(reader) => return Ok(Box::new(reader)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let file = self.aggregator.get_file(file_id).await?;
        debug!(id = %id, file_id, size = file.size, "Serving blob from aggregator");
        Ok(Box::new(
            RemoteRangeReader::new(Arc::clone(&self.aggregator), file_id, file.size)
                .with_read_ahead(self.config.read_ahead),
        ))
    }

    pub async fn describe(&self, id: &BlobId) -> Result<Descriptor> {
        let file_id = self.id_map.get(id).await?;

        let mut descriptor = match self.local.describe(id).await {
            Ok(descriptor) => descriptor,
            Err(e) if e.is_not_found() => {
                let file = self.aggregator.get_file(file_id).await?;
                Descriptor {
                    id: *id,
                    size: file.size,
                    modification_time: file.last_modified.unwrap_or_default(),
                    replicas: Vec::new(),
                }
            }
            Err(e) => return Err(e),
        };

        let deals = self.aggregator.get_file_deals(file_id).await?;
        descriptor.replicas = replicas_from_deals(deals);
        Ok(descriptor)
    }

    /// Run a cleanup sweep now. `None` if one is already running.
    pub async fn sweep_now(&self) -> Result<Option<SweepReport>> {
        self.running()?.cleanup.sweep_now().await
    }

    pub async fn reconcile_schedules(&self) -> Result<ReconcileReport> {
        self.running()?.reconciler.reconcile().await
    }

    /// Stop the background tasks, each bounded by `deadline`
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        let Some(running) = self.running.get() else {
            return Ok(());
        };

        let (pipeline, cleanup, reconciler) = tokio::join!(
            running.pipeline.shutdown(deadline),
            running.cleanup.shutdown(deadline),
            running.reconciler.shutdown(deadline),
        );
        pipeline?;
        cleanup?;
        reconciler?;

        info!("Aggregated store stopped");
        Ok(())
    }
}

/// Group deal records into one replica per provider
fn replicas_from_deals(deals: Vec<DealRecord>) -> Vec<Replica> {
    let mut by_provider: BTreeMap<String, Vec<Piece>> = BTreeMap::new();
    for deal in deals {
        by_provider.entry(deal.provider).or_default().push(Piece {
            status: deal.state.as_str().to_string(),
            piece_cid: deal.piece_cid,
            expiration: epoch_to_time(deal.end_epoch),
            last_verified: deal.last_verified_at,
        });
    }
    by_provider
        .into_iter()
        .map(|(provider, pieces)| Replica { provider, pieces })
        .collect()
}

#[async_trait]
impl BlobStore for AggregatedStore {
    async fn put(&self, source: BlobSource, cancel: &CancellationToken) -> Result<Descriptor> {
        AggregatedStore::put(self, source, cancel).await
    }

    async fn get(&self, id: &BlobId) -> Result<Box<dyn BlobReader>> {
        AggregatedStore::get(self, id).await
    }

    async fn describe(&self, id: &BlobId) -> Result<Descriptor> {
        AggregatedStore::describe(self, id).await
    }
}

#[async_trait]
impl PassthroughGet for AggregatedStore {
    /// Streams from the aggregator once the local copy is gone.
    async fn pass_get(&self, id: &BlobId, range: Option<&str>) -> Result<Option<PassthroughResponse>> {
        let file_id = self.id_map.get(id).await?;
        if self.local.contains(id).await {
            return Ok(None);
        }
        let response = self.aggregator.retrieve(file_id, range).await?;
        Ok(Some(response.into()))
    }
}

/// Every configured provider holds at least one active deal
pub struct ReplicationCheck {
    id_map: Arc<IdMap>,
    aggregator: Arc<dyn Aggregator>,
    providers: Vec<String>,
}

#[async_trait]
impl CleanupPredicate for ReplicationCheck {
    async fn is_cleanup_ready(&self, id: &BlobId) -> Result<bool> {
        if self.providers.is_empty() {
            return Ok(false);
        }
        let file_id = self.id_map.get(id).await?;
        let deals = self.aggregator.get_file_deals(file_id).await?;

        Ok(self.providers.iter().all(|provider| {
            deals
                .iter()
                .any(|d| d.provider == *provider && d.state.is_terminal_success())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{DealState, MemoryAggregator, Operation};
    use crate::blob::read_to_end;
    use crate::config::{BackendKind, Config};
    use crate::local_store::LocalStoreConfig;
    use tempfile::TempDir;

    async fn setup(dir: &TempDir, providers: &[&str]) -> (Arc<MemoryAggregator>, AggregatedStore) {
        setup_with(dir, providers, MemoryAggregator::new()).await
    }

    async fn setup_with(
        dir: &TempDir,
        providers: &[&str],
        agg: MemoryAggregator,
    ) -> (Arc<MemoryAggregator>, AggregatedStore) {
        let mut config = Config::default();
        config.backend = BackendKind::Aggregated;
        config.storage_dir = dir.path().to_path_buf();
        config.aggregator.wallet_key = "secret-key".into();
        config.aggregator.pack_threshold = 1 << 20;
        config.aggregator.force_pack_after_secs = 3600;
        config.replication.providers = providers.iter().map(|p| p.to_string()).collect();

        let local = Arc::new(
            LocalStore::new(LocalStoreConfig {
                dir: config.blobs_dir(),
                min_free_space: 0,
            })
            .await
            .unwrap(),
        );
        let agg = Arc::new(agg);
        let store = AggregatedStore::new(config.aggregated_store_config(), local, agg.clone());
        (agg, store)
    }

    /// Sweep, waiting out the scheduler's own startup sweep if it overlaps
    async fn sweep(store: &AggregatedStore) -> SweepReport {
        for _ in 0..100 {
            if let Some(report) = store.sweep_now().await.unwrap() {
                return report;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sweep never ran");
    }

    fn source(data: &[u8]) -> BlobSource {
        Box::new(std::io::Cursor::new(data.to_vec()))
    }

    #[tokio::test]
    async fn test_start_establishes_remote_state() {
        let temp_dir = TempDir::new().unwrap();
        let (agg, store) = setup(&temp_dir, &["f01000", "f01001"]).await;
        store.start().await.unwrap();

        assert_eq!(agg.datasets().len(), 1);
        assert_eq!(agg.sources().len(), 1);
        assert_eq!(agg.attached_wallets("REPLICA_STAGE").len(), 1);
        assert_eq!(agg.schedules().len(), 2);
        assert!(store.start().await.is_err());

        store.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_reuses_remote_state() {
        let temp_dir = TempDir::new().unwrap();
        let (agg, store) = setup(&temp_dir, &["f01000"]).await;
        store.start().await.unwrap();
        store.shutdown(Duration::from_secs(1)).await.unwrap();

        let second = AggregatedStore::new(
            store.config.clone(),
            Arc::clone(store.local()),
            agg.clone(),
        );
        second.start().await.unwrap();
        assert_eq!(agg.datasets().len(), 1);
        assert_eq!(agg.sources().len(), 1);
        assert_eq!(agg.attached_wallets("REPLICA_STAGE").len(), 1);
        assert_eq!(agg.schedules().len(), 1);
        second.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_startup_failure_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let (agg, store) = setup(&temp_dir, &[]).await;
        agg.set_failing(Operation::ImportWallet, true);

        assert!(matches!(store.start().await, Err(StorageError::Startup(_))));
        assert!(store.source_id().is_none());
    }

    #[tokio::test]
    async fn test_put_before_start_fails() {
        let temp_dir = TempDir::new().unwrap();
        let (_agg, store) = setup(&temp_dir, &[]).await;
        assert!(store.put(source(b"x"), &CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_put_get_describe() {
        let temp_dir = TempDir::new().unwrap();
        let (agg, store) = setup(&temp_dir, &["f01000"]).await;
        store.start().await.unwrap();

        let data = b"replicate me".to_vec();
        let desc = store.put(source(&data), &CancellationToken::new()).await.unwrap();
        assert_eq!(desc.size, data.len() as u64);

        let mut reader = store.get(&desc.id).await.unwrap();
        assert_eq!(read_to_end(reader.as_mut()).await.unwrap(), data);

        let file_id = agg.file_ids()[0];
        agg.add_deal(file_id, "f01000", DealState::Published);
        let described = store.describe(&desc.id).await.unwrap();
        assert_eq!(described.size, data.len() as u64);
        assert_eq!(described.replicas.len(), 1);
        assert_eq!(described.replicas[0].provider, "f01000");
        assert_eq!(described.replicas[0].pieces[0].status, "published");

        // Passthrough declines while the local copy exists
        assert!(store.pass_get(&desc.id, None).await.unwrap().is_none());

        store.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_reads_fall_back_to_remote_after_cleanup() {
        let temp_dir = TempDir::new().unwrap();
        let (agg, store) = setup(&temp_dir, &["f01000", "f01001"]).await;
        store.start().await.unwrap();

        let data: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
        let desc = store.put(source(&data), &CancellationToken::new()).await.unwrap();
        let file_id = agg.file_ids()[0];

        // One provider is not enough
        agg.add_deal(file_id, "f01000", DealState::Active);
        agg.add_deal(file_id, "f01001", DealState::Published);
        let report = sweep(&store).await;
        assert!(report.removed.is_empty());
        assert!(store.local().contains(&desc.id).await);

        agg.set_deal_state(file_id, "f01001", DealState::Active);
        let report = sweep(&store).await;
        assert_eq!(report.removed, vec![desc.id]);
        assert!(!store.local().contains(&desc.id).await);

        let mut reader = store.get(&desc.id).await.unwrap();
        assert_eq!(reader.size(), data.len() as u64);
        assert_eq!(read_to_end(reader.as_mut()).await.unwrap(), data);

        let described = store.describe(&desc.id).await.unwrap();
        assert_eq!(described.size, data.len() as u64);
        assert_eq!(described.replicas.len(), 2);

        let passthrough = store.pass_get(&desc.id, Some("bytes=0-9")).await.unwrap().unwrap();
        assert_eq!(passthrough.status, 206);
        assert_eq!(passthrough.content_length, Some(10));

        store.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_no_providers_never_evicts() {
        let temp_dir = TempDir::new().unwrap();
        let (agg, store) = setup(&temp_dir, &[]).await;
        store.start().await.unwrap();

        let desc = store.put(source(b"keep"), &CancellationToken::new()).await.unwrap();
        agg.add_deal(agg.file_ids()[0], "f01000", DealState::Active);

        let report = sweep(&store).await;
        assert!(report.removed.is_empty());
        assert!(store.local().contains(&desc.id).await);
        store.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_push_rolls_back() {
        let temp_dir = TempDir::new().unwrap();
        let (agg, store) = setup(&temp_dir, &[]).await;
        store.start().await.unwrap();
        agg.set_failing(Operation::PushFile, true);

        let err = store.put(source(b"doomed"), &CancellationToken::new()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.local().list().await.unwrap().is_empty());
        store.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_during_push_rolls_back() {
        let temp_dir = TempDir::new().unwrap();
        let slow = MemoryAggregator::new().with_push_delay(Duration::from_millis(200));
        let (agg, store) = setup_with(&temp_dir, &[], slow).await;
        store.start().await.unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let err = store.put(source(b"abandoned"), &cancel).await.unwrap_err();
        assert!(matches!(err, StorageError::Cancelled));
        assert!(store.local().list().await.unwrap().is_empty());
        assert!(agg.file_ids().is_empty());
        store.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_put_leaves_no_unmapped_blob() {
        let temp_dir = TempDir::new().unwrap();
        let slow = MemoryAggregator::new().with_push_delay(Duration::from_secs(5));
        let (_agg, store) = setup_with(&temp_dir, &[], slow).await;
        store.start().await.unwrap();

        let cancel = CancellationToken::new();
        let put = store.put(source(b"half registered"), &cancel);
        assert!(tokio::time::timeout(Duration::from_millis(100), put).await.is_err());

        assert!(store.local().list().await.unwrap().is_empty());
        let leftovers = std::fs::read_dir(store.local().dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.ends_with(".bin") || name.ends_with(".id") || name.ends_with(".tmp")
            })
            .count();
        assert_eq!(leftovers, 0);
        store.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_blob() {
        let temp_dir = TempDir::new().unwrap();
        let (_agg, store) = setup(&temp_dir, &[]).await;
        store.start().await.unwrap();

        let id = BlobId::generate();
        assert!(store.get(&id).await.err().unwrap().is_not_found());
        assert!(store.describe(&id).await.unwrap_err().is_not_found());
        store.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[test]
    fn test_replicas_grouped_by_provider() {
        let deal = |provider: &str, state| DealRecord {
            id: 1,
            provider: provider.to_string(),
            state,
            piece_cid: "baga".into(),
            end_epoch: 0,
            last_verified_at: None,
        };
        let replicas = replicas_from_deals(vec![
            deal("f02", DealState::Active),
            deal("f01", DealState::Proposed),
            deal("f02", DealState::Expired),
        ]);
        assert_eq!(replicas.len(), 2);
        assert_eq!(replicas[0].provider, "f01");
        assert_eq!(replicas[1].pieces.len(), 2);
        assert_eq!(replicas[1].pieces[1].status, "expired");
        assert_eq!(replicas[0].pieces[0].expiration, epoch_to_time(0));
    }
}
