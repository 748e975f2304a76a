//! In-memory aggregation service
//!
//! Behaves like the remote service closely enough to exercise the service
//! core end to end: pushed files are read from the source directory and
//! kept in memory, outstanding unpacked bytes are tracked per source, and
//! ready-to-pack signals are counted. Deal states are scripted by the
//! caller, and individual operations can be made to fail.

use super::*;
use crate::blob::{ByteRange, RangeNotSatisfiable};
use crate::error::StorageError;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Operations that can be made to fail on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateDataset,
    CreateSource,
    ImportWallet,
    ListSchedules,
    CreateSchedule,
    UpdateSchedule,
    DeleteSchedule,
    PushFile,
    PrepareToPackFile,
    PackSource,
    GetFile,
    GetFileDeals,
    Retrieve,
}

struct StoredFile {
    entry: FileEntry,
    source_id: u64,
    data: Bytes,
    prepared: bool,
}

#[derive(Default)]
struct State {
    next_id: u64,
    datasets: Vec<Dataset>,
    sources: Vec<(String, Source)>,
    wallets: Vec<Wallet>,
    attached: Vec<(String, String)>,
    schedules: BTreeMap<u64, Schedule>,
    files: HashMap<u64, StoredFile>,
    outstanding: HashMap<u64, u64>,
    pack_signals: HashMap<u64, u64>,
    deals: HashMap<u64, Vec<DealRecord>>,
    failing: HashSet<Operation>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check(&self, op: Operation) -> Result<()> {
        if self.failing.contains(&op) {
            return Err(StorageError::Remote {
                status: 500,
                message: format!("injected failure: {op:?}"),
            });
        }
        Ok(())
    }
}

pub struct MemoryAggregator {
    state: Mutex<State>,
    retrieve_chunk_size: usize,
    retrieve_calls: AtomicU64,
    push_delay: Duration,
}

impl Default for MemoryAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAggregator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            retrieve_chunk_size: 64 * 1024,
            retrieve_calls: AtomicU64::new(0),
            push_delay: Duration::ZERO,
        }
    }

    /// Hold every push this long before it is accepted
    pub fn with_push_delay(mut self, delay: Duration) -> Self {
        self.push_delay = delay;
        self
    }

    /// Split retrieval bodies into chunks of this many bytes
    pub fn with_retrieve_chunk_size(mut self, size: usize) -> Self {
        self.retrieve_chunk_size = size.max(1);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make an operation fail (or succeed again) from now on
    pub fn set_failing(&self, op: Operation, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.failing.insert(op);
        } else {
            state.failing.remove(&op);
        }
    }

    /// Register a file with in-memory content, bypassing the source directory
    pub fn insert_file(&self, source_id: u64, path: &str, data: impl Into<Bytes>) -> u64 {
        let data = data.into();
        let mut state = self.lock();
        let id = state.next_id();
        let entry = FileEntry {
            id,
            path: path.to_string(),
            size: data.len() as u64,
            last_modified: Some(Utc::now()),
        };
        state.files.insert(
            id,
            StoredFile {
                entry,
                source_id,
                data,
                prepared: false,
            },
        );
        id
    }

    /// Record a deal for a file
    pub fn add_deal(&self, file_id: u64, provider: &str, state: DealState) {
        let mut guard = self.lock();
        let id = guard.next_id();
        guard.deals.entry(file_id).or_default().push(DealRecord {
            id,
            provider: provider.to_string(),
            state,
            piece_cid: format!("baga6ea4seaq{file_id:08}"),
            end_epoch: 4_000_000,
            last_verified_at: None,
        });
    }

    /// Move every deal a provider holds for a file into `state`
    pub fn set_deal_state(&self, file_id: u64, provider: &str, state: DealState) {
        let mut guard = self.lock();
        if let Some(deals) = guard.deals.get_mut(&file_id) {
            for deal in deals.iter_mut().filter(|d| d.provider == provider) {
                deal.state = state;
            }
        }
    }

    /// Ready-to-pack signals issued for a source
    pub fn pack_signal_count(&self, source_id: u64) -> u64 {
        self.lock().pack_signals.get(&source_id).copied().unwrap_or(0)
    }

    pub fn outstanding_bytes(&self, source_id: u64) -> u64 {
        self.lock().outstanding.get(&source_id).copied().unwrap_or(0)
    }

    pub fn file_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.lock().files.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn file_data(&self, file_id: u64) -> Option<Bytes> {
        self.lock().files.get(&file_id).map(|f| f.data.clone())
    }

    pub fn schedules(&self) -> Vec<Schedule> {
        self.lock().schedules.values().cloned().collect()
    }

    /// Seed a schedule as if created by an earlier run
    pub fn insert_schedule(&self, dataset: &str, provider: &str, terms: ScheduleTerms) -> u64 {
        let mut state = self.lock();
        let id = state.next_id();
        state.schedules.insert(
            id,
            Schedule {
                id,
                dataset: dataset.to_string(),
                provider: provider.to_string(),
                terms,
            },
        );
        id
    }

    pub fn datasets(&self) -> Vec<Dataset> {
        self.lock().datasets.clone()
    }

    pub fn sources(&self) -> Vec<Source> {
        self.lock().sources.iter().map(|(_, s)| s.clone()).collect()
    }

    pub fn attached_wallets(&self, dataset: &str) -> Vec<String> {
        self.lock()
            .attached
            .iter()
            .filter(|(d, _)| d == dataset)
            .map(|(_, a)| a.clone())
            .collect()
    }

    /// Range retrievals served so far
    pub fn retrieve_calls(&self) -> u64 {
        self.retrieve_calls.load(Ordering::SeqCst)
    }

    fn require_dataset(state: &State, dataset: &str) -> Result<()> {
        if state.datasets.iter().any(|d| d.name == dataset) {
            Ok(())
        } else {
            Err(StorageError::BlobNotFound(format!("dataset {dataset}")))
        }
    }
}

/// Stand-in address derived from the key bytes
fn wallet_address(private_key: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(private_key.as_bytes());
    format!("f1{}", &hex::encode(digest)[..38])
}

#[async_trait]
impl Aggregator for MemoryAggregator {
    async fn list_datasets(&self) -> Result<Vec<Dataset>> {
        Ok(self.lock().datasets.clone())
    }

    async fn create_dataset(&self, request: &CreateDatasetRequest) -> Result<Dataset> {
        let mut state = self.lock();
        state.check(Operation::CreateDataset)?;
        if state.datasets.iter().any(|d| d.name == request.name) {
            return Err(StorageError::Conflict(format!("dataset {}", request.name)));
        }
        let dataset = Dataset {
            id: state.next_id(),
            name: request.name.clone(),
            max_size: request.max_size.clone(),
        };
        state.datasets.push(dataset.clone());
        Ok(dataset)
    }

    async fn list_sources(&self, dataset: &str) -> Result<Vec<Source>> {
        let state = self.lock();
        Self::require_dataset(&state, dataset)?;
        Ok(state
            .sources
            .iter()
            .filter(|(d, _)| d == dataset)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn create_source(&self, dataset: &str, request: &CreateSourceRequest) -> Result<Source> {
        let mut state = self.lock();
        state.check(Operation::CreateSource)?;
        Self::require_dataset(&state, dataset)?;
        if state
            .sources
            .iter()
            .any(|(d, s)| d == dataset && s.name == request.name)
        {
            return Err(StorageError::Conflict(format!("source {}", request.name)));
        }
        let source = Source {
            id: state.next_id(),
            name: request.name.clone(),
            path: request.path.clone(),
        };
        state.sources.push((dataset.to_string(), source.clone()));
        Ok(source)
    }

    async fn list_wallets(&self) -> Result<Vec<Wallet>> {
        Ok(self.lock().wallets.clone())
    }

    async fn import_wallet(&self, private_key: &str) -> Result<Wallet> {
        let mut state = self.lock();
        state.check(Operation::ImportWallet)?;
        let address = wallet_address(private_key);
        if state.wallets.iter().any(|w| w.address == address) {
            return Err(StorageError::Conflict(format!("wallet {address}")));
        }
        let wallet = Wallet {
            address,
            private_key: Some(private_key.to_string()),
        };
        state.wallets.push(wallet.clone());
        Ok(wallet)
    }

    async fn list_attached_wallets(&self, dataset: &str) -> Result<Vec<Wallet>> {
        let state = self.lock();
        Self::require_dataset(&state, dataset)?;
        Ok(state
            .wallets
            .iter()
            .filter(|w| {
                state
                    .attached
                    .iter()
                    .any(|(d, a)| d == dataset && *a == w.address)
            })
            .cloned()
            .collect())
    }

    async fn attach_wallet(&self, dataset: &str, address: &str) -> Result<()> {
        let mut state = self.lock();
        Self::require_dataset(&state, dataset)?;
        if !state.wallets.iter().any(|w| w.address == address) {
            return Err(StorageError::BlobNotFound(format!("wallet {address}")));
        }
        let pair = (dataset.to_string(), address.to_string());
        if !state.attached.contains(&pair) {
            state.attached.push(pair);
        }
        Ok(())
    }

    async fn list_schedules(&self, dataset: &str) -> Result<Vec<Schedule>> {
        let state = self.lock();
        state.check(Operation::ListSchedules)?;
        Self::require_dataset(&state, dataset)?;
        Ok(state
            .schedules
            .values()
            .filter(|s| s.dataset == dataset)
            .cloned()
            .collect())
    }

    async fn create_schedule(&self, request: &CreateScheduleRequest) -> Result<Schedule> {
        let mut state = self.lock();
        state.check(Operation::CreateSchedule)?;
        let id = state.next_id();
        let schedule = Schedule {
            id,
            dataset: request.dataset.clone(),
            provider: request.provider.clone(),
            terms: request.terms.clone(),
        };
        state.schedules.insert(id, schedule.clone());
        Ok(schedule)
    }

    async fn update_schedule(&self, id: u64, terms: &ScheduleTerms) -> Result<Schedule> {
        let mut state = self.lock();
        state.check(Operation::UpdateSchedule)?;
        let schedule = state
            .schedules
            .get_mut(&id)
            .ok_or_else(|| StorageError::BlobNotFound(format!("schedule {id}")))?;
        schedule.terms = terms.clone();
        Ok(schedule.clone())
    }

    async fn delete_schedule(&self, id: u64) -> Result<()> {
        let mut state = self.lock();
        state.check(Operation::DeleteSchedule)?;
        state
            .schedules
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StorageError::BlobNotFound(format!("schedule {id}")))
    }

    async fn push_file(&self, source_id: u64, path: &str) -> Result<FileEntry> {
        let root = {
            let state = self.lock();
            state.check(Operation::PushFile)?;
            state
                .sources
                .iter()
                .find(|(_, s)| s.id == source_id)
                .map(|(_, s)| s.path.clone())
                .ok_or_else(|| StorageError::BlobNotFound(format!("source {source_id}")))?
        };

        if !self.push_delay.is_zero() {
            tokio::time::sleep(self.push_delay).await;
        }

        let full_path = Path::new(&root).join(path);
        let data = match tokio::fs::read(&full_path).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::BlobNotFound(full_path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let id = self.insert_file(source_id, path, data);
        let state = self.lock();
        state
            .files
            .get(&id)
            .map(|f| f.entry.clone())
            .ok_or_else(|| StorageError::Internal(format!("file {id} vanished")))
    }

    async fn prepare_to_pack_file(&self, file_id: u64) -> Result<u64> {
        let mut state = self.lock();
        state.check(Operation::PrepareToPackFile)?;
        let file = state
            .files
            .get_mut(&file_id)
            .ok_or_else(|| StorageError::BlobNotFound(format!("file {file_id}")))?;
        let (source_id, size, newly) = (file.source_id, file.entry.size, !file.prepared);
        file.prepared = true;

        let outstanding = state.outstanding.entry(source_id).or_default();
        if newly {
            *outstanding += size;
        }
        Ok(*outstanding)
    }

    async fn pack_source(&self, source_id: u64) -> Result<()> {
        let mut state = self.lock();
        state.check(Operation::PackSource)?;
        state.outstanding.insert(source_id, 0);
        *state.pack_signals.entry(source_id).or_default() += 1;
        Ok(())
    }

    async fn get_file(&self, file_id: u64) -> Result<FileEntry> {
        let state = self.lock();
        state.check(Operation::GetFile)?;
        state
            .files
            .get(&file_id)
            .map(|f| f.entry.clone())
            .ok_or_else(|| StorageError::BlobNotFound(format!("file {file_id}")))
    }

    async fn get_file_deals(&self, file_id: u64) -> Result<Vec<DealRecord>> {
        let state = self.lock();
        state.check(Operation::GetFileDeals)?;
        if !state.files.contains_key(&file_id) {
            return Err(StorageError::BlobNotFound(format!("file {file_id}")));
        }
        Ok(state.deals.get(&file_id).cloned().unwrap_or_default())
    }

    async fn retrieve(&self, file_id: u64, range: Option<&str>) -> Result<RetrieveResponse> {
        self.retrieve_calls.fetch_add(1, Ordering::SeqCst);
        let data = {
            let state = self.lock();
            state.check(Operation::Retrieve)?;
            state
                .files
                .get(&file_id)
                .map(|f| f.data.clone())
                .ok_or_else(|| StorageError::BlobNotFound(format!("file {file_id}")))?
        };
        let size = data.len() as u64;

        let parsed = match range {
            Some(header) => ByteRange::parse(header, size),
            None => Ok(None),
        };
        let (status, body, content_range) = match parsed {
            Ok(Some(r)) => (
                206,
                data.slice(r.start as usize..=r.end as usize),
                Some(r.content_range(size)),
            ),
            Ok(None) => (200, data, None),
            Err(RangeNotSatisfiable) => {
                return Err(StorageError::Remote {
                    status: 416,
                    message: format!("range not satisfiable for {size} byte file"),
                })
            }
        };

        let chunk = self.retrieve_chunk_size;
        let chunks: Vec<Result<Bytes>> = (0..body.len())
            .step_by(chunk)
            .map(|start| Ok(body.slice(start..(start + chunk).min(body.len()))))
            .collect();

        Ok(RetrieveResponse {
            status,
            content_length: Some(body.len() as u64),
            content_range,
            body: Box::pin(futures::stream::iter(chunks)),
        })
    }
}
