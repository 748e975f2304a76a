//! Remote aggregation service
//!
//! The aggregator owns datasets, source storages, wallets, replication
//! schedules and the deals made for every pushed file. This module defines
//! the operations the service core consumes ([`Aggregator`]), an HTTP
//! client for them ([`AggregatorClient`]) and an in-memory implementation
//! ([`MemoryAggregator`]) used by tests and local experiments.

pub mod client;
pub mod memory;

pub use client::{AggregatorClient, AggregatorConfig};
pub use memory::{MemoryAggregator, Operation};

use crate::blob::{ByteStream, PassthroughResponse};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Length of one chain epoch
pub const EPOCH_DURATION_SECS: u64 = 30;

/// Unix time of chain epoch 0
pub const GENESIS_UNIX_SECS: i64 = 1_598_306_400;

/// Wall-clock time at which a chain epoch starts
pub fn epoch_to_time(epoch: i64) -> DateTime<Utc> {
    let secs = GENESIS_UNIX_SECS.saturating_add(epoch.saturating_mul(EPOCH_DURATION_SECS as i64));
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub max_size: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateDatasetRequest {
    pub name: String,
    pub max_size: String,
}

/// Storage location the aggregator reads pushed files from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: u64,
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSourceRequest {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub address: String,
    #[serde(default)]
    pub private_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportWalletRequest {
    pub private_key: String,
}

/// Deal terms shared by every provider schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleTerms {
    pub price_per_gib_epoch: f64,
    pub price_per_gib: f64,
    pub price_per_deal: f64,
    /// Seconds string, e.g. `"259200s"`
    pub start_delay: String,
    pub duration: String,
    pub verified: bool,
    pub ipni: bool,
    pub keep_unsealed: bool,
    #[serde(default)]
    pub url_template: String,
    #[serde(default)]
    pub schedule_cron: String,
    #[serde(default)]
    pub schedule_cron_perpetual: bool,
    #[serde(default)]
    pub schedule_deal_number: u64,
    #[serde(default)]
    pub total_deal_number: u64,
    #[serde(default)]
    pub schedule_deal_size: String,
    #[serde(default)]
    pub total_deal_size: String,
    #[serde(default)]
    pub max_pending_deal_size: String,
    #[serde(default)]
    pub max_pending_deal_number: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: u64,
    pub dataset: String,
    pub provider: String,
    #[serde(flatten)]
    pub terms: ScheduleTerms,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateScheduleRequest {
    pub dataset: String,
    pub provider: String,
    #[serde(flatten)]
    pub terms: ScheduleTerms,
}

/// A file registered with a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: u64,
    pub path: String,
    pub size: u64,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushFileRequest {
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealState {
    Proposed,
    Published,
    Active,
    Expired,
    ProposalExpired,
    Rejected,
    Slashed,
    Error,
    #[serde(other)]
    Unknown,
}

impl DealState {
    /// The provider is storing the data and proving it
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, DealState::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DealState::Proposed => "proposed",
            DealState::Published => "published",
            DealState::Active => "active",
            DealState::Expired => "expired",
            DealState::ProposalExpired => "proposal_expired",
            DealState::Rejected => "rejected",
            DealState::Slashed => "slashed",
            DealState::Error => "error",
            DealState::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealRecord {
    pub id: u64,
    pub provider: String,
    pub state: DealState,
    pub piece_cid: String,
    pub end_epoch: i64,
    #[serde(default)]
    pub last_verified_at: Option<DateTime<Utc>>,
}

/// Streamed range retrieval
pub struct RetrieveResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub content_range: Option<String>,
    pub body: ByteStream,
}

impl From<RetrieveResponse> for PassthroughResponse {
    fn from(r: RetrieveResponse) -> Self {
        PassthroughResponse {
            status: r.status,
            content_length: r.content_length,
            content_range: r.content_range,
            body: r.body,
        }
    }
}

/// Operations consumed from the remote aggregation service.
///
/// Absent datasets, files and schedules surface as
/// [`StorageError::BlobNotFound`](crate::StorageError::BlobNotFound); an
/// already existing resource on create surfaces as
/// [`StorageError::Conflict`](crate::StorageError::Conflict).
#[async_trait]
pub trait Aggregator: Send + Sync {
    async fn list_datasets(&self) -> Result<Vec<Dataset>>;

    async fn create_dataset(&self, request: &CreateDatasetRequest) -> Result<Dataset>;

    async fn list_sources(&self, dataset: &str) -> Result<Vec<Source>>;

    /// Create a source storage and attach it to the dataset
    async fn create_source(&self, dataset: &str, request: &CreateSourceRequest) -> Result<Source>;

    async fn list_wallets(&self) -> Result<Vec<Wallet>>;

    async fn import_wallet(&self, private_key: &str) -> Result<Wallet>;

    async fn list_attached_wallets(&self, dataset: &str) -> Result<Vec<Wallet>>;

    async fn attach_wallet(&self, dataset: &str, address: &str) -> Result<()>;

    async fn list_schedules(&self, dataset: &str) -> Result<Vec<Schedule>>;

    async fn create_schedule(&self, request: &CreateScheduleRequest) -> Result<Schedule>;

    async fn update_schedule(&self, id: u64, terms: &ScheduleTerms) -> Result<Schedule>;

    async fn delete_schedule(&self, id: u64) -> Result<()>;

    /// Register a file, by path relative to the source root
    async fn push_file(&self, source_id: u64, path: &str) -> Result<FileEntry>;

    /// Mark a file ready for packing; returns the outstanding unpacked
    /// bytes of its source
    async fn prepare_to_pack_file(&self, file_id: u64) -> Result<u64>;

    /// Signal that the source's outstanding data should be packed now
    async fn pack_source(&self, source_id: u64) -> Result<()>;

    async fn get_file(&self, file_id: u64) -> Result<FileEntry>;

    async fn get_file_deals(&self, file_id: u64) -> Result<Vec<DealRecord>>;

    /// Stream file bytes, honouring an optional `Range` header value
    async fn retrieve(&self, file_id: u64, range: Option<&str>) -> Result<RetrieveResponse>;
}
