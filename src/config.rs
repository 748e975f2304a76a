//! Configuration for replica-stage
//!
//! A single TOML file with a top-level section plus `[chunked]`,
//! `[aggregator]` and `[replication]` tables. Every field has a default, so
//! an empty file is a valid local-only configuration. Components never read
//! `Config` directly: they receive the narrow config value built by one of
//! the `*_config` helpers below, after [`Config::validate`] has passed.

use crate::aggregated_store::AggregatedStoreConfig;
use crate::aggregator::{AggregatorConfig, ScheduleTerms, EPOCH_DURATION_SECS};
use crate::chunk_store::{ChunkStoreConfig, DEFAULT_CHUNK_SIZE};
use crate::cleanup::CleanupConfig;
use crate::error::{Result, StorageError};
use crate::local_store::LocalStoreConfig;
use crate::pack_pipeline::PackPipelineConfig;
use crate::schedule::ScheduleConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("replica-stage")
}

/// Which blob store implementation serves the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Flat files in the staging directory, nothing leaves the machine
    Local,
    /// Content-addressed chunks with a per-blob index
    Chunked,
    /// Staged locally, replicated through the remote aggregator
    Aggregated,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackendKind::Local => "local",
            BackendKind::Chunked => "chunked",
            BackendKind::Aggregated => "aggregated",
        };
        f.write_str(name)
    }
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for staged blobs, identifier maps and chunks
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Blob store implementation
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// Largest body accepted by `POST /v0/blob`
    #[serde(default = "default_max_blob_length")]
    pub max_blob_length: u64,

    /// Free bytes that must remain on the staging disk (0 = no check)
    #[serde(default)]
    pub min_free_space: u64,

    #[serde(default)]
    pub chunked: ChunkedSection,

    #[serde(default)]
    pub aggregator: AggregatorSection,

    #[serde(default)]
    pub replication: ReplicationSection,
}

/// `[chunked]` backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkedSection {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_max_chunked_blob_size")]
    pub max_blob_size: u64,
}

/// `[aggregator]` connection and batching settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorSection {
    /// Base URL of the aggregation service API
    #[serde(default)]
    pub url: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Logical dataset all blobs are grouped under
    #[serde(default = "default_dataset_name")]
    pub dataset_name: String,

    /// Name of the source storage that points at the staging directory
    #[serde(default = "default_source_name")]
    pub source_name: String,

    /// Maximum archive size handed to the aggregator, e.g. "31.5GiB"
    #[serde(default = "default_max_car_size")]
    pub max_car_size: String,

    /// Opaque wallet key imported into the aggregator at startup
    #[serde(default)]
    pub wallet_key: String,

    /// Outstanding unpacked bytes that trigger a ready-to-pack signal
    #[serde(default = "default_pack_threshold")]
    pub pack_threshold: u64,

    /// Longest time between ready-to-pack signals
    #[serde(default = "default_force_pack_after_secs")]
    pub force_pack_after_secs: u64,

    #[serde(default = "default_pack_queue_capacity")]
    pub pack_queue_capacity: usize,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Schedule reconciliation poll interval (0 = startup only)
    #[serde(default)]
    pub reconcile_interval_secs: u64,

    /// Minimum bytes requested per remote range fetch
    #[serde(default = "default_read_ahead_bytes")]
    pub read_ahead_bytes: u64,
}

/// `[replication]` providers and deal terms
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSection {
    /// Storage provider addresses that must each hold a replica
    #[serde(default)]
    pub providers: Vec<String>,

    /// Prices are denominated in FIL
    #[serde(default)]
    pub price_per_gib_epoch: f64,
    #[serde(default)]
    pub price_per_gib: f64,
    #[serde(default)]
    pub price_per_deal: f64,

    #[serde(default = "default_deal_start_delay_epochs")]
    pub deal_start_delay_epochs: u64,

    #[serde(default = "default_deal_duration_epochs")]
    pub deal_duration_epochs: u64,

    #[serde(default)]
    pub verified: bool,

    #[serde(default = "default_true")]
    pub ipni_announce: bool,

    #[serde(default = "default_true")]
    pub keep_unsealed: bool,

    /// Where providers fetch archives from; empty lets the aggregator decide
    #[serde(default)]
    pub url_template: String,

    #[serde(default)]
    pub schedule_cron: String,

    #[serde(default = "default_true")]
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

fn default_http_port() -> u16 {
    40080
}

fn default_backend() -> BackendKind {
    BackendKind::Local
}

fn default_max_blob_length() -> u64 {
    32 << 30
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_max_chunked_blob_size() -> u64 {
    31 << 30
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_dataset_name() -> String {
    "REPLICA_STAGE".to_string()
}

fn default_source_name() -> String {
    "replica-stage-staging".to_string()
}

fn default_max_car_size() -> String {
    "31.5GiB".to_string()
}

fn default_pack_threshold() -> u64 {
    16 << 30
}

fn default_force_pack_after_secs() -> u64 {
    24 * 60 * 60
}

fn default_pack_queue_capacity() -> usize {
    1
}

fn default_cleanup_interval_secs() -> u64 {
    60 * 60
}

fn default_read_ahead_bytes() -> u64 {
    1 << 20
}

// 72 hours of 30 second epochs
fn default_deal_start_delay_epochs() -> u64 {
    72 * 120
}

// One year of 30 second epochs
fn default_deal_duration_epochs() -> u64 {
    1_051_200
}

fn default_true() -> bool {
    true
}

impl Default for ChunkedSection {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_blob_size: default_max_chunked_blob_size(),
        }
    }
}

impl Default for AggregatorSection {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_secs: default_timeout_secs(),
            dataset_name: default_dataset_name(),
            source_name: default_source_name(),
            max_car_size: default_max_car_size(),
            wallet_key: String::new(),
            pack_threshold: default_pack_threshold(),
            force_pack_after_secs: default_force_pack_after_secs(),
            pack_queue_capacity: default_pack_queue_capacity(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            reconcile_interval_secs: 0,
            read_ahead_bytes: default_read_ahead_bytes(),
        }
    }
}

impl Default for ReplicationSection {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            price_per_gib_epoch: 0.0,
            price_per_gib: 0.0,
            price_per_deal: 0.0,
            deal_start_delay_epochs: default_deal_start_delay_epochs(),
            deal_duration_epochs: default_deal_duration_epochs(),
            verified: false,
            ipni_announce: true,
            keep_unsealed: true,
            url_template: String::new(),
            schedule_cron: String::new(),
            schedule_cron_perpetual: true,
            schedule_deal_number: 0,
            total_deal_number: 0,
            schedule_deal_size: String::new(),
            total_deal_size: String::new(),
            max_pending_deal_size: String::new(),
            max_pending_deal_number: 0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            http_port: default_http_port(),
            backend: default_backend(),
            max_blob_length: default_max_blob_length(),
            min_free_space: 0,
            chunked: ChunkedSection::default(),
            aggregator: AggregatorSection::default(),
            replication: ReplicationSection::default(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> std::result::Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::result::Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Reject values no component can run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_blob_length == 0 {
            return Err(StorageError::Config("max_blob_length must be positive".into()));
        }
        if self.chunked.chunk_size == 0 {
            return Err(StorageError::Config("chunked.chunk_size must be positive".into()));
        }

        if self.backend != BackendKind::Aggregated {
            return Ok(());
        }

        let aggregator = &self.aggregator;
        if aggregator.url.trim().is_empty() {
            return Err(StorageError::Config(
                "aggregated backend requires aggregator.url".into(),
            ));
        }
        if aggregator.wallet_key.trim().is_empty() {
            return Err(StorageError::Config(
                "aggregated backend requires aggregator.wallet_key".into(),
            ));
        }
        if aggregator.dataset_name.is_empty() || aggregator.source_name.is_empty() {
            return Err(StorageError::Config(
                "aggregator.dataset_name and aggregator.source_name must be set".into(),
            ));
        }
        if aggregator.timeout_secs == 0
            || aggregator.force_pack_after_secs == 0
            || aggregator.cleanup_interval_secs == 0
        {
            return Err(StorageError::Config(
                "aggregator timeouts and intervals must be positive".into(),
            ));
        }
        if aggregator.pack_queue_capacity == 0 {
            return Err(StorageError::Config(
                "aggregator.pack_queue_capacity must be positive".into(),
            ));
        }

        let mut seen = HashSet::new();
        for provider in &self.replication.providers {
            if provider.trim().is_empty() {
                return Err(StorageError::Config("empty provider address".into()));
            }
            if !seen.insert(provider.as_str()) {
                return Err(StorageError::Config(format!(
                    "duplicate provider address: {provider}"
                )));
            }
        }
        let prices = [
            self.replication.price_per_gib_epoch,
            self.replication.price_per_gib,
            self.replication.price_per_deal,
        ];
        if prices.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(StorageError::Config("prices must be non-negative".into()));
        }
        if self.replication.deal_duration_epochs == 0 {
            return Err(StorageError::Config(
                "replication.deal_duration_epochs must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Get staged blobs directory
    pub fn blobs_dir(&self) -> PathBuf {
        self.storage_dir.join("blobs")
    }

    /// Get chunk store directory
    pub fn chunks_dir(&self) -> PathBuf {
        self.storage_dir.join("chunked")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    pub fn local_store_config(&self) -> LocalStoreConfig {
        LocalStoreConfig {
            dir: self.blobs_dir(),
            min_free_space: self.min_free_space,
        }
    }

    pub fn chunk_store_config(&self) -> ChunkStoreConfig {
        ChunkStoreConfig {
            dir: self.chunks_dir(),
            chunk_size: self.chunked.chunk_size,
            max_blob_size: self.chunked.max_blob_size,
        }
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            base_url: self.aggregator.url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(self.aggregator.timeout_secs),
        }
    }

    /// Deal terms applied to every provider schedule
    pub fn schedule_terms(&self) -> ScheduleTerms {
        let r = &self.replication;
        ScheduleTerms {
            price_per_gib_epoch: r.price_per_gib_epoch,
            price_per_gib: r.price_per_gib,
            price_per_deal: r.price_per_deal,
            start_delay: epochs_to_duration_string(r.deal_start_delay_epochs),
            duration: epochs_to_duration_string(r.deal_duration_epochs),
            verified: r.verified,
            ipni: r.ipni_announce,
            keep_unsealed: r.keep_unsealed,
            url_template: r.url_template.clone(),
            schedule_cron: r.schedule_cron.clone(),
            schedule_cron_perpetual: r.schedule_cron_perpetual,
            schedule_deal_number: r.schedule_deal_number,
            total_deal_number: r.total_deal_number,
            schedule_deal_size: r.schedule_deal_size.clone(),
            total_deal_size: r.total_deal_size.clone(),
            max_pending_deal_size: r.max_pending_deal_size.clone(),
            max_pending_deal_number: r.max_pending_deal_number,
        }
    }

    pub fn aggregated_store_config(&self) -> AggregatedStoreConfig {
        let a = &self.aggregator;
        let reconcile_interval =
            (a.reconcile_interval_secs > 0).then(|| Duration::from_secs(a.reconcile_interval_secs));

        AggregatedStoreConfig {
            dataset_name: a.dataset_name.clone(),
            source_name: a.source_name.clone(),
            max_car_size: a.max_car_size.clone(),
            wallet_key: a.wallet_key.clone(),
            pack: PackPipelineConfig {
                pack_threshold: a.pack_threshold,
                force_pack_after: Duration::from_secs(a.force_pack_after_secs),
                queue_capacity: a.pack_queue_capacity,
            },
            cleanup: CleanupConfig {
                interval: Duration::from_secs(a.cleanup_interval_secs),
            },
            schedule: ScheduleConfig {
                dataset: a.dataset_name.clone(),
                providers: self.replication.providers.clone(),
                terms: self.schedule_terms(),
            },
            reconcile_interval,
            read_ahead: a.read_ahead_bytes,
        }
    }
}

/// Render a chain epoch count as the seconds string the aggregator expects.
pub fn epochs_to_duration_string(epochs: u64) -> String {
    format!("{}s", epochs.saturating_mul(EPOCH_DURATION_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregated() -> Config {
        let mut config = Config::default();
        config.backend = BackendKind::Aggregated;
        config.aggregator.url = "http://localhost:9090/".into();
        config.aggregator.wallet_key = "7b2254797065223a22736563703235366b31227d".into();
        config.replication.providers = vec!["f01000".into(), "f01001".into()];
        config
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.backend, BackendKind::Local);
        assert_eq!(config.max_blob_length, 32 << 30);
        assert_eq!(config.aggregator.pack_threshold, 16 << 30);
        assert_eq!(config.aggregator.force_pack_after_secs, 86400);
        assert_eq!(config.aggregator.pack_queue_capacity, 1);
        assert!(config.replication.keep_unsealed);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.http_port, 40080);
        assert_eq!(config.chunked.chunk_size, 1 << 20);
        assert_eq!(config.aggregator.max_car_size, "31.5GiB");
    }

    #[test]
    fn test_toml_sections() {
        let config: Config = toml::from_str(
            r#"
            backend = "aggregated"
            min_free_space = 1024

            [aggregator]
            url = "http://singularity:9090"
            wallet_key = "abc"
            pack_threshold = 10485760

            [replication]
            providers = ["f0123"]
            price_per_gib = 0.5
            verified = true
            "#,
        )
        .unwrap();

        assert_eq!(config.backend, BackendKind::Aggregated);
        assert_eq!(config.min_free_space, 1024);
        assert_eq!(config.aggregator.pack_threshold, 10 << 20);
        assert_eq!(config.aggregator.cleanup_interval_secs, 3600);
        assert_eq!(config.replication.providers, vec!["f0123".to_string()]);
        assert!(config.replication.verified);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let config = aggregated();
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();

        assert_eq!(loaded.backend, BackendKind::Aggregated);
        assert_eq!(loaded.replication.providers, config.replication.providers);
        assert_eq!(loaded.aggregator.url, config.aggregator.url);
    }

    #[test]
    fn test_validate_rejects_inconsistent_values() {
        let mut config = aggregated();
        config.aggregator.wallet_key.clear();
        assert!(matches!(config.validate(), Err(StorageError::Config(_))));

        let mut config = aggregated();
        config.aggregator.url.clear();
        assert!(config.validate().is_err());

        let mut config = aggregated();
        config.aggregator.pack_queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = aggregated();
        config.aggregator.cleanup_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = aggregated();
        config.replication.providers.push("f01000".into());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.chunked.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_component_configs() {
        let config = aggregated();
        assert_eq!(config.aggregator_config().base_url, "http://localhost:9090");

        let store = config.aggregated_store_config();
        assert_eq!(store.schedule.providers.len(), 2);
        assert_eq!(store.schedule.terms.start_delay, "259200s");
        assert_eq!(store.schedule.terms.duration, "31536000s");
        assert!(store.reconcile_interval.is_none());
        assert_eq!(store.pack.force_pack_after, Duration::from_secs(86400));
    }
}
