//! Integration tests for the aggregator-backed store
//!
//! Runs the full Put, pack, replicate, evict, read-back cycle against the
//! in-memory aggregation service.

use rand::RngCore;
use replica_stage::aggregator::DealState;
use replica_stage::blob::read_to_end;
use replica_stage::config::BackendKind;
use replica_stage::id_map::IdMap;
use replica_stage::{AggregatedStore, BlobSource, Config, LocalStore, MemoryAggregator};
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const MIB: usize = 1 << 20;

fn test_config(temp_dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.backend = BackendKind::Aggregated;
    config.storage_dir = temp_dir.path().to_path_buf();
    config.aggregator.wallet_key = "integration-wallet".into();
    config.aggregator.pack_threshold = 10 * MIB as u64;
    config.replication.providers = vec!["f01000".into(), "f02000".into()];
    config
}

async fn start_store(config: &Config) -> (Arc<MemoryAggregator>, AggregatedStore) {
    let local = Arc::new(LocalStore::new(config.local_store_config()).await.unwrap());
    let agg = Arc::new(MemoryAggregator::new());
    let store = AggregatedStore::new(config.aggregated_store_config(), local, agg.clone());
    store.start().await.unwrap();
    (agg, store)
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

fn source(data: &[u8]) -> BlobSource {
    Box::new(std::io::Cursor::new(data.to_vec()))
}

#[tokio::test]
async fn test_large_puts_trigger_packing() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir);
    let (agg, store) = start_store(&config).await;
    let source_id = store.source_id().unwrap();

    let first = random_bytes(15 * MIB);
    let second = random_bytes(15 * MIB);
    let cancel = CancellationToken::new();
    let a = store.put(source(&first), &cancel).await.unwrap();
    let b = store.put(source(&second), &cancel).await.unwrap();
    assert_eq!(a.size, first.len() as u64);
    assert_eq!(b.size, second.len() as u64);

    assert!(agg.pack_signal_count(source_id) >= 1);
    assert_eq!(agg.file_ids().len(), 2);

    // Both blobs are still served from the local cache
    let mut reader = store.get(&b.id).await.unwrap();
    reader.seek(SeekFrom::Start(MIB as u64)).await.unwrap();
    let mut buf = vec![0u8; 4096];
    let n = reader.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], &second[MIB..MIB + 4096]);

    store.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_crossing_put_returns_after_pack_signal() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir);
    let (agg, store) = start_store(&config).await;
    let source_id = store.source_id().unwrap();
    let cancel = CancellationToken::new();

    store.put(source(&random_bytes(5 * MIB)), &cancel).await.unwrap();
    assert_eq!(agg.outstanding_bytes(source_id), 5 * MIB as u64);
    store.put(source(&random_bytes(5 * MIB)), &cancel).await.unwrap();
    assert_eq!(agg.outstanding_bytes(source_id), 10 * MIB as u64);
    assert_eq!(agg.pack_signal_count(source_id), 0);

    // 15 MiB outstanding crosses the 10 MiB threshold
    store.put(source(&random_bytes(5 * MIB)), &cancel).await.unwrap();
    assert_eq!(agg.pack_signal_count(source_id), 1);
    assert_eq!(agg.outstanding_bytes(source_id), 0);

    store.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_replicate_evict_and_read_back() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir);
    let (agg, store) = start_store(&config).await;

    let data = random_bytes(3 * MIB + 17);
    let desc = store.put(source(&data), &CancellationToken::new()).await.unwrap();
    let file_id = agg.file_ids()[0];

    agg.add_deal(file_id, "f01000", DealState::Active);
    agg.add_deal(file_id, "f02000", DealState::Active);

    let mut evicted = false;
    for _ in 0..100 {
        store.sweep_now().await.unwrap();
        if !store.local().contains(&desc.id).await {
            evicted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(evicted);

    // The identifier mapping survives eviction
    let id_map = IdMap::new(config.blobs_dir());
    assert_eq!(id_map.get(&desc.id).await.unwrap(), file_id);

    let mut reader = store.get(&desc.id).await.unwrap();
    assert_eq!(reader.size(), data.len() as u64);
    assert_eq!(read_to_end(reader.as_mut()).await.unwrap(), data);

    reader.seek(SeekFrom::End(-17)).await.unwrap();
    let mut tail = [0u8; 32];
    let n = reader.read(&mut tail).await.unwrap();
    assert_eq!(&tail[..n], &data[data.len() - 17..]);
    reader.close().await.unwrap();

    let described = store.describe(&desc.id).await.unwrap();
    assert_eq!(described.size, data.len() as u64);
    let providers: Vec<&str> = described.replicas.iter().map(|r| r.provider.as_str()).collect();
    assert_eq!(providers, vec!["f01000", "f02000"]);

    store.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_cancelled_put_leaves_no_trace() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir);
    let (agg, store) = start_store(&config).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(store.put(source(b"never"), &cancel).await.is_err());

    assert!(store.local().list().await.unwrap().is_empty());
    assert!(agg.file_ids().is_empty());
    store.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_restart_keeps_serving_evicted_blobs() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir);
    let (agg, store) = start_store(&config).await;

    let data = random_bytes(64 * 1024);
    let desc = store.put(source(&data), &CancellationToken::new()).await.unwrap();
    store.local().remove(&desc.id).await.unwrap();
    store.shutdown(Duration::from_secs(2)).await.unwrap();

    let local = Arc::new(LocalStore::new(config.local_store_config()).await.unwrap());
    let restarted = AggregatedStore::new(config.aggregated_store_config(), local, agg.clone());
    restarted.start().await.unwrap();

    let mut reader = restarted.get(&desc.id).await.unwrap();
    assert_eq!(read_to_end(reader.as_mut()).await.unwrap(), data);
    assert_eq!(agg.schedules().len(), 2);
    restarted.shutdown(Duration::from_secs(2)).await.unwrap();
}
