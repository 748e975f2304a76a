//! Replica Stage - Blob staging service with network replication
//!
//! Accepts blobs over HTTP, stages them on local disk, and hands them to a
//! remote aggregation service that packs them into archives and replicates
//! them to storage providers under the configured deal terms.
//!
//! ## Architecture
//!
//! - **Local staging store**: Flat files, free-space admission control
//! - **Identifier map**: Blob ID to remote file ID, one small file per blob
//! - **Packing pipeline**: Tells the aggregator when enough bytes are waiting
//! - **Schedule reconciler**: One replication schedule per provider
//! - **Cleanup scheduler**: Evicts staged copies once replication is confirmed
//! - **Remote range reader**: Serves evicted blobs by HTTP range requests
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/replica-stage/
//! ├── blobs/                 # Staged blobs and identifier map
//! │   ├── <uuid>.bin
//! │   └── <uuid>.id
//! ├── chunked/               # Chunked backend only
//! │   ├── chunks/<ab12>/<sha256>
//! │   └── index/<uuid>.json
//! └── config.toml            # Configuration
//! ```

pub mod aggregated_store;
pub mod aggregator;
pub mod backend;
pub mod blob;
pub mod chunk_store;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod http;
pub mod id_map;
pub mod local_store;
pub mod pack_pipeline;
pub mod range_reader;
pub mod schedule;
pub mod task;

// Re-exports
pub use aggregated_store::{AggregatedStore, AggregatedStoreConfig};
pub use aggregator::{Aggregator, AggregatorClient, AggregatorConfig, MemoryAggregator};
pub use backend::Backend;
pub use blob::{BlobId, BlobReader, BlobSource, BlobStore, Descriptor, PassthroughGet};
pub use chunk_store::ChunkStore;
pub use config::{BackendKind, Config};
pub use error::StorageError;
pub use http::HttpServer;
pub use local_store::LocalStore;
