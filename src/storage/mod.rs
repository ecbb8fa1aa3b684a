//! Durable storage for sparse binary Merkle trees.
//!
//! A table keeps internal hashes, leaves and a key→path map in append-only
//! data files addressed through in-memory indexes. Background compaction
//! reclaims superseded items; the registry owns tables and snapshots.

/// Compaction scheduling and the store kinds it works on.
pub mod compaction;

/// One table's stores with point reads and atomic bulk writes.
pub mod data_source;

/// Append-only data files, their collections and the file compactor.
pub mod files;

/// In-memory path and hash indexes.
pub mod index;

/// Hashed key→path map built on bucket items.
pub mod key_to_path;

/// Store of items addressed by a dense key.
pub mod kv_store;

/// Hashes, leaves and leaf ranges.
pub mod record;

/// Key and value byte formats.
pub mod serializer;

pub(crate) mod metrics;
pub(crate) mod options;
pub(crate) mod registry;

pub use compaction::{compaction_pool, CompactionCoordinator, Compactor, StoreKind};
pub use data_source::{DataSource, DataSourceState};

/// Metrics and instrumentation.
pub use metrics::{default_metrics, CounterMetrics, Instrumentation, NoopMetrics, StoreMetrics};

/// Engine, table and registry configuration.
pub use options::{EngineConfig, LinkMode, RegistryOptions, TableConfig};
pub use record::{key_hash, DigestType, Hash, HashRecord, KeyRange, LeafRecord};

/// Table ownership, snapshots and restore.
pub use registry::Registry;
pub use serializer::ByteFormat;
