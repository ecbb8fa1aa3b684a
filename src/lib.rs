//! Durable storage engine for sparse binary Merkle trees.
//!
//! Open a [`Registry`] on a storage root, create or open a [`DataSource`] per
//! table, and write hashes and leaves in batches with
//! [`DataSource::save_records`]. Reads go straight to the append-only data
//! files through in-memory indexes while compaction runs in the background.

#![warn(missing_docs)]

pub mod admin;
pub mod primitives;
pub mod storage;
pub mod types;

pub use admin::{ValidationReport, Validator};
pub use storage::{
    key_hash, ByteFormat, DataSource, DigestType, EngineConfig, Hash, HashRecord, KeyRange,
    LeafRecord, Registry, RegistryOptions, StoreKind, TableConfig,
};
pub use types::{Result, StoreError, TableId};
