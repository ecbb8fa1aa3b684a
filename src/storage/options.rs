use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use crate::primitives::io::LinkMode;
use crate::storage::metrics::{default_metrics, Instrumentation, StoreMetrics};
use crate::storage::record::DigestType;
use crate::storage::serializer::ByteFormat;
use crate::types::{Result, StoreError};

/// Engine-wide tuning shared by every table of a registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads in the shared compaction pool.
    pub compaction_threads: usize,
    /// Fewest completed files a store needs before it is compacted.
    pub min_files_to_compact: usize,
    /// Most files merged by one compaction.
    pub max_files_to_compact: usize,
    /// Items copied between cancellation checks.
    pub compaction_check_interval: usize,
    /// Entries kept in each data source's leaf record cache. Zero disables it.
    pub leaf_cache_capacity: usize,
    /// Attempts made when a read races a compaction that removed its file.
    pub read_retries: usize,
    /// Ignore saved index images on open and rebuild from data files.
    pub index_rebuild_enforced: bool,
    /// Queue compaction of every touched store after each flush.
    pub compact_after_flush: bool,
    /// How snapshots and copies materialise files.
    pub link_mode: LinkMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            compaction_threads: 3,
            min_files_to_compact: 2,
            max_files_to_compact: 64,
            compaction_check_interval: 1024,
            leaf_cache_capacity: 65_536,
            read_retries: 5,
            index_rebuild_enforced: false,
            compact_after_flush: true,
            link_mode: LinkMode::Auto,
        }
    }
}

impl EngineConfig {
    /// Parses a TOML document; omitted keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] for malformed TOML and
    /// [`StoreError::InvalidArgument`] for out-of-range values.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let cfg: EngineConfig = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Loads a TOML file.
    ///
    /// # Errors
    ///
    /// As [`EngineConfig::from_toml_str`], plus I/O errors reading the file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.compaction_threads == 0 {
            return Err(StoreError::InvalidArgument(
                "compaction_threads must be at least 1".into(),
            ));
        }
        if self.min_files_to_compact == 0 || self.max_files_to_compact < self.min_files_to_compact
        {
            return Err(StoreError::InvalidArgument(format!(
                "invalid compaction file bounds [{}, {}]",
                self.min_files_to_compact, self.max_files_to_compact
            )));
        }
        if self.read_retries == 0 || self.compaction_check_interval == 0 {
            return Err(StoreError::InvalidArgument(
                "read_retries and compaction_check_interval must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Sets the compaction pool size.
    pub fn compaction_threads(mut self, threads: usize) -> Self {
        self.compaction_threads = threads;
        self
    }

    /// Sets the minimum number of files worth compacting.
    pub fn min_files_to_compact(mut self, files: usize) -> Self {
        self.min_files_to_compact = files;
        self
    }

    /// Sets the maximum number of files merged at once.
    pub fn max_files_to_compact(mut self, files: usize) -> Self {
        self.max_files_to_compact = files;
        self
    }

    /// Sets how many items are copied between cancellation checks.
    pub fn compaction_check_interval(mut self, items: usize) -> Self {
        self.compaction_check_interval = items;
        self
    }

    /// Sets the leaf cache capacity.
    pub fn leaf_cache_capacity(mut self, entries: usize) -> Self {
        self.leaf_cache_capacity = entries;
        self
    }

    /// Sets how many times a read retries after a concurrent file swap.
    pub fn read_retries(mut self, retries: usize) -> Self {
        self.read_retries = retries;
        self
    }

    /// Forces index rebuilds on open.
    pub fn index_rebuild_enforced(mut self, enforced: bool) -> Self {
        self.index_rebuild_enforced = enforced;
        self
    }

    /// Enables or disables compaction after each flush.
    pub fn compact_after_flush(mut self, enabled: bool) -> Self {
        self.compact_after_flush = enabled;
        self
    }

    /// Sets the link mode for snapshots and copies.
    pub fn link_mode(mut self, mode: LinkMode) -> Self {
        self.link_mode = mode;
        self
    }
}

/// Per-table settings, fixed when the table is created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Digest algorithm of every stored hash.
    pub digest: DigestType,
    /// Expected maximum number of keys; sizes the key→path bucket table.
    pub max_keys: u64,
    /// Hashes at paths below this stay in RAM; the rest go to disk.
    pub hashes_ram_to_disk_threshold: u64,
    /// Key encoding.
    pub key_format: ByteFormat,
    /// Value encoding.
    pub value_format: ByteFormat,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            digest: DigestType::Sha384,
            max_keys: 1 << 20,
            hashes_ram_to_disk_threshold: 1 << 16,
            key_format: ByteFormat::Variable,
            value_format: ByteFormat::Variable,
        }
    }
}

impl TableConfig {
    /// Sets the digest type.
    pub fn digest(mut self, digest: DigestType) -> Self {
        self.digest = digest;
        self
    }

    /// Sets the expected maximum key count.
    pub fn max_keys(mut self, max_keys: u64) -> Self {
        self.max_keys = max_keys;
        self
    }

    /// Sets the RAM/disk hash threshold.
    pub fn hashes_ram_to_disk_threshold(mut self, threshold: u64) -> Self {
        self.hashes_ram_to_disk_threshold = threshold;
        self
    }

    /// Sets the key format.
    pub fn key_format(mut self, format: ByteFormat) -> Self {
        self.key_format = format;
        self
    }

    /// Sets the value format.
    pub fn value_format(mut self, format: ByteFormat) -> Self {
        self.value_format = format;
        self
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.max_keys == 0 {
            return Err(StoreError::InvalidArgument("max_keys must be positive".into()));
        }
        if let ByteFormat::Fixed { size: 0 } = self.key_format {
            return Err(StoreError::InvalidArgument(
                "fixed key format needs a non-zero size".into(),
            ));
        }
        Ok(())
    }
}

/// Options supplied when opening a registry.
#[derive(Clone)]
pub struct RegistryOptions {
    /// Engine tuning.
    pub config: EngineConfig,
    /// Metrics sink shared by every data source.
    pub metrics: Arc<dyn StoreMetrics>,
    /// Open-source and index-memory counters.
    pub instrumentation: Arc<Instrumentation>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            metrics: default_metrics(),
            instrumentation: Arc::new(Instrumentation::default()),
        }
    }
}

impl RegistryOptions {
    /// Sets the engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the metrics sink.
    pub fn metrics(mut self, metrics: Arc<dyn StoreMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Shares instrumentation counters, for example across registries in one test.
    pub fn instrumentation(mut self, instrumentation: Arc<Instrumentation>) -> Self {
        self.instrumentation = instrumentation;
        self
    }
}
