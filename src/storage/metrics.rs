use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Trait for observing reads, flushes and compactions of the storage engine.
///
/// Implementations receive named events only. Exporting them to a metrics
/// backend is left to the embedding application.
pub trait StoreMetrics: Send + Sync {
    /// Records a hash read.
    fn hash_read(&self);

    /// Records a leaf read.
    ///
    /// # Parameters
    /// * `by_key` - Whether the lookup went through the key→path index.
    /// * `cached` - Whether the result was served from the leaf cache.
    fn leaf_read(&self, by_key: bool, cached: bool);

    /// Records one `save_records` batch.
    fn flush(&self, hashes: u64, leaves: u64, deleted: u64);

    /// Records a finished compaction.
    ///
    /// # Parameters
    /// * `store` - Store name, one of `key_to_path`, `hashes` or `leaves`.
    /// * `millis` - Wall-clock duration.
    /// * `files_merged` - Source files consumed.
    fn compaction_finished(&self, store: &'static str, millis: u64, files_merged: u64);

    /// Records a compaction that failed or panicked.
    fn compaction_failed(&self, store: &'static str);

    /// Records a compaction interrupted by its cancellation token.
    fn compaction_cancelled(&self, store: &'static str);

    /// Reports the current file count and size of a store.
    fn store_files(&self, store: &'static str, files: u64, bytes: u64);
}

/// A no-op implementation of [`StoreMetrics`] that discards all events.
#[derive(Default)]
pub struct NoopMetrics;

impl StoreMetrics for NoopMetrics {
    fn hash_read(&self) {}
    fn leaf_read(&self, _by_key: bool, _cached: bool) {}
    fn flush(&self, _hashes: u64, _leaves: u64, _deleted: u64) {}
    fn compaction_finished(&self, _store: &'static str, _millis: u64, _files_merged: u64) {}
    fn compaction_failed(&self, _store: &'static str) {}
    fn compaction_cancelled(&self, _store: &'static str) {}
    fn store_files(&self, _store: &'static str, _files: u64, _bytes: u64) {}
}

/// A thread-safe counter-based implementation of [`StoreMetrics`].
#[derive(Default)]
pub struct CounterMetrics {
    /// Hash reads.
    pub hash_reads: AtomicU64,
    /// Leaf reads by path.
    pub leaf_reads_by_path: AtomicU64,
    /// Leaf reads by key.
    pub leaf_reads_by_key: AtomicU64,
    /// Leaf reads served from cache.
    pub leaf_cache_hits: AtomicU64,
    /// `save_records` batches.
    pub flushes: AtomicU64,
    /// Hashes written.
    pub hashes_written: AtomicU64,
    /// Leaves written.
    pub leaves_written: AtomicU64,
    /// Leaves deleted.
    pub leaves_deleted: AtomicU64,
    /// Successful compactions.
    pub compactions: AtomicU64,
    /// Failed compactions.
    pub compaction_failures: AtomicU64,
    /// Compactions stopped by cancellation.
    pub compaction_cancellations: AtomicU64,
    /// Files consumed by compactions.
    pub files_merged: AtomicU64,
    /// Accumulated compaction time.
    pub compaction_millis: AtomicU64,
}

impl StoreMetrics for CounterMetrics {
    fn hash_read(&self) {
        self.hash_reads.fetch_add(1, Ordering::Relaxed);
    }

    fn leaf_read(&self, by_key: bool, cached: bool) {
        if by_key {
            self.leaf_reads_by_key.fetch_add(1, Ordering::Relaxed);
        } else {
            self.leaf_reads_by_path.fetch_add(1, Ordering::Relaxed);
        }
        if cached {
            self.leaf_cache_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn flush(&self, hashes: u64, leaves: u64, deleted: u64) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.hashes_written.fetch_add(hashes, Ordering::Relaxed);
        self.leaves_written.fetch_add(leaves, Ordering::Relaxed);
        self.leaves_deleted.fetch_add(deleted, Ordering::Relaxed);
    }

    fn compaction_finished(&self, _store: &'static str, millis: u64, files_merged: u64) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
        self.compaction_millis.fetch_add(millis, Ordering::Relaxed);
        self.files_merged.fetch_add(files_merged, Ordering::Relaxed);
    }

    fn compaction_failed(&self, _store: &'static str) {
        self.compaction_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn compaction_cancelled(&self, _store: &'static str) {
        self.compaction_cancellations.fetch_add(1, Ordering::Relaxed);
    }

    fn store_files(&self, _store: &'static str, _files: u64, _bytes: u64) {}
}

/// Returns the default metrics implementation wrapped in an [`Arc`].
pub fn default_metrics() -> Arc<dyn StoreMetrics> {
    Arc::new(NoopMetrics)
}

/// Process-level counters injected into a registry instead of living in globals.
///
/// Both counters return to their starting values once every data source
/// opened through the owning registries has been closed.
#[derive(Default, Debug)]
pub struct Instrumentation {
    open_data_sources: AtomicI64,
    index_bytes: AtomicI64,
}

impl Instrumentation {
    /// Creates zeroed counters.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Data sources currently open.
    pub fn open_data_sources(&self) -> i64 {
        self.open_data_sources.load(Ordering::Acquire)
    }

    /// Bytes currently allocated by in-memory indexes.
    pub fn index_bytes(&self) -> i64 {
        self.index_bytes.load(Ordering::Acquire)
    }

    pub(crate) fn data_source_opened(&self) {
        self.open_data_sources.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn data_source_closed(&self) {
        self.open_data_sources.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn index_allocated(&self, bytes: usize) {
        self.index_bytes.fetch_add(bytes as i64, Ordering::AcqRel);
    }

    pub(crate) fn index_released(&self, bytes: usize) {
        self.index_bytes.fetch_sub(bytes as i64, Ordering::AcqRel);
    }
}
