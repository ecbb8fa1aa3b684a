#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::admin::{self, StatsReport};
use crate::primitives::concurrency::TableLock;
use crate::primitives::io::{write_atomic, LinkMode};
use crate::storage::compaction::{CompactionCoordinator, Compactor, StoreKind};
use crate::storage::files::CompactionLimits;
use crate::storage::index::{HashList, LongList};
use crate::storage::key_to_path::{bucket_count, KeyToPath, BUCKET_INDEX_FILE};
use crate::storage::kv_store::IndexedStore;
use crate::storage::metrics::{Instrumentation, StoreMetrics};
use crate::storage::options::{EngineConfig, TableConfig};
use crate::storage::record::{Hash, HashRecord, KeyRange, LeafRecord};
use crate::types::{Result, StoreError, TableId};

pub(crate) const TABLE_METADATA_FILE: &str = "table_metadata.json";
const INTERNAL_INDEX_FILE: &str = "internal_index.ll";
const LEAF_INDEX_FILE: &str = "leaf_index.ll";
const HASHES_RAM_FILE: &str = "hashes_ram.hl";
const HASHES_DIR: &str = "hashes";
const LEAVES_DIR: &str = "leaves";
const KEY_TO_PATH_DIR: &str = "key_to_path";
const METADATA_VERSION: u32 = 1;

const STATE_OPEN: u8 = 1;
const STATE_CLOSING: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// Lifecycle of a data source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceState {
    /// Serving reads and writes.
    Open,
    /// Draining compaction and writers.
    Closing,
    /// Resources released.
    Closed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct TableMetadata {
    pub version: u32,
    pub leaf_range: KeyRange,
    pub flush_version: u64,
}

impl TableMetadata {
    pub(crate) fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(TABLE_METADATA_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::Corruption(format!(
                    "table metadata missing at {}",
                    path.display()
                )))
            }
            Err(err) => return Err(err.into()),
        };
        let meta: TableMetadata = serde_json::from_slice(&bytes).map_err(|err| {
            StoreError::Corruption(format!("table metadata {}: {err}", path.display()))
        })?;
        if meta.version != METADATA_VERSION {
            return Err(StoreError::Corruption(format!(
                "unsupported table metadata version {}",
                meta.version
            )));
        }
        Ok(meta)
    }

    fn save(&self, dir: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(&dir.join(TABLE_METADATA_FILE), &bytes)
    }
}

/// Receives close notifications so the owner can forget or delete a table.
pub(crate) trait CloseListener: Send + Sync {
    fn data_source_closed(&self, id: TableId, name: &str, deleted: bool);
}

/// Everything needed to open a data source on a table directory.
pub(crate) struct OpenParams {
    pub name: String,
    pub id: TableId,
    pub dir: PathBuf,
    pub config: TableConfig,
    pub engine: EngineConfig,
    pub create: bool,
    pub transient: bool,
    pub enable_compaction: bool,
    pub pool: Arc<rayon::ThreadPool>,
    pub metrics: Arc<dyn StoreMetrics>,
    pub instrumentation: Arc<Instrumentation>,
    pub listener: Option<Weak<dyn CloseListener>>,
}

type LeafCache = LruCache<Bytes, Option<LeafRecord>>;

struct Inner {
    name: String,
    id: TableId,
    dir: PathBuf,
    config: TableConfig,
    engine: EngineConfig,
    transient: bool,
    state: AtomicU8,
    lock: TableLock,
    leaf_range: RwLock<KeyRange>,
    flush_version: AtomicU64,
    hashes_ram: HashList,
    hashes_disk: IndexedStore,
    leaves: IndexedStore,
    key_to_path: KeyToPath,
    cache: Option<Mutex<LeafCache>>,
    cache_epoch: AtomicU64,
    coordinator: CompactionCoordinator,
    metrics: Arc<dyn StoreMetrics>,
    instrumentation: Arc<Instrumentation>,
    listener: Option<Weak<dyn CloseListener>>,
}

/// One table's hashes and leaves with point reads and atomic bulk writes.
///
/// Handles are cheap to clone and share the same underlying table. One
/// thread writes through [`DataSource::save_records`] at a time while any
/// number of threads read.
#[derive(Clone)]
pub struct DataSource {
    inner: Arc<Inner>,
}

fn take_image(path: &Path, rebuild: bool) -> Result<Option<PathBuf>> {
    if rebuild {
        if path.exists() {
            fs::remove_file(path)?;
        }
        return Ok(None);
    }
    Ok(path.exists().then(|| path.to_path_buf()))
}

fn load_long_list(
    path: &Path,
    rebuild: bool,
    instrumentation: &Arc<Instrumentation>,
) -> Result<Option<LongList>> {
    match take_image(path, rebuild)? {
        Some(image) => {
            let list = LongList::load_from_file(&image, instrumentation.clone())?;
            fs::remove_file(&image)?;
            Ok(Some(list))
        }
        None => Ok(None),
    }
}

fn rebuild_hashes_ram(
    disk: &IndexedStore,
    config: &TableConfig,
    range: KeyRange,
    instrumentation: &Arc<Instrumentation>,
) -> Result<HashList> {
    let list = HashList::new(config.digest.len(), instrumentation.clone());
    let threshold = i64::try_from(config.hashes_ram_to_disk_threshold).unwrap_or(i64::MAX);
    let end = (range.last + 1).max(0).min(threshold);
    for path in 0..end {
        if let Some(payload) = disk.get(path)? {
            let record = HashRecord::decode(&payload, config.digest)?;
            list.put(path as u64, &record.hash)?;
        }
    }
    Ok(list)
}

fn hash_range(range: KeyRange) -> (i64, i64) {
    if range.is_empty() {
        (-1, -1)
    } else {
        (0, range.last)
    }
}

/// Paths of `previous` that fall outside `next`.
fn dropped_paths(previous: KeyRange, next: KeyRange) -> impl Iterator<Item = i64> {
    let empty = 0..=-1;
    let (below, above) = if previous.is_empty() {
        (empty.clone(), empty)
    } else if next.is_empty() {
        (previous.first..=previous.last, empty)
    } else {
        (
            previous.first..=previous.last.min(next.first - 1),
            (next.last + 1).max(previous.first)..=previous.last,
        )
    };
    below.chain(above)
}

fn leaf_index_range(range: KeyRange) -> (i64, i64) {
    if range.is_empty() {
        (-1, -1)
    } else {
        (range.first, range.last)
    }
}

impl DataSource {
    pub(crate) fn open(params: OpenParams) -> Result<Self> {
        let OpenParams {
            name,
            id,
            dir,
            config,
            engine,
            create,
            transient,
            enable_compaction,
            pool,
            metrics,
            instrumentation,
            listener,
        } = params;
        config.validate()?;
        if create {
            fs::create_dir_all(&dir)?;
            if !dir.join(TABLE_METADATA_FILE).exists() {
                TableMetadata {
                    version: METADATA_VERSION,
                    leaf_range: KeyRange::EMPTY,
                    flush_version: 0,
                }
                .save(&dir)?;
            }
        }
        let meta = TableMetadata::load(&dir)?;
        let rebuild = engine.index_rebuild_enforced;
        let retries = engine.read_retries;

        let hashes_disk = IndexedStore::open(
            &dir.join(HASHES_DIR),
            StoreKind::Hashes.as_str(),
            load_long_list(&dir.join(INTERNAL_INDEX_FILE), rebuild, &instrumentation)?,
            hash_range(meta.leaf_range),
            retries,
            instrumentation.clone(),
        )?;
        let hashes_ram = match take_image(&dir.join(HASHES_RAM_FILE), rebuild)? {
            Some(image) => {
                let list =
                    HashList::load_from_file(&image, config.digest.len(), instrumentation.clone())?;
                fs::remove_file(&image)?;
                list
            }
            None => rebuild_hashes_ram(&hashes_disk, &config, meta.leaf_range, &instrumentation)?,
        };
        let leaves = IndexedStore::open(
            &dir.join(LEAVES_DIR),
            StoreKind::PathToKeyValue.as_str(),
            load_long_list(&dir.join(LEAF_INDEX_FILE), rebuild, &instrumentation)?,
            leaf_index_range(meta.leaf_range),
            retries,
            instrumentation.clone(),
        )?;
        let ktp_dir = dir.join(KEY_TO_PATH_DIR);
        fs::create_dir_all(&ktp_dir)?;
        let key_to_path = KeyToPath::open(
            &ktp_dir,
            bucket_count(config.max_keys),
            load_long_list(&ktp_dir.join(BUCKET_INDEX_FILE), rebuild, &instrumentation)?,
            retries,
            instrumentation.clone(),
        )?;

        let lock = TableLock::new();
        let limits = CompactionLimits {
            min_files: engine.min_files_to_compact,
            max_files: engine.max_files_to_compact,
            check_interval: engine.compaction_check_interval,
        };
        let mut compactors: HashMap<StoreKind, Arc<dyn Compactor>> = HashMap::new();
        compactors.insert(
            StoreKind::KeyToPath,
            Arc::new(key_to_path.compactor(lock.clone(), limits, metrics.clone())),
        );
        compactors.insert(
            StoreKind::Hashes,
            Arc::new(hashes_disk.compactor(lock.clone(), limits, metrics.clone())),
        );
        compactors.insert(
            StoreKind::PathToKeyValue,
            Arc::new(leaves.compactor(lock.clone(), limits, metrics.clone())),
        );
        let coordinator = CompactionCoordinator::new(
            format!("{name}-{id}"),
            compactors,
            pool,
            metrics.clone(),
            enable_compaction,
        );
        let cache = NonZeroUsize::new(engine.leaf_cache_capacity)
            .map(|cap| Mutex::new(LruCache::new(cap)));

        instrumentation.data_source_opened();
        info!(
            table = %name,
            id = id.0,
            first_leaf_path = meta.leaf_range.first,
            last_leaf_path = meta.leaf_range.last,
            flush_version = meta.flush_version,
            transient,
            "data_source.opened"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                name,
                id,
                dir,
                config,
                engine,
                transient,
                state: AtomicU8::new(STATE_OPEN),
                lock,
                leaf_range: RwLock::new(meta.leaf_range),
                flush_version: AtomicU64::new(meta.flush_version),
                hashes_ram,
                hashes_disk,
                leaves,
                key_to_path,
                cache,
                cache_epoch: AtomicU64::new(0),
                coordinator,
                metrics,
                instrumentation,
                listener,
            }),
        })
    }

    /// Table name.
    pub fn table_name(&self) -> &str {
        &self.inner.name
    }

    /// Numeric table id assigned by the registry.
    pub fn table_id(&self) -> TableId {
        self.inner.id
    }

    /// Immutable table configuration.
    pub fn table_config(&self) -> &TableConfig {
        &self.inner.config
    }

    /// Directory holding this table's files.
    pub fn storage_dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Whether the table directory is deleted on close.
    pub fn is_transient(&self) -> bool {
        self.inner.transient
    }

    /// Current leaf range.
    pub fn leaf_range(&self) -> KeyRange {
        *self.inner.leaf_range.read()
    }

    /// First leaf path, or -1 when there are no leaves.
    pub fn first_leaf_path(&self) -> i64 {
        self.leaf_range().first
    }

    /// Last leaf path, or -1 when there are no leaves.
    pub fn last_leaf_path(&self) -> i64 {
        self.leaf_range().last
    }

    /// Number of `save_records` batches applied over the table's life.
    pub fn flush_version(&self) -> u64 {
        self.inner.flush_version.load(Ordering::Acquire)
    }

    /// Lifecycle state.
    pub fn state(&self) -> DataSourceState {
        match self.inner.state.load(Ordering::Acquire) {
            STATE_OPEN => DataSourceState::Open,
            STATE_CLOSING => DataSourceState::Closing,
            _ => DataSourceState::Closed,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.state.load(Ordering::Acquire) == STATE_OPEN {
            Ok(())
        } else {
            Err(StoreError::closed(&self.inner.name))
        }
    }

    /// Applies one batch of hash and leaf changes.
    ///
    /// `first_leaf_path` and `last_leaf_path` give the leaf range after the
    /// batch; `-1/-1` removes every leaf and ignores any hash records. Hashes
    /// may target any path up to `last_leaf_path`. Leaves must lie in the new
    /// range. A deleted leaf only loses its key mapping if that mapping still
    /// points at the deleted path and was written by an earlier batch, so a
    /// key updated in the same batch keeps its new location. Keys of leaves
    /// left behind when the range shrinks are unmapped the same way.
    ///
    /// All three flush files are sealed before anything is published. A
    /// batch that fails leaves the data source as it was.
    ///
    /// Blocks while a snapshot of this data source is running.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidArgument`] for malformed input,
    /// [`StoreError::IllegalState`] when closed or when another writer is
    /// active, and I/O errors from the stores.
    pub fn save_records<I, L, D>(
        &self,
        first_leaf_path: i64,
        last_leaf_path: i64,
        internal_records: I,
        leaf_records: L,
        deleted_leaf_records: D,
    ) -> Result<()>
    where
        I: IntoIterator<Item = HashRecord>,
        L: IntoIterator<Item = LeafRecord>,
        D: IntoIterator<Item = LeafRecord>,
    {
        self.ensure_open()?;
        let range = KeyRange::new(first_leaf_path, last_leaf_path)?;
        let mut hashes: Vec<HashRecord> = internal_records.into_iter().collect();
        let mut leaves: Vec<LeafRecord> = leaf_records.into_iter().collect();
        let deleted: Vec<LeafRecord> = deleted_leaf_records.into_iter().collect();
        if range.is_empty() && !hashes.is_empty() {
            debug!(
                table = %self.inner.name,
                hashes = hashes.len(),
                "data_source.hashes_ignored"
            );
            hashes.clear();
        }
        leaves.sort_by_key(|leaf| leaf.path);
        self.validate_batch(range, &hashes, &leaves, &deleted)?;

        let _writer = self.inner.lock.acquire_writer()?;
        self.ensure_open()?;
        let started = Instant::now();
        let version = self.flush_version() + 1;
        let previous = self.leaf_range();

        let staged = thread::scope(|scope| -> Result<Vec<LeafRecord>> {
            let hash_task = scope.spawn(|| self.stage_hashes(&hashes));
            let leaf_result = self.stage_leaves(previous, range, &leaves, &deleted, version);
            let hash_result = hash_task
                .join()
                .map_err(|_| StoreError::IllegalState("hash writer panicked".into()))
                .and_then(|staged| staged);
            hash_result.and(leaf_result)
        });
        let dropped = match staged {
            Ok(dropped) => dropped,
            Err(err) => {
                self.discard_staged();
                return Err(err);
            }
        };
        self.publish_staged(range, &hashes)?;

        self.inner.flush_version.store(version, Ordering::Release);
        *self.inner.leaf_range.write() = range;
        TableMetadata {
            version: METADATA_VERSION,
            leaf_range: range,
            flush_version: version,
        }
        .save(&self.inner.dir)?;
        self.invalidate_cache(leaves.iter().chain(deleted.iter()).chain(dropped.iter()));

        if self.inner.engine.compact_after_flush {
            self.inner.coordinator.compact_all_async();
        }
        self.inner.metrics.flush(
            hashes.len() as u64,
            leaves.len() as u64,
            deleted.len() as u64,
        );
        debug!(
            table = %self.inner.name,
            version,
            first_leaf_path,
            last_leaf_path,
            hashes = hashes.len(),
            leaves = leaves.len(),
            deleted = deleted.len(),
            dropped = dropped.len(),
            millis = started.elapsed().as_millis() as u64,
            "data_source.save_records"
        );
        Ok(())
    }

    fn validate_batch(
        &self,
        range: KeyRange,
        hashes: &[HashRecord],
        leaves: &[LeafRecord],
        deleted: &[LeafRecord],
    ) -> Result<()> {
        let digest_len = self.inner.config.digest.len();
        for record in hashes {
            if record.path < 0 {
                return Err(StoreError::invalid_path(record.path));
            }
            if record.path > range.last {
                return Err(StoreError::InvalidArgument(format!(
                    "hash path {} beyond last leaf path {}",
                    record.path, range.last
                )));
            }
            if record.hash.len() != digest_len {
                return Err(StoreError::InvalidArgument(format!(
                    "hash at {} has {} bytes, digest needs {digest_len}",
                    record.path,
                    record.hash.len()
                )));
            }
        }
        let key_format = self.inner.config.key_format;
        let value_format = self.inner.config.value_format;
        let mut previous = None;
        for leaf in leaves {
            if !range.contains(leaf.path) {
                return Err(StoreError::InvalidArgument(format!(
                    "leaf path {} outside leaf range [{}, {}]",
                    leaf.path, range.first, range.last
                )));
            }
            if previous == Some(leaf.path) {
                return Err(StoreError::InvalidArgument(format!(
                    "leaf path {} written twice in one batch",
                    leaf.path
                )));
            }
            previous = Some(leaf.path);
            key_format.validate(&leaf.key)?;
            value_format.validate(&leaf.value)?;
        }
        for leaf in deleted {
            if leaf.path < 0 {
                return Err(StoreError::invalid_path(leaf.path));
            }
            key_format.validate(&leaf.key)?;
        }
        Ok(())
    }

    /// Appends every hash to a sealed, unpublished disk flush. Hashes below
    /// the RAM threshold go to disk too, so a crash before the next close can
    /// rebuild the RAM list from the files.
    fn stage_hashes(&self, hashes: &[HashRecord]) -> Result<()> {
        let inner = &self.inner;
        if hashes.is_empty() {
            return Ok(());
        }
        inner.hashes_disk.start_writing()?;
        let mut buf = Vec::with_capacity(8 + inner.config.digest.len());
        for record in hashes {
            buf.clear();
            record.encode(&mut buf);
            inner.hashes_disk.put(record.path, &buf)?;
        }
        inner.hashes_disk.seal()
    }

    /// Appends leaves and removal markers, then seals the leaf and key→path
    /// flushes. Returns the leaves left behind by a shrinking range.
    fn stage_leaves(
        &self,
        previous: KeyRange,
        range: KeyRange,
        leaves: &[LeafRecord],
        deleted: &[LeafRecord],
        version: u64,
    ) -> Result<Vec<LeafRecord>> {
        let inner = &self.inner;
        let written_paths: HashSet<i64> = leaves.iter().map(|leaf| leaf.path).collect();
        let mut dropped = Vec::new();
        for path in dropped_paths(previous, range) {
            if written_paths.contains(&path) {
                continue;
            }
            if let Some(current) = self.read_leaf(path)? {
                dropped.push(current);
            }
        }
        if leaves.is_empty() && deleted.is_empty() && dropped.is_empty() {
            return Ok(dropped);
        }

        inner.leaves.start_writing()?;
        inner.key_to_path.start_writing()?;
        let mut buf = Vec::new();
        for leaf in leaves {
            buf.clear();
            leaf.encode(inner.config.key_format, inner.config.value_format, &mut buf)?;
            inner.leaves.put(leaf.path, &buf)?;
            inner
                .key_to_path
                .put(leaf.key.clone(), leaf.key_hash(), leaf.path, version);
        }
        for leaf in deleted {
            inner
                .key_to_path
                .delete_if(leaf.key.clone(), leaf.key_hash(), leaf.path, version);
            if written_paths.contains(&leaf.path) {
                continue;
            }
            if let Some(current) = self.read_leaf(leaf.path)? {
                if current.key == leaf.key {
                    inner.leaves.remove(leaf.path)?;
                }
            }
        }
        for leaf in &dropped {
            inner
                .key_to_path
                .delete_if(leaf.key.clone(), leaf.key_hash(), leaf.path, version);
        }
        inner.leaves.seal()?;
        inner.key_to_path.seal()?;
        Ok(dropped)
    }

    /// Narrows the valid ranges and makes every sealed flush visible.
    fn publish_staged(&self, range: KeyRange, hashes: &[HashRecord]) -> Result<()> {
        let inner = &self.inner;
        let (min, max) = hash_range(range);
        inner.hashes_disk.update_valid_range(min, max)?;
        inner.hashes_disk.publish()?;
        inner.hashes_ram.truncate((range.last + 1).max(0) as u64);
        let threshold = inner.config.hashes_ram_to_disk_threshold;
        for record in hashes.iter().filter(|r| (r.path as u64) < threshold) {
            inner.hashes_ram.put(record.path as u64, &record.hash)?;
        }
        let (min, max) = leaf_index_range(range);
        inner.leaves.update_valid_range(min, max)?;
        inner.leaves.publish()?;
        inner.key_to_path.publish()
    }

    /// Throws away open or sealed flushes of a failed batch.
    fn discard_staged(&self) {
        self.inner.hashes_disk.abort_writing();
        self.inner.leaves.abort_writing();
        self.inner.key_to_path.abort_writing();
    }

    fn invalidate_cache<'a>(&self, touched: impl Iterator<Item = &'a LeafRecord>) {
        let Some(cache) = &self.inner.cache else {
            return;
        };
        let mut cache = cache.lock();
        for leaf in touched {
            cache.pop(&leaf.key);
        }
        self.inner.cache_epoch.fetch_add(1, Ordering::AcqRel);
    }

    fn read_leaf(&self, path: i64) -> Result<Option<LeafRecord>> {
        let Some(payload) = self.inner.leaves.get(path)? else {
            return Ok(None);
        };
        let record = LeafRecord::decode(
            &payload,
            self.inner.config.key_format,
            self.inner.config.value_format,
        )?;
        if record.path != path {
            return Err(StoreError::Corruption(format!(
                "leaf stored for path {path} claims path {}",
                record.path
            )));
        }
        Ok(Some(record))
    }

    /// Returns the hash stored at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidArgument`] for a negative path.
    pub fn load_hash(&self, path: i64) -> Result<Option<Hash>> {
        self.ensure_open()?;
        if path < 0 {
            return Err(StoreError::invalid_path(path));
        }
        if path > self.last_leaf_path() {
            return Ok(None);
        }
        self.inner.metrics.hash_read();
        if (path as u64) < self.inner.config.hashes_ram_to_disk_threshold {
            return Ok(self.inner.hashes_ram.get(path as u64));
        }
        let Some(payload) = self.inner.hashes_disk.get(path)? else {
            return Ok(None);
        };
        let record = HashRecord::decode(&payload, self.inner.config.digest)?;
        if record.path != path {
            return Err(StoreError::Corruption(format!(
                "hash stored for path {path} claims path {}",
                record.path
            )));
        }
        Ok(Some(record.hash))
    }

    /// Returns the leaf at `path`, or `None` outside the leaf range.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidArgument`] for a negative path.
    pub fn load_leaf_record(&self, path: i64) -> Result<Option<LeafRecord>> {
        self.ensure_open()?;
        if path < 0 {
            return Err(StoreError::invalid_path(path));
        }
        if !self.leaf_range().contains(path) {
            return Ok(None);
        }
        self.inner.metrics.leaf_read(false, false);
        self.read_leaf(path)
    }

    /// Returns the leaf holding `key`. `key_hash` must be
    /// [`crate::storage::record::key_hash`] of `key`.
    pub fn load_leaf_record_by_key(&self, key: &[u8], key_hash: u64) -> Result<Option<LeafRecord>> {
        self.ensure_open()?;
        let epoch = self.inner.cache_epoch.load(Ordering::Acquire);
        if let Some(cache) = &self.inner.cache {
            if let Some(hit) = cache.lock().get(key) {
                self.inner.metrics.leaf_read(true, true);
                let range = self.leaf_range();
                return Ok(hit.clone().filter(|record| range.contains(record.path)));
            }
        }
        self.inner.metrics.leaf_read(true, false);
        let record = match self.find_key(key, key_hash)? {
            Some(path) => self
                .read_leaf(path)?
                .filter(|record| record.key.as_ref() == key),
            None => None,
        };
        if let Some(cache) = &self.inner.cache {
            let mut cache = cache.lock();
            if self.inner.cache_epoch.load(Ordering::Acquire) == epoch {
                cache.put(Bytes::copy_from_slice(key), record.clone());
            }
        }
        Ok(record)
    }

    /// Path currently holding `key`, if it lies in the leaf range.
    pub fn find_key(&self, key: &[u8], key_hash: u64) -> Result<Option<i64>> {
        self.ensure_open()?;
        let found = self.inner.key_to_path.get(key, key_hash)?;
        Ok(found
            .map(|(path, _)| path)
            .filter(|path| self.leaf_range().contains(*path)))
    }

    /// Calls `f` with every key→path entry.
    pub(crate) fn for_each_key_entry(&self, f: impl FnMut(&[u8], i64) -> Result<()>) -> Result<()> {
        self.ensure_open()?;
        self.inner.key_to_path.for_each_entry(f)
    }

    /// Whether background compaction accepts new requests.
    pub fn is_compaction_enabled(&self) -> bool {
        self.inner.coordinator.is_compaction_enabled()
    }

    /// Accepts background compaction requests again.
    pub fn enable_background_compaction(&self) {
        self.inner.coordinator.enable_background_compaction();
    }

    /// Stops background compaction, cancelling and awaiting running merges.
    pub fn stop_and_disable_background_compaction(&self) {
        self.inner.coordinator.stop_and_disable_background_compaction();
    }

    /// Queues compaction of one store. Returns `false` if the request was discarded.
    pub fn compact_async(&self, store: StoreKind) -> bool {
        self.ensure_open().is_ok() && self.inner.coordinator.compact_async(store)
    }

    /// Queues compaction of every store; returns how many requests were accepted.
    pub fn compact_now(&self) -> usize {
        if self.ensure_open().is_err() {
            return 0;
        }
        self.inner.coordinator.compact_all_async()
    }

    /// Whether `store` is compacting right now.
    pub fn is_compacting(&self, store: StoreKind) -> bool {
        self.inner.coordinator.is_compacting(store)
    }

    /// Blocks until no compaction of this data source is running.
    pub fn wait_for_compaction(&self) {
        self.inner.coordinator.await_idle();
    }

    /// Sealed file count and bytes of one store.
    pub fn store_files(&self, store: StoreKind) -> (usize, u64) {
        let store = match store {
            StoreKind::KeyToPath => self.inner.key_to_path.store(),
            StoreKind::Hashes => &self.inner.hashes_disk,
            StoreKind::PathToKeyValue => &self.inner.leaves,
        };
        (store.file_count(), store.total_bytes())
    }

    /// Size and state report; also pushes the per-store file figures to the metrics sink.
    pub fn stats(&self) -> StatsReport {
        let report = admin::stats(self);
        for store in &report.stores {
            self.inner
                .metrics
                .store_files(store.store, store.files as u64, store.bytes);
        }
        report
    }

    /// Bytes held by this data source's in-memory indexes.
    pub fn index_bytes(&self) -> usize {
        self.inner.hashes_ram.memory_bytes()
            + self.inner.hashes_disk.index_bytes()
            + self.inner.leaves.index_bytes()
            + self.inner.key_to_path.store().index_bytes()
    }

    /// Writes a consistent image of this table into `target`, which must not exist yet.
    ///
    /// Holds the table lock exclusively: the writer and compaction swaps wait
    /// until the image is complete.
    pub(crate) fn snapshot_into(&self, target: &Path, mode: LinkMode) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.inner.lock.try_acquire_snapshot()?;
        self.ensure_open()?;
        if target.exists() {
            return Err(StoreError::IllegalState(format!(
                "snapshot target {} already exists",
                target.display()
            )));
        }
        let started = Instant::now();
        fs::create_dir_all(target)?;
        let written = self.write_image(target, mode);
        if let Err(err) = written {
            if let Err(cleanup) = fs::remove_dir_all(target) {
                warn!(error = %cleanup, target = %target.display(), "data_source.snapshot.cleanup_failed");
            }
            return Err(err);
        }
        info!(
            table = %self.inner.name,
            target = %target.display(),
            millis = started.elapsed().as_millis() as u64,
            "data_source.snapshot.completed"
        );
        Ok(())
    }

    fn write_image(&self, target: &Path, mode: LinkMode) -> Result<()> {
        let inner = &self.inner;
        thread::scope(|scope| -> Result<()> {
            let tasks = [
                scope.spawn(move || {
                    inner.leaves.snapshot(
                        &target.join(LEAVES_DIR),
                        &target.join(LEAF_INDEX_FILE),
                        mode,
                    )
                }),
                scope.spawn(move || {
                    inner.hashes_disk.snapshot(
                        &target.join(HASHES_DIR),
                        &target.join(INTERNAL_INDEX_FILE),
                        mode,
                    )?;
                    inner.hashes_ram.write_to_file(&target.join(HASHES_RAM_FILE))
                }),
                scope.spawn(move || inner.key_to_path.snapshot(&target.join(KEY_TO_PATH_DIR), mode)),
            ];
            let mut outcome = TableMetadata {
                version: METADATA_VERSION,
                leaf_range: *inner.leaf_range.read(),
                flush_version: inner.flush_version.load(Ordering::Acquire),
            }
            .save(target);
            for task in tasks {
                let result = task
                    .join()
                    .map_err(|_| StoreError::IllegalState("snapshot task panicked".into()))
                    .and_then(|r| r);
                if outcome.is_ok() {
                    outcome = result;
                }
            }
            outcome
        })
    }

    /// Closes the data source, keeping its files unless it is a transient copy.
    ///
    /// Stops compaction and waits for in-flight work, saves the index images,
    /// and releases index memory. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        self.inner.close(false)
    }

    /// Closes the data source and deletes its files and registry entry.
    pub fn close_and_delete(&self) -> Result<()> {
        self.inner.close(true)
    }
}

impl Inner {
    fn close(&self, delete: bool) -> Result<()> {
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        self.coordinator.stop_and_disable_background_compaction();
        let exclusive = self.lock.acquire_exclusive();
        let keep = !self.transient && !delete;
        let saved = if keep { self.save_images() } else { Ok(()) };

        self.hashes_disk.close();
        self.leaves.close();
        self.key_to_path.close();
        self.hashes_ram.release();
        if let Some(cache) = &self.cache {
            cache.lock().clear();
        }
        if !keep {
            if let Err(err) = fs::remove_dir_all(&self.dir) {
                warn!(table = %self.name, error = %err, "data_source.delete_failed");
            }
        }
        self.state.store(STATE_CLOSED, Ordering::Release);
        drop(exclusive);
        self.instrumentation.data_source_closed();
        if let Some(listener) = self.listener.as_ref().and_then(Weak::upgrade) {
            listener.data_source_closed(self.id, &self.name, !keep);
        }
        info!(table = %self.name, id = self.id.0, deleted = !keep, "data_source.closed");
        saved
    }

    fn save_images(&self) -> Result<()> {
        self.hashes_disk.save_index(&self.dir.join(INTERNAL_INDEX_FILE))?;
        self.leaves.save_index(&self.dir.join(LEAF_INDEX_FILE))?;
        self.key_to_path.save_index(&self.dir.join(KEY_TO_PATH_DIR))?;
        self.hashes_ram.write_to_file(&self.dir.join(HASHES_RAM_FILE))?;
        TableMetadata {
            version: METADATA_VERSION,
            leaf_range: *self.leaf_range.read(),
            flush_version: self.flush_version.load(Ordering::Acquire),
        }
        .save(&self.dir)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Err(err) = self.close(false) {
            warn!(table = %self.name, error = %err, "data_source.drop_close_failed");
        }
    }
}
