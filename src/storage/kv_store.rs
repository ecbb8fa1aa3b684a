#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::primitives::concurrency::TableLock;
use crate::primitives::io::LinkMode;
use crate::storage::files::{CompactionLimits, DataFileCollection, FileCompactor};
use crate::storage::index::LongList;
use crate::storage::metrics::{Instrumentation, StoreMetrics};
use crate::types::{Result, StoreError};

/// Leading key of a stored item: every item starts with its path or bucket id.
pub(crate) fn item_key(payload: &[u8]) -> Result<i64> {
    payload
        .get(..8)
        .and_then(|raw| raw.try_into().ok())
        .map(i64::from_le_bytes)
        .ok_or_else(|| StoreError::Corruption("data item shorter than its key".into()))
}

/// A removal is persisted as an item holding nothing but its key. Every
/// stored record carries a body after the key, so the two never collide.
const TOMBSTONE_LEN: usize = 8;

pub(crate) fn is_tombstone(payload: &[u8]) -> bool {
    payload.len() == TOMBSTONE_LEN
}

/// Append-only store of items addressed by a dense `i64` key.
///
/// A flush goes through two steps. [`IndexedStore::seal`] fsyncs the flush
/// file and registers it, and [`IndexedStore::publish`] applies its index
/// entries. Until then the flush is invisible to readers, and
/// [`IndexedStore::abort_writing`] can still throw it away.
pub struct IndexedStore {
    files: Arc<DataFileCollection>,
    index: Arc<LongList>,
    pending: Mutex<Vec<(i64, u64)>>,
    sealed: Mutex<Option<u32>>,
}

impl IndexedStore {
    /// Opens the store in `dir`.
    ///
    /// With a saved index image the image is used as is. Without one the
    /// index is rebuilt by scanning every sealed file, keeping the newest
    /// location of each key inside `rebuild_range`.
    pub fn open(
        dir: &Path,
        store: &'static str,
        image: Option<LongList>,
        rebuild_range: (i64, i64),
        read_retries: usize,
        instrumentation: Arc<Instrumentation>,
    ) -> Result<Self> {
        let files = Arc::new(DataFileCollection::open(dir, store, read_retries)?);
        let index = match image {
            Some(image) => image,
            None => {
                let index = LongList::new(instrumentation);
                index.update_valid_range(rebuild_range.0, rebuild_range.1)?;
                let (min, max) = index.valid_range();
                let mut restored = 0u64;
                let mut removed = 0u64;
                files.for_each_item(|location, payload| {
                    let key = item_key(payload)?;
                    if min < 0 || key < min || key > max {
                        return Ok(());
                    }
                    if is_tombstone(payload) {
                        index.put(key, 0)?;
                        removed += 1;
                    } else {
                        index.put(key, location)?;
                        restored += 1;
                    }
                    Ok(())
                })?;
                debug!(store, restored, removed, min, max, "index.rebuilt");
                index
            }
        };
        Ok(Self {
            files,
            index: Arc::new(index),
            pending: Mutex::new(Vec::new()),
            sealed: Mutex::new(None),
        })
    }

    /// Opens a flush.
    pub fn start_writing(&self) -> Result<()> {
        self.pending.lock().clear();
        if let Some(stale) = self.sealed.lock().take() {
            self.files.release(stale);
        }
        self.files.start_writing()
    }

    /// Appends `payload` for `key` to the open flush.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidArgument`] for a payload without a body
    /// after its key.
    pub fn put(&self, key: i64, payload: &[u8]) -> Result<()> {
        if payload.len() <= TOMBSTONE_LEN {
            return Err(StoreError::InvalidArgument(format!(
                "item for {key} has no body after its key"
            )));
        }
        let location = self.files.store_item(payload)?;
        self.pending.lock().push((key, location));
        Ok(())
    }

    /// Appends a removal marker for `key`; the key is cleared when the flush
    /// is published and stays cleared when the index is rebuilt from files.
    pub fn remove(&self, key: i64) -> Result<()> {
        self.files.store_item(&key.to_le_bytes())?;
        self.pending.lock().push((key, 0));
        Ok(())
    }

    /// Fsyncs and registers the flush file without publishing its entries.
    /// The file stays out of compaction until it is published.
    pub fn seal(&self) -> Result<()> {
        let sealed = self.files.seal_writing()?;
        *self.sealed.lock() = sealed;
        Ok(())
    }

    /// Publishes the sealed flush's index updates in order, then lets
    /// compaction pick its file. Entries outside the valid range at this
    /// point are dropped.
    pub fn publish(&self) -> Result<()> {
        let pending = std::mem::take(&mut *self.pending.lock());
        let (min, max) = self.index.valid_range();
        for (key, location) in pending {
            if min < 0 || key < min || key > max {
                continue;
            }
            self.index.put(key, location)?;
        }
        if let Some(sealed) = self.sealed.lock().take() {
            self.files.release(sealed);
        }
        Ok(())
    }

    /// Seals and publishes the flush.
    pub fn end_writing(&self) -> Result<()> {
        self.seal()?;
        self.publish()
    }

    /// Drops the flush without publishing anything. A flush that was already
    /// sealed loses its file too.
    pub fn abort_writing(&self) {
        self.pending.lock().clear();
        self.files.abort_writing();
        let Some(sealed) = self.sealed.lock().take() else {
            return;
        };
        if let Err(err) = self.files.remove_files(&[sealed]) {
            warn!(
                store = self.files.store(),
                file = sealed,
                error = %err,
                "flush.discard_failed"
            );
        }
    }

    /// Reads the current item of `key`.
    pub fn get(&self, key: i64) -> Result<Option<Vec<u8>>> {
        self.files.read_indexed(&self.index, key)
    }

    /// Narrows or widens the keys this store serves.
    pub fn update_valid_range(&self, min: i64, max: i64) -> Result<()> {
        self.index.update_valid_range(min, max)
    }

    /// Calls `f` with every live key and its item.
    pub fn for_each_live(&self, mut f: impl FnMut(i64, &[u8]) -> Result<()>) -> Result<()> {
        self.index.for_each(|key, _| {
            if let Some(payload) = self.get(key)? {
                f(key, &payload)?;
            }
            Ok(())
        })
    }

    /// Builds the compactor for this store.
    pub fn compactor(
        &self,
        lock: TableLock,
        limits: CompactionLimits,
        metrics: Arc<dyn StoreMetrics>,
    ) -> FileCompactor {
        FileCompactor::new(self.files.clone(), self.index.clone(), lock, limits, metrics)
    }

    /// Materialises the sealed files in `dir` and the index image at `index_path`.
    pub fn snapshot(&self, dir: &Path, index_path: &Path, mode: LinkMode) -> Result<()> {
        self.files.snapshot(dir, mode)?;
        self.index.write_to_file(index_path)
    }

    /// Writes the index image to `path`.
    pub fn save_index(&self, path: &Path) -> Result<()> {
        self.index.write_to_file(path)
    }

    /// Sealed file count.
    pub fn file_count(&self) -> usize {
        self.files.file_count()
    }

    /// Sealed file bytes.
    pub fn total_bytes(&self) -> u64 {
        self.files.total_bytes()
    }

    /// Bytes held by the index.
    pub fn index_bytes(&self) -> usize {
        self.index.memory_bytes()
    }

    /// Releases file handles and index memory.
    pub fn close(&self) {
        self.files.close();
        self.index.release();
    }
}
