#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::primitives::io::{link_or_copy, sync_dir, LinkMode};
use crate::storage::files::data_file::{
    location_file, location_offset, parse_file_name, DataFileReader, DataFileWriter,
};
use crate::storage::index::LongList;
use crate::types::{Result, StoreError};

type FileMap = BTreeMap<u32, Arc<DataFileReader>>;

/// The set of sealed data files of one store plus the file being flushed.
///
/// The sealed set is copy-on-write: readers grab the current map without
/// blocking writers, and compaction publishes a new map when it swaps files.
pub struct DataFileCollection {
    dir: PathBuf,
    store: &'static str,
    next_index: AtomicU32,
    files: RwLock<Arc<FileMap>>,
    writer: Mutex<Option<DataFileWriter>>,
    held: Mutex<HashSet<u32>>,
    read_retries: usize,
}

impl DataFileCollection {
    /// Opens the collection in `dir`, discarding files that were never sealed.
    pub fn open(dir: &Path, store: &'static str, read_retries: usize) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let mut files = FileMap::new();
        let mut next_index = 0u32;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(index) = parse_file_name(store, name) else {
                continue;
            };
            next_index = next_index.max(index.saturating_add(1));
            match DataFileReader::open(&entry.path()) {
                Ok(reader) => {
                    files.insert(index, Arc::new(reader));
                }
                Err(StoreError::Corruption(reason)) => {
                    warn!(store, file = name, reason = %reason, "data_files.incomplete_removed");
                    fs::remove_file(entry.path())?;
                }
                Err(err) => return Err(err),
            }
        }
        debug!(store, files = files.len(), next_index, "data_files.opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            store,
            next_index: AtomicU32::new(next_index),
            files: RwLock::new(Arc::new(files)),
            writer: Mutex::new(None),
            held: Mutex::new(HashSet::new()),
            read_retries: read_retries.max(1),
        })
    }

    /// Store name used in file names and log events.
    pub fn store(&self) -> &'static str {
        self.store
    }

    /// Directory holding the files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn allocate_index(&self) -> u32 {
        self.next_index.fetch_add(1, Ordering::AcqRel)
    }

    /// Opens a fresh level-zero file for a flush.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::IllegalState`] when a flush is already open.
    pub fn start_writing(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        if writer.is_some() {
            return Err(StoreError::IllegalState(format!(
                "{} is already writing",
                self.store
            )));
        }
        let index = self.allocate_index();
        *writer = Some(DataFileWriter::create(&self.dir, self.store, index, 0, index)?);
        Ok(())
    }

    /// Appends an item to the open flush file.
    pub fn store_item(&self, payload: &[u8]) -> Result<u64> {
        let mut writer = self.writer.lock();
        let writer = writer.as_mut().ok_or_else(|| {
            StoreError::IllegalState(format!("{} is not writing", self.store))
        })?;
        writer.store(payload)
    }

    /// Seals the flush file and makes it readable. Returns its index, or
    /// `None` when nothing was written and the file was discarded.
    pub fn end_writing(&self) -> Result<Option<u32>> {
        let sealed = self.seal_writing()?;
        if let Some(index) = sealed {
            self.release(index);
        }
        Ok(sealed)
    }

    /// Seals the flush file like [`DataFileCollection::end_writing`] but keeps
    /// it out of compaction until [`DataFileCollection::release`].
    pub fn seal_writing(&self) -> Result<Option<u32>> {
        let Some(writer) = self.writer.lock().take() else {
            return Err(StoreError::IllegalState(format!(
                "{} is not writing",
                self.store
            )));
        };
        if writer.items() == 0 {
            writer.abort();
            return Ok(None);
        }
        let reader = writer.finish()?;
        let index = reader.index();
        self.held.lock().insert(index);
        self.register(reader);
        sync_dir(&self.dir)?;
        Ok(Some(index))
    }

    /// Lets compaction pick a held file.
    pub fn release(&self, index: u32) {
        self.held.lock().remove(&index);
    }

    /// Drops the open flush file, if any.
    pub fn abort_writing(&self) {
        if let Some(writer) = self.writer.lock().take() {
            writer.abort();
        }
    }

    /// True while a flush file is open.
    pub fn is_writing(&self) -> bool {
        self.writer.lock().is_some()
    }

    /// Creates a file for compaction output; it stays invisible until registered.
    pub fn new_compaction_writer(&self, level: u8, generation: u32) -> Result<DataFileWriter> {
        DataFileWriter::create(&self.dir, self.store, self.allocate_index(), level, generation)
    }

    /// Makes a sealed file readable.
    pub fn register(&self, reader: DataFileReader) {
        let mut files = self.files.write();
        let mut next = FileMap::clone(&files);
        next.insert(reader.index(), Arc::new(reader));
        *files = Arc::new(next);
    }

    /// Unregisters and deletes the given files.
    pub fn remove_files(&self, indices: &[u32]) -> Result<()> {
        {
            let mut held = self.held.lock();
            for index in indices {
                held.remove(index);
            }
        }
        let removed: Vec<Arc<DataFileReader>> = {
            let mut files = self.files.write();
            let mut next = FileMap::clone(&files);
            let removed = indices.iter().filter_map(|idx| next.remove(idx)).collect();
            *files = Arc::new(next);
            removed
        };
        for reader in removed {
            if let Err(err) = fs::remove_file(reader.path()) {
                warn!(
                    store = self.store,
                    error = %err,
                    file = %reader.path().display(),
                    "data_files.remove_failed"
                );
            }
        }
        sync_dir(&self.dir)
    }

    /// Sealed files, ordered by index.
    pub fn completed_files(&self) -> Vec<Arc<DataFileReader>> {
        self.files.read().values().cloned().collect()
    }

    /// Sealed files compaction may merge, ordered by index.
    pub fn mergeable_files(&self) -> Vec<Arc<DataFileReader>> {
        let held = self.held.lock();
        self.files
            .read()
            .values()
            .filter(|reader| !held.contains(&reader.index()))
            .cloned()
            .collect()
    }

    /// Number of sealed files.
    pub fn file_count(&self) -> usize {
        self.files.read().len()
    }

    /// Total bytes of sealed files.
    pub fn total_bytes(&self) -> u64 {
        self.files.read().values().map(|f| f.size()).sum()
    }

    /// Reads the item at `location`; `None` if its file is no longer registered.
    pub fn read(&self, location: u64) -> Result<Option<Vec<u8>>> {
        let Some(file_index) = location_file(location) else {
            return Ok(None);
        };
        let reader = self.files.read().get(&file_index).cloned();
        match reader {
            Some(reader) => reader.read(location_offset(location)).map(Some),
            None => Ok(None),
        }
    }

    /// Reads the item `index` points at for `key`, retrying when a concurrent
    /// compaction moved it between the index lookup and the file read.
    pub fn read_indexed(&self, index: &LongList, key: i64) -> Result<Option<Vec<u8>>> {
        let mut last = 0;
        for _ in 0..self.read_retries {
            last = index.get(key);
            if last == 0 {
                return Ok(None);
            }
            if let Some(payload) = self.read(last)? {
                return Ok(Some(payload));
            }
        }
        Err(StoreError::Corruption(format!(
            "{}: location {last:#x} of {key} points at a missing file after {} attempts",
            self.store, self.read_retries
        )))
    }

    /// Calls `f` for every item of every sealed file, oldest generation first.
    ///
    /// A merged file carries the generation of its newest input, so items of
    /// later flushes are always visited after the items they supersede.
    pub fn for_each_item(&self, mut f: impl FnMut(u64, &[u8]) -> Result<()>) -> Result<()> {
        let mut files = self.completed_files();
        files.sort_by_key(|reader| (reader.generation(), reader.index()));
        for reader in files {
            reader.for_each_item(&mut f)?;
        }
        Ok(())
    }

    /// Materialises every sealed file in `target`.
    pub fn snapshot(&self, target: &Path, mode: LinkMode) -> Result<()> {
        fs::create_dir_all(target)?;
        for reader in self.completed_files() {
            let Some(name) = reader.path().file_name() else {
                continue;
            };
            link_or_copy(reader.path(), &target.join(name), mode)?;
        }
        sync_dir(target)
    }

    /// Drops any open flush and every reader.
    pub fn close(&self) {
        self.abort_writing();
        *self.files.write() = Arc::new(FileMap::new());
    }
}
