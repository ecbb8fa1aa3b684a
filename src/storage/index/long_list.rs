#![forbid(unsafe_code)]

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::primitives::bytes::le;
use crate::storage::metrics::Instrumentation;
use crate::types::{Result, StoreError};

/// Entries per lazily allocated chunk.
pub const CHUNK_LEN: usize = 1 << 14;

const MAGIC: &[u8; 4] = b"VTLL";
const VERSION: u32 = 1;

type Chunk = Arc<[AtomicU64]>;

/// Sparse, chunked array of `u64` locations indexed by path or bucket.
///
/// Entries outside the valid range read as zero. Every entry is an atomic, so
/// readers never observe a torn value and compaction can swap entries with
/// compare-and-set while the writer updates others.
pub struct LongList {
    chunks: RwLock<Vec<Option<Chunk>>>,
    min_valid: AtomicI64,
    max_valid: AtomicI64,
    allocated: AtomicUsize,
    instrumentation: Arc<Instrumentation>,
}

impl LongList {
    /// Creates an empty list with an empty valid range.
    pub fn new(instrumentation: Arc<Instrumentation>) -> Self {
        Self {
            chunks: RwLock::new(Vec::new()),
            min_valid: AtomicI64::new(-1),
            max_valid: AtomicI64::new(-1),
            allocated: AtomicUsize::new(0),
            instrumentation,
        }
    }

    /// Current valid range; `(-1, -1)` when empty.
    pub fn valid_range(&self) -> (i64, i64) {
        (
            self.min_valid.load(Ordering::Acquire),
            self.max_valid.load(Ordering::Acquire),
        )
    }

    fn in_range(&self, index: i64) -> bool {
        let (min, max) = self.valid_range();
        min >= 0 && index >= min && index <= max
    }

    /// Returns the entry at `index`, or zero when absent or out of range.
    pub fn get(&self, index: i64) -> u64 {
        if !self.in_range(index) {
            return 0;
        }
        let (chunk, slot) = split(index);
        let chunks = self.chunks.read();
        match chunks.get(chunk) {
            Some(Some(entries)) => entries[slot].load(Ordering::Acquire),
            _ => 0,
        }
    }

    /// Stores `value` at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidArgument`] if `index` lies outside the valid range.
    pub fn put(&self, index: i64, value: u64) -> Result<()> {
        if !self.in_range(index) {
            let (min, max) = self.valid_range();
            return Err(StoreError::InvalidArgument(format!(
                "index {index} outside valid range [{min}, {max}]"
            )));
        }
        let (chunk, slot) = split(index);
        if value == 0 {
            if let Some(Some(entries)) = self.chunks.read().get(chunk) {
                entries[slot].store(0, Ordering::Release);
            }
            return Ok(());
        }
        self.chunk_for_write(chunk)[slot].store(value, Ordering::Release);
        Ok(())
    }

    /// Replaces the entry at `index` with `new` only if it still equals `old`.
    pub fn put_if_equal(&self, index: i64, old: u64, new: u64) -> bool {
        if !self.in_range(index) {
            return false;
        }
        let (chunk, slot) = split(index);
        let chunks = self.chunks.read();
        match chunks.get(chunk) {
            Some(Some(entries)) => entries[slot]
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            _ => false,
        }
    }

    fn chunk_for_write(&self, chunk: usize) -> Chunk {
        if let Some(Some(entries)) = self.chunks.read().get(chunk) {
            return entries.clone();
        }
        let mut chunks = self.chunks.write();
        if chunks.len() <= chunk {
            chunks.resize(chunk + 1, None);
        }
        chunks[chunk]
            .get_or_insert_with(|| {
                let bytes = CHUNK_LEN * std::mem::size_of::<u64>();
                self.allocated.fetch_add(bytes, Ordering::AcqRel);
                self.instrumentation.index_allocated(bytes);
                (0..CHUNK_LEN).map(|_| AtomicU64::new(0)).collect()
            })
            .clone()
    }

    /// Narrows or widens the valid range, clearing entries that fall outside it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidArgument`] for an inverted range.
    pub fn update_valid_range(&self, min: i64, max: i64) -> Result<()> {
        let empty = min < 0 || max < 0;
        if !empty && max < min {
            return Err(StoreError::InvalidArgument(format!(
                "inverted valid range [{min}, {max}]"
            )));
        }
        let (min, max) = if empty { (-1, -1) } else { (min, max) };
        self.min_valid.store(min, Ordering::Release);
        self.max_valid.store(max, Ordering::Release);

        let mut chunks = self.chunks.write();
        let mut released = 0usize;
        for (idx, slot) in chunks.iter_mut().enumerate() {
            if slot.is_none() {
                continue;
            }
            let chunk_first = (idx * CHUNK_LEN) as i64;
            let chunk_last = chunk_first + CHUNK_LEN as i64 - 1;
            if empty || chunk_last < min || chunk_first > max {
                *slot = None;
                released += CHUNK_LEN * std::mem::size_of::<u64>();
                continue;
            }
            let Some(entries) = slot.as_ref() else {
                continue;
            };
            for (offset, entry) in entries.iter().enumerate() {
                let index = chunk_first + offset as i64;
                if index < min || index > max {
                    entry.store(0, Ordering::Release);
                }
            }
        }
        if empty {
            chunks.clear();
        }
        drop(chunks);
        if released > 0 {
            self.allocated.fetch_sub(released, Ordering::AcqRel);
            self.instrumentation.index_released(released);
        }
        Ok(())
    }

    /// Calls `f` for every non-zero entry in the valid range, in index order.
    pub fn for_each(&self, mut f: impl FnMut(i64, u64) -> Result<()>) -> Result<()> {
        let (min, max) = self.valid_range();
        if min < 0 {
            return Ok(());
        }
        let snapshot: Vec<Option<Chunk>> = self.chunks.read().clone();
        for (idx, slot) in snapshot.iter().enumerate() {
            let Some(entries) = slot else {
                continue;
            };
            let chunk_first = (idx * CHUNK_LEN) as i64;
            for (offset, entry) in entries.iter().enumerate() {
                let index = chunk_first + offset as i64;
                if index < min || index > max {
                    continue;
                }
                let value = entry.load(Ordering::Acquire);
                if value != 0 {
                    f(index, value)?;
                }
            }
        }
        Ok(())
    }

    /// Bytes held by allocated chunks.
    pub fn memory_bytes(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Drops every chunk and returns the memory to the instrumentation counter.
    pub fn release(&self) {
        let mut chunks = self.chunks.write();
        chunks.clear();
        drop(chunks);
        let bytes = self.allocated.swap(0, Ordering::AcqRel);
        if bytes > 0 {
            self.instrumentation.index_released(bytes);
        }
    }

    /// Writes the valid range and its entries to `path`.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("ll.tmp");
        let (min, max) = self.valid_range();
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            let mut header = Vec::with_capacity(24);
            header.extend_from_slice(MAGIC);
            le::put_u32(&mut header, VERSION);
            le::put_i64(&mut header, min);
            le::put_i64(&mut header, max);
            out.write_all(&header)?;
            if min >= 0 {
                for index in min..=max {
                    out.write_all(&self.get(index).to_le_bytes())?;
                }
            }
            let file = out.into_inner().map_err(|err| StoreError::Io(err.into_error()))?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Loads a list previously written by [`LongList::write_to_file`].
    pub fn load_from_file(path: &Path, instrumentation: Arc<Instrumentation>) -> Result<Self> {
        let mut input = BufReader::new(OpenOptions::new().read(true).open(path)?);
        let mut header = [0u8; 24];
        input.read_exact(&mut header)?;
        if &header[..4] != MAGIC {
            return Err(StoreError::Corruption(format!(
                "bad index magic in {}",
                path.display()
            )));
        }
        if le::u32_at(&header[4..]) != Some(VERSION) {
            return Err(StoreError::Corruption("unsupported index version".into()));
        }
        let min = le::u64_at(&header[8..]).unwrap_or_default() as i64;
        let max = le::u64_at(&header[16..]).unwrap_or_default() as i64;
        let list = LongList::new(instrumentation);
        list.update_valid_range(min, max)?;
        if min >= 0 {
            let mut word = [0u8; 8];
            for index in min..=max {
                input.read_exact(&mut word)?;
                let value = u64::from_le_bytes(word);
                if value != 0 {
                    list.put(index, value)?;
                }
            }
        }
        Ok(list)
    }
}

impl Drop for LongList {
    fn drop(&mut self) {
        self.release();
    }
}

fn split(index: i64) -> (usize, usize) {
    let index = index as usize;
    (index / CHUNK_LEN, index % CHUNK_LEN)
}
