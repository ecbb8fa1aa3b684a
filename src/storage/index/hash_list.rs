#![forbid(unsafe_code)]

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::primitives::bytes::le;
use crate::storage::metrics::Instrumentation;
use crate::storage::record::Hash;
use crate::types::{Result, StoreError};

const HASHES_PER_CHUNK: usize = 4096;
const MAGIC: &[u8; 4] = b"VTHL";
const VERSION: u32 = 1;

struct HashChunk {
    bytes: Box<[u8]>,
    present: Box<[u64]>,
}

impl HashChunk {
    fn new(digest_len: usize) -> Self {
        Self {
            bytes: vec![0u8; digest_len * HASHES_PER_CHUNK].into_boxed_slice(),
            present: vec![0u64; HASHES_PER_CHUNK / 64].into_boxed_slice(),
        }
    }

    fn footprint(digest_len: usize) -> usize {
        digest_len * HASHES_PER_CHUNK + HASHES_PER_CHUNK / 8
    }

    fn is_present(&self, slot: usize) -> bool {
        self.present[slot / 64] & (1 << (slot % 64)) != 0
    }
}

/// RAM-resident hashes for the low paths of a tree.
pub struct HashList {
    digest_len: usize,
    chunks: RwLock<Vec<Option<HashChunk>>>,
    allocated: AtomicUsize,
    instrumentation: Arc<Instrumentation>,
}

impl HashList {
    /// Creates an empty list of `digest_len`-byte hashes.
    pub fn new(digest_len: usize, instrumentation: Arc<Instrumentation>) -> Self {
        Self {
            digest_len,
            chunks: RwLock::new(Vec::new()),
            allocated: AtomicUsize::new(0),
            instrumentation,
        }
    }

    /// Returns the hash at `index`, if one was stored.
    pub fn get(&self, index: u64) -> Option<Hash> {
        let (chunk, slot) = split(index);
        let chunks = self.chunks.read();
        let entry = chunks.get(chunk)?.as_ref()?;
        if !entry.is_present(slot) {
            return None;
        }
        let start = slot * self.digest_len;
        Some(Hash::new(Bytes::copy_from_slice(
            &entry.bytes[start..start + self.digest_len],
        )))
    }

    /// Stores `hash` at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidArgument`] when the hash length differs from the digest.
    pub fn put(&self, index: u64, hash: &Hash) -> Result<()> {
        if hash.len() != self.digest_len {
            return Err(StoreError::InvalidArgument(format!(
                "hash has {} bytes, digest needs {}",
                hash.len(),
                self.digest_len
            )));
        }
        let (chunk, slot) = split(index);
        let mut chunks = self.chunks.write();
        if chunks.len() <= chunk {
            chunks.resize_with(chunk + 1, || None);
        }
        let entry = chunks[chunk].get_or_insert_with(|| {
            let bytes = HashChunk::footprint(self.digest_len);
            self.allocated.fetch_add(bytes, Ordering::AcqRel);
            self.instrumentation.index_allocated(bytes);
            HashChunk::new(self.digest_len)
        });
        let start = slot * self.digest_len;
        entry.bytes[start..start + self.digest_len].copy_from_slice(hash.as_bytes());
        entry.present[slot / 64] |= 1 << (slot % 64);
        Ok(())
    }

    /// Forgets every hash at `index` or above.
    pub fn truncate(&self, index: u64) {
        let (first_chunk, first_slot) = split(index);
        let mut chunks = self.chunks.write();
        let mut released = 0;
        for (idx, slot) in chunks.iter_mut().enumerate().skip(first_chunk) {
            if idx > first_chunk || first_slot == 0 {
                if slot.take().is_some() {
                    released += HashChunk::footprint(self.digest_len);
                }
                continue;
            }
            if let Some(entry) = slot.as_mut() {
                for bit in first_slot..HASHES_PER_CHUNK {
                    entry.present[bit / 64] &= !(1 << (bit % 64));
                }
            }
        }
        drop(chunks);
        if released > 0 {
            self.allocated.fetch_sub(released, Ordering::AcqRel);
            self.instrumentation.index_released(released);
        }
    }

    /// Bytes held by allocated chunks.
    pub fn memory_bytes(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Drops every chunk and returns the memory to the instrumentation counter.
    pub fn release(&self) {
        self.chunks.write().clear();
        let bytes = self.allocated.swap(0, Ordering::AcqRel);
        if bytes > 0 {
            self.instrumentation.index_released(bytes);
        }
    }

    /// Writes every stored hash to `path`.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("hl.tmp");
        {
            let chunks = self.chunks.read();
            let mut body = Vec::new();
            let mut count = 0u64;
            for (idx, slot) in chunks.iter().enumerate() {
                let Some(entry) = slot else {
                    continue;
                };
                for bit in 0..HASHES_PER_CHUNK {
                    if !entry.is_present(bit) {
                        continue;
                    }
                    le::put_u64(&mut body, (idx * HASHES_PER_CHUNK + bit) as u64);
                    let start = bit * self.digest_len;
                    body.extend_from_slice(&entry.bytes[start..start + self.digest_len]);
                    count += 1;
                }
            }
            drop(chunks);
            let mut out = BufWriter::new(File::create(&tmp)?);
            let mut header = Vec::with_capacity(20);
            header.extend_from_slice(MAGIC);
            le::put_u32(&mut header, VERSION);
            le::put_u32(&mut header, self.digest_len as u32);
            le::put_u64(&mut header, count);
            out.write_all(&header)?;
            out.write_all(&body)?;
            let file = out.into_inner().map_err(|err| StoreError::Io(err.into_error()))?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Loads a list written by [`HashList::write_to_file`].
    pub fn load_from_file(
        path: &Path,
        digest_len: usize,
        instrumentation: Arc<Instrumentation>,
    ) -> Result<Self> {
        let mut input = BufReader::new(File::open(path)?);
        let mut header = [0u8; 20];
        input.read_exact(&mut header)?;
        if &header[..4] != MAGIC || le::u32_at(&header[4..]) != Some(VERSION) {
            return Err(StoreError::Corruption(format!(
                "bad hash list header in {}",
                path.display()
            )));
        }
        if le::u32_at(&header[8..]) != Some(digest_len as u32) {
            return Err(StoreError::Corruption(
                "hash list digest length does not match table".into(),
            ));
        }
        let count = le::u64_at(&header[12..]).unwrap_or_default();
        let list = HashList::new(digest_len, instrumentation);
        let mut index = [0u8; 8];
        let mut digest = vec![0u8; digest_len];
        for _ in 0..count {
            input.read_exact(&mut index)?;
            input.read_exact(&mut digest)?;
            list.put(u64::from_le_bytes(index), &Hash::new(digest.clone()))?;
        }
        Ok(list)
    }
}

impl Drop for HashList {
    fn drop(&mut self) {
        self.release();
    }
}

fn split(index: u64) -> (usize, usize) {
    let index = index as usize;
    (index / HASHES_PER_CHUNK, index % HASHES_PER_CHUNK)
}
