#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::primitives::bytes::{buf::Cursor, le, var};
use crate::primitives::concurrency::TableLock;
use crate::primitives::io::LinkMode;
use crate::storage::files::{CompactionLimits, FileCompactor};
use crate::storage::index::LongList;
use crate::storage::kv_store::IndexedStore;
use crate::storage::metrics::{Instrumentation, StoreMetrics};
use crate::types::{Result, StoreError};

const TARGET_ENTRIES_PER_BUCKET: u64 = 16;
const MAX_BUCKETS: u64 = 1 << 26;

/// Number of buckets used for a table sized for `max_keys` keys.
pub fn bucket_count(max_keys: u64) -> u64 {
    (max_keys / TARGET_ENTRIES_PER_BUCKET)
        .clamp(1, MAX_BUCKETS)
        .next_power_of_two()
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Entry {
    key_hash: u64,
    path: i64,
    version: u64,
    key: Bytes,
}

#[derive(Debug, Default)]
struct Bucket {
    entries: Vec<Entry>,
}

impl Bucket {
    fn decode(src: &[u8]) -> Result<(i64, Self)> {
        let mut cur = Cursor::new(src);
        let id = cur.i64()?;
        let count = cur.u32()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let key_hash = cur.u64()?;
            let path = cur.i64()?;
            let version = cur.u64()?;
            let len = usize::try_from(cur.varint()?)
                .map_err(|_| StoreError::Corruption("bucket key length overflow".into()))?;
            let key = Bytes::copy_from_slice(cur.take(len)?);
            entries.push(Entry {
                key_hash,
                path,
                version,
                key,
            });
        }
        cur.finish()?;
        Ok((id, Self { entries }))
    }

    fn encode(&self, id: i64) -> Vec<u8> {
        let mut out = Vec::new();
        le::put_i64(&mut out, id);
        le::put_u32(&mut out, self.entries.len() as u32);
        for entry in &self.entries {
            le::put_u64(&mut out, entry.key_hash);
            le::put_i64(&mut out, entry.path);
            le::put_u64(&mut out, entry.version);
            var::encode_u64(entry.key.len() as u64, &mut out);
            out.extend_from_slice(&entry.key);
        }
        out
    }

    fn position(&self, key: &[u8], key_hash: u64) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.key_hash == key_hash && e.key.as_ref() == key)
    }

    fn apply(&mut self, mutation: Mutation) {
        match mutation {
            Mutation::Put {
                key,
                key_hash,
                path,
                version,
            } => match self.position(&key, key_hash) {
                Some(at) => {
                    let entry = &mut self.entries[at];
                    entry.path = path;
                    entry.version = version;
                }
                None => self.entries.push(Entry {
                    key_hash,
                    path,
                    version,
                    key,
                }),
            },
            Mutation::DeleteIf {
                key,
                key_hash,
                path,
                version,
            } => {
                if let Some(at) = self.position(&key, key_hash) {
                    let entry = &self.entries[at];
                    if entry.path == path && entry.version < version {
                        self.entries.swap_remove(at);
                    }
                }
            }
        }
    }
}

enum Mutation {
    Put {
        key: Bytes,
        key_hash: u64,
        path: i64,
        version: u64,
    },
    DeleteIf {
        key: Bytes,
        key_hash: u64,
        path: i64,
        version: u64,
    },
}

/// Disk-resident key→path map with version-stamped entries.
///
/// Keys hash into a fixed number of buckets. A flush rewrites every touched
/// bucket as one item, so a bucket is always read and replaced whole.
pub struct KeyToPath {
    store: IndexedStore,
    bucket_mask: u64,
    pending: Mutex<BTreeMap<i64, Vec<Mutation>>>,
}

impl KeyToPath {
    /// Opens the map in `dir` with `buckets` buckets (a power of two).
    pub fn open(
        dir: &Path,
        buckets: u64,
        image: Option<LongList>,
        read_retries: usize,
        instrumentation: Arc<Instrumentation>,
    ) -> Result<Self> {
        if !buckets.is_power_of_two() {
            return Err(StoreError::InvalidArgument(format!(
                "bucket count {buckets} is not a power of two"
            )));
        }
        let store = IndexedStore::open(
            dir,
            "keytopath",
            image,
            (0, buckets as i64 - 1),
            read_retries,
            instrumentation,
        )?;
        Ok(Self {
            store,
            bucket_mask: buckets - 1,
            pending: Mutex::new(BTreeMap::new()),
        })
    }

    fn bucket_of(&self, key_hash: u64) -> i64 {
        (key_hash & self.bucket_mask) as i64
    }

    fn load_bucket(&self, id: i64) -> Result<Bucket> {
        match self.store.get(id)? {
            Some(payload) => {
                let (stored, bucket) = Bucket::decode(&payload)?;
                if stored != id {
                    return Err(StoreError::Corruption(format!(
                        "bucket {id} location holds bucket {stored}"
                    )));
                }
                Ok(bucket)
            }
            None => Ok(Bucket::default()),
        }
    }

    /// Path and version currently mapped to `key`.
    pub fn get(&self, key: &[u8], key_hash: u64) -> Result<Option<(i64, u64)>> {
        let bucket = self.load_bucket(self.bucket_of(key_hash))?;
        Ok(bucket
            .position(key, key_hash)
            .map(|at| (bucket.entries[at].path, bucket.entries[at].version)))
    }

    /// Opens a flush.
    pub fn start_writing(&self) -> Result<()> {
        self.pending.lock().clear();
        self.store.start_writing()
    }

    /// Maps `key` to `path`, stamped with `version`.
    pub fn put(&self, key: Bytes, key_hash: u64, path: i64, version: u64) {
        let bucket = self.bucket_of(key_hash);
        self.pending
            .lock()
            .entry(bucket)
            .or_default()
            .push(Mutation::Put {
                key,
                key_hash,
                path,
                version,
            });
    }

    /// Removes `key` if it still maps to `path` with a version older than `version`.
    pub fn delete_if(&self, key: Bytes, key_hash: u64, path: i64, version: u64) {
        let bucket = self.bucket_of(key_hash);
        self.pending
            .lock()
            .entry(bucket)
            .or_default()
            .push(Mutation::DeleteIf {
                key,
                key_hash,
                path,
                version,
            });
    }

    /// Rewrites every touched bucket into the flush file and seals it.
    /// Lookups keep returning the old buckets until [`KeyToPath::publish`].
    pub fn seal(&self) -> Result<()> {
        let pending = std::mem::take(&mut *self.pending.lock());
        for (id, mutations) in pending {
            let mut bucket = self.load_bucket(id)?;
            for mutation in mutations {
                bucket.apply(mutation);
            }
            self.store.put(id, &bucket.encode(id))?;
        }
        self.store.seal()
    }

    /// Makes the sealed buckets visible.
    pub fn publish(&self) -> Result<()> {
        self.store.publish()
    }

    /// Rewrites every touched bucket and publishes them.
    pub fn end_writing(&self) -> Result<()> {
        self.seal()?;
        self.publish()
    }

    /// Drops the open or sealed flush.
    pub fn abort_writing(&self) {
        self.pending.lock().clear();
        self.store.abort_writing();
    }

    /// Calls `f` with every mapped key and its path.
    pub fn for_each_entry(&self, mut f: impl FnMut(&[u8], i64) -> Result<()>) -> Result<()> {
        self.store.for_each_live(|_, payload| {
            let (_, bucket) = Bucket::decode(payload)?;
            for entry in &bucket.entries {
                f(&entry.key, entry.path)?;
            }
            Ok(())
        })
    }

    /// Builds the compactor for the bucket files.
    pub fn compactor(
        &self,
        lock: TableLock,
        limits: CompactionLimits,
        metrics: Arc<dyn StoreMetrics>,
    ) -> FileCompactor {
        self.store.compactor(lock, limits, metrics)
    }

    /// Materialises files and the bucket index in `dir`.
    pub fn snapshot(&self, dir: &Path, mode: LinkMode) -> Result<()> {
        self.store
            .snapshot(dir, &dir.join(BUCKET_INDEX_FILE), mode)
    }

    /// Writes the bucket index image into `dir`.
    pub fn save_index(&self, dir: &Path) -> Result<()> {
        self.store.save_index(&dir.join(BUCKET_INDEX_FILE))
    }

    /// Underlying store, for statistics.
    pub fn store(&self) -> &IndexedStore {
        &self.store
    }

    /// Releases file handles and index memory.
    pub fn close(&self) {
        self.store.close();
    }
}

/// File name of the bucket index image inside the key→path directory.
pub const BUCKET_INDEX_FILE: &str = "bucket_index.ll";
