#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::primitives::concurrency::{CancelToken, TableLock};
use crate::storage::compaction::Compactor;
use crate::storage::files::collection::DataFileCollection;
use crate::storage::files::data_file::location_file;
use crate::storage::index::LongList;
use crate::storage::kv_store::{is_tombstone, item_key};
use crate::storage::metrics::StoreMetrics;
use crate::types::Result;

/// Limits applied when choosing files to merge.
#[derive(Clone, Copy, Debug)]
pub struct CompactionLimits {
    /// Fewest files of one level worth merging.
    pub min_files: usize,
    /// Most files merged at once.
    pub max_files: usize,
    /// Items copied between cancellation checks.
    pub check_interval: usize,
}

/// Merges sealed files of one store into a single file at the next level.
///
/// Only items the index still references are copied, plus removal markers
/// for keys an unmerged older file may still hold. The merged file is
/// fsynced before the swap, and the swap runs inside the table lock's swap
/// section so a snapshot never sees a half-applied merge.
pub struct FileCompactor {
    files: Arc<DataFileCollection>,
    index: Arc<LongList>,
    lock: TableLock,
    limits: CompactionLimits,
    metrics: Arc<dyn StoreMetrics>,
}

impl FileCompactor {
    /// Creates a compactor for `files` indexed by `index`.
    pub fn new(
        files: Arc<DataFileCollection>,
        index: Arc<LongList>,
        lock: TableLock,
        limits: CompactionLimits,
        metrics: Arc<dyn StoreMetrics>,
    ) -> Self {
        Self {
            files,
            index,
            lock,
            limits,
            metrics,
        }
    }

    /// Picks the oldest mergeable files of the lowest level holding at least
    /// `min_files` files, with the generation the merged file inherits.
    fn select(&self) -> Option<(u8, Vec<u32>, u32)> {
        let mut by_level: BTreeMap<u8, Vec<(u32, u32)>> = BTreeMap::new();
        for reader in self.files.mergeable_files() {
            by_level
                .entry(reader.level())
                .or_default()
                .push((reader.generation(), reader.index()));
        }
        by_level
            .into_iter()
            .find(|(_, files)| files.len() >= self.limits.min_files)
            .map(|(level, mut files)| {
                files.sort_unstable();
                files.truncate(self.limits.max_files);
                let generation = files.iter().map(|(g, _)| *g).max().unwrap_or_default();
                (level, files.into_iter().map(|(_, idx)| idx).collect(), generation)
            })
    }
}

impl Compactor for FileCompactor {
    fn compact(&self, cancel: &CancelToken) -> Result<bool> {
        let Some((level, selected, generation)) = self.select() else {
            return Ok(false);
        };
        let store = self.files.store();
        let started = Instant::now();
        let chosen: HashSet<u32> = selected.iter().copied().collect();
        let mut writer = self
            .files
            .new_compaction_writer(level.saturating_add(1), generation)?;
        let mut moves: Vec<(i64, u64, u64)> = Vec::new();
        let mut since_check = 0usize;
        let mut tick = || -> Result<()> {
            since_check += 1;
            if since_check >= self.limits.check_interval {
                since_check = 0;
                cancel.check()?;
            }
            Ok(())
        };
        // Removal markers only matter while an older file may still hold
        // the removed key.
        let keep_removals = self
            .files
            .completed_files()
            .iter()
            .any(|reader| !chosen.contains(&reader.index()) && reader.generation() < generation);
        let mut removals = 0u64;

        let copied = (|| -> Result<()> {
            self.index.for_each(|key, location| {
                if !location_file(location).is_some_and(|file| chosen.contains(&file)) {
                    return Ok(());
                }
                tick()?;
                let Some(payload) = self.files.read(location)? else {
                    return Ok(());
                };
                let moved = writer.store(&payload)?;
                moves.push((key, location, moved));
                Ok(())
            })?;
            if !keep_removals {
                return Ok(());
            }
            let (min, max) = self.index.valid_range();
            let mut carried = HashSet::new();
            for reader in self.files.completed_files() {
                if !chosen.contains(&reader.index()) {
                    continue;
                }
                reader.for_each_item(|_, payload| {
                    if !is_tombstone(payload) {
                        return Ok(());
                    }
                    let key = item_key(payload)?;
                    if min < 0 || key < min || key > max || self.index.get(key) != 0 {
                        return Ok(());
                    }
                    if carried.insert(key) {
                        tick()?;
                        writer.store(payload)?;
                        removals += 1;
                    }
                    Ok(())
                })?;
            }
            Ok(())
        })();
        if let Err(err) = copied.and_then(|()| cancel.check()) {
            writer.abort();
            return Err(err);
        }

        let merged = if writer.items() == 0 {
            writer.abort();
            None
        } else {
            Some(writer.finish()?)
        };

        let swap = self.lock.acquire_swap();
        if let Err(err) = cancel.check() {
            if let Some(reader) = merged {
                let path = reader.path().to_path_buf();
                drop(reader);
                std::fs::remove_file(path)?;
            }
            return Err(err);
        }
        let merged_index = merged.as_ref().map(|reader| reader.index());
        if let Some(reader) = merged {
            self.files.register(reader);
        }
        let mut swapped = 0u64;
        for (key, old, new) in &moves {
            if self.index.put_if_equal(*key, *old, *new) {
                swapped += 1;
            }
        }
        self.files.remove_files(&selected)?;
        drop(swap);

        let millis = started.elapsed().as_millis() as u64;
        self.metrics
            .compaction_finished(store, millis, selected.len() as u64);
        self.metrics.store_files(
            store,
            self.files.file_count() as u64,
            self.files.total_bytes(),
        );
        info!(
            store,
            level,
            files_merged = selected.len(),
            items_copied = moves.len(),
            items_swapped = swapped,
            removals_carried = removals,
            merged_file = ?merged_index,
            millis,
            "compaction.completed"
        );
        debug!(store, remaining_files = self.files.file_count(), "compaction.files");
        Ok(true)
    }
}
