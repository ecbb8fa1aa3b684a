#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::primitives::concurrency::CancelToken;
use crate::storage::metrics::StoreMetrics;
use crate::types::{Result, StoreError};

/// The three independently compacted stores of a data source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreKind {
    /// key→path buckets.
    KeyToPath,
    /// Disk-resident hashes.
    Hashes,
    /// path→(key, value) leaves.
    PathToKeyValue,
}

impl StoreKind {
    /// Every store, in compaction order.
    pub const ALL: [StoreKind; 3] = [
        StoreKind::KeyToPath,
        StoreKind::Hashes,
        StoreKind::PathToKeyValue,
    ];

    /// Name used in file names, metrics and log events.
    pub const fn as_str(self) -> &'static str {
        match self {
            StoreKind::KeyToPath => "keytopath",
            StoreKind::Hashes => "hashes",
            StoreKind::PathToKeyValue => "leaves",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A store that can reclaim space from superseded records.
pub trait Compactor: Send + Sync {
    /// Runs one compaction. Returns `false` when there was nothing to do.
    ///
    /// Implementations poll `cancel` at safe points and return
    /// [`StoreError::Interrupted`] once it fires, leaving the index untouched.
    fn compact(&self, cancel: &CancelToken) -> Result<bool>;
}

#[derive(Default)]
struct CoordinatorState {
    enabled: bool,
    in_flight: HashMap<StoreKind, CancelToken>,
}

struct Shared {
    table: String,
    state: Mutex<CoordinatorState>,
    idle: Condvar,
    metrics: Arc<dyn StoreMetrics>,
}

/// Schedules background compaction of one data source's stores.
///
/// At most one compaction per store runs at a time; a trigger arriving while
/// that store is compacting is discarded. Stores compact concurrently on the
/// shared pool.
pub struct CompactionCoordinator {
    shared: Arc<Shared>,
    compactors: HashMap<StoreKind, Arc<dyn Compactor>>,
    pool: Arc<rayon::ThreadPool>,
}

impl CompactionCoordinator {
    /// Creates a coordinator for `table` that starts with compaction `enabled` or not.
    pub fn new(
        table: impl Into<String>,
        compactors: HashMap<StoreKind, Arc<dyn Compactor>>,
        pool: Arc<rayon::ThreadPool>,
        metrics: Arc<dyn StoreMetrics>,
        enabled: bool,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                table: table.into(),
                state: Mutex::new(CoordinatorState {
                    enabled,
                    in_flight: HashMap::new(),
                }),
                idle: Condvar::new(),
                metrics,
            }),
            compactors,
            pool,
        }
    }

    /// Queues a compaction of `store`. Returns `false` if compaction is disabled,
    /// the store has no compactor, or the store is already compacting.
    pub fn compact_async(&self, store: StoreKind) -> bool {
        let Some(compactor) = self.compactors.get(&store).cloned() else {
            return false;
        };
        let token = {
            let mut state = self.shared.state.lock();
            if !state.enabled {
                return false;
            }
            if state.in_flight.contains_key(&store) {
                debug!(table = %self.shared.table, %store, "compaction.discarded");
                return false;
            }
            let token = CancelToken::new();
            state.in_flight.insert(store, token.clone());
            token
        };
        let shared = self.shared.clone();
        self.pool.spawn(move || run_task(shared, store, compactor, token));
        true
    }

    /// Queues compaction of every store; returns how many were accepted.
    pub fn compact_all_async(&self) -> usize {
        StoreKind::ALL
            .into_iter()
            .filter(|store| self.compact_async(*store))
            .count()
    }

    /// Accepts new compaction requests again.
    pub fn enable_background_compaction(&self) {
        self.shared.state.lock().enabled = true;
        info!(table = %self.shared.table, "compaction.enabled");
    }

    /// Stops accepting requests, cancels running compactions and waits for
    /// every one of them to finish.
    pub fn stop_and_disable_background_compaction(&self) {
        let mut state = self.shared.state.lock();
        state.enabled = false;
        for token in state.in_flight.values() {
            token.cancel();
        }
        let cancelled = state.in_flight.len();
        while !state.in_flight.is_empty() {
            self.shared.idle.wait(&mut state);
        }
        drop(state);
        info!(table = %self.shared.table, cancelled, "compaction.disabled");
    }

    /// Whether new compaction requests are accepted.
    pub fn is_compaction_enabled(&self) -> bool {
        self.shared.state.lock().enabled
    }

    /// Whether `store` is compacting right now.
    pub fn is_compacting(&self, store: StoreKind) -> bool {
        self.shared.state.lock().in_flight.contains_key(&store)
    }

    /// Blocks until no compaction is running.
    pub fn await_idle(&self) {
        let mut state = self.shared.state.lock();
        while !state.in_flight.is_empty() {
            self.shared.idle.wait(&mut state);
        }
    }
}

impl Drop for CompactionCoordinator {
    fn drop(&mut self) {
        self.stop_and_disable_background_compaction();
    }
}

fn run_task(shared: Arc<Shared>, store: StoreKind, compactor: Arc<dyn Compactor>, token: CancelToken) {
    let outcome = catch_unwind(AssertUnwindSafe(|| compactor.compact(&token)));
    match outcome {
        Ok(Ok(true)) => {}
        Ok(Ok(false)) => {
            debug!(table = %shared.table, %store, "compaction.skipped");
        }
        Ok(Err(err)) if err.is_interrupted() => {
            shared.metrics.compaction_cancelled(store.as_str());
            debug!(table = %shared.table, %store, "compaction.cancelled");
        }
        Ok(Err(err)) => {
            shared.metrics.compaction_failed(store.as_str());
            warn!(table = %shared.table, %store, error = %err, "compaction.failed");
        }
        Err(_) => {
            shared.metrics.compaction_failed(store.as_str());
            warn!(table = %shared.table, %store, "compaction.panicked");
        }
    }
    let mut state = shared.state.lock();
    state.in_flight.remove(&store);
    drop(state);
    shared.idle.notify_all();
}

/// Builds the bounded worker pool shared by every coordinator of a registry.
pub fn compaction_pool(threads: usize) -> Result<Arc<rayon::ThreadPool>> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .thread_name(|idx| format!("vtreedb-compaction-{idx}"))
        .build()
        .map(Arc::new)
        .map_err(|err| StoreError::IllegalState(format!("compaction pool: {err}")))
}
