#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::types::{Result, StoreError};

/// Cooperative cancellation flag shared between a task and its owner.
#[derive(Clone, Default, Debug)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. The flag stays set for the token's lifetime.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns true once cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Fails with [`StoreError::Interrupted`] once cancellation has been requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(StoreError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Per-table lock arbitrating the writer, compaction index swaps and snapshots.
///
/// Writers and swaps exclude nothing but a snapshot. A snapshot blocks new
/// writers and swaps, drains the ones in flight, and refuses to start while
/// another snapshot holds the lock.
#[derive(Clone, Default)]
pub struct TableLock {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<LockState>,
    cond: Condvar,
}

#[derive(Default, Debug)]
struct LockState {
    swaps: u32,
    writer: bool,
    snapshot: bool,
}

/// Snapshot of lock state for observability.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSnapshot {
    /// Number of compaction swaps in progress.
    pub swaps: u32,
    /// Whether the writer lock is held.
    pub writer: bool,
    /// Whether a snapshot holds the lock.
    pub snapshot: bool,
}

/// Guard representing the held writer slot.
pub struct WriterGuard {
    lock: TableLock,
}

/// Guard representing one compaction index swap.
pub struct SwapGuard {
    lock: TableLock,
}

/// Guard representing exclusive snapshot access.
pub struct SnapshotGuard {
    lock: TableLock,
}

impl TableLock {
    /// Creates an unheld lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the writer slot, waiting while a snapshot runs.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::IllegalState`] if another writer already holds the slot.
    pub fn acquire_writer(&self) -> Result<WriterGuard> {
        let mut state = self.inner.state.lock();
        while state.snapshot {
            self.inner.cond.wait(&mut state);
        }
        if state.writer {
            return Err(StoreError::IllegalState(
                "another writer is already saving records".into(),
            ));
        }
        state.writer = true;
        Ok(WriterGuard { lock: self.clone() })
    }

    /// Enters a compaction swap section, waiting while a snapshot runs.
    pub fn acquire_swap(&self) -> SwapGuard {
        let mut state = self.inner.state.lock();
        while state.snapshot {
            self.inner.cond.wait(&mut state);
        }
        state.swaps += 1;
        SwapGuard { lock: self.clone() }
    }

    /// Takes exclusive snapshot access once the writer and swaps drain.
    ///
    /// # Errors
    ///
    /// Fails fast with [`StoreError::IllegalState`] if a snapshot already holds the lock.
    pub fn try_acquire_snapshot(&self) -> Result<SnapshotGuard> {
        let mut state = self.inner.state.lock();
        if state.snapshot {
            return Err(StoreError::IllegalState(
                "a snapshot of this data source is already in progress".into(),
            ));
        }
        state.snapshot = true;
        let guard = SnapshotGuard { lock: self.clone() };
        while state.writer || state.swaps > 0 {
            self.inner.cond.wait(&mut state);
        }
        Ok(guard)
    }

    /// Takes exclusive access, waiting for a running snapshot instead of failing.
    pub fn acquire_exclusive(&self) -> SnapshotGuard {
        let mut state = self.inner.state.lock();
        while state.snapshot {
            self.inner.cond.wait(&mut state);
        }
        state.snapshot = true;
        let guard = SnapshotGuard { lock: self.clone() };
        while state.writer || state.swaps > 0 {
            self.inner.cond.wait(&mut state);
        }
        guard
    }

    /// Returns the current lock state.
    pub fn snapshot_state(&self) -> LockSnapshot {
        let state = self.inner.state.lock();
        LockSnapshot {
            swaps: state.swaps,
            writer: state.writer,
            snapshot: state.snapshot,
        }
    }

    fn release(&self, apply: impl FnOnce(&mut LockState)) {
        let mut state = self.inner.state.lock();
        apply(&mut state);
        drop(state);
        self.inner.cond.notify_all();
    }
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.lock.release(|state| state.writer = false);
    }
}

impl Drop for SwapGuard {
    fn drop(&mut self) {
        self.lock.release(|state| state.swaps = state.swaps.saturating_sub(1));
    }
}

impl Drop for SnapshotGuard {
    fn drop(&mut self) {
        self.lock.release(|state| state.snapshot = false);
    }
}
