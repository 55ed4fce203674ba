//! Rundown reference (§9 "Rundown reference").
//!
//! A read-count plus a one-time drain edge: `acquire` fails once shutdown
//! has started, `release_and_wait` blocks until every acquired reference
//! has been released. Used by the datapath to block `datapath_uninit`
//! until every binding has been deleted, and by each binding to block
//! `binding_delete` until every outstanding upcall (one ref per socket
//! context) has finished.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct Inner {
    count: Mutex<u64>,
    draining: Mutex<bool>,
    drained: Condvar,
}

/// A clonable handle to a rundown. Cloning shares the same counter; it does
/// not acquire a reference by itself.
#[derive(Clone, Default)]
pub struct Rundown {
    inner: Arc<Inner>,
}

/// An acquired reference. Dropping it releases the reference.
pub struct RundownGuard {
    inner: Arc<Inner>,
}

impl Rundown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires a reference. Fails once `release_and_wait` has been called.
    pub fn acquire(&self) -> Option<RundownGuard> {
        let draining = self.inner.draining.lock();
        if *draining {
            return None;
        }
        *self.inner.count.lock() += 1;
        Some(RundownGuard {
            inner: self.inner.clone(),
        })
    }

    /// Releases one reference without blocking. Used when a reference was
    /// acquired speculatively and needs to be given back without ever
    /// being installed as a [`RundownGuard`] (e.g. on a failed bind
    /// midway through `binding_create`).
    pub fn release(&self) {
        let mut count = self.inner.count.lock();
        debug_assert!(*count > 0, "rundown released more times than acquired");
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.inner.drained.notify_all();
        }
    }

    /// Marks the rundown as draining (no further `acquire` succeeds) and
    /// blocks until every outstanding reference has been released.
    pub fn release_and_wait(&self) {
        *self.inner.draining.lock() = true;

        let mut count = self.inner.count.lock();
        while *count > 0 {
            self.inner.drained.wait(&mut count);
        }
    }

    /// Current outstanding reference count. Exposed for tests and metrics,
    /// not part of the external contract.
    pub fn count(&self) -> u64 {
        *self.inner.count.lock()
    }
}

impl Drop for RundownGuard {
    fn drop(&mut self) {
        let mut count = self.inner.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.inner.drained.notify_all();
        }
    }
}
