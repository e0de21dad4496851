//! Read-copy-update publication of the snapshot table.
//!
//! Readers call [`RcuCell::load`] and get a guard on the current version
//! without taking a lock or bumping a refcount. Writers build a complete
//! new version and [`RcuCell::publish`] it with a single pointer swap;
//! readers that loaded the old version keep using it until they drop it.
//!
//! Writers must serialize among themselves externally (the snapshot
//! workflow holds its writer mutex around clone, edit, and publish).
//!
//! # Logging
//!
//! - **TRACE** `sbt::snapshot`: `snapshot_table_load` (reader guard created)
//! - **DEBUG** `sbt::snapshot`: `snapshot_table_publish` (new version visible)

use arc_swap::ArcSwap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// A single RCU-protected value with a publication counter.
pub struct RcuCell<T> {
    inner: ArcSwap<T>,
    version: AtomicU64,
}

impl<T: fmt::Debug> fmt::Debug for RcuCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RcuCell")
            .field("value", &*self.load_arc())
            .field("version", &self.version())
            .finish()
    }
}

impl<T> RcuCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: ArcSwap::from_pointee(value),
            version: AtomicU64::new(0),
        }
    }

    /// Borrow the current version. Keep the guard short-lived.
    #[inline]
    pub fn load(&self) -> arc_swap::Guard<Arc<T>> {
        let guard = self.inner.load();
        trace!(
            target: "sbt::snapshot",
            version = self.version.load(Ordering::Relaxed),
            "snapshot_table_load"
        );
        guard
    }

    /// Take a counted reference to the current version, for readers that
    /// hold it across many queries.
    #[inline]
    pub fn load_arc(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Make `value` the current version and return the previous one.
    pub fn publish(&self, value: T) -> Arc<T> {
        let old = self.inner.swap(Arc::new(value));
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(target: "sbt::snapshot", version, "snapshot_table_publish");
        old
    }

    /// Number of versions published since creation.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}
