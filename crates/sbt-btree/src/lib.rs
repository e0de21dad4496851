#![forbid(unsafe_code)]
//! Btree transactions.
//!
//! A [`Transaction`] is one thread's handle on a [`BtreeFs`]. It owns a table
//! of [`path`]s (cursors with per-level node locks), a bump arena for values
//! staged during the attempt, and the list of pending updates. Iterators sit
//! on top of paths; [`Transaction::commit`] applies the updates under write
//! locks.
//!
//! Locks are six locks ([`lock::SixLock`]): read, intent and write. They are
//! always taken top-down and in `(btree, pos)` order across paths; when that
//! order would be violated, or a bounded wait expires, the operation fails
//! with [`sbt_error::SbtError::Restart`]. The transaction then drops its
//! locks and the caller re-runs the attempt from the top, usually through
//! [`Transaction::run`] or one of the other loops in [`restart`].
//!
//! Dropping locks does not forget what was observed: each locked level keeps
//! the node's sequence number, so [`Transaction::relock`] can retake the
//! locks cheaply if nothing changed, or restart with `LockSeqStale` if a
//! writer got in between.
//!
//! # Logging
//!
//! - **TRACE** `sbt::btree::lock`: `node_lock`, `node_relock_fail`,
//!   `node_lock_would_deadlock`
//! - **TRACE** `sbt::btree::path`: `path_alloc`, `path_get`, `path_put`,
//!   `path_clone`, `path_free`
//! - **TRACE** `sbt::btree::trans`: `trans_restart`, `trans_retry`
//! - **TRACE** `sbt::btree::cache`: `node_load`
//! - **DEBUG** `sbt::btree::trans`: `trans_begin_after_restart`,
//!   `trans_commit`, `trans_leaked_paths`
//! - **DEBUG** `sbt::btree::path`: `path_reclaim`
//! - **DEBUG** `sbt::btree::mem`: `trans_mem_promote`
//! - **WARN** `sbt::btree::cache`: `node_image_mismatch`
//! - **ERROR** `sbt::btree::cache`: `node_write_error`

pub mod commit;
pub mod config;
pub mod fs;
pub mod iter;
pub mod lock;
pub mod mem;
pub mod node;
pub mod path;
pub mod restart;
pub mod trans;
pub mod traverse;

pub use commit::{CommitFlags, CommitRequest, DiskReservation, JournalSink, NoopJournal};
pub use config::BtreeConfig;
pub use fs::{BtreeFs, RestartStats};
pub use iter::{BtreeIter, IterFlags};
pub use lock::{LockCounts, LockMode, LockOwner, SixLock};
pub use mem::{MemHandle, TransMem};
pub use node::{
    BtreeNode, BtreeRoot, CacheStats, ChildPtr, MemNodeIo, NodeCache, NodeImage, NodeIo,
    NodeKeys, NodePtr,
};
pub use path::{PathIdx, PathInfo, Uptodate};
pub use trans::{LockEvent, Transaction};
