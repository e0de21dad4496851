//! Transaction lifecycle: creation, attempts, restarts, unlock/relock,
//! arena access and release on drop.

use crate::commit::PendingUpdate;
use crate::fs::BtreeFs;
use crate::lock::LockMode;
use crate::mem::{MemHandle, TransMem};
use crate::node::NodePtr;
use crate::path::{PathIdx, PathTable, Uptodate};
use rand::rngs::SmallRng;
use sbt_error::{RestartReason, Result, SbtError};
use sbt_types::BtreeId;
use std::fmt;
use tracing::{debug, trace};

/// One traversal lock acquisition, recorded when `trace_locks` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockEvent {
    /// Traversal number within the transaction; equal numbers are one walk.
    pub traversal: u64,
    pub path: PathIdx,
    pub btree_id: BtreeId,
    pub level: u8,
    pub node: NodePtr,
    pub mode: LockMode,
}

/// A unit of work against the btrees.
///
/// Owns its paths, pending updates and arena. All of it is single-threaded;
/// concurrency is between transactions, through node locks.
pub struct Transaction<'a> {
    pub(crate) fs: &'a BtreeFs,
    pub(crate) id: u64,
    pub(crate) paths: PathTable,
    pub(crate) mem: TransMem,
    pub(crate) updates: Vec<PendingUpdate>,
    pub(crate) restart_count: u32,
    pub(crate) restarted: Option<RestartReason>,
    pub(crate) restarts_by_reason: [u32; RestartReason::ALL.len()],
    /// False after `unlock()`; traversal relocks first.
    pub(crate) locked: bool,
    pub(crate) traversal_seq: u64,
    pub(crate) lock_trace: Vec<LockEvent>,
    pub(crate) fault_rng: Option<SmallRng>,
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("paths", &self.paths.nr_allocated())
            .field("updates", &self.updates.len())
            .field("restart_count", &self.restart_count)
            .field("restarted", &self.restarted)
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(fs: &'a BtreeFs) -> Self {
        let cfg = fs.config();
        Self {
            fs,
            id: fs.next_trans_id(),
            paths: fs.take_path_table(),
            mem: TransMem::new(cfg.arena_initial_bytes, cfg.arena_max_bytes),
            updates: Vec::new(),
            restart_count: 0,
            restarted: None,
            restarts_by_reason: [0; RestartReason::ALL.len()],
            locked: true,
            traversal_seq: 0,
            lock_trace: Vec::new(),
            fault_rng: None,
        }
    }

    #[must_use]
    pub const fn fs(&self) -> &'a BtreeFs {
        self.fs
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Attempts that ended in a restart.
    #[must_use]
    pub const fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// The pending restart, if the current attempt has failed with one.
    #[must_use]
    pub const fn restarted(&self) -> Option<RestartReason> {
        self.restarted
    }

    #[must_use]
    pub const fn restarts(&self, reason: RestartReason) -> u32 {
        self.restarts_by_reason[reason.index()]
    }

    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.locked
    }

    /// Start an attempt. Pending updates and arena memory are discarded and,
    /// after a restart, every lock is dropped. Unreferenced paths are freed
    /// unless marked preserve, which buys them one more attempt.
    pub fn begin(&mut self) -> u32 {
        let restarted = self.restarted.take();
        if let Some(reason) = restarted {
            self.restart_count += 1;
            debug!(
                target: "sbt::btree::trans",
                trans_id = self.id,
                restart_count = self.restart_count,
                reason = reason.name(),
                "trans_begin_after_restart"
            );
        }

        for update in std::mem::take(&mut self.updates) {
            self.put_path(update.path, true);
        }
        self.mem.reset();

        let idxs: Vec<PathIdx> = self.paths.iter().collect();
        for idx in idxs {
            if !self.paths.is_allocated(idx) {
                continue;
            }
            let p = &mut self.paths[idx];
            p.should_be_locked = false;
            if p.ref_count == 0 {
                if p.preserve {
                    p.preserve = false;
                } else {
                    self.path_free(idx);
                }
            }
        }

        if restarted.is_some() {
            self.unlock_paths();
        }
        self.locked = true;
        self.restart_count
    }

    /// Record a restart and build the error that carries it up to the
    /// nearest retry loop.
    pub fn restart(&mut self, reason: RestartReason) -> SbtError {
        self.restarted = Some(reason);
        self.restarts_by_reason[reason.index()] += 1;
        self.fs.note_restart(reason);
        trace!(
            target: "sbt::btree::trans",
            trans_id = self.id,
            reason = reason.name(),
            restart_count = self.restart_count,
            "trans_restart"
        );
        SbtError::Restart(reason)
    }

    /// A restart error that did not come from this transaction's own
    /// `restart()` (a closure built it) still marks the attempt restarted.
    pub(crate) fn note_restart_error(&mut self, err: &SbtError) {
        if let Some(reason) = err.restart_reason() {
            if self.restarted.is_none() {
                let _ = self.restart(reason);
            }
        }
    }

    pub(crate) fn verify_not_in_restart(&self) {
        if let Some(reason) = self.restarted {
            panic!(
                "transaction {} used while in restart ({reason}); the attempt must end first",
                self.id
            );
        }
    }

    /// An attempt that reported success must not have restarted.
    pub(crate) fn verify_not_restarted(&self, restart_count: u32) {
        if self.restart_count != restart_count || self.restarted.is_some() {
            panic!(
                "transaction {} restarted ({:?}, count {} -> {}) but the attempt reported success",
                self.id, self.restarted, restart_count, self.restart_count
            );
        }
    }

    fn unlock_paths(&mut self) {
        let idxs: Vec<PathIdx> = self.paths.iter().collect();
        for idx in idxs {
            self.path_unlock(idx);
        }
    }

    /// Drop every lock, keeping nodes and sequences so `relock` can
    /// revalidate them.
    pub fn unlock(&mut self) {
        self.unlock_paths();
        self.locked = false;
    }

    /// Relock every should-be-locked path. If any node changed since it was
    /// observed the transaction restarts with `LockSeqStale`.
    pub fn relock(&mut self) -> Result<()> {
        let sorted = self.paths.sorted().to_vec();
        for idx in sorted {
            if !self.paths[idx].should_be_locked {
                continue;
            }
            if !self.relock_path(idx) {
                return Err(self.restart(RestartReason::LockSeqStale));
            }
            self.paths[idx].uptodate = Uptodate::Uptodate;
        }
        self.locked = true;
        Ok(())
    }

    // ── Arena ──────────────────────────────────────────────────────────────

    pub fn mem_alloc(&mut self, size: usize) -> Result<MemHandle> {
        self.mem.alloc(size)
    }

    pub fn mem_alloc_copy(&mut self, bytes: &[u8]) -> Result<MemHandle> {
        self.mem.alloc_copy(bytes)
    }

    #[must_use]
    pub fn mem(&self, handle: MemHandle) -> &[u8] {
        self.mem.get(handle)
    }

    pub fn mem_mut(&mut self, handle: MemHandle) -> &mut [u8] {
        self.mem.get_mut(handle)
    }

    #[must_use]
    pub fn mem_capacity(&self) -> usize {
        self.mem.capacity()
    }

    // ── Diagnostics ────────────────────────────────────────────────────────

    #[must_use]
    pub fn lock_trace(&self) -> &[LockEvent] {
        &self.lock_trace
    }

    pub fn clear_lock_trace(&mut self) {
        self.lock_trace.clear();
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        let leaked = self
            .paths
            .iter()
            .filter(|&idx| self.paths[idx].ref_count > 0)
            .count();
        if leaked > 0 {
            debug!(
                target: "sbt::btree::trans",
                trans_id = self.id,
                leaked,
                pending_updates = self.updates.len(),
                "trans_leaked_paths"
            );
        }
        self.unlock_paths();
        let table = std::mem::take(&mut self.paths);
        self.fs.return_path_table(table);
    }
}
