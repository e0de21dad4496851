//! Path traversal: relock, walk up to a still-valid node, lock the root if
//! nothing is, then descend with lock coupling.
//!
//! Locks are acquired top-down and in `(btree, pos)` order across paths. A
//! lock that would break that order is tried once; if it is busy the
//! transaction restarts instead of waiting.

use crate::lock::LockMode;
use crate::node::{BtreeNode, BtreeRoot};
use crate::path::{PathIdx, PathLevel, Uptodate};
use crate::trans::{LockEvent, Transaction};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use sbt_error::{RestartReason, Result, SbtError};
use sbt_types::BTREE_MAX_DEPTH;
use std::sync::Arc;
use tracing::trace;

impl Transaction<'_> {
    /// Bring `idx` up to date: every level from the path's level to its
    /// `locks_want` top is locked and its recorded sequence is current.
    pub fn path_traverse(&mut self, idx: PathIdx) -> Result<()> {
        self.verify_not_in_restart();
        if !self.locked {
            self.relock()?;
        }
        if self.paths[idx].uptodate == Uptodate::Uptodate {
            return Ok(());
        }
        self.traverse_one(idx)
    }

    pub(crate) fn traverse_one(&mut self, idx: PathIdx) -> Result<()> {
        self.maybe_inject_restart()?;

        if self.paths[idx].uptodate == Uptodate::NeedRelock {
            if self.relock_path(idx) {
                self.paths[idx].uptodate = Uptodate::Uptodate;
                return Ok(());
            }
            if self.paths[idx].should_be_locked {
                return Err(self.restart(RestartReason::LockSeqStale));
            }
        }

        self.paths[idx].uptodate = Uptodate::NeedTraverse;
        self.traversal_seq += 1;

        let top = match self.up_until_good_node(idx) {
            Some(level) => level,
            None => self.path_lock_root(idx)?,
        };
        let target = usize::from(self.paths[idx].level);
        let mut level = top;
        while level > target {
            self.path_down(idx, level)?;
            level -= 1;
        }
        self.drop_unneeded_locks(idx);
        self.paths[idx].uptodate = Uptodate::Uptodate;
        debug_assert!(self.path_seqs_current(idx));
        Ok(())
    }

    /// Retake every lock the path should hold, top-down, without blocking.
    /// Succeeds only if no node changed since it was last observed.
    pub(crate) fn relock_path(&mut self, idx: PathIdx) -> bool {
        let owner = self.id;
        let (level, top) = {
            let p = &self.paths[idx];
            (usize::from(p.level), p.lock_top())
        };
        let root_level = self
            .fs
            .root(self.paths[idx].btree_id)
            .map_or(level, |r| usize::from(r.level).max(level));
        for l in (level..=top.min(root_level)).rev() {
            let p = &mut self.paths[idx];
            let mode = p.mode_for(l);
            let pl = &mut p.l[l];
            if pl.held.is_some() {
                continue;
            }
            let Some(node) = &pl.node else {
                return false;
            };
            if !node.lock().relock(mode, owner, pl.lock_seq) {
                trace!(
                    target: "sbt::btree::lock",
                    trans_id = owner,
                    path = idx.get(),
                    node = node.ptr().0,
                    level = l,
                    seq = pl.lock_seq,
                    live_seq = node.lock().seq(),
                    "node_relock_fail"
                );
                return false;
            }
            pl.held = Some(mode);
        }
        true
    }

    /// Lowest cached level, at or above the path's level, whose node still
    /// covers the position and can be relocked, with every level above it up
    /// to `lock_top` relocked as well. When an upper level cannot be
    /// relocked the search resumes above it. Levels below the returned one
    /// are released.
    fn up_until_good_node(&mut self, idx: PathIdx) -> Option<usize> {
        let (target, top, btree_id) = {
            let p = &self.paths[idx];
            (usize::from(p.level), p.lock_top(), p.btree_id)
        };
        let root = self.fs.root(btree_id);
        let root_level = root.map_or(target, |r| usize::from(r.level));
        let mut from = target;
        'search: loop {
            let good = (from..BTREE_MAX_DEPTH).find(|&l| self.relock_level(idx, l, root, true))?;
            for upper in good + 1..=top.min(root_level) {
                if !self.relock_level(idx, upper, root, false) {
                    for below in target..upper {
                        self.unlock_level(idx, below);
                        self.paths[idx].l[below].node = None;
                    }
                    from = upper + 1;
                    continue 'search;
                }
            }
            for below in target..good {
                self.unlock_level(idx, below);
                self.paths[idx].l[below].node = None;
            }
            return Some(good);
        }
    }

    /// Whether level `l` holds a cached node that still covers the path's
    /// position and is (or could be re-) locked at its last sequence. A node
    /// that no longer covers the position is dropped; with `forget`, so is a
    /// node whose relock failed.
    fn relock_level(
        &mut self,
        idx: PathIdx,
        l: usize,
        root: Option<BtreeRoot>,
        forget: bool,
    ) -> bool {
        let owner = self.id;
        let pos = self.paths[idx].pos;
        let Some(node) = self.paths[idx].l[l].node.clone() else {
            return false;
        };
        let is_stale_root = root.is_some_and(|r| usize::from(r.level) == l && r.ptr != node.ptr());
        if !node.covers(pos) || is_stale_root {
            self.unlock_level(idx, l);
            self.paths[idx].l[l].node = None;
            return false;
        }
        let mode = self.paths[idx].mode_for(l);
        let pl = &mut self.paths[idx].l[l];
        if pl.held.is_some() {
            return true;
        }
        if !node.lock().relock(mode, owner, pl.lock_seq) {
            if forget {
                pl.node = None;
            }
            return false;
        }
        pl.held = Some(mode);
        true
    }

    /// Lock the current root, retrying if it changed while we waited.
    fn path_lock_root(&mut self, idx: PathIdx) -> Result<usize> {
        let btree_id = self.paths[idx].btree_id;
        loop {
            let root = self
                .fs
                .root(btree_id)
                .ok_or_else(|| SbtError::NotFound(format!("btree {btree_id} has no root")))?;
            let level = usize::from(root.level);
            let target = self.paths[idx].level;
            if root.level < target {
                return Err(SbtError::Invalid(format!(
                    "path level {target} is above the {btree_id} root at level {}",
                    root.level
                )));
            }
            let node = self.fs.cache().get(btree_id, root.ptr, Some(root.level))?;
            for l in usize::from(target)..BTREE_MAX_DEPTH {
                self.unlock_level(idx, l);
                self.paths[idx].l[l].node = None;
            }
            let mode = self.paths[idx].mode_for(level);
            self.lock_node(idx, &node, mode)?;
            if self.fs.root(btree_id).map(|r| r.ptr) != Some(node.ptr()) {
                node.lock().unlock(mode, self.id);
                continue;
            }
            let seq = node.lock().seq();
            self.paths[idx].l[level] = PathLevel {
                node: Some(node),
                lock_seq: seq,
                held: Some(mode),
            };
            return Ok(level);
        }
    }

    /// Step from the locked node at `level` to its child covering the
    /// path's position. The parent is released once the child is locked,
    /// unless `locks_want` keeps it.
    fn path_down(&mut self, idx: PathIdx, level: usize) -> Result<()> {
        let (btree_id, pos) = {
            let p = &self.paths[idx];
            (p.btree_id, p.pos)
        };
        let parent = match &self.paths[idx].l[level].node {
            Some(node) => Arc::clone(node),
            None => panic!("path {} descending from unlocked level {level}", idx.get()),
        };
        let child_ptr = parent.child_for(pos).ok_or_else(|| SbtError::Corruption {
            node: parent.ptr().0,
            detail: format!("no child covers {pos}"),
        })?;
        let child_level = level - 1;
        #[expect(clippy::cast_possible_truncation)]
        let child = self
            .fs
            .cache()
            .get(btree_id, child_ptr, Some(child_level as u8))?;
        if !child.covers(pos) {
            return Err(SbtError::Corruption {
                node: child.ptr().0,
                detail: format!(
                    "child range {}..={} does not cover {pos}",
                    child.min_key(),
                    child.max_key()
                ),
            });
        }

        self.unlock_level(idx, child_level);
        let mode = self.paths[idx].mode_for(child_level);
        self.lock_node(idx, &child, mode)?;
        let seq = child.lock().seq();
        self.paths[idx].l[child_level] = PathLevel {
            node: Some(child),
            lock_seq: seq,
            held: Some(mode),
        };
        if level > self.paths[idx].lock_top() {
            self.unlock_level(idx, level);
        }
        Ok(())
    }

    /// Release levels outside `[level, lock_top]`; nodes and sequences stay.
    fn drop_unneeded_locks(&mut self, idx: PathIdx) {
        let (level, top) = {
            let p = &self.paths[idx];
            (usize::from(p.level), p.lock_top())
        };
        for l in (0..level).chain(top + 1..BTREE_MAX_DEPTH) {
            self.unlock_level(idx, l);
        }
    }

    /// Try, then (if ordering allows) wait with a bound. Every failure is a
    /// `LockNotAvailable` restart.
    fn lock_node(&mut self, idx: PathIdx, node: &Arc<BtreeNode>, mode: LockMode) -> Result<()> {
        let owner = self.id;
        if !node.lock().try_lock(mode, owner) {
            if self.would_deadlock(idx, node) {
                trace!(
                    target: "sbt::btree::lock",
                    trans_id = owner,
                    path = idx.get(),
                    node = node.ptr().0,
                    "node_lock_would_deadlock"
                );
                return Err(self.restart(RestartReason::LockNotAvailable));
            }
            if !node.lock().lock_timeout(mode, owner, self.fs.config().lock_wait) {
                return Err(self.restart(RestartReason::LockNotAvailable));
            }
        }
        trace!(
            target: "sbt::btree::lock",
            trans_id = owner,
            path = idx.get(),
            node = node.ptr().0,
            level = node.level(),
            mode = ?mode,
            "node_lock"
        );
        if self.fs.config().trace_locks {
            self.lock_trace.push(LockEvent {
                traversal: self.traversal_seq,
                path: idx,
                btree_id: node.btree_id(),
                level: node.level(),
                node: node.ptr(),
                mode,
            });
        }
        Ok(())
    }

    /// Whether blocking on `node` could deadlock: some lock we hold orders
    /// after the requested `(btree, pos)`, or sits below it in the same btree.
    fn would_deadlock(&self, idx: PathIdx, node: &BtreeNode) -> bool {
        let want = {
            let p = &self.paths[idx];
            (p.btree_id, p.pos)
        };
        let level = usize::from(node.level());
        self.paths.iter().any(|other| {
            let o = &self.paths[other];
            o.l.iter().enumerate().any(|(l, pl)| {
                pl.held.is_some()
                    && ((o.btree_id, o.pos) > want || (o.btree_id == want.0 && l < level))
            })
        })
    }

    pub(crate) fn path_seqs_current(&self, idx: PathIdx) -> bool {
        self.paths[idx]
            .l
            .iter()
            .filter(|pl| pl.held.is_some())
            .all(|pl| pl.node.as_ref().is_some_and(|n| n.lock().seq() == pl.lock_seq))
    }

    /// Debug builds only: restart one traversal in
    /// `inject_restart_one_in`, if configured.
    pub(crate) fn maybe_inject_restart(&mut self) -> Result<()> {
        if !cfg!(debug_assertions) {
            return Ok(());
        }
        let Some(one_in) = self.fs.config().inject_restart_one_in else {
            return Ok(());
        };
        let seed = self.id;
        let rng = self
            .fault_rng
            .get_or_insert_with(|| SmallRng::seed_from_u64(seed));
        if rng.gen_range(0..one_in.max(1)) == 0 {
            return Err(self.restart(RestartReason::FaultInjected));
        }
        Ok(())
    }
}
