//! Btree paths and the per-transaction path table.
//!
//! A path is a cursor from a root down to one level, with a node reference,
//! lock state and observed lock sequence at every level. Iterators and
//! pending updates hold paths by [`PathIdx`]; several holders may share one
//! path, in which case repositioning copies it first.

use crate::iter::IterFlags;
use crate::lock::LockMode;
use crate::node::BtreeNode;
use crate::trans::Transaction;
use sbt_error::{RestartReason, Result};
use sbt_types::{BTREE_MAX_DEPTH, Bkey, Bpos, BtreeId, POS_MIN};
use std::cmp::Reverse;
use std::fmt::Write as _;
use std::ops::{Index, IndexMut};
use std::sync::Arc;
use tracing::{debug, trace};

/// Index of a path in its transaction's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathIdx(u16);

impl PathIdx {
    #[must_use]
    pub const fn get(self) -> usize {
        self.0 as usize
    }
}

/// How much work the next traversal has to do. Ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Uptodate {
    Uptodate,
    NeedRelock,
    #[default]
    NeedTraverse,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct PathLevel {
    pub(crate) node: Option<Arc<BtreeNode>>,
    pub(crate) lock_seq: u32,
    pub(crate) held: Option<LockMode>,
}

#[derive(Debug, Clone)]
pub(crate) struct BtreePath {
    pub(crate) btree_id: BtreeId,
    pub(crate) pos: Bpos,
    pub(crate) level: u8,
    /// Levels below this one are locked intent rather than read.
    pub(crate) locks_want: u8,
    pub(crate) ref_count: u16,
    pub(crate) intent_ref: u16,
    pub(crate) uptodate: Uptodate,
    pub(crate) should_be_locked: bool,
    pub(crate) preserve: bool,
    pub(crate) sorted_idx: usize,
    pub(crate) l: [PathLevel; BTREE_MAX_DEPTH],
}

impl Default for BtreePath {
    fn default() -> Self {
        Self {
            btree_id: BtreeId::Extents,
            pos: POS_MIN,
            level: 0,
            locks_want: 0,
            ref_count: 0,
            intent_ref: 0,
            uptodate: Uptodate::NeedTraverse,
            should_be_locked: false,
            preserve: false,
            sorted_idx: 0,
            l: Default::default(),
        }
    }
}

impl BtreePath {
    pub(crate) fn mode_for(&self, level: usize) -> LockMode {
        if level < usize::from(self.locks_want) {
            LockMode::Intent
        } else {
            LockMode::Read
        }
    }

    /// Highest level that stays locked after a traversal.
    pub(crate) fn lock_top(&self) -> usize {
        usize::from(self.locks_want)
            .saturating_sub(1)
            .max(usize::from(self.level))
            .min(BTREE_MAX_DEPTH - 1)
    }

    pub(crate) fn sort_key(&self) -> (BtreeId, Bpos, Reverse<u8>) {
        (self.btree_id, self.pos, Reverse(self.level))
    }

    pub(crate) fn nodes_locked(&self) -> bool {
        self.l.iter().any(|l| l.held.is_some())
    }
}

/// Read-only snapshot of a path, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInfo {
    pub btree_id: BtreeId,
    pub pos: Bpos,
    pub level: u8,
    pub locks_want: u8,
    pub ref_count: u16,
    pub intent_ref: u16,
    pub uptodate: Uptodate,
    pub should_be_locked: bool,
    pub preserve: bool,
    pub held: [Option<LockMode>; BTREE_MAX_DEPTH],
    /// Per level: `(observed seq, live seq)` where a node is cached.
    pub seqs: [Option<(u32, u32)>; BTREE_MAX_DEPTH],
}

// ── Table ───────────────────────────────────────────────────────────────────

/// Slot storage with an allocation bitmap and a sorted index.
#[derive(Debug, Default)]
pub(crate) struct PathTable {
    paths: Vec<BtreePath>,
    allocated: Vec<u64>,
    sorted: Vec<PathIdx>,
    nr_allocated: usize,
}

impl PathTable {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let mut paths = Vec::with_capacity(capacity);
        paths.resize_with(capacity, BtreePath::default);
        Self {
            paths,
            allocated: vec![0; capacity.div_ceil(64)],
            sorted: Vec::with_capacity(capacity),
            nr_allocated: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.paths.len()
    }

    pub(crate) const fn nr_allocated(&self) -> usize {
        self.nr_allocated
    }

    pub(crate) fn is_allocated(&self, idx: PathIdx) -> bool {
        let i = idx.get();
        i < self.paths.len() && self.allocated[i / 64] & (1 << (i % 64)) != 0
    }

    fn first_free(&self) -> Option<usize> {
        self.allocated.iter().enumerate().find_map(|(w, word)| {
            let i = w * 64 + (!word).trailing_zeros() as usize;
            (*word != u64::MAX && i < self.paths.len()).then_some(i)
        })
    }

    /// Claim a slot, doubling capacity up to `max`. The slot is reset and
    /// not yet in the sorted index.
    #[expect(clippy::cast_possible_truncation)]
    pub(crate) fn alloc(&mut self, max: usize) -> Option<PathIdx> {
        let i = match self.first_free() {
            Some(i) => i,
            None => {
                let len = self.paths.len();
                if len >= max {
                    return None;
                }
                let new_len = (len * 2).max(1).min(max);
                self.paths.resize_with(new_len, BtreePath::default);
                self.allocated.resize(new_len.div_ceil(64), 0);
                len
            }
        };
        self.allocated[i / 64] |= 1 << (i % 64);
        self.nr_allocated += 1;
        self.paths[i] = BtreePath::default();
        Some(PathIdx(i as u16))
    }

    pub(crate) fn free(&mut self, idx: PathIdx) {
        assert!(self.is_allocated(idx), "freeing unallocated path {}", idx.get());
        let i = idx.get();
        self.allocated[i / 64] &= !(1 << (i % 64));
        self.nr_allocated -= 1;
        self.sort_remove(idx);
        self.paths[i].l = Default::default();
    }

    /// Allocated indices in slot order.
    #[expect(clippy::cast_possible_truncation)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = PathIdx> + '_ {
        (0..self.paths.len())
            .map(|i| PathIdx(i as u16))
            .filter(|&idx| self.is_allocated(idx))
    }

    /// Allocated indices in `(btree, pos, level desc)` order.
    pub(crate) fn sorted(&self) -> &[PathIdx] {
        &self.sorted
    }

    pub(crate) fn sort_insert(&mut self, idx: PathIdx) {
        let key = self.paths[idx.get()].sort_key();
        let at = self
            .sorted
            .partition_point(|&other| self.paths[other.get()].sort_key() <= key);
        self.sorted.insert(at, idx);
        self.reindex_from(at);
    }

    fn sort_remove(&mut self, idx: PathIdx) {
        let at = self.paths[idx.get()].sorted_idx;
        if self.sorted.get(at) == Some(&idx) {
            self.sorted.remove(at);
            self.reindex_from(at);
        }
    }

    /// Re-place `idx` after its position changed.
    pub(crate) fn resort(&mut self, idx: PathIdx) {
        self.sort_remove(idx);
        self.sort_insert(idx);
    }

    fn reindex_from(&mut self, from: usize) {
        for (i, &idx) in self.sorted.iter().enumerate().skip(from) {
            self.paths[idx.get()].sorted_idx = i;
        }
    }

    /// Any allocated path with this exact `(btree, pos, level)`.
    pub(crate) fn find(&self, btree_id: BtreeId, pos: Bpos, level: u8) -> Option<PathIdx> {
        let key = (btree_id, pos, Reverse(level));
        self.sorted
            .binary_search_by(|&idx| self.paths[idx.get()].sort_key().cmp(&key))
            .ok()
            .map(|at| self.sorted[at])
    }

    pub(crate) fn clear(&mut self) {
        self.allocated.fill(0);
        self.sorted.clear();
        self.nr_allocated = 0;
        for path in &mut self.paths {
            path.l = Default::default();
        }
    }
}

impl Index<PathIdx> for PathTable {
    type Output = BtreePath;

    fn index(&self, idx: PathIdx) -> &BtreePath {
        assert!(self.is_allocated(idx), "path index {} not allocated", idx.get());
        &self.paths[idx.get()]
    }
}

impl IndexMut<PathIdx> for PathTable {
    fn index_mut(&mut self, idx: PathIdx) -> &mut BtreePath {
        assert!(self.is_allocated(idx), "path index {} not allocated", idx.get());
        &mut self.paths[idx.get()]
    }
}

// ── Path operations ─────────────────────────────────────────────────────────

impl Transaction<'_> {
    /// Get a path to `(btree_id, pos)` at `level`, sharing an existing one
    /// at the same position or reviving a pooled one where possible.
    pub fn get_path(
        &mut self,
        btree_id: BtreeId,
        pos: Bpos,
        locks_want: u8,
        level: u8,
        flags: IterFlags,
    ) -> Result<PathIdx> {
        assert!(
            usize::from(level) < BTREE_MAX_DEPTH,
            "path level {level} out of range"
        );
        let intent = flags.contains(IterFlags::INTENT);
        let locks_want = locks_want.max(u8::from(intent));
        assert!(
            usize::from(locks_want) <= BTREE_MAX_DEPTH,
            "locks_want {locks_want} out of range"
        );

        let idx = if let Some(idx) = self.paths.find(btree_id, pos, level) {
            self.path_get(idx, intent);
            idx
        } else if let Some(idx) = self.find_pooled(btree_id, level) {
            self.paths[idx].preserve = false;
            self.path_get(idx, intent);
            self.path_set_pos(idx, pos, intent)?
        } else {
            let idx = self.path_alloc(btree_id, pos, level)?;
            self.path_get(idx, intent);
            idx
        };

        if !flags.contains(IterFlags::NOPRESERVE) {
            self.paths[idx].preserve = true;
        }
        if locks_want > self.paths[idx].locks_want {
            self.path_upgrade(idx, locks_want);
        }
        Ok(idx)
    }

    fn find_pooled(&self, btree_id: BtreeId, level: u8) -> Option<PathIdx> {
        self.paths.iter().find(|&idx| {
            let p = &self.paths[idx];
            p.ref_count == 0 && p.preserve && p.btree_id == btree_id && p.level == level
        })
    }

    pub(crate) fn path_get(&mut self, idx: PathIdx, intent: bool) {
        let p = &mut self.paths[idx];
        p.ref_count += 1;
        p.intent_ref += u16::from(intent);
        trace!(
            target: "sbt::btree::path",
            trans_id = self.id,
            path = idx.get(),
            refs = p.ref_count,
            "path_get"
        );
    }

    /// Drop a reference. At zero the path is freed unless it is marked
    /// preserve and no other path duplicates it.
    pub fn put_path(&mut self, idx: PathIdx, intent: bool) {
        let p = &mut self.paths[idx];
        assert!(p.ref_count > 0, "path {} refcount underflow", idx.get());
        if intent {
            assert!(p.intent_ref > 0, "path {} intent refcount underflow", idx.get());
            p.intent_ref -= 1;
        }
        p.ref_count -= 1;
        trace!(
            target: "sbt::btree::path",
            trans_id = self.id,
            path = idx.get(),
            refs = p.ref_count,
            "path_put"
        );
        if p.ref_count > 0 {
            return;
        }
        if !p.preserve || self.has_duplicate(idx) {
            self.path_free(idx);
        }
    }

    fn has_duplicate(&self, idx: PathIdx) -> bool {
        let key = self.paths[idx].sort_key();
        self.paths
            .iter()
            .any(|other| other != idx && self.paths[other].sort_key() == key)
    }

    pub(crate) fn path_free(&mut self, idx: PathIdx) {
        self.path_unlock(idx);
        trace!(target: "sbt::btree::path", trans_id = self.id, path = idx.get(), "path_free");
        self.paths.free(idx);
    }

    fn path_alloc(&mut self, btree_id: BtreeId, pos: Bpos, level: u8) -> Result<PathIdx> {
        let idx = self.path_slot()?;
        let p = &mut self.paths[idx];
        p.btree_id = btree_id;
        p.pos = pos;
        p.level = level;
        self.paths.sort_insert(idx);
        trace!(
            target: "sbt::btree::path",
            trans_id = self.id,
            path = idx.get(),
            btree = btree_id.name(),
            %pos,
            level,
            "path_alloc"
        );
        Ok(idx)
    }

    fn path_slot(&mut self) -> Result<PathIdx> {
        let cfg = self.fs.config();
        let (soft, max) = (cfg.path_soft_limit, cfg.max_paths);
        if self.paths.nr_allocated() >= soft {
            self.reclaim_paths();
        }
        match self.paths.alloc(max) {
            Some(idx) => Ok(idx),
            None => Err(self.restart(RestartReason::TooManyPaths)),
        }
    }

    /// Free every unreferenced path.
    fn reclaim_paths(&mut self) {
        let idle: Vec<PathIdx> = self
            .paths
            .iter()
            .filter(|&idx| self.paths[idx].ref_count == 0)
            .collect();
        for &idx in &idle {
            self.path_free(idx);
        }
        debug!(
            target: "sbt::btree::path",
            trans_id = self.id,
            freed = idle.len(),
            allocated = self.paths.nr_allocated(),
            "path_reclaim"
        );
    }

    /// Copy `idx` into a fresh slot holding the same locks, with one
    /// reference from the caller.
    fn path_clone(&mut self, idx: PathIdx, intent: bool) -> Result<PathIdx> {
        let new = self.path_slot()?;
        let mut copy = self.paths[idx].clone();
        copy.ref_count = 0;
        copy.intent_ref = 0;
        copy.preserve = false;
        copy.should_be_locked = false;
        for level in &copy.l {
            if let (Some(node), Some(mode)) = (&level.node, level.held) {
                node.lock().increment(mode, self.id);
            }
        }
        self.paths[new] = copy;
        self.paths.sort_insert(new);
        self.path_get(new, intent);
        trace!(
            target: "sbt::btree::path",
            trans_id = self.id,
            from = idx.get(),
            path = new.get(),
            "path_clone"
        );
        Ok(new)
    }

    /// Make `idx` safe to modify: a path that is shared or preserved is
    /// copied and the caller's reference moves to the copy.
    pub fn path_make_mut(&mut self, idx: PathIdx, intent: bool) -> Result<PathIdx> {
        let p = &self.paths[idx];
        if p.ref_count <= 1 && !p.preserve {
            return Ok(idx);
        }
        let new = self.path_clone(idx, intent)?;
        self.put_path(idx, intent);
        Ok(new)
    }

    /// Move a path. Levels whose node no longer covers `pos` are dropped;
    /// the path then needs a traversal.
    pub fn path_set_pos(&mut self, idx: PathIdx, pos: Bpos, intent: bool) -> Result<PathIdx> {
        if self.paths[idx].pos == pos {
            return Ok(idx);
        }
        let idx = self.path_make_mut(idx, intent)?;
        {
            let p = &mut self.paths[idx];
            p.pos = pos;
            p.should_be_locked = false;
        }
        self.paths.resort(idx);

        let start = usize::from(self.paths[idx].level);
        let mut l = start;
        while l < BTREE_MAX_DEPTH {
            match &self.paths[idx].l[l].node {
                Some(node) if node.covers(pos) => break,
                Some(_) => {
                    self.unlock_level(idx, l);
                    self.paths[idx].l[l].node = None;
                }
                None => {}
            }
            l += 1;
        }
        if l != start {
            self.paths[idx].uptodate = Uptodate::NeedTraverse;
        }
        Ok(idx)
    }

    pub fn path_set_should_be_locked(&mut self, idx: PathIdx) {
        debug_assert!(self.paths[idx].uptodate == Uptodate::Uptodate);
        self.paths[idx].should_be_locked = true;
    }

    /// Raise `locks_want`. Levels now wanting intent but holding read are
    /// released so the next traversal relocks them as intent.
    pub fn path_upgrade(&mut self, idx: PathIdx, locks_want: u8) {
        self.paths[idx].locks_want = locks_want;
        let top = usize::from(locks_want).min(BTREE_MAX_DEPTH);
        let mut dropped = false;
        for l in usize::from(self.paths[idx].level)..top {
            if self.paths[idx].l[l].held == Some(LockMode::Read) {
                self.unlock_level(idx, l);
                dropped = true;
            }
        }
        if dropped {
            let p = &mut self.paths[idx];
            p.uptodate = p.uptodate.max(Uptodate::NeedRelock);
        }
    }

    /// Lower `locks_want`, trading intent for read at the path's own level
    /// and dropping intent above it.
    pub fn path_downgrade(&mut self, idx: PathIdx, locks_want: u8) {
        let owner = self.id;
        let p = &mut self.paths[idx];
        let floor = u8::from(p.intent_ref > 0);
        p.locks_want = locks_want.max(floor);
        let level = usize::from(p.level);
        for l in level..BTREE_MAX_DEPTH {
            if p.l[l].held != Some(LockMode::Intent) || l < usize::from(p.locks_want) {
                continue;
            }
            let Some(node) = p.l[l].node.clone() else {
                continue;
            };
            if l == level && node.lock().try_lock(LockMode::Read, owner) {
                p.l[l].held = Some(LockMode::Read);
            } else {
                p.l[l].held = None;
            }
            node.lock().unlock(LockMode::Intent, owner);
        }
    }

    pub(crate) fn unlock_level(&mut self, idx: PathIdx, level: usize) {
        let owner = self.id;
        let pl = &mut self.paths[idx].l[level];
        if let Some(mode) = pl.held.take() {
            if let Some(node) = &pl.node {
                node.lock().unlock(mode, owner);
            }
        }
    }

    /// Release every lock on a path, keeping nodes and sequences.
    pub(crate) fn path_unlock(&mut self, idx: PathIdx) {
        if !self.paths[idx].nodes_locked() {
            return;
        }
        for l in 0..BTREE_MAX_DEPTH {
            self.unlock_level(idx, l);
        }
        let p = &mut self.paths[idx];
        p.uptodate = p.uptodate.max(Uptodate::NeedRelock);
    }

    /// The key exactly at the path's position, or a deleted key there.
    pub fn path_peek_slot_exact(&mut self, idx: PathIdx) -> Result<Bkey> {
        self.path_traverse(idx)?;
        let pos = self.paths[idx].pos;
        Ok(self.path_leaf(idx).get_exact(pos).unwrap_or_else(|| Bkey::deleted(pos)))
    }

    /// Node at the path's level; valid only after a traversal.
    pub(crate) fn path_leaf(&self, idx: PathIdx) -> Arc<BtreeNode> {
        let p = &self.paths[idx];
        match &p.l[usize::from(p.level)].node {
            Some(node) => Arc::clone(node),
            None => panic!("path {} has no node at level {}", idx.get(), p.level),
        }
    }

    #[must_use]
    pub fn path_info(&self, idx: PathIdx) -> PathInfo {
        let p = &self.paths[idx];
        PathInfo {
            btree_id: p.btree_id,
            pos: p.pos,
            level: p.level,
            locks_want: p.locks_want,
            ref_count: p.ref_count,
            intent_ref: p.intent_ref,
            uptodate: p.uptodate,
            should_be_locked: p.should_be_locked,
            preserve: p.preserve,
            held: std::array::from_fn(|l| p.l[l].held),
            seqs: std::array::from_fn(|l| {
                p.l[l]
                    .node
                    .as_ref()
                    .map(|n| (p.l[l].lock_seq, n.lock().seq()))
            }),
        }
    }

    #[must_use]
    pub fn nr_paths(&self) -> usize {
        self.paths.nr_allocated()
    }

    /// One line per path, in lock order.
    #[must_use]
    pub fn paths_to_text(&self) -> String {
        let mut out = String::new();
        for &idx in self.paths.sorted() {
            let p = &self.paths[idx];
            let locks: String = p
                .l
                .iter()
                .map(|l| l.held.map_or('-', LockMode::as_char))
                .collect();
            let _ = writeln!(
                out,
                "{:>3} {} l={} pos={} ref={}/{} want={} {:?} locks={}{}{}",
                idx.get(),
                p.btree_id,
                p.level,
                p.pos,
                p.ref_count,
                p.intent_ref,
                p.locks_want,
                p.uptodate,
                locks,
                if p.should_be_locked { " S" } else { "" },
                if p.preserve { " P" } else { "" },
            );
        }
        out
    }
}
