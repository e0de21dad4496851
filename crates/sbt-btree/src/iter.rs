//! Btree iterators.
//!
//! An iterator owns a reference to a path and adds the search policy on
//! top: snapshot filtering, whiteout skipping, extent semantics, slot
//! synthesis, and the overlay of the transaction's own pending updates.
//!
//! With snapshot filtering, a key at snapshot `s` is visible to an iterator
//! at snapshot `i` iff `s == i` or `s` is an ancestor of `i`. Versions of one
//! logical position sort by snapshot id and descendants have lower ids, so the
//! first visible version met going forward from `(pos, i)` is the closest one.
//! If that version is a whiteout the position is skipped.
//!
//! Extents are indexed by their end: a forward search starts at the
//! successor of the iterator position and stops once a key starts at or
//! after the bound, and a returned key is clipped to the bound.

use crate::node::BtreeNode;
use crate::path::PathIdx;
use crate::trans::Transaction;
use sbt_error::{Result, SbtError};
use sbt_snapshot::SnapshotTable;
use sbt_types::{Bkey, Bpos, BtreeId, POS_MIN, SPOS_MAX, SnapshotId};
use std::cmp::Ordering;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

/// Iterator behaviour switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IterFlags(pub u32);

impl IterFlags {
    pub const NONE: Self = Self(0);
    /// Return a key for every position, synthesizing deleted keys and holes.
    pub const SLOTS: Self = Self(1 << 0);
    /// Take intent locks on the leaf.
    pub const INTENT: Self = Self(1 << 1);
    pub const IS_EXTENTS: Self = Self(1 << 2);
    /// Treat an extents btree as plain keys.
    pub const NOT_EXTENTS: Self = Self(1 << 3);
    /// Return every snapshot version; no filtering.
    pub const ALL_SNAPSHOTS: Self = Self(1 << 4);
    pub const FILTER_SNAPSHOTS: Self = Self(1 << 5);
    /// Merge the transaction's pending updates over btree keys.
    pub const WITH_UPDATES: Self = Self(1 << 6);
    /// The path is not kept for reuse after its last reference goes.
    pub const NOPRESERVE: Self = Self(1 << 7);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Add the flags implied by the btree: extents semantics and snapshot
    /// filtering unless explicitly opted out.
    #[must_use]
    pub fn for_btree(self, btree_id: BtreeId) -> Self {
        let mut flags = self;
        if btree_id.is_extents() && !flags.contains(Self::NOT_EXTENTS) {
            flags |= Self::IS_EXTENTS;
        }
        if btree_id.has_snapshots() && !flags.contains(Self::ALL_SNAPSHOTS) {
            flags |= Self::FILTER_SNAPSHOTS;
        }
        flags
    }
}

impl BitOr for IterFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for IterFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Cursor over one btree. Create with [`Transaction::iter_init`], release
/// with [`Transaction::iter_exit`].
#[derive(Debug)]
pub struct BtreeIter {
    pub(crate) path: PathIdx,
    pub(crate) update_path: Option<PathIdx>,
    pub(crate) btree_id: BtreeId,
    pub(crate) pos: Bpos,
    pub(crate) snapshot: SnapshotId,
    pub(crate) flags: IterFlags,
    pub(crate) k: Bkey,
}

impl BtreeIter {
    #[must_use]
    pub const fn btree_id(&self) -> BtreeId {
        self.btree_id
    }

    #[must_use]
    pub const fn pos(&self) -> Bpos {
        self.pos
    }

    #[must_use]
    pub const fn snapshot(&self) -> SnapshotId {
        self.snapshot
    }

    #[must_use]
    pub const fn flags(&self) -> IterFlags {
        self.flags
    }

    /// The key most recently returned, or a deleted key at the position.
    #[must_use]
    pub const fn key(&self) -> &Bkey {
        &self.k
    }

    #[must_use]
    pub const fn path(&self) -> PathIdx {
        self.path
    }

    /// Intent path at the returned key's position in the iterator's own
    /// snapshot, present after a filtered intent peek found an ancestor's key.
    #[must_use]
    pub const fn update_path(&self) -> Option<PathIdx> {
        self.update_path
    }

    const fn intent(&self) -> bool {
        self.flags.contains(IterFlags::INTENT)
    }

    const fn all_snapshots(&self) -> bool {
        self.flags.contains(IterFlags::ALL_SNAPSHOTS)
    }

    const fn is_extents(&self) -> bool {
        self.flags.contains(IterFlags::IS_EXTENTS)
    }
}

fn visible(table: &SnapshotTable, key_snapshot: SnapshotId, snapshot: SnapshotId) -> bool {
    key_snapshot == snapshot || table.is_ancestor(snapshot, key_snapshot)
}

/// Length of the hole from `start` up to `limit`, or to the end of the inode.
fn hole_len(start: Bpos, limit: Option<Bpos>) -> u32 {
    let room = match limit {
        Some(l) if l.inode == start.inode => l.offset - start.offset,
        _ => u64::MAX - start.offset,
    };
    u32::try_from(room).unwrap_or(u32::MAX)
}

impl Transaction<'_> {
    // ── Lifetime ───────────────────────────────────────────────────────────

    pub fn iter_init(&mut self, btree_id: BtreeId, pos: Bpos, flags: IterFlags) -> Result<BtreeIter> {
        let flags = flags.for_btree(btree_id);
        if flags.contains(IterFlags::FILTER_SNAPSHOTS) && pos.snapshot.is_none() {
            return Err(SbtError::Invalid(format!(
                "snapshot-filtered {btree_id} iterator at {pos} needs a snapshot id"
            )));
        }
        let locks_want = u8::from(flags.contains(IterFlags::INTENT));
        let path = self.get_path(btree_id, pos, locks_want, 0, flags)?;
        Ok(BtreeIter {
            path,
            update_path: None,
            btree_id,
            pos,
            snapshot: pos.snapshot,
            flags,
            k: Bkey::deleted(pos),
        })
    }

    pub fn iter_exit(&mut self, iter: BtreeIter) {
        if let Some(up) = iter.update_path {
            self.put_path(up, true);
        }
        self.put_path(iter.path, iter.intent());
    }

    /// A second iterator sharing `src`'s path; whichever moves first copies.
    pub fn iter_copy(&mut self, src: &BtreeIter) -> BtreeIter {
        self.path_get(src.path, src.intent());
        if let Some(up) = src.update_path {
            self.path_get(up, true);
        }
        BtreeIter {
            k: src.k.clone(),
            ..*src
        }
    }

    /// Scoped iterator: released when `f` returns, whatever it returns.
    pub fn with_iter<T>(
        &mut self,
        btree_id: BtreeId,
        pos: Bpos,
        flags: IterFlags,
        f: impl FnOnce(&mut Self, &mut BtreeIter) -> Result<T>,
    ) -> Result<T> {
        let mut iter = self.iter_init(btree_id, pos, flags)?;
        let ret = f(self, &mut iter);
        self.iter_exit(iter);
        ret
    }

    fn iter_put_update_path(&mut self, iter: &mut BtreeIter) {
        if let Some(up) = iter.update_path.take() {
            self.put_path(up, true);
        }
    }

    // ── Positioning ────────────────────────────────────────────────────────

    /// Reposition lazily; the path moves on the next peek. Outside
    /// `ALL_SNAPSHOTS` the snapshot field is forced to the iterator's.
    pub fn iter_set_pos(&mut self, iter: &mut BtreeIter, pos: Bpos) {
        self.iter_put_update_path(iter);
        let pos = if iter.all_snapshots() {
            pos
        } else {
            pos.with_snapshot(iter.snapshot)
        };
        iter.pos = pos;
        iter.k = Bkey::deleted(pos);
    }

    /// Move to the start of the key last returned rather than the position
    /// it was searched from.
    pub fn iter_set_pos_to_extent_start(&mut self, iter: &mut BtreeIter) {
        debug_assert!(iter.is_extents());
        let start = iter.k.start_pos();
        iter.pos = if iter.all_snapshots() {
            start
        } else {
            start.with_snapshot(iter.snapshot)
        };
    }

    pub fn iter_set_snapshot(&mut self, iter: &mut BtreeIter, snapshot: SnapshotId) {
        debug_assert!(iter.flags.contains(IterFlags::FILTER_SNAPSHOTS));
        iter.snapshot = snapshot;
        self.iter_set_pos(iter, iter.pos);
    }

    /// Step past the current key. False at the end of the key space.
    pub fn iter_advance(&mut self, iter: &mut BtreeIter) -> bool {
        let pos = iter.k.pos;
        let at_end = if iter.all_snapshots() {
            pos == SPOS_MAX
        } else {
            pos.cmp_nosnap(&SPOS_MAX) == Ordering::Equal
        };
        let next = if at_end {
            None
        } else if iter.is_extents() {
            Some(pos)
        } else if iter.all_snapshots() {
            pos.successor()
        } else {
            pos.nosnap_successor()
        };
        match next {
            Some(next) => {
                self.iter_set_pos(iter, next);
                true
            }
            None => false,
        }
    }

    /// Step before the current key. False at the start of the key space.
    pub fn iter_rewind(&mut self, iter: &mut BtreeIter) -> bool {
        let pos = iter.k.start_pos();
        let prev = if iter.is_extents() {
            (pos.cmp_nosnap(&POS_MIN) != Ordering::Equal).then_some(pos)
        } else if iter.all_snapshots() {
            pos.predecessor()
        } else {
            pos.nosnap_predecessor()
        };
        match prev {
            Some(prev) => {
                self.iter_set_pos(iter, prev);
                true
            }
            None => false,
        }
    }

    // ── Raw access ─────────────────────────────────────────────────────────

    fn iter_traverse_to(&mut self, iter: &mut BtreeIter, search: Bpos) -> Result<Arc<BtreeNode>> {
        iter.path = self.path_set_pos(iter.path, search, iter.intent())?;
        self.path_traverse(iter.path)?;
        Ok(self.path_leaf(iter.path))
    }

    /// First key at or after `search`, crossing leaves, with pending updates
    /// merged in when the iterator asks for them.
    fn peek_raw_fwd(&mut self, iter: &mut BtreeIter, search: Bpos) -> Result<Option<Bkey>> {
        let mut at = search;
        let found = loop {
            let leaf = self.iter_traverse_to(iter, at)?;
            if let Some(k) = leaf.peek_fwd(at) {
                break Some(k);
            }
            match leaf.max_key().successor() {
                Some(next) => at = next,
                None => break None,
            }
        };
        if !iter.flags.contains(IterFlags::WITH_UPDATES) {
            return Ok(found);
        }
        let key = (iter.btree_id, search);
        let i = self.updates.partition_point(|u| (u.btree_id, u.pos) < key);
        let update = self
            .updates
            .get(i)
            .filter(|u| u.btree_id == iter.btree_id)
            .map(|u| self.materialize(u));
        Ok(match (found, update) {
            (Some(k), Some(u)) => Some(if u.pos <= k.pos { u } else { k }),
            (k, u) => u.or(k),
        })
    }

    /// Last key at or before `search`; the mirror of [`Self::peek_raw_fwd`].
    fn peek_raw_back(&mut self, iter: &mut BtreeIter, search: Bpos) -> Result<Option<Bkey>> {
        let mut at = search;
        let found = loop {
            let leaf = self.iter_traverse_to(iter, at)?;
            if let Some(k) = leaf.peek_back(at) {
                break Some(k);
            }
            match leaf.min_key().predecessor() {
                Some(prev) => at = prev,
                None => break None,
            }
        };
        if !iter.flags.contains(IterFlags::WITH_UPDATES) {
            return Ok(found);
        }
        let key = (iter.btree_id, search);
        let i = self.updates.partition_point(|u| (u.btree_id, u.pos) <= key);
        let update = i
            .checked_sub(1)
            .and_then(|i| self.updates.get(i))
            .filter(|u| u.btree_id == iter.btree_id)
            .map(|u| self.materialize(u));
        Ok(match (found, update) {
            (Some(k), Some(u)) => Some(if u.pos >= k.pos { u } else { k }),
            (k, u) => u.or(k),
        })
    }

    /// First version at `search`'s logical position, from `search` on,
    /// that is visible to `snapshot`. Tombstones are returned as found.
    pub(crate) fn find_visible_at(
        &mut self,
        iter: &mut BtreeIter,
        search: Bpos,
        snapshot: SnapshotId,
        table: &SnapshotTable,
    ) -> Result<Option<Bkey>> {
        let mut at = search;
        loop {
            let Some(k) = self.peek_raw_fwd(iter, at)? else {
                return Ok(None);
            };
            if !k.pos.same_logical(&search) {
                return Ok(None);
            }
            if visible(table, k.pos.snapshot, snapshot) {
                return Ok(Some(k));
            }
            match k.pos.successor() {
                Some(next) => at = next,
                None => return Ok(None),
            }
        }
    }

    /// Next logical search position after `pos` in this iterator's mode.
    fn search_successor(iter: &BtreeIter, pos: Bpos) -> Option<Bpos> {
        if iter.all_snapshots() {
            pos.successor()
        } else {
            pos.nosnap_successor().map(|p| p.with_snapshot(iter.snapshot))
        }
    }

    fn snapshot_table(&self, iter: &BtreeIter) -> Option<Arc<SnapshotTable>> {
        iter.flags
            .contains(IterFlags::FILTER_SNAPSHOTS)
            .then(|| self.fs.snapshots().load_arc())
    }

    /// First key from `search` the iterator would return, bounded by `end`.
    fn scan_fwd(
        &mut self,
        iter: &mut BtreeIter,
        search: Bpos,
        end: Bpos,
        table: Option<&SnapshotTable>,
    ) -> Result<Option<Bkey>> {
        let mut at = search;
        loop {
            let Some(k) = self.peek_raw_fwd(iter, at)? else {
                return Ok(None);
            };
            let past_end = if iter.is_extents() {
                k.start_pos().cmp_nosnap(&end) != Ordering::Less
            } else if iter.all_snapshots() {
                k.pos > end
            } else {
                k.pos.cmp_nosnap(&end) == Ordering::Greater
            };
            if past_end {
                return Ok(None);
            }
            let skip_to = match table {
                Some(table) if !visible(table, k.pos.snapshot, iter.snapshot) => k.pos.successor(),
                Some(_) if k.is_tombstone() => Self::search_successor(iter, k.pos),
                None if k.is_deleted() || (k.is_whiteout() && !iter.all_snapshots()) => {
                    Self::search_successor(iter, k.pos)
                }
                _ => return Ok(Some(k)),
            };
            match skip_to {
                Some(next) => at = next,
                None => return Ok(None),
            }
        }
    }

    /// Last key at or before `search` the iterator would return, bounded
    /// below by `end_min`.
    fn scan_back(
        &mut self,
        iter: &mut BtreeIter,
        search: Bpos,
        end_min: Bpos,
        table: Option<&SnapshotTable>,
    ) -> Result<Option<Bkey>> {
        let logical_prev = |pos: Bpos| {
            pos.nosnap_predecessor()
                .map(|p| p.with_snapshot(SnapshotId::MAX))
        };
        let mut at = search;
        loop {
            let Some(k) = self.peek_raw_back(iter, at)? else {
                return Ok(None);
            };
            let before_min = if iter.is_extents() {
                k.pos.cmp_nosnap(&end_min) != Ordering::Greater
            } else if iter.all_snapshots() {
                k.pos < end_min
            } else {
                k.pos.cmp_nosnap(&end_min) == Ordering::Less
            };
            if before_min {
                return Ok(None);
            }
            let prev = if let Some(table) = table {
                let snapshot = iter.snapshot;
                let best = self.find_visible_at(iter, k.pos.with_snapshot(snapshot), snapshot, table)?;
                match best {
                    Some(best) if !best.is_tombstone() => return Ok(Some(best)),
                    _ => logical_prev(k.pos),
                }
            } else if k.is_deleted() || (k.is_whiteout() && !iter.all_snapshots()) {
                if iter.all_snapshots() {
                    k.pos.predecessor()
                } else {
                    logical_prev(k.pos)
                }
            } else {
                return Ok(Some(k));
            };
            match prev {
                Some(prev) => at = prev,
                None => return Ok(None),
            }
        }
    }

    // ── Peek ───────────────────────────────────────────────────────────────

    pub fn iter_peek(&mut self, iter: &mut BtreeIter) -> Result<Option<Bkey>> {
        self.iter_peek_max(iter, SPOS_MAX)
    }

    /// First key at or after the iterator position and no later than `end`.
    /// The iterator moves to the key (for extents: to its start, if that is
    /// past the old position); at the end it moves to `end`.
    pub fn iter_peek_max(&mut self, iter: &mut BtreeIter, end: Bpos) -> Result<Option<Bkey>> {
        self.iter_put_update_path(iter);
        let table = self.snapshot_table(iter);
        let search = if iter.is_extents() {
            Self::search_successor(iter, iter.pos)
        } else {
            Some(iter.pos)
        };
        let found = match search {
            Some(search) => self.scan_fwd(iter, search, end, table.as_deref())?,
            None => None,
        };
        let Some(mut k) = found else {
            self.iter_set_pos(iter, end);
            return Ok(None);
        };

        if iter.is_extents() {
            let start = k.start_pos();
            if start.cmp_nosnap(&iter.pos) == Ordering::Greater {
                iter.pos = start;
            }
            k.cut_back(end);
        } else {
            iter.pos = k.pos;
        }
        if !iter.all_snapshots() {
            iter.pos.snapshot = iter.snapshot;
        }

        let filtered = iter.flags.contains(IterFlags::FILTER_SNAPSHOTS);
        if filtered && iter.intent() && k.pos.snapshot != iter.snapshot {
            let up = self.get_path(
                iter.btree_id,
                k.pos.with_snapshot(iter.snapshot),
                1,
                0,
                IterFlags::INTENT,
            )?;
            if let Err(err) = self.path_traverse(up) {
                self.put_path(up, true);
                return Err(err);
            }
            self.path_set_should_be_locked(up);
            iter.update_path = Some(up);
        }
        self.path_set_should_be_locked(iter.path);
        iter.k = k.clone();
        Ok(Some(k))
    }

    pub fn iter_peek_prev(&mut self, iter: &mut BtreeIter) -> Result<Option<Bkey>> {
        self.iter_peek_prev_min(iter, POS_MIN)
    }

    /// Last key at or before the iterator position and no earlier than
    /// `end_min`. For extents this is the key containing the position's
    /// predecessor, or else the last key ending at or before the position.
    pub fn iter_peek_prev_min(&mut self, iter: &mut BtreeIter, end_min: Bpos) -> Result<Option<Bkey>> {
        self.iter_put_update_path(iter);
        let table = self.snapshot_table(iter);

        let mut found = None;
        if iter.is_extents() {
            if let Some(search) = Self::search_successor(iter, iter.pos) {
                let pos = iter.pos;
                found = self.scan_fwd(iter, search, pos, table.as_deref())?;
            }
        }
        if found.is_none() {
            let search = if iter.all_snapshots() {
                iter.pos
            } else {
                iter.pos.with_snapshot(SnapshotId::MAX)
            };
            found = self.scan_back(iter, search, end_min, table.as_deref())?;
        }
        let Some(k) = found else {
            self.iter_set_pos(iter, end_min);
            return Ok(None);
        };

        if iter.is_extents() {
            if k.pos.cmp_nosnap(&iter.pos) == Ordering::Less {
                iter.pos = k.pos;
            }
        } else {
            iter.pos = k.pos;
        }
        if !iter.all_snapshots() {
            iter.pos.snapshot = iter.snapshot;
        }
        self.path_set_should_be_locked(iter.path);
        iter.k = k.clone();
        Ok(Some(k))
    }

    pub fn iter_next(&mut self, iter: &mut BtreeIter) -> Result<Option<Bkey>> {
        if !self.iter_advance(iter) {
            return Ok(None);
        }
        self.iter_peek(iter)
    }

    pub fn iter_prev(&mut self, iter: &mut BtreeIter) -> Result<Option<Bkey>> {
        if !self.iter_rewind(iter) {
            return Ok(None);
        }
        self.iter_peek_prev(iter)
    }

    // ── Slots ──────────────────────────────────────────────────────────────

    /// The key at exactly the iterator position. A missing key comes back
    /// as a zero-size deleted key there; in an extents btree, as a hole
    /// reaching up to the next extent.
    pub fn iter_peek_slot(&mut self, iter: &mut BtreeIter) -> Result<Bkey> {
        self.iter_put_update_path(iter);
        let table = self.snapshot_table(iter);
        let pos = iter.pos;

        let k = if iter.is_extents() {
            let inode_end = Bpos::new(pos.inode, u64::MAX, SnapshotId::MAX);
            let next = match Self::search_successor(iter, pos) {
                Some(search) => self.scan_fwd(iter, search, inode_end, table.as_deref())?,
                None => None,
            };
            match next {
                Some(k) if k.start_pos().cmp_nosnap(&pos) != Ordering::Greater => k,
                next => Bkey::hole(pos, hole_len(pos, next.map(|k| k.start_pos()))),
            }
        } else if let Some(table) = &table {
            let snapshot = iter.snapshot;
            match self.find_visible_at(iter, pos.with_snapshot(snapshot), snapshot, table)? {
                Some(k) if !k.is_whiteout() => k,
                _ => Bkey::deleted(pos),
            }
        } else {
            match self.peek_raw_fwd(iter, pos)? {
                Some(k) if k.pos == pos => k,
                _ => Bkey::deleted(pos),
            }
        };

        self.path_traverse(iter.path)?;
        self.path_set_should_be_locked(iter.path);
        iter.k = k.clone();
        Ok(k)
    }

    pub fn iter_next_slot(&mut self, iter: &mut BtreeIter) -> Result<Option<Bkey>> {
        if !self.iter_advance(iter) {
            return Ok(None);
        }
        self.iter_peek_slot(iter).map(Some)
    }

    pub fn iter_prev_slot(&mut self, iter: &mut BtreeIter) -> Result<Option<Bkey>> {
        let start = iter.k.start_pos();
        let prev = if iter.all_snapshots() {
            start.predecessor()
        } else {
            start.nosnap_predecessor()
        };
        let Some(prev) = prev else {
            return Ok(None);
        };
        self.iter_set_pos(iter, prev);
        self.iter_peek_slot(iter).map(Some)
    }
}
