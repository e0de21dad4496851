//! The immutable snapshot table and its ancestry queries.
//!
//! Entries are indexed by `top - id`, where `top` is the highest id the
//! table spans, so the densely allocated, descending ids of one filesystem
//! occupy a contiguous vector.
//!
//! `is_ancestor` answers in three tiers:
//!
//! 1. Skiplist jumps (`skip[2]`, `skip[1]`, `skip[0]`, then `parent`) until
//!    the cursor is within [`IS_ANCESTOR_BITMAP`] ids of the candidate.
//! 2. One bit test in the cursor's ancestor bitmap.
//! 3. A parent walk, used only when a jump would land on an entry that is
//!    no longer live (a skiplist built before a reparent).
//!
//! Bitmap words are atomics with relaxed stores, so a bitmap can be
//! refreshed through a shared reference. Writers refresh the private copy
//! they are about to publish; the only bits that change on refresh belong
//! to deleted ids.

use crate::record::SnapshotRecord;
use sbt_types::SnapshotId;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Ancestors within this many ids are answered from the bitmap.
pub const IS_ANCESTOR_BITMAP: u32 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotState {
    #[default]
    Empty,
    Live,
    Deleted,
}

/// One snapshot's ancestry record.
#[derive(Debug, Default)]
pub struct SnapshotEntry {
    pub state: SnapshotState,
    /// `SnapshotId::NONE` for a tree root.
    pub parent: SnapshotId,
    /// Random ancestors, ascending.
    pub skip: [SnapshotId; 3],
    pub depth: u32,
    /// Normalized so `children[0] >= children[1]`.
    pub children: [SnapshotId; 2],
    pub subvol: u32,
    pub tree: u32,
    /// Bit `k` set iff `id + k + 1` is an ancestor.
    is_ancestor: [AtomicU64; 2],
}

impl Clone for SnapshotEntry {
    fn clone(&self) -> Self {
        let entry = Self {
            state: self.state,
            parent: self.parent,
            skip: self.skip,
            depth: self.depth,
            children: self.children,
            subvol: self.subvol,
            tree: self.tree,
            is_ancestor: Default::default(),
        };
        entry.store_bitmap(self.bitmap());
        entry
    }
}

impl SnapshotEntry {
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state == SnapshotState::Live
    }

    #[must_use]
    pub fn bitmap(&self) -> u128 {
        u128::from(self.is_ancestor[0].load(Ordering::Relaxed))
            | (u128::from(self.is_ancestor[1].load(Ordering::Relaxed)) << 64)
    }

    /// Word-by-word relaxed store; readers may see a mix of old and new words.
    #[expect(clippy::cast_possible_truncation)]
    pub(crate) fn store_bitmap(&self, bits: u128) {
        self.is_ancestor[0].store(bits as u64, Ordering::Relaxed);
        self.is_ancestor[1].store((bits >> 64) as u64, Ordering::Relaxed);
    }

    fn test_bit(&self, bit: u32) -> bool {
        let word = self.is_ancestor[(bit / 64) as usize].load(Ordering::Relaxed);
        (word >> (bit % 64)) & 1 == 1
    }

    /// Number of non-zero children.
    #[must_use]
    pub fn nr_children(&self) -> usize {
        self.children.iter().filter(|c| !c.is_none()).count()
    }

    pub(crate) fn normalize_children(&mut self) {
        if self.children[0] < self.children[1] {
            self.children.swap(0, 1);
        }
    }

    #[must_use]
    pub fn to_record(&self) -> SnapshotRecord {
        let mut flags = 0;
        if self.state == SnapshotState::Deleted {
            flags |= SnapshotRecord::FLAG_DELETED;
        }
        if self.subvol != 0 {
            flags |= SnapshotRecord::FLAG_SUBVOL;
        }
        SnapshotRecord {
            flags,
            parent: self.parent.0,
            children: [self.children[0].0, self.children[1].0],
            subvol: self.subvol,
            tree: self.tree,
            depth: self.depth,
            skip: [self.skip[0].0, self.skip[1].0, self.skip[2].0],
        }
    }

    /// Entry from a persisted record; the bitmap is left empty.
    #[must_use]
    pub fn from_record(rec: &SnapshotRecord) -> Self {
        let mut entry = Self {
            state: if rec.is_deleted() {
                SnapshotState::Deleted
            } else {
                SnapshotState::Live
            },
            parent: SnapshotId(rec.parent),
            skip: rec.skip.map(SnapshotId),
            depth: rec.depth,
            children: rec.children.map(SnapshotId),
            subvol: rec.subvol,
            tree: rec.tree,
            is_ancestor: Default::default(),
        };
        entry.normalize_children();
        entry.skip.sort_unstable();
        entry
    }
}

enum Step {
    Jump(SnapshotId),
    Root,
    Imprecise,
}

/// One published version of the snapshot index.
#[derive(Debug, Clone, Default)]
pub struct SnapshotTable {
    top: u32,
    entries: Vec<SnapshotEntry>,
}

impl SnapshotTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn index(&self, id: SnapshotId) -> Option<usize> {
        if id.is_none() || id.0 > self.top {
            return None;
        }
        let idx = (self.top - id.0) as usize;
        (idx < self.entries.len()).then_some(idx)
    }

    /// The entry for `id` in any state other than empty.
    #[must_use]
    pub fn entry(&self, id: SnapshotId) -> Option<&SnapshotEntry> {
        self.index(id)
            .map(|idx| &self.entries[idx])
            .filter(|e| e.state != SnapshotState::Empty)
    }

    #[must_use]
    pub fn live(&self, id: SnapshotId) -> Option<&SnapshotEntry> {
        self.entry(id).filter(|e| e.is_live())
    }

    #[must_use]
    pub fn is_live(&self, id: SnapshotId) -> bool {
        self.live(id).is_some()
    }

    #[must_use]
    pub fn parent(&self, id: SnapshotId) -> SnapshotId {
        self.entry(id).map_or(SnapshotId::NONE, |e| e.parent)
    }

    #[must_use]
    pub fn depth(&self, id: SnapshotId) -> u32 {
        self.entry(id).map_or(0, |e| e.depth)
    }

    #[must_use]
    pub fn tree(&self, id: SnapshotId) -> u32 {
        self.entry(id).map_or(0, |e| e.tree)
    }

    #[must_use]
    pub fn subvol(&self, id: SnapshotId) -> u32 {
        self.entry(id).map_or(0, |e| e.subvol)
    }

    #[must_use]
    pub fn children(&self, id: SnapshotId) -> [SnapshotId; 2] {
        self.entry(id).map_or([SnapshotId::NONE; 2], |e| e.children)
    }

    #[must_use]
    pub fn skiplist(&self, id: SnapshotId) -> [SnapshotId; 3] {
        self.entry(id).map_or([SnapshotId::NONE; 3], |e| e.skip)
    }

    /// Lowest id the table spans, or `None` when empty.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn lowest_id(&self) -> Option<SnapshotId> {
        let len = self.entries.len() as u32;
        (len > 0).then(|| SnapshotId(self.top - (len - 1)))
    }

    /// Ids of live entries, parents before children (descending).
    #[expect(clippy::cast_possible_truncation)]
    pub fn live_ids(&self) -> impl Iterator<Item = SnapshotId> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_live())
            .map(|(idx, _)| SnapshotId(self.top - idx as u32))
    }

    /// Ids of every non-empty entry, descending.
    #[expect(clippy::cast_possible_truncation)]
    pub fn ids(&self) -> impl Iterator<Item = SnapshotId> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state != SnapshotState::Empty)
            .map(|(idx, _)| SnapshotId(self.top - idx as u32))
    }

    #[must_use]
    pub fn nr_live(&self) -> usize {
        self.entries.iter().filter(|e| e.is_live()).count()
    }

    /// Walk `n` parent pointers up from `id`; `NONE` past the root.
    #[must_use]
    pub fn nth_parent(&self, mut id: SnapshotId, n: u32) -> SnapshotId {
        for _ in 0..n {
            if id.is_none() {
                break;
            }
            id = self.parent(id);
        }
        id
    }

    fn ancestor_below(&self, id: SnapshotId, ancestor: SnapshotId) -> Step {
        let Some(entry) = self.live(id) else {
            return Step::Imprecise;
        };
        for &skip in entry.skip.iter().rev() {
            if !skip.is_none() && skip <= ancestor {
                return if self.is_live(skip) {
                    Step::Jump(skip)
                } else {
                    Step::Imprecise
                };
            }
        }
        if entry.parent.is_none() {
            Step::Root
        } else {
            Step::Jump(entry.parent)
        }
    }

    /// Is `ancestor` a strict ancestor of `id`?
    ///
    /// Lock-free and allocation-free. Strict: `is_ancestor(a, a)` is false,
    /// and a true answer implies `id < ancestor`.
    #[must_use]
    pub fn is_ancestor(&self, id: SnapshotId, ancestor: SnapshotId) -> bool {
        if id.is_none() || id >= ancestor {
            return false;
        }
        let mut cur = id;
        while ancestor.0 - cur.0 > IS_ANCESTOR_BITMAP {
            match self.ancestor_below(cur, ancestor) {
                Step::Jump(next) => cur = next,
                Step::Root => return false,
                Step::Imprecise => {
                    trace!(
                        target: "sbt::snapshot",
                        id = cur.0,
                        ancestor = ancestor.0,
                        "snapshot_ancestor_fallback"
                    );
                    return self.is_ancestor_walk(cur, ancestor);
                }
            }
            if cur >= ancestor {
                return cur == ancestor;
            }
        }
        match self.live(cur) {
            Some(entry) => entry.test_bit(ancestor.0 - cur.0 - 1),
            None => self.is_ancestor_walk(cur, ancestor),
        }
    }

    /// Parent-pointer walk; the reference answer for [`Self::is_ancestor`].
    #[must_use]
    pub fn is_ancestor_walk(&self, id: SnapshotId, ancestor: SnapshotId) -> bool {
        if id.is_none() || id >= ancestor {
            return false;
        }
        let mut cur = id;
        loop {
            let parent = self.parent(cur);
            if parent.is_none() || parent > ancestor || parent <= cur {
                return false;
            }
            if parent == ancestor {
                return true;
            }
            cur = parent;
        }
    }

    /// The bitmap's answer, when `ancestor` is within bitmap range of a
    /// live `id`.
    #[must_use]
    pub fn test_ancestor_bitmap(&self, id: SnapshotId, ancestor: SnapshotId) -> Option<bool> {
        if id.is_none() || id >= ancestor || ancestor.0 - id.0 > IS_ANCESTOR_BITMAP {
            return None;
        }
        self.live(id).map(|e| e.test_bit(ancestor.0 - id.0 - 1))
    }

    /// Bitmap for a child `id` of `parent`: the parent's bitmap shifted by
    /// their distance, plus the parent's own bit.
    #[must_use]
    pub fn compute_bitmap(&self, id: SnapshotId, parent: SnapshotId) -> u128 {
        if parent.is_none() || parent <= id {
            return 0;
        }
        let dist = parent.0 - id.0;
        if dist > IS_ANCESTOR_BITMAP {
            return 0;
        }
        let inherited = self
            .entry(parent)
            .map_or(0, |p| p.bitmap().checked_shl(dist).unwrap_or(0));
        inherited | (1_u128 << (dist - 1))
    }

    // ── Writer-side editing (on an unpublished copy) ────────────────────────

    pub(crate) fn slot_mut(&mut self, id: SnapshotId) -> &mut SnapshotEntry {
        debug_assert!(!id.is_none(), "snapshot id 0 has no slot");
        if self.entries.is_empty() {
            self.top = id.0;
        } else if id.0 > self.top {
            let shift = (id.0 - self.top) as usize;
            let mut grown = Vec::with_capacity(self.entries.len() + shift);
            grown.resize_with(shift, SnapshotEntry::default);
            grown.append(&mut self.entries);
            self.entries = grown;
            self.top = id.0;
        }
        let idx = (self.top - id.0) as usize;
        if idx >= self.entries.len() {
            self.entries.resize_with(idx + 1, SnapshotEntry::default);
        }
        &mut self.entries[idx]
    }

    pub(crate) fn clear_slot(&mut self, id: SnapshotId) {
        if let Some(idx) = self.index(id) {
            self.entries[idx] = SnapshotEntry::default();
        }
    }

    /// Recompute every live entry's bitmap, parents first. Stores are
    /// relaxed.
    pub(crate) fn refresh_bitmaps(&self) -> usize {
        let mut refreshed = 0;
        for id in self.live_ids() {
            let Some(entry) = self.live(id) else { continue };
            let bits = self.compute_bitmap(id, entry.parent);
            if bits != entry.bitmap() {
                entry.store_bitmap(bits);
                refreshed += 1;
            }
        }
        refreshed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(ids: &[u32]) -> SnapshotTable {
        let mut t = SnapshotTable::new();
        let mut parent = SnapshotId::NONE;
        for (depth, &raw) in ids.iter().enumerate() {
            let id = SnapshotId(raw);
            {
                let e = t.slot_mut(id);
                e.state = SnapshotState::Live;
                e.parent = parent;
                e.depth = u32::try_from(depth).expect("depth fits");
            }
            let bits = t.compute_bitmap(id, parent);
            t.live(id).expect("just inserted").store_bitmap(bits);
            if !parent.is_none() {
                let p = t.slot_mut(parent);
                p.children[0] = id;
            }
            parent = id;
        }
        t
    }

    #[test]
    fn root_child_grandchild() {
        let t = chain(&[100, 50, 10]);
        assert!(t.is_ancestor(SnapshotId(10), SnapshotId(100)));
        assert!(t.is_ancestor(SnapshotId(50), SnapshotId(100)));
        assert!(t.is_ancestor(SnapshotId(10), SnapshotId(50)));
        assert!(!t.is_ancestor(SnapshotId(100), SnapshotId(10)));
        assert!(!t.is_ancestor(SnapshotId(50), SnapshotId(50)));
    }

    #[test]
    fn bitmap_bits_match_parent_chain() {
        let t = chain(&[100, 50, 10]);
        let bits = t.live(SnapshotId(10)).expect("live").bitmap();
        assert_eq!(bits, (1_u128 << 39) | (1_u128 << 89));
        assert_eq!(
            t.test_ancestor_bitmap(SnapshotId(10), SnapshotId(100)),
            Some(true)
        );
        assert_eq!(
            t.test_ancestor_bitmap(SnapshotId(10), SnapshotId(99)),
            Some(false)
        );
    }

    #[test]
    fn far_ancestor_uses_parent_jumps() {
        // Skiplists are empty here, so jumps go through parents.
        let t = chain(&[1000, 700, 400, 100, 5]);
        assert!(t.is_ancestor(SnapshotId(5), SnapshotId(1000)));
        assert!(t.is_ancestor(SnapshotId(5), SnapshotId(400)));
        assert!(!t.is_ancestor(SnapshotId(5), SnapshotId(999)));
        assert!(!t.is_ancestor(SnapshotId(5), SnapshotId(450)));
    }

    #[test]
    fn slot_mut_rebases_for_higher_ids() {
        let mut t = SnapshotTable::new();
        t.slot_mut(SnapshotId(10)).state = SnapshotState::Live;
        t.slot_mut(SnapshotId(20)).state = SnapshotState::Live;
        t.slot_mut(SnapshotId(5)).state = SnapshotState::Live;
        let ids: Vec<_> = t.live_ids().collect();
        assert_eq!(ids, vec![SnapshotId(20), SnapshotId(10), SnapshotId(5)]);
        assert_eq!(t.lowest_id(), Some(SnapshotId(5)));
        assert!(t.entry(SnapshotId(15)).is_none());
        assert!(t.entry(SnapshotId(21)).is_none());
    }

    #[test]
    fn deleted_skip_target_falls_back_to_walk() {
        let mut t = chain(&[1000, 600, 300, 10]);
        t.slot_mut(SnapshotId(10)).skip = [SnapshotId(600); 3];
        t.slot_mut(SnapshotId(600)).state = SnapshotState::Deleted;
        // 300 was reparented onto 1000 when 600 went away.
        t.slot_mut(SnapshotId(300)).parent = SnapshotId(1000);
        assert!(t.is_ancestor(SnapshotId(10), SnapshotId(1000)));
        assert!(t.is_ancestor_walk(SnapshotId(10), SnapshotId(1000)));
    }

    #[test]
    fn record_conversion_keeps_structure() {
        let t = chain(&[100, 50]);
        let rec = t.entry(SnapshotId(50)).expect("present").to_record();
        assert_eq!(rec.parent, 100);
        let back = SnapshotEntry::from_record(&rec);
        assert!(back.is_live());
        assert_eq!(back.parent, SnapshotId(100));
        assert_eq!(back.bitmap(), 0);
    }
}
