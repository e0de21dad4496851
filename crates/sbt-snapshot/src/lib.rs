#![forbid(unsafe_code)]
//! Snapshot ancestry index.
//!
//! [`Snapshots`] owns the current [`SnapshotTable`] behind an [`RcuCell`].
//! Queries ([`Snapshots::is_ancestor`], or any method on a loaded table)
//! never lock. Structural changes (create, fork, delete, deletion cleanup,
//! reload from records) serialize on one writer mutex, edit a private copy
//! of the table and publish it with a pointer swap, so readers see either
//! the old or the new version in full.
//!
//! Deletion runs in two phases:
//!
//! 1. [`Snapshots::delete`] reparents the live child (if any) onto the
//!    deleted entry's parent and marks the entry deleted, in one published
//!    version. No live entry ever points at a deleted parent.
//! 2. [`Snapshots::finish_deletions`] recomputes depths and skiplists,
//!    frees deleted slots and refreshes ancestor bitmaps, all on the copy it
//!    then publishes.
//!
//! Between the phases skiplists may still name deleted ids; queries that
//! would jump onto one fall back to a parent walk.
//!
//! # Logging
//!
//! - **TRACE** `sbt::snapshot`: `snapshot_table_load`, `snapshot_ancestor_fallback`
//! - **DEBUG** `sbt::snapshot`: `snapshot_table_publish`, `snapshot_created`,
//!   `snapshot_deleted`, `snapshot_deletions_finished`, `snapshot_table_loaded`

pub mod rcu;
pub mod record;
pub mod table;

pub use rcu::RcuCell;
pub use record::{SNAPSHOT_RECORD_SIZE, SnapshotRecord};
pub use table::{IS_ANCESTOR_BITMAP, SnapshotEntry, SnapshotState, SnapshotTable};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sbt_error::{Result, SbtError};
use sbt_types::SnapshotId;
use std::sync::Arc;
use tracing::debug;

/// Span shifts for the three skiplist picks: anywhere up the chain, the
/// nearest quarter, the nearest sixteenth.
const SKIP_SPAN_SHIFTS: [u32; 3] = [0, 2, 4];

struct SnapshotWriter {
    rng: StdRng,
}

/// The shared, read-mostly snapshot index.
pub struct Snapshots {
    table: RcuCell<SnapshotTable>,
    writer: Mutex<SnapshotWriter>,
}

impl std::fmt::Debug for Snapshots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.load();
        f.debug_struct("Snapshots")
            .field("live", &table.nr_live())
            .field("version", &self.table.version())
            .finish_non_exhaustive()
    }
}

impl Default for Snapshots {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(id: SnapshotId, detail: impl Into<String>) -> SbtError {
    SbtError::InvalidSnapshot {
        id: id.0,
        detail: detail.into(),
    }
}

fn skiplist_pick(table: &SnapshotTable, rng: &mut StdRng, id: SnapshotId, shift: u32) -> SnapshotId {
    if id.is_none() {
        return SnapshotId::NONE;
    }
    let depth = table.depth(id);
    if depth == 0 {
        return id;
    }
    let span = (depth >> shift).max(1);
    table.nth_parent(id, rng.gen_range(0..span))
}

fn fresh_skiplist(table: &SnapshotTable, rng: &mut StdRng, parent: SnapshotId) -> [SnapshotId; 3] {
    let mut skip = SKIP_SPAN_SHIFTS.map(|shift| skiplist_pick(table, rng, parent, shift));
    skip.sort_unstable();
    skip
}

impl Snapshots {
    #[must_use]
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic skiplist choices, for tests and reproducible tooling.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            table: RcuCell::new(SnapshotTable::new()),
            writer: Mutex::new(SnapshotWriter { rng }),
        }
    }

    /// Borrow the current table version.
    #[inline]
    pub fn load(&self) -> arc_swap::Guard<Arc<SnapshotTable>> {
        self.table.load()
    }

    /// Hold the current table version for a long-running query.
    #[inline]
    #[must_use]
    pub fn load_arc(&self) -> Arc<SnapshotTable> {
        self.table.load_arc()
    }

    /// Number of table versions published so far.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.table.version()
    }

    /// Is `ancestor` a strict ancestor of `id` in the current version?
    #[must_use]
    pub fn is_ancestor(&self, id: SnapshotId, ancestor: SnapshotId) -> bool {
        self.table.load().is_ancestor(id, ancestor)
    }

    fn edit<T>(&self, f: impl FnOnce(&mut SnapshotTable, &mut StdRng) -> Result<T>) -> Result<T> {
        let mut writer = self.writer.lock();
        let mut next = SnapshotTable::clone(&self.table.load());
        let out = f(&mut next, &mut writer.rng)?;
        self.table.publish(next);
        Ok(out)
    }

    /// Start a new snapshot tree rooted at `root`.
    pub fn create_tree(&self, root: SnapshotId, tree: u32) -> Result<()> {
        if root.is_none() {
            return Err(invalid(root, "snapshot id 0 is reserved"));
        }
        self.edit(|t, _| {
            if t.entry(root).is_some() {
                return Err(SbtError::Exists(format!("snapshot {root}")));
            }
            let entry = t.slot_mut(root);
            entry.state = SnapshotState::Live;
            entry.tree = tree;
            debug!(target: "sbt::snapshot", id = root.0, tree, "snapshot_created");
            Ok(())
        })
    }

    /// Add `id` as a child of `parent`.
    pub fn create_child(&self, parent: SnapshotId, id: SnapshotId) -> Result<()> {
        self.edit(|t, rng| insert_child(t, rng, parent, id))
    }

    /// Give `parent` two new children with the next free ids below the
    /// lowest id in use. Returns them larger first.
    pub fn fork(&self, parent: SnapshotId) -> Result<[SnapshotId; 2]> {
        self.edit(|t, rng| {
            let low = t
                .lowest_id()
                .ok_or_else(|| invalid(parent, "snapshot table is empty"))?;
            if low.0 < 3 {
                return Err(invalid(parent, "snapshot id space exhausted"));
            }
            let ids = [SnapshotId(low.0 - 1), SnapshotId(low.0 - 2)];
            insert_child(t, rng, parent, ids[0])?;
            insert_child(t, rng, parent, ids[1])?;
            Ok(ids)
        })
    }

    pub fn set_subvol(&self, id: SnapshotId, subvol: u32) -> Result<()> {
        self.edit(|t, _| {
            if !t.is_live(id) {
                return Err(invalid(id, "not a live snapshot"));
            }
            t.slot_mut(id).subvol = subvol;
            Ok(())
        })
    }

    /// A fresh random ancestor of `id` (or `id` itself), drawn the way new
    /// skiplists are.
    #[must_use]
    pub fn skiplist_get(&self, id: SnapshotId) -> SnapshotId {
        let mut writer = self.writer.lock();
        skiplist_pick(&self.table.load(), &mut writer.rng, id, 0)
    }

    /// Phase one of deletion: reparent the surviving child and mark `id`
    /// deleted. An entry with two live children cannot be deleted.
    pub fn delete(&self, id: SnapshotId) -> Result<()> {
        self.edit(|t, _| {
            let entry = t
                .live(id)
                .ok_or_else(|| invalid(id, "not a live snapshot"))?;
            let parent = entry.parent;
            let live_children: Vec<SnapshotId> = entry
                .children
                .iter()
                .copied()
                .filter(|c| t.is_live(*c))
                .collect();
            if live_children.len() == 2 {
                return Err(invalid(id, "has two live children"));
            }
            let survivor = live_children.first().copied().unwrap_or(SnapshotId::NONE);

            if !survivor.is_none() {
                t.slot_mut(survivor).parent = parent;
            }
            if !parent.is_none() {
                let p = t.slot_mut(parent);
                for child in &mut p.children {
                    if *child == id {
                        *child = survivor;
                    }
                }
                p.normalize_children();
            }
            let e = t.slot_mut(id);
            e.state = SnapshotState::Deleted;
            e.children = [SnapshotId::NONE; 2];
            debug!(
                target: "sbt::snapshot",
                id = id.0,
                parent = parent.0,
                survivor = survivor.0,
                "snapshot_deleted"
            );
            Ok(())
        })
    }

    /// Phase two of deletion. Returns how many deleted entries were freed.
    pub fn finish_deletions(&self) -> Result<usize> {
        let (freed, refreshed) = self.edit(|t, rng| {
            let deleted: Vec<SnapshotId> = t
                .ids()
                .filter(|id| t.entry(*id).is_some_and(|e| e.state == SnapshotState::Deleted))
                .collect();
            let live: Vec<SnapshotId> = t.live_ids().collect();
            for id in live {
                let parent = t.parent(id);
                let (depth, tree) = if parent.is_none() {
                    (0, t.tree(id))
                } else {
                    (t.depth(parent) + 1, t.tree(parent))
                };
                let mut skip = t.skiplist(id);
                let stale = skip.iter().any(|s| !s.is_none() && !t.is_live(*s));
                if stale || depth != t.depth(id) {
                    skip = fresh_skiplist(t, rng, parent);
                }
                let e = t.slot_mut(id);
                e.depth = depth;
                e.tree = tree;
                e.skip = skip;
            }
            for id in &deleted {
                t.clear_slot(*id);
            }
            // Bitmaps are settled before publishing, so a writer that clones
            // the new version next cannot carry bits for freed ids.
            let refreshed = t.refresh_bitmaps();
            Ok((deleted.len(), refreshed))
        })?;

        debug!(
            target: "sbt::snapshot",
            freed,
            refreshed,
            "snapshot_deletions_finished"
        );
        Ok(freed)
    }

    /// Replace the whole index with entries rebuilt from persisted records.
    pub fn load_records(&self, records: &[(SnapshotId, SnapshotRecord)]) -> Result<()> {
        let mut sorted = records.to_vec();
        sorted.sort_by(|a, b| b.0.cmp(&a.0));
        let _writer = self.writer.lock();
        let mut t = SnapshotTable::new();
        for (id, rec) in &sorted {
            if id.is_none() {
                return Err(invalid(*id, "snapshot id 0 is reserved"));
            }
            if rec.parent != 0 && rec.parent <= id.0 {
                return Err(invalid(*id, "parent id not greater than child id"));
            }
            *t.slot_mut(*id) = SnapshotEntry::from_record(rec);
        }
        for (id, _) in &sorted {
            let parent = t.parent(*id);
            if t.is_live(*id) && !parent.is_none() && !t.is_live(parent) {
                return Err(invalid(*id, "live snapshot has a non-live parent"));
            }
        }
        t.refresh_bitmaps();
        self.table.publish(t);
        debug!(target: "sbt::snapshot", entries = sorted.len(), "snapshot_table_loaded");
        Ok(())
    }

    /// Persistable records of every non-empty entry, highest id first.
    #[must_use]
    pub fn records(&self) -> Vec<(SnapshotId, SnapshotRecord)> {
        let t = self.table.load();
        t.ids()
            .filter_map(|id| t.entry(id).map(|e| (id, e.to_record())))
            .collect()
    }

    /// The persisted record for one id.
    #[must_use]
    pub fn record(&self, id: SnapshotId) -> Option<SnapshotRecord> {
        self.table.load().entry(id).map(SnapshotEntry::to_record)
    }
}

/// Decode a persisted record for `id`.
pub fn decode_record(id: SnapshotId, bytes: &[u8]) -> Result<SnapshotRecord> {
    SnapshotRecord::from_bytes(bytes).map_err(|err| invalid(id, err.to_string()))
}

fn insert_child(
    t: &mut SnapshotTable,
    rng: &mut StdRng,
    parent: SnapshotId,
    id: SnapshotId,
) -> Result<()> {
    if id.is_none() || id >= parent {
        return Err(invalid(id, "child id must be nonzero and below its parent"));
    }
    let parent_entry = t
        .live(parent)
        .ok_or_else(|| invalid(parent, "parent is not a live snapshot"))?;
    if parent_entry.nr_children() == 2 {
        return Err(invalid(parent, "already has two children"));
    }
    if t.entry(id).is_some() {
        return Err(SbtError::Exists(format!("snapshot {id}")));
    }
    let depth = parent_entry.depth + 1;
    let tree = parent_entry.tree;
    let skip = fresh_skiplist(t, rng, parent);
    let bits = t.compute_bitmap(id, parent);

    let entry = t.slot_mut(id);
    entry.state = SnapshotState::Live;
    entry.parent = parent;
    entry.depth = depth;
    entry.tree = tree;
    entry.skip = skip;
    entry.store_bitmap(bits);

    let p = t.slot_mut(parent);
    if p.children[0].is_none() {
        p.children[0] = id;
    } else {
        p.children[1] = id;
    }
    p.normalize_children();

    debug!(
        target: "sbt::snapshot",
        id = id.0,
        parent = parent.0,
        depth,
        "snapshot_created"
    );
    Ok(())
}
