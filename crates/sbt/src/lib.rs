#![forbid(unsafe_code)]
//! Filesystem context and snapshot workflow.
//!
//! [`Filesystem`] owns the btree context ([`BtreeFs`]) and keeps the snapshot
//! ancestry index in step with the `Snapshots` btree: every structural
//! change to the index is followed by a transaction that rewrites the
//! affected records, and [`Filesystem::open`] rebuilds the index from those
//! records.
//!
//! Records live at `(0, id, 0)` in the `Snapshots` btree, encoded with
//! [`SnapshotRecord::to_bytes`]. A freed entry's key is deleted.
//!
//! # Logging
//!
//! - **INFO** `sbt`: `fs_open`
//! - **DEBUG** `sbt`: `snapshot_records_written`, `snapshot_records_read`

use sbt_btree::{
    BtreeConfig, BtreeFs, BtreeRoot, CommitFlags, IterFlags, JournalSink, MemNodeIo, NodeIo,
    NoopJournal,
};
use sbt_error::{Result, SbtError};
use sbt_snapshot::{SnapshotRecord, Snapshots, decode_record};
use sbt_types::{Bkey, Bpos, BtreeId, POS_MIN, SnapshotId};
use std::sync::Arc;
use tracing::{debug, info};

pub use sbt_btree;
pub use sbt_error;
pub use sbt_snapshot;
pub use sbt_types;

/// Options for [`Filesystem::open`].
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    pub config: BtreeConfig,
    /// Seed for skiplist randomness; entropy when `None`.
    pub snapshot_seed: Option<u64>,
}

/// Key position of a snapshot record.
#[must_use]
pub fn snapshot_record_pos(id: SnapshotId) -> Bpos {
    Bpos::new(0, u64::from(id.0), SnapshotId(0))
}

fn record_id(pos: Bpos) -> Result<SnapshotId> {
    if pos.inode != 0 {
        return Err(SbtError::Invalid(format!("snapshot record at {pos} outside inode 0")));
    }
    u32::try_from(pos.offset)
        .map(SnapshotId)
        .map_err(|_| SbtError::Invalid(format!("snapshot record at {pos} has no valid id")))
}

pub struct Filesystem {
    btree: BtreeFs,
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("btree", &self.btree)
            .field("snapshots", &self.btree.snapshots().load().nr_live())
            .finish()
    }
}

impl Filesystem {
    /// Open over existing btree roots and rebuild the snapshot index from
    /// the `Snapshots` btree.
    pub fn open(
        io: Arc<dyn NodeIo>,
        roots: impl IntoIterator<Item = (BtreeId, BtreeRoot)>,
        journal: Arc<dyn JournalSink>,
        options: &OpenOptions,
    ) -> Result<Self> {
        let snapshots = match options.snapshot_seed {
            Some(seed) => Snapshots::with_seed(seed),
            None => Snapshots::new(),
        };
        let btree = BtreeFs::new(options.config.clone(), io, roots, Arc::new(snapshots), journal)?;
        let fs = Self { btree };
        let nr = fs.read_snapshots()?;
        info!(target: "sbt", snapshots = nr, "fs_open");
        Ok(fs)
    }

    /// Fresh in-memory filesystem with empty btrees.
    pub fn in_memory(options: &OpenOptions) -> Result<(Self, Arc<MemNodeIo>)> {
        let io = Arc::new(MemNodeIo::new());
        let roots: Vec<(BtreeId, BtreeRoot)> = BtreeId::ALL
            .iter()
            .map(|&id| (id, io.empty_root(id)))
            .collect();
        let fs = Self::open(
            Arc::clone(&io) as Arc<dyn NodeIo>,
            roots,
            Arc::new(NoopJournal::default()),
            options,
        )?;
        Ok((fs, io))
    }

    #[must_use]
    pub const fn btree(&self) -> &BtreeFs {
        &self.btree
    }

    #[must_use]
    pub const fn snapshots(&self) -> &Arc<Snapshots> {
        self.btree.snapshots()
    }

    /// Replace the in-memory index with the records in the `Snapshots`
    /// btree. Returns how many records were read.
    pub fn read_snapshots(&self) -> Result<usize> {
        let mut trans = self.btree.trans();
        let mut records = Vec::new();
        trans.for_each_key(BtreeId::Snapshots, POS_MIN, IterFlags::NONE, |_, _, k| {
            let id = record_id(k.pos)?;
            records.push((id, decode_record(id, &k.val)?));
            Ok(())
        })?;
        drop(trans);
        self.snapshots().load_records(&records)?;
        debug!(target: "sbt", records = records.len(), "snapshot_records_read");
        Ok(records.len())
    }

    /// Persist the current index entries for `ids`; ids without an entry
    /// have their record deleted.
    fn write_records(&self, ids: &[SnapshotId]) -> Result<()> {
        let snapshots = self.snapshots();
        let mut trans = self.btree.trans();
        let mut seq = 0;
        trans.commit_do(None, Some(&mut seq), CommitFlags::NONE, |trans| {
            for &id in ids {
                let pos = snapshot_record_pos(id);
                let key = match snapshots.record(id) {
                    Some(rec) => Bkey::value(pos, rec.to_bytes().to_vec()),
                    None => Bkey::deleted(pos),
                };
                trans.update_key(BtreeId::Snapshots, key)?;
            }
            Ok(())
        })?;
        debug!(target: "sbt", records = ids.len(), journal_seq = seq, "snapshot_records_written");
        Ok(())
    }

    pub fn create_snapshot_tree(&self, root: SnapshotId, tree: u32) -> Result<()> {
        self.snapshots().create_tree(root, tree)?;
        self.write_records(&[root])
    }

    /// Add `id` as a child of `parent`; `id` must sort below every id in use.
    pub fn create_snapshot(&self, parent: SnapshotId, id: SnapshotId) -> Result<()> {
        self.snapshots().create_child(parent, id)?;
        self.write_records(&[parent, id])
    }

    /// Give `parent` two children with freshly allocated ids.
    pub fn fork_snapshot(&self, parent: SnapshotId) -> Result<[SnapshotId; 2]> {
        let ids = self.snapshots().fork(parent)?;
        self.write_records(&[parent, ids[0], ids[1]])?;
        Ok(ids)
    }

    pub fn set_snapshot_subvol(&self, id: SnapshotId, subvol: u32) -> Result<()> {
        self.snapshots().set_subvol(id, subvol)?;
        self.write_records(&[id])
    }

    /// Mark `id` deleted and reparent its surviving child. The entry stays
    /// until [`Self::run_snapshot_deletion`].
    pub fn delete_snapshot(&self, id: SnapshotId) -> Result<()> {
        let (parent, children) = {
            let table = self.snapshots().load();
            let entry = table.live(id).ok_or_else(|| SbtError::InvalidSnapshot {
                id: id.0,
                detail: "not a live snapshot".into(),
            })?;
            (entry.parent, entry.children)
        };
        self.snapshots().delete(id)?;
        let mut affected = vec![id];
        affected.extend(
            std::iter::once(parent)
                .chain(children)
                .filter(|s| !s.is_none()),
        );
        self.write_records(&affected)
    }

    /// Free every deleted entry and rewrite the records whose depth or
    /// skiplist changed. Returns how many entries were freed.
    pub fn run_snapshot_deletion(&self) -> Result<usize> {
        let before: Vec<SnapshotId> = self.snapshots().records().into_iter().map(|(id, _)| id).collect();
        let freed = self.snapshots().finish_deletions()?;
        self.write_records(&before)?;
        Ok(freed)
    }

    /// Records as stored in the btree, highest id first.
    pub fn stored_records(&self) -> Result<Vec<(SnapshotId, SnapshotRecord)>> {
        let mut trans = self.btree.trans();
        let mut records = Vec::new();
        trans.for_each_key_reverse(
            BtreeId::Snapshots,
            snapshot_record_pos(SnapshotId::MAX),
            IterFlags::NONE,
            |_, _, k| {
                let id = record_id(k.pos)?;
                records.push((id, decode_record(id, &k.val)?));
                Ok(())
            },
        )?;
        Ok(records)
    }
}
