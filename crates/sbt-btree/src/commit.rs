//! Pending updates and the commit boundary.
//!
//! Updates are staged per `(btree, pos)` with their values in the
//! transaction arena, each holding an intent path to its leaf. Commit:
//!
//! 1. traverses every update path (intent on the leaf);
//! 2. write-locks each distinct leaf in lock order, counting the
//!    transaction's own read locks on it;
//! 3. hands the batch to the [`JournalSink`], whose errors are not restarts;
//! 4. applies the keys, writes the leaves back through `NodeIo`;
//! 5. releases write (bumping each leaf's sequence) and refreshes the
//!    recorded sequence of every path of this transaction on those leaves.
//!
//! Once the journal has accepted the batch the commit has happened. A failed
//! write-back after that point does not fail the commit; it puts the context
//! into emergency read-only mode ([`BtreeFs::write_error`]) and every later
//! commit returns `ReadOnly`.
//!
//! [`BtreeFs::write_error`]: crate::fs::BtreeFs::write_error

use crate::iter::{BtreeIter, IterFlags};
use crate::lock::LockMode;
use crate::mem::MemHandle;
use crate::node::{BtreeNode, NodeKeys, apply_to_leaf};
use crate::path::PathIdx;
use crate::trans::Transaction;
use sbt_error::{RestartReason, Result};
use sbt_types::{Bkey, Bpos, BtreeId, KeyType, SnapshotId};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Commit behaviour switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitFlags(pub u32);

impl CommitFlags {
    pub const NONE: Self = Self(0);
    /// Skip the journal hook.
    pub const NO_JOURNAL: Self = Self(1 << 0);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Space the caller reserved for this commit; passed through to the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiskReservation {
    pub sectors: u64,
}

/// What the journal hook sees for one commit.
#[derive(Debug)]
pub struct CommitRequest<'r> {
    pub trans_id: u64,
    pub updates: &'r [(BtreeId, Bkey)],
    pub disk_res: Option<&'r DiskReservation>,
    pub flags: CommitFlags,
}

/// Journal boundary. Called with the leaves write-locked; returns the
/// sequence number the commit was journalled at.
pub trait JournalSink: Send + Sync {
    fn journal_commit(&self, req: &CommitRequest<'_>) -> Result<u64>;
}

/// Accepts everything, numbering commits from 1.
#[derive(Debug, Default)]
pub struct NoopJournal {
    seq: AtomicU64,
}

impl JournalSink for NoopJournal {
    fn journal_commit(&self, _req: &CommitRequest<'_>) -> Result<u64> {
        Ok(self.seq.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingUpdate {
    pub(crate) btree_id: BtreeId,
    pub(crate) pos: Bpos,
    pub(crate) size: u32,
    pub(crate) kind: KeyType,
    pub(crate) val: MemHandle,
    pub(crate) path: PathIdx,
}

impl Transaction<'_> {
    /// Stage `key` in the iterator's btree.
    pub fn update(&mut self, iter: &BtreeIter, key: Bkey) -> Result<()> {
        self.update_key(iter.btree_id(), key)
    }

    /// Stage `key`, replacing any update already staged at its position.
    pub fn update_key(&mut self, btree_id: BtreeId, key: Bkey) -> Result<()> {
        let path = self.get_path(
            btree_id,
            key.pos,
            1,
            0,
            IterFlags::INTENT | IterFlags::NOPRESERVE,
        )?;
        if let Err(err) = self.path_traverse(path) {
            self.put_path(path, true);
            return Err(err);
        }
        self.path_set_should_be_locked(path);
        let val = match self.mem.alloc_copy(&key.val) {
            Ok(val) => val,
            Err(err) => {
                self.put_path(path, true);
                return Err(err);
            }
        };
        let update = PendingUpdate {
            btree_id,
            pos: key.pos,
            size: key.size,
            kind: key.kind,
            val,
            path,
        };
        match self
            .updates
            .binary_search_by(|u| (u.btree_id, u.pos).cmp(&(btree_id, key.pos)))
        {
            Ok(i) => {
                let old = std::mem::replace(&mut self.updates[i], update);
                self.put_path(old.path, true);
            }
            Err(i) => self.updates.insert(i, update),
        }
        Ok(())
    }

    /// Delete the key at the iterator. In a snapshot-filtered iterator this
    /// stages a whiteout when an ancestor snapshot's key would otherwise
    /// show through.
    pub fn delete_at(&mut self, iter: &mut BtreeIter) -> Result<()> {
        let filtered = iter.flags().contains(IterFlags::FILTER_SNAPSHOTS);
        let (pos, size) = if iter.flags().contains(IterFlags::IS_EXTENTS) {
            (iter.key().pos, iter.key().size)
        } else {
            (iter.pos(), 0)
        };
        let pos = if filtered { pos.with_snapshot(iter.snapshot()) } else { pos };
        let kind = if filtered && self.ancestor_key_visible(iter, pos)? {
            KeyType::Whiteout
        } else {
            KeyType::Deleted
        };
        self.update_key(
            iter.btree_id(),
            Bkey {
                pos,
                size,
                kind,
                val: Vec::new(),
            },
        )
    }

    /// Whether a key from a strict ancestor of `pos.snapshot` is visible at
    /// `pos`'s logical position.
    fn ancestor_key_visible(&mut self, iter: &mut BtreeIter, pos: Bpos) -> Result<bool> {
        let Some(first_ancestor) = pos.snapshot.0.checked_add(1) else {
            return Ok(false);
        };
        let table = self.fs.snapshots().load_arc();
        let found = self.find_visible_at(
            iter,
            pos.with_snapshot(SnapshotId(first_ancestor)),
            pos.snapshot,
            &table,
        )?;
        Ok(found.is_some_and(|k| !k.is_tombstone()))
    }

    pub(crate) fn materialize(&self, update: &PendingUpdate) -> Bkey {
        Bkey {
            pos: update.pos,
            size: update.size,
            kind: update.kind,
            val: self.mem.get(update.val).to_vec(),
        }
    }

    #[must_use]
    pub fn nr_updates(&self) -> usize {
        self.updates.len()
    }

    /// Apply every staged update atomically with respect to other
    /// transactions' readers. On success the staged set is empty.
    pub fn commit(
        &mut self,
        disk_res: Option<&DiskReservation>,
        journal_seq: Option<&mut u64>,
        flags: CommitFlags,
    ) -> Result<()> {
        self.verify_not_in_restart();
        if self.updates.is_empty() {
            return Ok(());
        }
        self.fs.check_writable()?;
        if !self.locked {
            self.relock()?;
        }
        self.maybe_inject_restart()?;

        for i in 0..self.updates.len() {
            let path = self.updates[i].path;
            self.path_traverse(path)?;
        }

        let keys: Vec<(BtreeId, Bkey)> = self
            .updates
            .iter()
            .map(|u| (u.btree_id, self.materialize(u)))
            .collect();
        let leaves_of: Vec<Arc<BtreeNode>> =
            self.updates.iter().map(|u| self.path_leaf(u.path)).collect();
        let mut leaves = leaves_of.clone();
        leaves.sort_by_key(|n| (n.btree_id(), n.min_key()));
        leaves.dedup_by_key(|n| n.ptr());

        let wait = self.fs.config().lock_wait;
        for (i, leaf) in leaves.iter().enumerate() {
            let own_readers = self.own_read_locks(leaf);
            if !leaf.lock().lock_write(self.id, own_readers, wait) {
                for done in leaves[..i].iter().rev() {
                    done.lock().unlock_write(self.id, false);
                }
                return Err(self.restart(RestartReason::LockNotAvailable));
            }
        }

        let seq = if flags.contains(CommitFlags::NO_JOURNAL) {
            None
        } else {
            let req = CommitRequest {
                trans_id: self.id,
                updates: &keys,
                disk_res,
                flags,
            };
            match self.fs.journal().journal_commit(&req) {
                Ok(seq) => Some(seq),
                Err(err) => {
                    for leaf in leaves.iter().rev() {
                        leaf.lock().unlock_write(self.id, false);
                    }
                    return Err(err);
                }
            }
        };

        let nr_keys = keys.len();
        for ((_, key), leaf) in keys.into_iter().zip(&leaves_of) {
            if let NodeKeys::Leaf(leaf_keys) = &mut *leaf.keys_mut() {
                apply_to_leaf(leaf_keys, key);
            }
        }
        for leaf in &leaves {
            if let Err(err) = self.fs.io().write_node(&leaf.image()) {
                self.fs.note_write_error(leaf.ptr(), &err);
            }
        }
        for leaf in &leaves {
            leaf.lock().unlock_write(self.id, true);
            self.refresh_path_seqs(leaf);
        }

        for update in std::mem::take(&mut self.updates) {
            self.put_path(update.path, true);
        }
        self.fs.note_commit();
        debug!(
            target: "sbt::btree::trans",
            trans_id = self.id,
            keys = nr_keys,
            leaves = leaves.len(),
            journal_seq = ?seq,
            "trans_commit"
        );
        if let (Some(out), Some(seq)) = (journal_seq, seq) {
            *out = seq;
        }
        Ok(())
    }

    /// Read locks this transaction holds on `node`, over all paths.
    fn own_read_locks(&self, node: &BtreeNode) -> u32 {
        let mut n = 0;
        for idx in self.paths.iter() {
            for pl in &self.paths[idx].l {
                let on_node = pl.node.as_ref().is_some_and(|p| p.ptr() == node.ptr());
                if on_node && pl.held == Some(LockMode::Read) {
                    n += 1;
                }
            }
        }
        n
    }

    /// After our own write, locked paths on `node` observe the new sequence.
    fn refresh_path_seqs(&mut self, node: &BtreeNode) {
        let seq = node.lock().seq();
        let idxs: Vec<PathIdx> = self.paths.iter().collect();
        for idx in idxs {
            for pl in &mut self.paths[idx].l {
                let on_node = pl.node.as_ref().is_some_and(|p| p.ptr() == node.ptr());
                if on_node && pl.held.is_some() {
                    pl.lock_seq = seq;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BtreeConfig;
    use crate::fs::BtreeFs;
    use crate::node::NodeIo;
    use parking_lot::Mutex;
    use sbt_error::SbtError;
    use sbt_snapshot::Snapshots;
    use sbt_types::SnapshotId;

    fn pos(offset: u64) -> Bpos {
        Bpos::new(1, offset, SnapshotId(0))
    }

    #[derive(Default)]
    struct RecordingJournal {
        seen: Mutex<Vec<usize>>,
        fail: bool,
    }

    impl JournalSink for RecordingJournal {
        fn journal_commit(&self, req: &CommitRequest<'_>) -> Result<u64> {
            if self.fail {
                return Err(SbtError::Journal("journal full".into()));
            }
            let mut seen = self.seen.lock();
            seen.push(req.updates.len());
            Ok(seen.len() as u64 + 100)
        }
    }

    fn fs_with(journal: Arc<dyn JournalSink>) -> (BtreeFs, Arc<crate::node::MemNodeIo>) {
        let io = Arc::new(crate::node::MemNodeIo::new());
        let keys = (0..32).map(|i| Bkey::value(pos(i * 2), vec![0])).collect();
        let root = io.build_tree(BtreeId::Inodes, keys, 4).expect("build");
        let fs = BtreeFs::new(
            BtreeConfig::default(),
            Arc::clone(&io) as Arc<dyn NodeIo>,
            [(BtreeId::Inodes, root)],
            Arc::new(Snapshots::new()),
            journal,
        )
        .expect("fs");
        (fs, io)
    }

    fn get(trans: &mut Transaction<'_>, offset: u64) -> Bkey {
        let idx = trans
            .get_path(BtreeId::Inodes, pos(offset), 0, 0, IterFlags::NONE)
            .expect("path");
        let k = trans.path_peek_slot_exact(idx).expect("peek");
        trans.put_path(idx, false);
        k
    }

    #[test]
    fn commit_applies_and_journals() {
        let journal = Arc::new(RecordingJournal::default());
        let (fs, io) = fs_with(Arc::clone(&journal) as Arc<dyn JournalSink>);
        let writes_before = io.writes();
        let mut trans = fs.trans();
        trans.update_key(BtreeId::Inodes, Bkey::value(pos(3), b"three".to_vec())).expect("stage");
        trans.update_key(BtreeId::Inodes, Bkey::value(pos(61), b"far".to_vec())).expect("stage");
        trans.update_key(BtreeId::Inodes, Bkey::deleted(pos(4))).expect("stage");
        assert_eq!(trans.nr_updates(), 3);

        let mut seq = 0;
        trans
            .commit(Some(&DiskReservation { sectors: 8 }), Some(&mut seq), CommitFlags::NONE)
            .expect("commit");
        assert_eq!(seq, 101);
        assert_eq!(*journal.seen.lock(), vec![3]);
        assert_eq!(trans.nr_updates(), 0);
        assert_eq!(trans.nr_paths(), 0, "update paths are released");
        assert!(io.writes() > writes_before);

        assert_eq!(get(&mut trans, 3).val, b"three");
        assert_eq!(get(&mut trans, 61).val, b"far");
        assert!(get(&mut trans, 4).is_deleted());
        assert!(get(&mut trans, 6).val == vec![0]);
    }

    #[test]
    fn restaging_a_position_replaces_it() {
        let (fs, _io) = fs_with(Arc::new(NoopJournal::default()));
        let mut trans = fs.trans();
        trans.update_key(BtreeId::Inodes, Bkey::value(pos(5), b"a".to_vec())).expect("stage");
        trans.update_key(BtreeId::Inodes, Bkey::value(pos(5), b"b".to_vec())).expect("stage");
        assert_eq!(trans.nr_updates(), 1);
        trans.commit(None, None, CommitFlags::NONE).expect("commit");
        assert_eq!(get(&mut trans, 5).val, b"b");
    }

    #[test]
    fn journal_failure_is_not_a_restart_and_leaves_tree_untouched() {
        let journal = Arc::new(RecordingJournal {
            fail: true,
            ..RecordingJournal::default()
        });
        let (fs, _io) = fs_with(journal);
        let mut trans = fs.trans();
        trans.update_key(BtreeId::Inodes, Bkey::value(pos(7), b"x".to_vec())).expect("stage");
        let err = trans.commit(None, None, CommitFlags::NONE).expect_err("journal fails");
        assert!(matches!(err, SbtError::Journal(_)));
        assert!(!err.is_restart());
        assert!(trans.restarted().is_none());

        trans.begin();
        assert!(get(&mut trans, 7).is_deleted());
        trans.update_key(BtreeId::Inodes, Bkey::value(pos(7), b"x".to_vec())).expect("stage");
        trans
            .commit(None, None, CommitFlags::NO_JOURNAL)
            .expect("no journal, no failure");
        assert_eq!(get(&mut trans, 7).val, b"x");
    }

    struct FailingWrites {
        inner: crate::node::MemNodeIo,
        fail: std::sync::atomic::AtomicBool,
    }

    impl NodeIo for FailingWrites {
        fn load_node(
            &self,
            btree_id: BtreeId,
            ptr: crate::node::NodePtr,
        ) -> Result<crate::node::NodeImage> {
            self.inner.load_node(btree_id, ptr)
        }

        fn write_node(&self, image: &crate::node::NodeImage) -> Result<()> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(SbtError::Io(std::io::Error::other("disk")));
            }
            self.inner.write_node(image)
        }
    }

    #[test]
    fn failed_write_back_keeps_commit_and_goes_read_only() {
        let io = Arc::new(FailingWrites {
            inner: crate::node::MemNodeIo::new(),
            fail: std::sync::atomic::AtomicBool::new(true),
        });
        let keys = (0..8).map(|i| Bkey::value(pos(i), vec![0])).collect();
        let root = io.inner.build_tree(BtreeId::Inodes, keys, 4).expect("build");
        let journal = Arc::new(RecordingJournal::default());
        let fs = BtreeFs::new(
            BtreeConfig::default(),
            Arc::clone(&io) as Arc<dyn NodeIo>,
            [(BtreeId::Inodes, root)],
            Arc::new(Snapshots::new()),
            Arc::clone(&journal) as Arc<dyn JournalSink>,
        )
        .expect("fs");

        let mut trans = fs.trans();
        trans.update_key(BtreeId::Inodes, Bkey::value(pos(3), b"x".to_vec())).expect("stage");
        let mut seq = 0;
        trans
            .commit(None, Some(&mut seq), CommitFlags::NONE)
            .expect("journalled commit stands");
        assert_eq!(seq, 101);
        assert_eq!(fs.restart_stats().commits, 1);
        assert!(fs.write_error().is_some_and(|e| e.contains("disk")));
        drop(trans);

        let mut reader = fs.trans();
        assert_eq!(get(&mut reader, 3).val, b"x");

        io.fail.store(false, Ordering::Relaxed);
        reader.update_key(BtreeId::Inodes, Bkey::value(pos(4), b"y".to_vec())).expect("stage");
        let err = reader.commit(None, None, CommitFlags::NONE).expect_err("read-only");
        assert!(matches!(err, SbtError::ReadOnly(_)));
        assert_eq!(journal.seen.lock().len(), 1);
        assert!(get(&mut reader, 4).is_deleted());
    }

    #[test]
    fn commit_refreshes_own_path_sequences() {
        let (fs, _io) = fs_with(Arc::new(NoopJournal::default()));
        let mut trans = fs.trans();
        let reader = trans
            .get_path(BtreeId::Inodes, pos(8), 0, 0, IterFlags::NONE)
            .expect("path");
        trans.path_traverse(reader).expect("traverse");
        trans.path_set_should_be_locked(reader);
        let before = trans.path_info(reader).seqs[0].expect("leaf cached");

        trans.update_key(BtreeId::Inodes, Bkey::value(pos(9), b"n".to_vec())).expect("stage");
        trans.commit(None, None, CommitFlags::NONE).expect("commit with own reader");

        let (seen, live) = trans.path_info(reader).seqs[0].expect("leaf cached");
        assert_eq!(seen, live);
        assert_eq!(live, before.1 + 1);
        trans.unlock();
        trans.relock().expect("own write does not invalidate own path");
        trans.put_path(reader, false);
    }
}
