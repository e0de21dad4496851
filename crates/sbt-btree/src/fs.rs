//! The filesystem-wide context shared by every transaction.

use crate::commit::{JournalSink, NoopJournal};
use crate::config::BtreeConfig;
use crate::node::{BtreeRoot, MemNodeIo, NodeCache, NodeIo, NodePtr};
use crate::path::PathTable;
use crate::trans::Transaction;
use parking_lot::{Mutex, RwLock};
use sbt_error::{RestartReason, Result, SbtError};
use sbt_snapshot::Snapshots;
use sbt_types::{Bkey, BtreeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

const PATH_POOL_MAX: usize = 16;

/// Restart totals across every transaction of one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RestartStats {
    pub by_reason: [u64; RestartReason::ALL.len()],
    pub commits: u64,
}

impl RestartStats {
    #[must_use]
    pub fn get(&self, reason: RestartReason) -> u64 {
        self.by_reason[reason.index()]
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.by_reason.iter().sum()
    }
}

/// Everything a transaction reads from outside itself: configuration, node
/// storage and cache, btree roots, the snapshot index and the journal hook.
pub struct BtreeFs {
    config: BtreeConfig,
    cache: NodeCache,
    roots: RwLock<HashMap<BtreeId, BtreeRoot>>,
    snapshots: Arc<Snapshots>,
    journal: Arc<dyn JournalSink>,
    next_trans_id: AtomicU64,
    restarts: [AtomicU64; RestartReason::ALL.len()],
    commits: AtomicU64,
    path_pool: Mutex<Vec<PathTable>>,
    write_error: Mutex<Option<String>>,
}

impl fmt::Debug for BtreeFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BtreeFs")
            .field("config", &self.config)
            .field("roots", &*self.roots.read())
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl BtreeFs {
    pub fn new(
        config: BtreeConfig,
        io: Arc<dyn NodeIo>,
        roots: impl IntoIterator<Item = (BtreeId, BtreeRoot)>,
        snapshots: Arc<Snapshots>,
        journal: Arc<dyn JournalSink>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cache: NodeCache::new(io),
            roots: RwLock::new(roots.into_iter().collect()),
            snapshots,
            journal,
            next_trans_id: AtomicU64::new(1),
            restarts: Default::default(),
            commits: AtomicU64::new(0),
            path_pool: Mutex::new(Vec::new()),
            write_error: Mutex::new(None),
        })
    }

    /// Context over a fresh [`MemNodeIo`] with an empty root per btree.
    pub fn in_memory(config: BtreeConfig) -> Result<(Self, Arc<MemNodeIo>)> {
        let io = Arc::new(MemNodeIo::new());
        let roots: Vec<(BtreeId, BtreeRoot)> = BtreeId::ALL
            .iter()
            .map(|&id| (id, io.empty_root(id)))
            .collect();
        let fs = Self::new(
            config,
            Arc::clone(&io) as Arc<dyn NodeIo>,
            roots,
            Arc::new(Snapshots::new()),
            Arc::new(NoopJournal::default()),
        )?;
        Ok((fs, io))
    }

    #[must_use]
    pub const fn config(&self) -> &BtreeConfig {
        &self.config
    }

    #[must_use]
    pub const fn cache(&self) -> &NodeCache {
        &self.cache
    }

    #[must_use]
    pub fn io(&self) -> &Arc<dyn NodeIo> {
        self.cache.io()
    }

    #[must_use]
    pub const fn snapshots(&self) -> &Arc<Snapshots> {
        &self.snapshots
    }

    #[must_use]
    pub fn journal(&self) -> &Arc<dyn JournalSink> {
        &self.journal
    }

    #[must_use]
    pub fn root(&self, btree_id: BtreeId) -> Option<BtreeRoot> {
        self.roots.read().get(&btree_id).copied()
    }

    /// Swap in a new root. Transactions holding the old root notice on
    /// their next root lock.
    pub fn set_root(&self, btree_id: BtreeId, root: BtreeRoot) {
        self.roots.write().insert(btree_id, root);
    }

    /// Bulk-build `keys` into `io` with the configured `node_fanout` and
    /// install the result as the root of `btree_id`.
    pub fn load_tree(&self, io: &MemNodeIo, btree_id: BtreeId, keys: Vec<Bkey>) -> Result<BtreeRoot> {
        let root = io.build_tree(btree_id, keys, self.config.node_fanout)?;
        self.set_root(btree_id, root);
        Ok(root)
    }

    #[must_use]
    pub fn trans(&self) -> Transaction<'_> {
        Transaction::new(self)
    }

    /// Run `f` in a fresh transaction's restart loop.
    pub fn trans_do<'s, T>(&'s self, f: impl FnMut(&mut Transaction<'s>) -> Result<T>) -> Result<T> {
        self.trans().run(f)
    }

    #[must_use]
    pub fn restart_stats(&self) -> RestartStats {
        let mut stats = RestartStats {
            commits: self.commits.load(Ordering::Relaxed),
            ..RestartStats::default()
        };
        for (slot, counter) in stats.by_reason.iter_mut().zip(&self.restarts) {
            *slot = counter.load(Ordering::Relaxed);
        }
        stats
    }

    pub(crate) fn next_trans_id(&self) -> u64 {
        self.next_trans_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn note_restart(&self, reason: RestartReason) {
        self.restarts[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    /// The first node write-back failure, if any. Once set, the context is
    /// read-only: updates already committed stay visible, new commits fail.
    #[must_use]
    pub fn write_error(&self) -> Option<String> {
        self.write_error.lock().clone()
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        match &*self.write_error.lock() {
            Some(reason) => Err(SbtError::ReadOnly(reason.clone())),
            None => Ok(()),
        }
    }

    pub(crate) fn note_write_error(&self, node: NodePtr, err: &SbtError) {
        error!(target: "sbt::btree::cache", node = node.0, error = %err, "node_write_error");
        self.write_error
            .lock()
            .get_or_insert_with(|| format!("write-back of node {node} failed: {err}"));
    }

    pub(crate) fn take_path_table(&self) -> PathTable {
        self.path_pool
            .lock()
            .pop()
            .unwrap_or_else(|| PathTable::with_capacity(self.config.initial_paths))
    }

    pub(crate) fn return_path_table(&self, mut table: PathTable) {
        table.clear();
        let mut pool = self.path_pool.lock();
        if pool.len() < PATH_POOL_MAX {
            pool.push(table);
        }
    }

    #[must_use]
    pub fn pooled_path_tables(&self) -> usize {
        self.path_pool.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbt_types::{Bpos, SnapshotId};

    fn keys(n: u64) -> Vec<Bkey> {
        (0..n)
            .map(|i| Bkey::value(Bpos::new(1, i, SnapshotId(0)), vec![1]))
            .collect()
    }

    #[test]
    fn load_tree_uses_configured_fanout() {
        let narrow = BtreeConfig {
            node_fanout: 4,
            ..BtreeConfig::default()
        };
        let (fs, io) = BtreeFs::in_memory(narrow).expect("fs");
        let root = fs.load_tree(&io, BtreeId::Alloc, keys(20)).expect("load");
        assert_eq!(root.level, 2);
        assert_eq!(fs.root(BtreeId::Alloc), Some(root));

        let (fs, io) = BtreeFs::in_memory(BtreeConfig::default()).expect("fs");
        let root = fs.load_tree(&io, BtreeId::Alloc, keys(20)).expect("load");
        assert_eq!(root.level, 1);
        let k = fs
            .trans()
            .with_iter(
                BtreeId::Alloc,
                Bpos::new(1, 19, SnapshotId(0)),
                crate::iter::IterFlags::NONE,
                |trans, iter| trans.iter_peek_slot(iter),
            )
            .expect("lookup");
        assert_eq!(k.val, vec![1]);
    }

    #[test]
    fn write_error_is_sticky() {
        let (fs, _io) = BtreeFs::in_memory(BtreeConfig::default()).expect("fs");
        assert!(fs.check_writable().is_ok());
        fs.note_write_error(NodePtr(3), &SbtError::Io(std::io::Error::other("first")));
        fs.note_write_error(NodePtr(4), &SbtError::Io(std::io::Error::other("second")));
        let reason = fs.write_error().expect("recorded");
        assert!(reason.contains("first"));
        assert!(matches!(fs.check_writable(), Err(SbtError::ReadOnly(_))));
    }
}
