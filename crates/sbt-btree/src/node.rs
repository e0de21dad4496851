//! Btree nodes, the node I/O boundary, and the node cache.
//!
//! A node covers the closed key range `[min_key, max_key]`. Leaves hold keys
//! sorted by position; interior nodes hold child pointers sorted by the
//! child's `max_key`. The six lock guards a node's identity and contents for
//! traversal; the content lock only makes the in-place leaf edit at commit
//! (done under the write lock) visible to other threads.

use crate::lock::SixLock;
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use sbt_error::{Result, SbtError};
use sbt_types::{BTREE_MAX_DEPTH, Bkey, Bpos, BtreeId, POS_MIN, SPOS_MAX};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodePtr(pub u64);

impl fmt::Display for NodePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildPtr {
    pub max_key: Bpos,
    pub ptr: NodePtr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKeys {
    Leaf(Vec<Bkey>),
    Interior(Vec<ChildPtr>),
}

/// A node as stored by [`NodeIo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeImage {
    pub ptr: NodePtr,
    pub btree_id: BtreeId,
    pub level: u8,
    pub min_key: Bpos,
    pub max_key: Bpos,
    pub keys: NodeKeys,
}

/// The root of one btree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtreeRoot {
    pub ptr: NodePtr,
    pub level: u8,
}

/// Node storage. Loads may block; they happen with the parent locked.
pub trait NodeIo: Send + Sync {
    fn load_node(&self, btree_id: BtreeId, ptr: NodePtr) -> Result<NodeImage>;
    fn write_node(&self, image: &NodeImage) -> Result<()>;
}

// ── In-memory node ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct BtreeNode {
    ptr: NodePtr,
    btree_id: BtreeId,
    level: u8,
    min_key: Bpos,
    max_key: Bpos,
    lock: SixLock,
    keys: RwLock<NodeKeys>,
}

impl BtreeNode {
    #[must_use]
    pub fn from_image(image: NodeImage) -> Self {
        Self {
            ptr: image.ptr,
            btree_id: image.btree_id,
            level: image.level,
            min_key: image.min_key,
            max_key: image.max_key,
            lock: SixLock::new(),
            keys: RwLock::new(image.keys),
        }
    }

    #[must_use]
    pub const fn ptr(&self) -> NodePtr {
        self.ptr
    }

    #[must_use]
    pub const fn btree_id(&self) -> BtreeId {
        self.btree_id
    }

    #[must_use]
    pub const fn level(&self) -> u8 {
        self.level
    }

    #[must_use]
    pub const fn min_key(&self) -> Bpos {
        self.min_key
    }

    #[must_use]
    pub const fn max_key(&self) -> Bpos {
        self.max_key
    }

    #[must_use]
    pub const fn lock(&self) -> &SixLock {
        &self.lock
    }

    #[must_use]
    pub fn covers(&self, pos: Bpos) -> bool {
        self.min_key <= pos && pos <= self.max_key
    }

    #[must_use]
    pub fn image(&self) -> NodeImage {
        NodeImage {
            ptr: self.ptr,
            btree_id: self.btree_id,
            level: self.level,
            min_key: self.min_key,
            max_key: self.max_key,
            keys: self.keys.read().clone(),
        }
    }

    #[must_use]
    pub fn nr_keys(&self) -> usize {
        match &*self.keys.read() {
            NodeKeys::Leaf(keys) => keys.len(),
            NodeKeys::Interior(children) => children.len(),
        }
    }

    pub(crate) fn keys(&self) -> RwLockReadGuard<'_, NodeKeys> {
        self.keys.read()
    }

    pub(crate) fn keys_mut(&self) -> RwLockWriteGuard<'_, NodeKeys> {
        self.keys.write()
    }

    /// Child whose range contains `pos`.
    pub(crate) fn child_for(&self, pos: Bpos) -> Option<NodePtr> {
        match &*self.keys() {
            NodeKeys::Interior(children) => {
                let i = children.partition_point(|c| c.max_key < pos);
                children.get(i).map(|c| c.ptr)
            }
            NodeKeys::Leaf(_) => None,
        }
    }

    /// First key at or after `search`.
    pub(crate) fn peek_fwd(&self, search: Bpos) -> Option<Bkey> {
        match &*self.keys() {
            NodeKeys::Leaf(keys) => {
                let i = keys.partition_point(|k| k.pos < search);
                keys.get(i).cloned()
            }
            NodeKeys::Interior(_) => None,
        }
    }

    /// Last key at or before `search`.
    pub(crate) fn peek_back(&self, search: Bpos) -> Option<Bkey> {
        match &*self.keys() {
            NodeKeys::Leaf(keys) => {
                let i = keys.partition_point(|k| k.pos <= search);
                i.checked_sub(1).map(|i| keys[i].clone())
            }
            NodeKeys::Interior(_) => None,
        }
    }

    pub(crate) fn get_exact(&self, pos: Bpos) -> Option<Bkey> {
        match &*self.keys() {
            NodeKeys::Leaf(keys) => keys
                .binary_search_by(|k| k.pos.cmp(&pos))
                .ok()
                .map(|i| keys[i].clone()),
            NodeKeys::Interior(_) => None,
        }
    }
}

/// Insert, overwrite, or (for a deleted key) remove at `key.pos`.
/// Whiteouts are stored like any other key.
pub(crate) fn apply_to_leaf(keys: &mut Vec<Bkey>, key: Bkey) {
    match keys.binary_search_by(|k| k.pos.cmp(&key.pos)) {
        Ok(i) if key.is_deleted() => {
            keys.remove(i);
        }
        Ok(i) => keys[i] = key,
        Err(_) if key.is_deleted() => {}
        Err(i) => keys.insert(i, key),
    }
}

// ── Node cache ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub cached: usize,
}

enum CacheSlot {
    Ready(Arc<BtreeNode>),
    /// A thread is loading this node with the map unlocked.
    Loading,
}

/// Shared node cache. A miss parks a loading marker and reads the node with
/// the map unlocked; other threads asking for the same node wait on the
/// marker, so concurrent misses produce one load and one `BtreeNode` while
/// hits on other nodes proceed.
pub struct NodeCache {
    io: Arc<dyn NodeIo>,
    nodes: Mutex<HashMap<NodePtr, CacheSlot>>,
    loaded: Condvar,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl fmt::Debug for NodeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCache")
            .field("cached", &self.nodes.lock().len())
            .finish_non_exhaustive()
    }
}

impl NodeCache {
    #[must_use]
    pub fn new(io: Arc<dyn NodeIo>) -> Self {
        Self {
            io,
            nodes: Mutex::new(HashMap::new()),
            loaded: Condvar::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn io(&self) -> &Arc<dyn NodeIo> {
        &self.io
    }

    /// Fetch `ptr`, loading on a miss. The loaded image must name the
    /// requested btree, pointer and (if given) level.
    pub fn get(&self, btree_id: BtreeId, ptr: NodePtr, level: Option<u8>) -> Result<Arc<BtreeNode>> {
        let mut nodes = self.nodes.lock();
        loop {
            match nodes.get(&ptr) {
                Some(CacheSlot::Ready(node)) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Arc::clone(node));
                }
                Some(CacheSlot::Loading) => self.loaded.wait(&mut nodes),
                None => break,
            }
        }
        nodes.insert(ptr, CacheSlot::Loading);
        self.misses.fetch_add(1, Ordering::Relaxed);
        drop(nodes);

        let loaded = self.load(btree_id, ptr, level);
        let mut nodes = self.nodes.lock();
        match &loaded {
            Ok(node) => {
                nodes.insert(ptr, CacheSlot::Ready(Arc::clone(node)));
            }
            Err(_) => {
                nodes.remove(&ptr);
            }
        }
        drop(nodes);
        self.loaded.notify_all();
        loaded
    }

    fn load(&self, btree_id: BtreeId, ptr: NodePtr, level: Option<u8>) -> Result<Arc<BtreeNode>> {
        let image = self.io.load_node(btree_id, ptr)?;
        let level_ok = level.is_none_or(|l| l == image.level);
        if image.ptr != ptr || image.btree_id != btree_id || !level_ok {
            warn!(
                target: "sbt::btree::cache",
                node = ptr.0,
                btree = btree_id.name(),
                image_ptr = image.ptr.0,
                image_btree = image.btree_id.name(),
                image_level = image.level,
                expected_level = ?level,
                "node_image_mismatch"
            );
            return Err(SbtError::Corruption {
                node: ptr.0,
                detail: format!(
                    "expected {btree_id} node {ptr} at level {level:?}, found {} node {} at level {}",
                    image.btree_id, image.ptr, image.level
                ),
            });
        }
        trace!(target: "sbt::btree::cache", node = ptr.0, "node_load");
        Ok(Arc::new(BtreeNode::from_image(image)))
    }

    /// Drop `ptr` if nothing outside the cache references it.
    pub fn evict(&self, ptr: NodePtr) -> bool {
        let mut nodes = self.nodes.lock();
        let unused = matches!(
            nodes.get(&ptr),
            Some(CacheSlot::Ready(n)) if Arc::strong_count(n) == 1 && n.lock().is_unlocked()
        );
        if unused {
            nodes.remove(&ptr);
        }
        unused
    }

    /// Drop every unreferenced node; returns how many went.
    pub fn evict_unused(&self) -> usize {
        let mut nodes = self.nodes.lock();
        let before = nodes.len();
        nodes.retain(|_, slot| match slot {
            CacheSlot::Ready(n) => Arc::strong_count(n) > 1 || !n.lock().is_unlocked(),
            CacheSlot::Loading => true,
        });
        before - nodes.len()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            cached: self
                .nodes
                .lock()
                .values()
                .filter(|slot| matches!(slot, CacheSlot::Ready(_)))
                .count(),
        }
    }
}

// ── In-memory node store ────────────────────────────────────────────────────

/// `NodeIo` over a hash map, with injectable read faults.
#[derive(Debug, Default)]
pub struct MemNodeIo {
    nodes: RwLock<HashMap<NodePtr, NodeImage>>,
    next_ptr: AtomicU64,
    read_faults: Mutex<HashSet<NodePtr>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemNodeIo {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_ptr: AtomicU64::new(1),
            ..Self::default()
        }
    }

    pub fn alloc_ptr(&self) -> NodePtr {
        NodePtr(self.next_ptr.fetch_add(1, Ordering::Relaxed))
    }

    pub fn insert(&self, image: NodeImage) {
        self.nodes.write().insert(image.ptr, image);
    }

    #[must_use]
    pub fn node(&self, ptr: NodePtr) -> Option<NodeImage> {
        self.nodes.read().get(&ptr).cloned()
    }

    /// Make every later load of `ptr` fail with an I/O error.
    pub fn inject_read_fault(&self, ptr: NodePtr) {
        self.read_faults.lock().insert(ptr);
    }

    pub fn clear_read_faults(&self) {
        self.read_faults.lock().clear();
    }

    #[must_use]
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Single empty leaf spanning the whole key space.
    pub fn empty_root(&self, btree_id: BtreeId) -> BtreeRoot {
        let ptr = self.alloc_ptr();
        self.insert(NodeImage {
            ptr,
            btree_id,
            level: 0,
            min_key: POS_MIN,
            max_key: SPOS_MAX,
            keys: NodeKeys::Leaf(Vec::new()),
        });
        BtreeRoot { ptr, level: 0 }
    }

    /// Bulk-build a tree with at most `fanout` entries per node. Keys are
    /// sorted; for duplicate positions the first one wins.
    pub fn build_tree(&self, btree_id: BtreeId, mut keys: Vec<Bkey>, fanout: usize) -> Result<BtreeRoot> {
        let fanout = fanout.max(2);
        keys.sort_by(|a, b| a.pos.cmp(&b.pos));
        keys.dedup_by(|a, b| a.pos == b.pos);

        let chunks: Vec<Vec<Bkey>> = if keys.is_empty() {
            vec![Vec::new()]
        } else {
            keys.chunks(fanout).map(<[Bkey]>::to_vec).collect()
        };

        let mut children = Vec::with_capacity(chunks.len());
        let mut min_key = POS_MIN;
        let nr_chunks = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            let max_key = match chunk.last() {
                Some(last) if i + 1 < nr_chunks => last.pos,
                _ => SPOS_MAX,
            };
            let ptr = self.alloc_ptr();
            self.insert(NodeImage {
                ptr,
                btree_id,
                level: 0,
                min_key,
                max_key,
                keys: NodeKeys::Leaf(chunk),
            });
            children.push(ChildPtr { max_key, ptr });
            min_key = max_key.successor().unwrap_or(SPOS_MAX);
        }

        let mut level = 0_u8;
        while children.len() > 1 {
            level += 1;
            if usize::from(level) >= BTREE_MAX_DEPTH {
                return Err(SbtError::Invalid(format!(
                    "{} keys do not fit in a depth-{BTREE_MAX_DEPTH} tree with fanout {fanout}",
                    keys.len()
                )));
            }
            let mut parents = Vec::with_capacity(children.len().div_ceil(fanout));
            let mut min_key = POS_MIN;
            for group in children.chunks(fanout) {
                let max_key = group.last().map_or(SPOS_MAX, |c| c.max_key);
                let ptr = self.alloc_ptr();
                self.insert(NodeImage {
                    ptr,
                    btree_id,
                    level,
                    min_key,
                    max_key,
                    keys: NodeKeys::Interior(group.to_vec()),
                });
                parents.push(ChildPtr { max_key, ptr });
                min_key = max_key.successor().unwrap_or(SPOS_MAX);
            }
            children = parents;
        }

        let root = children.first().map_or_else(|| self.empty_root(btree_id).ptr, |c| c.ptr);
        Ok(BtreeRoot { ptr: root, level })
    }
}

impl NodeIo for MemNodeIo {
    fn load_node(&self, btree_id: BtreeId, ptr: NodePtr) -> Result<NodeImage> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if self.read_faults.lock().contains(&ptr) {
            return Err(SbtError::Io(std::io::Error::other(format!(
                "injected read fault on {btree_id} node {ptr}"
            ))));
        }
        self.node(ptr).ok_or_else(|| SbtError::Corruption {
            node: ptr.0,
            detail: format!("{btree_id} node {ptr} does not exist"),
        })
    }

    fn write_node(&self, image: &NodeImage) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.insert(image.clone());
        Ok(())
    }
}
