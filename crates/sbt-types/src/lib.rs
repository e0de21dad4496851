#![forbid(unsafe_code)]
//! Shared vocabulary for the sbt crates: btree ids, key positions, keys.
//!
//! Positions order by `(inode, offset, snapshot)`. Extent keys are indexed
//! by their *end* position; [`Bkey::start_pos`] recovers the start.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Maximum btree height (levels, leaf = 0).
pub const BTREE_MAX_DEPTH: usize = 4;

// ── Ids ─────────────────────────────────────────────────────────────────────

/// Snapshot id. Parents always have numerically greater ids than their
/// descendants; `0` means "no snapshot".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct SnapshotId(pub u32);

impl SnapshotId {
    pub const NONE: Self = Self(0);
    pub const MAX: Self = Self(u32::MAX);

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The btrees sharing one key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BtreeId {
    Extents,
    Inodes,
    Dirents,
    Xattrs,
    Alloc,
    Subvolumes,
    Snapshots,
}

impl BtreeId {
    pub const ALL: [Self; 7] = [
        Self::Extents,
        Self::Inodes,
        Self::Dirents,
        Self::Xattrs,
        Self::Alloc,
        Self::Subvolumes,
        Self::Snapshots,
    ];

    /// Keys in this btree cover ranges and are indexed by their end.
    #[must_use]
    pub const fn is_extents(self) -> bool {
        matches!(self, Self::Extents)
    }

    /// Keys in this btree carry a meaningful snapshot field.
    #[must_use]
    pub const fn has_snapshots(self) -> bool {
        matches!(
            self,
            Self::Extents | Self::Inodes | Self::Dirents | Self::Xattrs
        )
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Extents => "extents",
            Self::Inodes => "inodes",
            Self::Dirents => "dirents",
            Self::Xattrs => "xattrs",
            Self::Alloc => "alloc",
            Self::Subvolumes => "subvolumes",
            Self::Snapshots => "snapshots",
        }
    }
}

impl fmt::Display for BtreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Positions ───────────────────────────────────────────────────────────────

/// A key position. Field order is the sort order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Bpos {
    pub inode: u64,
    pub offset: u64,
    pub snapshot: SnapshotId,
}

pub const POS_MIN: Bpos = Bpos::new(0, 0, SnapshotId(0));
pub const SPOS_MAX: Bpos = Bpos::new(u64::MAX, u64::MAX, SnapshotId::MAX);

impl Bpos {
    #[must_use]
    pub const fn new(inode: u64, offset: u64, snapshot: SnapshotId) -> Self {
        Self {
            inode,
            offset,
            snapshot,
        }
    }

    #[must_use]
    pub const fn with_snapshot(self, snapshot: SnapshotId) -> Self {
        Self { snapshot, ..self }
    }

    /// Compare ignoring the snapshot field.
    #[must_use]
    pub fn cmp_nosnap(&self, other: &Self) -> Ordering {
        (self.inode, self.offset).cmp(&(other.inode, other.offset))
    }

    /// Same inode and offset.
    #[must_use]
    pub const fn same_logical(&self, other: &Self) -> bool {
        self.inode == other.inode && self.offset == other.offset
    }

    /// Next position in full `(inode, offset, snapshot)` order.
    #[must_use]
    pub const fn successor(self) -> Option<Self> {
        if self.snapshot.0 < u32::MAX {
            return Some(Self {
                snapshot: SnapshotId(self.snapshot.0 + 1),
                ..self
            });
        }
        if self.offset < u64::MAX {
            return Some(Self::new(self.inode, self.offset + 1, SnapshotId(0)));
        }
        if self.inode < u64::MAX {
            return Some(Self::new(self.inode + 1, 0, SnapshotId(0)));
        }
        None
    }

    /// Previous position in full `(inode, offset, snapshot)` order.
    #[must_use]
    pub const fn predecessor(self) -> Option<Self> {
        if self.snapshot.0 > 0 {
            return Some(Self {
                snapshot: SnapshotId(self.snapshot.0 - 1),
                ..self
            });
        }
        if self.offset > 0 {
            return Some(Self::new(self.inode, self.offset - 1, SnapshotId::MAX));
        }
        if self.inode > 0 {
            return Some(Self::new(self.inode - 1, u64::MAX, SnapshotId::MAX));
        }
        None
    }

    /// Next logical position; the snapshot field is cleared.
    #[must_use]
    pub const fn nosnap_successor(self) -> Option<Self> {
        if self.offset < u64::MAX {
            return Some(Self::new(self.inode, self.offset + 1, SnapshotId(0)));
        }
        if self.inode < u64::MAX {
            return Some(Self::new(self.inode + 1, 0, SnapshotId(0)));
        }
        None
    }

    /// Previous logical position; the snapshot field is cleared.
    #[must_use]
    pub const fn nosnap_predecessor(self) -> Option<Self> {
        if self.offset > 0 {
            return Some(Self::new(self.inode, self.offset - 1, SnapshotId(0)));
        }
        if self.inode > 0 {
            return Some(Self::new(self.inode - 1, u64::MAX, SnapshotId(0)));
        }
        None
    }
}

impl fmt::Display for Bpos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.inode, self.offset, self.snapshot)
    }
}

// ── Keys ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    /// Tombstone or synthesized hole.
    Deleted,
    /// Hides ancestor snapshots' keys at the same logical position.
    Whiteout,
    Value,
    Extent,
}

/// A key with its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bkey {
    /// Key position; the end of the range for extents.
    pub pos: Bpos,
    /// Range length for extents, zero otherwise.
    pub size: u32,
    pub kind: KeyType,
    pub val: Vec<u8>,
}

impl Bkey {
    #[must_use]
    pub const fn new(pos: Bpos, kind: KeyType, val: Vec<u8>) -> Self {
        Self {
            pos,
            size: 0,
            kind,
            val,
        }
    }

    #[must_use]
    pub const fn value(pos: Bpos, val: Vec<u8>) -> Self {
        Self::new(pos, KeyType::Value, val)
    }

    /// Zero-size deleted key at `pos`.
    #[must_use]
    pub const fn deleted(pos: Bpos) -> Self {
        Self::new(pos, KeyType::Deleted, Vec::new())
    }

    #[must_use]
    pub const fn whiteout(pos: Bpos) -> Self {
        Self::new(pos, KeyType::Whiteout, Vec::new())
    }

    /// Extent covering `[start, start + len)` in `inode`. The end clamps at
    /// `u64::MAX`, so an extent near the top of the offset space is shortened.
    #[must_use]
    pub const fn extent(
        inode: u64,
        start: u64,
        len: u32,
        snapshot: SnapshotId,
        val: Vec<u8>,
    ) -> Self {
        let end = start.saturating_add(len as u64);
        #[allow(clippy::cast_possible_truncation)]
        let size = (end - start) as u32;
        Self {
            pos: Bpos::new(inode, end, snapshot),
            size,
            kind: KeyType::Extent,
            val,
        }
    }

    /// Deleted key covering `[start, start + len)`: an unallocated range.
    #[must_use]
    pub const fn hole(start: Bpos, len: u32) -> Self {
        let end = start.offset.saturating_add(len as u64);
        #[allow(clippy::cast_possible_truncation)]
        let size = (end - start.offset) as u32;
        Self {
            pos: Bpos::new(start.inode, end, start.snapshot),
            size,
            kind: KeyType::Deleted,
            val: Vec::new(),
        }
    }

    #[must_use]
    pub const fn start_pos(&self) -> Bpos {
        Bpos {
            offset: self.pos.offset.saturating_sub(self.size as u64),
            ..self.pos
        }
    }

    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        matches!(self.kind, KeyType::Deleted)
    }

    #[must_use]
    pub const fn is_whiteout(&self) -> bool {
        matches!(self.kind, KeyType::Whiteout)
    }

    /// Deleted or whiteout.
    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        matches!(self.kind, KeyType::Deleted | KeyType::Whiteout)
    }

    /// Trim the range so it ends no later than `end`.
    #[expect(clippy::cast_possible_truncation)]
    pub fn cut_back(&mut self, end: Bpos) {
        if self.pos.cmp_nosnap(&end) != Ordering::Greater {
            return;
        }
        let start = self.start_pos();
        if start.cmp_nosnap(&end) == Ordering::Less {
            // start < end < pos implies the same inode.
            self.size -= (self.pos.offset - end.offset) as u32;
            self.pos.offset = end.offset;
        } else {
            self.pos.offset = start.offset;
            self.size = 0;
        }
    }

    /// Trim the range so it starts no earlier than `start`.
    #[expect(clippy::cast_possible_truncation)]
    pub fn cut_front(&mut self, start: Bpos) {
        if self.start_pos().cmp_nosnap(&start) != Ordering::Less {
            return;
        }
        if self.pos.cmp_nosnap(&start) == Ordering::Greater {
            self.size = (self.pos.offset - start.offset) as u32;
        } else {
            self.size = 0;
        }
    }
}

// ── Fixed-width decoding ────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}
