//! Persisted snapshot records.
//!
//! One record per snapshot id, stored as the value of a key in the
//! snapshots btree. The encoding is fixed-width little-endian; bitmaps are
//! not persisted because they are derived from parent pointers on load.
//!
//! | Bytes | Field | Notes |
//! |-------|-------|-------|
//! | 0..4 | `flags` | bit 0 deleted, bit 1 subvolume attached, bits 2..31 must be zero |
//! | 4..8 | `parent` | 0 for a tree root |
//! | 8..12 | `children[0]` | larger child id, or 0 |
//! | 12..16 | `children[1]` | smaller child id, or 0 |
//! | 16..20 | `subvol` | 0 unless bit 1 of `flags` |
//! | 20..24 | `tree` | snapshot tree id |
//! | 24..28 | `depth` | root is 0 |
//! | 28..40 | `skip[0..3]` | ascending ancestor ids |
//! | 40..48 | reserved | zero |

use sbt_types::{ParseError, read_le_u32, read_le_u64};
use serde::{Deserialize, Serialize};

pub const SNAPSHOT_RECORD_SIZE: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub flags: u32,
    pub parent: u32,
    pub children: [u32; 2],
    pub subvol: u32,
    pub tree: u32,
    pub depth: u32,
    pub skip: [u32; 3],
}

impl SnapshotRecord {
    pub const FLAG_DELETED: u32 = 1 << 0;
    pub const FLAG_SUBVOL: u32 = 1 << 1;
    const KNOWN_FLAGS: u32 = Self::FLAG_DELETED | Self::FLAG_SUBVOL;

    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.flags & Self::FLAG_DELETED != 0
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; SNAPSHOT_RECORD_SIZE] {
        let mut out = [0_u8; SNAPSHOT_RECORD_SIZE];
        let words = [
            self.flags,
            self.parent,
            self.children[0],
            self.children[1],
            self.subvol,
            self.tree,
            self.depth,
            self.skip[0],
            self.skip[1],
            self.skip[2],
        ];
        for (i, word) in words.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() != SNAPSHOT_RECORD_SIZE {
            return Err(ParseError::InvalidField {
                field: "snapshot_record",
                reason: "wrong length",
            });
        }
        let flags = read_le_u32(data, 0)?;
        if flags & !Self::KNOWN_FLAGS != 0 {
            return Err(ParseError::InvalidField {
                field: "flags",
                reason: "reserved bits set",
            });
        }
        if read_le_u64(data, 40)? != 0 {
            return Err(ParseError::InvalidField {
                field: "reserved",
                reason: "must be zero",
            });
        }
        let subvol = read_le_u32(data, 16)?;
        if (flags & Self::FLAG_SUBVOL == 0) != (subvol == 0) {
            return Err(ParseError::InvalidField {
                field: "subvol",
                reason: "disagrees with subvolume flag",
            });
        }
        Ok(Self {
            flags,
            parent: read_le_u32(data, 4)?,
            children: [read_le_u32(data, 8)?, read_le_u32(data, 12)?],
            subvol,
            tree: read_le_u32(data, 20)?,
            depth: read_le_u32(data, 24)?,
            skip: [
                read_le_u32(data, 28)?,
                read_le_u32(data, 32)?,
                read_le_u32(data, 36)?,
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_documented_offsets() {
        let rec = SnapshotRecord {
            flags: SnapshotRecord::FLAG_SUBVOL,
            parent: 0x0102_0304,
            children: [9, 8],
            subvol: 77,
            tree: 5,
            depth: 3,
            skip: [10, 20, 30],
        };
        let bytes = rec.to_bytes();
        assert_eq!(&bytes[0..4], &[2, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[4, 3, 2, 1]);
        assert_eq!(bytes[16], 77);
        assert_eq!(bytes[36], 30);
        assert!(bytes[40..].iter().all(|b| *b == 0));
        assert_eq!(SnapshotRecord::from_bytes(&bytes), Ok(rec));
    }

    #[test]
    fn rejects_reserved_flag_bits() {
        let mut bytes = SnapshotRecord::default().to_bytes();
        bytes[0] = 0x80;
        assert!(matches!(
            SnapshotRecord::from_bytes(&bytes),
            Err(ParseError::InvalidField { field: "flags", .. })
        ));
    }

    #[test]
    fn rejects_subvol_without_flag() {
        let mut bytes = SnapshotRecord::default().to_bytes();
        bytes[16] = 1;
        assert!(SnapshotRecord::from_bytes(&bytes).is_err());
        assert!(SnapshotRecord::from_bytes(&bytes[..40]).is_err());
    }
}
