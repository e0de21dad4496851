#![forbid(unsafe_code)]
//! Iterator semantics over built trees: extents, slots, snapshot
//! filtering and whiteouts, and ordering against a `BTreeMap` model.

use proptest::prelude::*;
use sbt_btree::{BtreeConfig, BtreeFs, CommitFlags, IterFlags, Transaction};
use sbt_types::{Bkey, Bpos, BtreeId, KeyType, SPOS_MAX, SnapshotId};
use std::collections::BTreeMap;

fn fs_with(btree_id: BtreeId, keys: Vec<Bkey>, fanout: usize) -> BtreeFs {
    let (fs, io) = BtreeFs::in_memory(BtreeConfig::default()).expect("in-memory fs");
    let root = io.build_tree(btree_id, keys, fanout).expect("build tree");
    fs.set_root(btree_id, root);
    fs
}

/// Manual loop rather than `for_each_key`: a retry loop would begin a new
/// attempt and drop the transaction's staged updates.
fn collect_fwd(trans: &mut Transaction<'_>, btree_id: BtreeId, start: Bpos, flags: IterFlags) -> Vec<Bkey> {
    let mut iter = trans.iter_init(btree_id, start, flags).expect("iter");
    let mut out = Vec::new();
    let mut k = trans.iter_peek(&mut iter).expect("peek");
    while let Some(key) = k {
        out.push(key);
        k = trans.iter_next(&mut iter).expect("next");
    }
    trans.iter_exit(iter);
    out
}

fn collect_back(trans: &mut Transaction<'_>, btree_id: BtreeId, start: Bpos, flags: IterFlags) -> Vec<Bkey> {
    let mut iter = trans.iter_init(btree_id, start, flags).expect("iter");
    let mut out = Vec::new();
    let mut k = trans.iter_peek_prev(&mut iter).expect("peek_prev");
    while let Some(key) = k {
        out.push(key);
        k = trans.iter_prev(&mut iter).expect("prev");
    }
    trans.iter_exit(iter);
    out
}

// ── Extents ─────────────────────────────────────────────────────────────────

const SNAP: SnapshotId = SnapshotId(1);

fn epos(offset: u64) -> Bpos {
    Bpos::new(5, offset, SNAP)
}

fn extents_fs() -> BtreeFs {
    fs_with(
        BtreeId::Extents,
        vec![
            Bkey::extent(5, 0, 10, SNAP, b"x".to_vec()),
            Bkey::extent(5, 20, 10, SNAP, b"y".to_vec()),
            Bkey::extent(5, 30, 20, SNAP, b"z".to_vec()),
            Bkey::extent(6, 100, 100, SNAP, b"w".to_vec()),
        ],
        2,
    )
}

#[test]
fn peek_max_clips_extent_to_end() {
    let fs = extents_fs();
    let mut trans = fs.trans();
    let start = Bpos::new(6, 100, SNAP);
    let k = trans
        .with_iter(BtreeId::Extents, start, IterFlags::NONE, |trans, iter| {
            trans.iter_peek_max(iter, Bpos::new(6, 110, SNAP))
        })
        .expect("peek")
        .expect("extent overlaps the range");
    assert_eq!(k.start_pos(), Bpos::new(6, 100, SNAP));
    assert_eq!(k.pos, Bpos::new(6, 110, SNAP));
    assert_eq!(k.size, 10);
    assert_eq!(k.val, b"w");
}

#[test]
fn extents_iterate_by_start_in_both_directions() {
    let fs = extents_fs();
    let mut trans = fs.trans();
    let mut iter = trans
        .iter_init(BtreeId::Extents, epos(0), IterFlags::NONE)
        .expect("iter");
    let mut starts = Vec::new();
    let mut k = trans.iter_peek_max(&mut iter, Bpos::new(5, u64::MAX, SNAP)).expect("peek");
    while let Some(key) = k {
        starts.push(key.start_pos().offset);
        assert_eq!(iter.pos().offset, key.start_pos().offset);
        k = if trans.iter_advance(&mut iter) {
            trans.iter_peek_max(&mut iter, Bpos::new(5, u64::MAX, SNAP)).expect("next")
        } else {
            None
        };
    }
    assert_eq!(starts, vec![0, 20, 30]);

    trans.iter_set_pos(&mut iter, epos(25));
    let k = trans.iter_peek_prev(&mut iter).expect("prev").expect("y covers 24");
    assert_eq!(k.val, b"y");
    let k = trans.iter_prev(&mut iter).expect("prev").expect("x");
    assert_eq!(k.val, b"x");
    assert_eq!(iter.pos(), epos(10));
    assert_eq!(trans.iter_prev(&mut iter).expect("prev"), None);
    trans.iter_exit(iter);
}

#[test]
fn extent_slots_fill_holes() {
    let fs = extents_fs();
    let mut trans = fs.trans();
    let mut iter = trans
        .iter_init(BtreeId::Extents, epos(10), IterFlags::SLOTS)
        .expect("iter");

    let hole = trans.iter_peek_slot(&mut iter).expect("slot");
    assert_eq!(hole.kind, KeyType::Deleted);
    assert_eq!(hole.start_pos(), epos(10));
    assert_eq!(hole.pos, epos(20));

    let y = trans.iter_next_slot(&mut iter).expect("slot").expect("y");
    assert_eq!(y.val, b"y");
    let z = trans.iter_next_slot(&mut iter).expect("slot").expect("z");
    assert_eq!(z.val, b"z");
    let tail = trans.iter_next_slot(&mut iter).expect("slot").expect("tail hole");
    assert!(tail.is_deleted());
    assert_eq!(tail.start_pos(), epos(50));
    assert_eq!(tail.size, u32::MAX);

    trans.iter_set_pos(&mut iter, epos(20));
    let y = trans.iter_peek_slot(&mut iter).expect("slot");
    let back = trans.iter_prev_slot(&mut iter).expect("slot").expect("hole before y");
    assert_eq!(y.val, b"y");
    assert!(back.is_deleted());
    assert_eq!(back.pos, epos(20));
    trans.iter_exit(iter);
}

#[test]
fn empty_slot_is_a_deleted_key_at_the_query() {
    let q = Bpos::new(8, 8, SnapshotId(0));
    let fs = fs_with(BtreeId::Alloc, vec![Bkey::value(Bpos::new(8, 9, SnapshotId(0)), vec![1])], 16);
    let mut trans = fs.trans();

    let path = trans
        .get_path(BtreeId::Alloc, q, 0, 0, IterFlags::NOPRESERVE)
        .expect("path");
    let k = trans.path_peek_slot_exact(path).expect("slot");
    trans.put_path(path, false);
    assert_eq!(k, Bkey::deleted(q));
    assert_eq!(k.size, 0);

    let k = trans
        .with_iter(BtreeId::Alloc, q, IterFlags::SLOTS, |trans, iter| trans.iter_peek_slot(iter))
        .expect("slot");
    assert_eq!(k, Bkey::deleted(q));
}

// ── Snapshots ───────────────────────────────────────────────────────────────

const ROOT: SnapshotId = SnapshotId(100);
const SIBLING: SnapshotId = SnapshotId(60);
const CHILD: SnapshotId = SnapshotId(50);
const LEAF: SnapshotId = SnapshotId(10);

fn ipos(offset: u64, snapshot: SnapshotId) -> Bpos {
    Bpos::new(1, offset, snapshot)
}

/// 100 -> {60, 50}, 50 -> 10, with versions of five inodes spread over them.
fn snapshot_fs() -> BtreeFs {
    let fs = fs_with(
        BtreeId::Inodes,
        vec![
            Bkey::value(ipos(1, ROOT), b"a".to_vec()),
            Bkey::whiteout(ipos(2, CHILD)),
            Bkey::value(ipos(2, ROOT), b"b".to_vec()),
            Bkey::value(ipos(3, LEAF), b"c".to_vec()),
            Bkey::value(ipos(4, CHILD), b"d-new".to_vec()),
            Bkey::value(ipos(4, ROOT), b"d-old".to_vec()),
            Bkey::value(ipos(5, SIBLING), b"e".to_vec()),
        ],
        3,
    );
    let snaps = fs.snapshots();
    snaps.create_tree(ROOT, 1).expect("root");
    snaps.create_child(ROOT, SIBLING).expect("sibling");
    snaps.create_child(ROOT, CHILD).expect("child");
    snaps.create_child(CHILD, LEAF).expect("leaf");
    fs
}

fn values(keys: &[Bkey]) -> Vec<&[u8]> {
    keys.iter().map(|k| k.val.as_slice()).collect()
}

#[test]
fn filtering_shows_the_closest_visible_version() {
    let fs = snapshot_fs();
    let mut trans = fs.trans();
    let cases: [(SnapshotId, &[&[u8]]); 4] = [
        (LEAF, &[b"a", b"c", b"d-new"]),
        (CHILD, &[b"a", b"d-new"]),
        (ROOT, &[b"a", b"b", b"d-old"]),
        (SIBLING, &[b"a", b"b", b"d-old", b"e"]),
    ];
    for (snapshot, want) in cases {
        let got = collect_fwd(&mut trans, BtreeId::Inodes, ipos(0, snapshot), IterFlags::NONE);
        assert_eq!(values(&got), want, "forward at snapshot {snapshot}");

        let mut back = collect_back(&mut trans, BtreeId::Inodes, ipos(99, snapshot), IterFlags::NONE);
        back.reverse();
        assert_eq!(values(&back), want, "reverse at snapshot {snapshot}");
    }
}

#[test]
fn all_snapshots_returns_every_version() {
    let fs = snapshot_fs();
    let mut trans = fs.trans();
    let got = collect_fwd(
        &mut trans,
        BtreeId::Inodes,
        ipos(0, SnapshotId(0)),
        IterFlags::ALL_SNAPSHOTS,
    );
    let positions: Vec<(u64, u32)> = got.iter().map(|k| (k.pos.offset, k.pos.snapshot.0)).collect();
    assert_eq!(
        positions,
        vec![(1, 100), (2, 50), (2, 100), (3, 10), (4, 50), (4, 100), (5, 60)]
    );
}

#[test]
fn slots_see_through_to_ancestors_but_not_whiteouts() {
    let fs = snapshot_fs();
    let mut trans = fs.trans();
    let slot = |trans: &mut Transaction<'_>, offset, snapshot| {
        trans
            .with_iter(BtreeId::Inodes, ipos(offset, snapshot), IterFlags::SLOTS, |trans, iter| {
                trans.iter_peek_slot(iter)
            })
            .expect("slot")
    };
    assert_eq!(slot(&mut trans, 1, LEAF).val, b"a");
    assert!(slot(&mut trans, 2, LEAF).is_deleted());
    assert_eq!(slot(&mut trans, 2, SIBLING).val, b"b");
    assert!(slot(&mut trans, 3, CHILD).is_deleted());
    assert_eq!(slot(&mut trans, 4, LEAF).val, b"d-new");
}

#[test]
fn intent_peek_on_ancestor_key_sets_up_update_path() {
    let fs = snapshot_fs();
    let mut trans = fs.trans();
    let mut iter = trans
        .iter_init(BtreeId::Inodes, ipos(1, LEAF), IterFlags::INTENT)
        .expect("iter");
    let k = trans.iter_peek(&mut iter).expect("peek").expect("a");
    assert_eq!(k.pos.snapshot, ROOT);
    let up = iter.update_path().expect("update path for the overwrite");
    let info = trans.path_info(up);
    assert_eq!(info.pos, ipos(1, LEAF));
    assert!(info.should_be_locked);
    assert!(info.intent_ref > 0);

    trans.iter_set_pos(&mut iter, ipos(3, LEAF));
    assert!(iter.update_path().is_none());
    let k = trans.iter_peek(&mut iter).expect("peek").expect("c");
    assert_eq!(k.pos.snapshot, LEAF);
    assert!(iter.update_path().is_none(), "own key needs no update path");
    trans.iter_exit(iter);
}

#[test]
fn deleting_an_inherited_key_writes_a_whiteout() {
    let fs = snapshot_fs();
    let mut trans = fs.trans();
    trans
        .commit_do(None, None, CommitFlags::NONE, |trans| {
            trans.with_iter(BtreeId::Inodes, ipos(1, LEAF), IterFlags::INTENT, |trans, iter| {
                trans.iter_peek(iter)?;
                trans.delete_at(iter)
            })?;
            trans.with_iter(BtreeId::Inodes, ipos(3, LEAF), IterFlags::INTENT, |trans, iter| {
                trans.iter_peek(iter)?;
                trans.delete_at(iter)
            })
        })
        .expect("delete");

    let leaf = collect_fwd(&mut trans, BtreeId::Inodes, ipos(0, LEAF), IterFlags::NONE);
    assert_eq!(values(&leaf), [b"d-new".as_slice()]);
    let child = collect_fwd(&mut trans, BtreeId::Inodes, ipos(0, CHILD), IterFlags::NONE);
    assert_eq!(values(&child), [b"a".as_slice(), b"d-new".as_slice()]);

    let raw = collect_fwd(&mut trans, BtreeId::Inodes, ipos(0, SnapshotId(0)), IterFlags::ALL_SNAPSHOTS);
    assert!(raw.iter().any(|k| k.pos == ipos(1, LEAF) && k.is_whiteout()));
    assert!(!raw.iter().any(|k| k.pos == ipos(3, LEAF)), "own key is simply removed");
}

#[test]
fn pending_updates_are_visible_with_updates_flag() {
    let fs = snapshot_fs();
    let mut trans = fs.trans();
    trans
        .update_key(BtreeId::Inodes, Bkey::value(ipos(6, LEAF), b"f".to_vec()))
        .expect("stage");
    trans
        .update_key(BtreeId::Inodes, Bkey::whiteout(ipos(4, LEAF)))
        .expect("stage");

    let plain = collect_fwd(&mut trans, BtreeId::Inodes, ipos(0, LEAF), IterFlags::NONE);
    assert_eq!(values(&plain), [b"a".as_slice(), b"c", b"d-new"]);
    let merged = collect_fwd(&mut trans, BtreeId::Inodes, ipos(0, LEAF), IterFlags::WITH_UPDATES);
    assert_eq!(values(&merged), [b"a".as_slice(), b"c", b"f"]);
}

#[test]
fn changing_snapshot_repositions() {
    let fs = snapshot_fs();
    let mut trans = fs.trans();
    let mut iter = trans
        .iter_init(BtreeId::Inodes, ipos(4, LEAF), IterFlags::NONE)
        .expect("iter");
    assert_eq!(trans.iter_peek(&mut iter).expect("peek").expect("d").val, b"d-new");
    trans.iter_set_snapshot(&mut iter, ROOT);
    assert_eq!(iter.pos(), ipos(4, ROOT));
    assert_eq!(trans.iter_peek(&mut iter).expect("peek").expect("d").val, b"d-old");
    trans.iter_exit(iter);
}

// ── Model ───────────────────────────────────────────────────────────────────

fn apos(offset: u64) -> Bpos {
    Bpos::new(2, offset, SnapshotId(0))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn ordering_matches_model(
        offsets in proptest::collection::btree_set(0_u64..400, 0..60),
        staged in proptest::collection::btree_map(0_u64..400, any::<bool>(), 0..12),
        start in 0_u64..400,
        fanout in 4_usize..9,
    ) {
        let keys = offsets.iter().map(|&o| Bkey::value(apos(o), vec![1])).collect();
        let fs = fs_with(BtreeId::Alloc, keys, fanout);
        let mut trans = fs.trans();

        let mut model: BTreeMap<u64, u8> = offsets.iter().map(|&o| (o, 1)).collect();
        for (&offset, &live) in &staged {
            if live {
                trans.update_key(BtreeId::Alloc, Bkey::value(apos(offset), vec![2])).expect("stage");
                model.insert(offset, 2);
            } else {
                trans.update_key(BtreeId::Alloc, Bkey::deleted(apos(offset))).expect("stage");
                model.remove(&offset);
            }
        }

        let fwd: Vec<(u64, u8)> = collect_fwd(&mut trans, BtreeId::Alloc, apos(start), IterFlags::WITH_UPDATES)
            .iter()
            .map(|k| (k.pos.offset, k.val[0]))
            .collect();
        let want: Vec<(u64, u8)> = model.range(start..).map(|(&o, &v)| (o, v)).collect();
        prop_assert_eq!(fwd, want);

        let back: Vec<(u64, u8)> = collect_back(&mut trans, BtreeId::Alloc, apos(start), IterFlags::WITH_UPDATES)
            .iter()
            .map(|k| (k.pos.offset, k.val[0]))
            .collect();
        let want: Vec<(u64, u8)> = model.range(..=start).rev().map(|(&o, &v)| (o, v)).collect();
        prop_assert_eq!(back, want);

        let committed: Vec<u64> = collect_fwd(&mut trans, BtreeId::Alloc, apos(0), IterFlags::NONE)
            .iter()
            .map(|k| k.pos.offset)
            .collect();
        prop_assert_eq!(committed, offsets.iter().copied().collect::<Vec<_>>());
    }
}

#[test]
fn peek_at_end_parks_the_iterator() {
    let fs = fs_with(BtreeId::Alloc, vec![Bkey::value(apos(1), vec![1])], 16);
    let mut trans = fs.trans();
    let mut iter = trans
        .iter_init(BtreeId::Alloc, apos(2), IterFlags::NONE)
        .expect("iter");
    assert_eq!(trans.iter_peek(&mut iter).expect("peek"), None);
    assert_eq!(iter.pos().cmp_nosnap(&SPOS_MAX), std::cmp::Ordering::Equal);
    assert!(!trans.iter_advance(&mut iter));
    trans.iter_exit(iter);
}
