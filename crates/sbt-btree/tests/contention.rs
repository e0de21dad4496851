#![forbid(unsafe_code)]
//! Cross-transaction lock behaviour: stale sequences, write exclusion,
//! lock order, and many threads updating one key.

use sbt_btree::{BtreeConfig, BtreeFs, CommitFlags, IterFlags, LockMode};
use sbt_error::{RestartReason, SbtError};
use sbt_types::{Bkey, Bpos, BtreeId, SnapshotId};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn fs_with(btree_id: BtreeId, keys: Vec<Bkey>, fanout: usize, config: BtreeConfig) -> BtreeFs {
    let (fs, io) = BtreeFs::in_memory(config).expect("in-memory fs");
    let root = io.build_tree(btree_id, keys, fanout).expect("build tree");
    fs.set_root(btree_id, root);
    fs
}

#[test]
fn commit_by_other_transaction_makes_relock_restart() {
    let at = Bpos::new(1, 100, SnapshotId(1));
    let keys = vec![Bkey::extent(1, 90, 10, SnapshotId(1), b"old".to_vec())];
    let fs = fs_with(BtreeId::Extents, keys, 16, BtreeConfig::default());

    let mut first = fs.trans();
    let path = first
        .get_path(BtreeId::Extents, at, 1, 0, IterFlags::INTENT)
        .expect("first path");
    first.path_traverse(path).expect("first traverse");
    first.path_set_should_be_locked(path);
    let before = first.path_info(path).seqs[0].expect("leaf cached");
    first.unlock();

    let mut second = fs.trans();
    second
        .update_key(BtreeId::Extents, Bkey::extent(1, 90, 10, SnapshotId(1), b"new".to_vec()))
        .expect("stage");
    second
        .commit(None, None, CommitFlags::NONE)
        .expect("second commits while the first is unlocked");
    drop(second);

    let after = first.path_info(path).seqs[0].expect("leaf still cached");
    assert_eq!(after.0, before.0, "observed seq is unchanged");
    assert_ne!(after.1, after.0, "the live seq moved on");

    let err = first.path_traverse(path).expect_err("stale leaf");
    assert_eq!(err.restart_reason(), Some(RestartReason::LockSeqStale));
    assert_eq!(first.restarted(), Some(RestartReason::LockSeqStale));
    assert!(!first.is_locked());

    assert_eq!(first.begin(), 1);
    first.path_traverse(path).expect("fresh traversal after begin");
    let seqs = first.path_info(path).seqs[0].expect("leaf cached");
    assert_eq!(seqs.0, seqs.1);
}

#[test]
fn relock_without_changes_succeeds() {
    let keys: Vec<Bkey> = (0..64)
        .map(|i| Bkey::value(Bpos::new(2, i, SnapshotId(0)), vec![0]))
        .collect();
    let fs = fs_with(BtreeId::Alloc, keys, 4, BtreeConfig::default());
    let mut trans = fs.trans();
    let path = trans
        .get_path(BtreeId::Alloc, Bpos::new(2, 40, SnapshotId(0)), 0, 0, IterFlags::NONE)
        .expect("path");
    trans.path_traverse(path).expect("traverse");
    trans.path_set_should_be_locked(path);
    trans.unlock();
    assert!(trans.path_info(path).held.iter().all(Option::is_none));

    trans.relock().expect("nothing changed");
    assert_eq!(trans.path_info(path).held[0], Some(LockMode::Read));
}

#[test]
fn relock_retakes_every_wanted_level_or_waits() {
    let keys: Vec<Bkey> = (0..64)
        .map(|i| Bkey::value(Bpos::new(2, i, SnapshotId(0)), vec![0]))
        .collect();
    let config = BtreeConfig {
        lock_wait: Duration::from_millis(1),
        ..BtreeConfig::default()
    };
    let fs = fs_with(BtreeId::Alloc, keys, 4, config);

    let mut first = fs.trans();
    let path = first
        .get_path(BtreeId::Alloc, Bpos::new(2, 1, SnapshotId(0)), 2, 0, IterFlags::INTENT)
        .expect("first path");
    first.path_traverse(path).expect("first traverse");
    assert_eq!(first.path_info(path).held[1], Some(LockMode::Intent));
    first.unlock();

    // A neighbouring leaf under the same parent; intent on the parent.
    let mut second = fs.trans();
    let other = second
        .get_path(BtreeId::Alloc, Bpos::new(2, 5, SnapshotId(0)), 2, 0, IterFlags::INTENT)
        .expect("second path");
    second.path_traverse(other).expect("second traverse");
    assert_eq!(second.path_info(other).held[1], Some(LockMode::Intent));

    let err = first
        .path_traverse(path)
        .expect_err("parent intent is held elsewhere");
    assert_eq!(err.restart_reason(), Some(RestartReason::LockNotAvailable));
    drop(second);

    assert_eq!(first.begin(), 1);
    first.path_traverse(path).expect("parent is free again");
    let held = first.path_info(path).held;
    assert_eq!(held[0], Some(LockMode::Intent));
    assert_eq!(held[1], Some(LockMode::Intent));
}

#[test]
fn commit_waits_for_foreign_readers_then_restarts() {
    let pos = Bpos::new(3, 1, SnapshotId(0));
    let fs = fs_with(
        BtreeId::Alloc,
        vec![Bkey::value(pos, vec![1])],
        16,
        BtreeConfig {
            lock_wait: Duration::from_millis(5),
            ..BtreeConfig::default()
        },
    );

    let mut reader = fs.trans();
    let path = reader
        .get_path(BtreeId::Alloc, pos, 0, 0, IterFlags::NONE)
        .expect("reader path");
    reader.path_traverse(path).expect("reader traverse");

    let mut writer = fs.trans();
    writer
        .update_key(BtreeId::Alloc, Bkey::value(pos, vec![2]))
        .expect("intent is compatible with a foreign read lock");
    let err = writer
        .commit(None, None, CommitFlags::NONE)
        .expect_err("write lock blocked by the reader");
    assert_eq!(err.restart_reason(), Some(RestartReason::LockNotAvailable));

    drop(reader);
    writer.begin();
    writer
        .update_key(BtreeId::Alloc, Bkey::value(pos, vec![2]))
        .expect("stage again");
    writer.commit(None, None, CommitFlags::NONE).expect("commit");
    drop(writer);

    let mut check = fs.trans();
    let path = check
        .get_path(BtreeId::Alloc, pos, 0, 0, IterFlags::NONE)
        .expect("path");
    assert_eq!(check.path_peek_slot_exact(path).expect("slot").val, vec![2]);
}

#[test]
fn locks_are_taken_top_down() {
    let keys: Vec<Bkey> = (0..200)
        .map(|i| Bkey::value(Bpos::new(4, i, SnapshotId(0)), vec![0]))
        .collect();
    let config = BtreeConfig {
        trace_locks: true,
        ..BtreeConfig::default()
    };
    let fs = fs_with(BtreeId::Alloc, keys, 4, config);
    let root_level = fs.root(BtreeId::Alloc).expect("root").level;
    assert!(root_level >= 2);

    let mut trans = fs.trans();
    for offset in [150, 3, 77] {
        let path = trans
            .get_path(BtreeId::Alloc, Bpos::new(4, offset, SnapshotId(0)), 0, 0, IterFlags::NONE)
            .expect("path");
        trans.path_traverse(path).expect("traverse");
    }

    let events = trans.lock_trace().to_vec();
    assert!(!events.is_empty());
    for pair in events.windows(2) {
        if pair[0].traversal == pair[1].traversal {
            assert!(
                pair[0].level > pair[1].level,
                "traversal {} locked level {} after level {}",
                pair[0].traversal,
                pair[1].level,
                pair[0].level
            );
        }
    }
    let first = events.first().expect("event");
    assert_eq!(first.level, root_level);
    assert!(events.iter().any(|e| e.level == 0 && e.mode == LockMode::Read));

    trans.clear_lock_trace();
    assert!(trans.lock_trace().is_empty());
}

#[test]
fn threads_increment_one_counter() {
    const THREADS: usize = 4;
    const ROUNDS: u64 = 50;

    let counter = Bpos::new(9, 0, SnapshotId(0));
    let mut keys = vec![Bkey::value(counter, 0_u64.to_le_bytes().to_vec())];
    keys.extend((1..40).map(|i| Bkey::value(Bpos::new(9, i, SnapshotId(0)), vec![0])));
    let fs = Arc::new(fs_with(BtreeId::Alloc, keys, 8, BtreeConfig::default()));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let fs = Arc::clone(&fs);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..ROUNDS {
                    let mut trans = fs.trans();
                    trans
                        .commit_do(None, None, CommitFlags::NONE, |trans| {
                            trans.with_iter(BtreeId::Alloc, counter, IterFlags::INTENT, |trans, iter| {
                                let k = trans.iter_peek_slot(iter)?;
                                let bytes: [u8; 8] = k.val.as_slice().try_into().map_err(|_| {
                                    SbtError::Invalid("counter is not 8 bytes".into())
                                })?;
                                let n = u64::from_le_bytes(bytes) + 1;
                                trans.update(iter, Bkey::value(counter, n.to_le_bytes().to_vec()))
                            })
                        })
                        .expect("increment");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread should not panic");
    }

    let value = fs
        .trans_do(|trans| {
            let path = trans.get_path(BtreeId::Alloc, counter, 0, 0, IterFlags::NOPRESERVE)?;
            let k = trans.path_peek_slot_exact(path);
            trans.put_path(path, false);
            k
        })
        .expect("read counter");
    let bytes: [u8; 8] = value.val.as_slice().try_into().expect("8 bytes");
    assert_eq!(u64::from_le_bytes(bytes), THREADS as u64 * ROUNDS);
    assert_eq!(fs.restart_stats().commits, THREADS as u64 * ROUNDS);
}
