//! Six lock: shared / intent / exclusive, with a sequence number.
//!
//! Read and intent are compatible; at most one owner holds intent, and an
//! owner may take it recursively. Write is taken on top of a held intent lock
//! and waits for readers to drain. Releasing write bumps `seq`, which is how
//! a relock detects that the node changed while it was unlocked.
//!
//! While a writer waits for readers to drain, new read locks from other
//! owners are refused, so a steady stream of readers cannot hold a committer
//! off until its wait expires.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Lock holder identity: the owning transaction's id.
pub type LockOwner = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Read,
    Intent,
    Write,
}

impl LockMode {
    #[must_use]
    pub const fn as_char(self) -> char {
        match self {
            Self::Read => 'r',
            Self::Intent => 'i',
            Self::Write => 'w',
        }
    }
}

/// Point-in-time holder counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockCounts {
    pub readers: u32,
    pub intent: u32,
    pub write: bool,
}

#[derive(Debug, Default)]
struct SixState {
    readers: u32,
    intent_owner: Option<LockOwner>,
    intent_count: u32,
    write_owner: Option<LockOwner>,
    /// Owner waiting in `lock_write`; blocks foreign readers.
    write_pending: Option<LockOwner>,
}

impl SixState {
    fn can_take(&self, mode: LockMode, owner: LockOwner) -> bool {
        match mode {
            LockMode::Read => {
                self.write_owner.is_none() && self.write_pending.is_none_or(|w| w == owner)
            }
            LockMode::Intent => self.intent_owner.is_none_or(|o| o == owner),
            LockMode::Write => false,
        }
    }

    fn take(&mut self, mode: LockMode, owner: LockOwner) {
        match mode {
            LockMode::Read => self.readers += 1,
            LockMode::Intent => {
                self.intent_owner = Some(owner);
                self.intent_count += 1;
            }
            LockMode::Write => unreachable!("write is taken through lock_write"),
        }
    }
}

#[derive(Debug, Default)]
pub struct SixLock {
    state: Mutex<SixState>,
    released: Condvar,
    seq: AtomicU32,
}

impl SixLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current sequence; changes only when a write lock is released dirty.
    #[must_use]
    pub fn seq(&self) -> u32 {
        self.seq.load(Ordering::Acquire)
    }

    pub fn try_lock(&self, mode: LockMode, owner: LockOwner) -> bool {
        let mut st = self.state.lock();
        if st.can_take(mode, owner) {
            st.take(mode, owner);
            true
        } else {
            false
        }
    }

    /// Block for at most `timeout`. Returns false on expiry.
    pub fn lock_timeout(&self, mode: LockMode, owner: LockOwner, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        loop {
            if st.can_take(mode, owner) {
                st.take(mode, owner);
                return true;
            }
            if self.released.wait_until(&mut st, deadline).timed_out() {
                if st.can_take(mode, owner) {
                    st.take(mode, owner);
                    return true;
                }
                return false;
            }
        }
    }

    /// Retake `mode` only if nothing was written since `seq` was observed.
    pub fn relock(&self, mode: LockMode, owner: LockOwner, seq: u32) -> bool {
        let mut st = self.state.lock();
        if self.seq.load(Ordering::Acquire) != seq || !st.can_take(mode, owner) {
            return false;
        }
        st.take(mode, owner);
        true
    }

    /// Take another reference on a lock this owner already holds.
    pub fn increment(&self, mode: LockMode, owner: LockOwner) {
        let mut st = self.state.lock();
        match mode {
            LockMode::Read => assert!(st.readers > 0, "six lock: increment of unheld read lock"),
            LockMode::Intent => assert!(
                st.intent_owner == Some(owner),
                "six lock: increment of intent lock held by another owner"
            ),
            LockMode::Write => panic!("six lock: write locks are not recursive"),
        }
        st.take(mode, owner);
    }

    pub fn unlock(&self, mode: LockMode, owner: LockOwner) {
        let mut st = self.state.lock();
        match mode {
            LockMode::Read => {
                assert!(st.readers > 0, "six lock: read unlock underflow");
                st.readers -= 1;
            }
            LockMode::Intent => {
                assert!(
                    st.intent_owner == Some(owner) && st.intent_count > 0,
                    "six lock: intent unlock underflow"
                );
                st.intent_count -= 1;
                if st.intent_count == 0 {
                    st.intent_owner = None;
                }
            }
            LockMode::Write => {
                assert!(st.write_owner == Some(owner), "six lock: write unlock by non-owner");
                st.write_owner = None;
                self.seq.fetch_add(1, Ordering::Release);
            }
        }
        drop(st);
        self.released.notify_all();
    }

    /// Take write on top of this owner's intent lock, waiting up to `timeout`
    /// for every reader except the owner's own `own_readers` to leave.
    pub fn lock_write(&self, owner: LockOwner, own_readers: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        assert!(
            st.intent_owner == Some(owner),
            "six lock: write requires the intent lock"
        );
        loop {
            if st.readers <= own_readers {
                st.write_pending = None;
                st.write_owner = Some(owner);
                return true;
            }
            st.write_pending = Some(owner);
            if self.released.wait_until(&mut st, deadline).timed_out() && st.readers > own_readers {
                st.write_pending = None;
                drop(st);
                self.released.notify_all();
                return false;
            }
        }
    }

    /// Release write. A clean release leaves `seq` alone.
    pub fn unlock_write(&self, owner: LockOwner, dirty: bool) {
        if dirty {
            self.unlock(LockMode::Write, owner);
            return;
        }
        let mut st = self.state.lock();
        assert!(st.write_owner == Some(owner), "six lock: write unlock by non-owner");
        st.write_owner = None;
        drop(st);
        self.released.notify_all();
    }

    #[must_use]
    pub fn counts(&self) -> LockCounts {
        let st = self.state.lock();
        LockCounts {
            readers: st.readers,
            intent: st.intent_count,
            write: st.write_owner.is_some(),
        }
    }

    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        self.counts() == LockCounts::default()
    }
}
