//! Retry loops.
//!
//! Every closure passed here is one transaction attempt: it may be run any
//! number of times, must not keep state across attempts outside the
//! transaction, and must propagate restart errors unchanged.

use crate::commit::{CommitFlags, DiskReservation};
use crate::iter::{BtreeIter, IterFlags};
use crate::trans::Transaction;
use sbt_error::{RestartReason, Result};
use sbt_types::{Bkey, Bpos, BtreeId};
use tracing::trace;

impl Transaction<'_> {
    /// Run `f` until it returns anything other than a restart.
    pub fn run<T>(&mut self, mut f: impl FnMut(&mut Self) -> Result<T>) -> Result<T> {
        loop {
            let restart_count = self.begin();
            match f(self) {
                Ok(value) => {
                    self.verify_not_restarted(restart_count);
                    return Ok(value);
                }
                Err(err) if err.is_restart() => {
                    self.note_restart_error(&err);
                    trace!(
                        target: "sbt::btree::trans",
                        trans_id = self.id,
                        restart_count,
                        "trans_retry"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Retry loop for use inside another attempt. Success after a restart
    /// still invalidates whatever the outer attempt observed, so it comes
    /// back as a `Nested` restart for the outer loop.
    pub fn run_nested<T>(&mut self, f: impl FnMut(&mut Self) -> Result<T>) -> Result<T> {
        let start = self.restart_count;
        let value = self.run(f)?;
        if self.restart_count != start {
            return Err(self.restart(RestartReason::Nested));
        }
        Ok(value)
    }

    /// Run `f` then commit, retrying both together.
    pub fn commit_do<T>(
        &mut self,
        disk_res: Option<&DiskReservation>,
        mut journal_seq: Option<&mut u64>,
        flags: CommitFlags,
        mut f: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.run(|trans| {
            let value = f(trans)?;
            trans.commit(disk_res, journal_seq.as_deref_mut(), flags)?;
            Ok(value)
        })
    }

    /// Visit keys from `start` in order. Each visit is its own attempt: a
    /// restart repeats only the current key.
    pub fn for_each_key(
        &mut self,
        btree_id: BtreeId,
        start: Bpos,
        flags: IterFlags,
        mut f: impl FnMut(&mut Self, &mut BtreeIter, &Bkey) -> Result<()>,
    ) -> Result<()> {
        let mut iter = self.iter_init(btree_id, start, flags)?;
        let ret = loop {
            let step = self.run(|trans| {
                let Some(k) = trans.iter_peek(&mut iter)? else {
                    return Ok(false);
                };
                f(trans, &mut iter, &k)?;
                Ok(true)
            });
            match step {
                Ok(true) if self.iter_advance(&mut iter) => {}
                Ok(_) => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        self.iter_exit(iter);
        ret
    }

    /// [`Self::for_each_key`] walking backwards from `start`.
    pub fn for_each_key_reverse(
        &mut self,
        btree_id: BtreeId,
        start: Bpos,
        flags: IterFlags,
        mut f: impl FnMut(&mut Self, &mut BtreeIter, &Bkey) -> Result<()>,
    ) -> Result<()> {
        let mut iter = self.iter_init(btree_id, start, flags)?;
        let ret = loop {
            let step = self.run(|trans| {
                let Some(k) = trans.iter_peek_prev(&mut iter)? else {
                    return Ok(false);
                };
                f(trans, &mut iter, &k)?;
                Ok(true)
            });
            match step {
                Ok(true) if self.iter_rewind(&mut iter) => {}
                Ok(_) => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        self.iter_exit(iter);
        ret
    }

    /// [`Self::for_each_key`] committing after every visit.
    #[expect(clippy::too_many_arguments)]
    pub fn for_each_key_commit(
        &mut self,
        btree_id: BtreeId,
        start: Bpos,
        flags: IterFlags,
        disk_res: Option<&DiskReservation>,
        mut journal_seq: Option<&mut u64>,
        commit_flags: CommitFlags,
        mut f: impl FnMut(&mut Self, &mut BtreeIter, &Bkey) -> Result<()>,
    ) -> Result<()> {
        let mut iter = self.iter_init(btree_id, start, flags)?;
        let ret = loop {
            let step = self.run(|trans| {
                let Some(k) = trans.iter_peek(&mut iter)? else {
                    return Ok(false);
                };
                f(trans, &mut iter, &k)?;
                trans.commit(disk_res, journal_seq.as_deref_mut(), commit_flags)?;
                Ok(true)
            });
            match step {
                Ok(true) if self.iter_advance(&mut iter) => {}
                Ok(_) => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        self.iter_exit(iter);
        ret
    }
}
