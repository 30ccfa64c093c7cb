//! Transaction bookkeeping: tid watermarks, live readers, and the
//! single write slot.
//!
//! Transaction ids are 64-bit, strictly monotonic over the store's
//! lifetime; `0` is reserved as invalid. Readers register the
//! `last_transaction` current at `begin_read` in an ordered multiset so
//! the checkpoint horizon (the oldest tid any reader still needs) is a
//! `min` over that set and the last commit.
//!
//! The write slot is a mutex-and-condvar pair: at most one transaction
//! (or checkpoint) owns it at a time, and `begin_write`'s deadline
//! bounds both the lock acquisition and the wait for an in-progress
//! writer to finish.

use std::collections::BTreeMap;
use std::time::Instant;

use eyre::Result;
use parking_lot::{Condvar, Mutex, MutexGuard};
use smallvec::SmallVec;

use crate::error::StoreError;
use crate::journal::LogBuffer;

pub type Tid = u64;

/// Watermarks plus the live-reader multiset. Guarded by the store's
/// reader-writer lock.
#[derive(Debug)]
pub struct TidTable {
    /// Most recent committed write.
    pub last_transaction: Tid,
    /// Oldest tid whose journal records have not been folded into the
    /// store file.
    pub first_transaction: Tid,
    readers: BTreeMap<Tid, usize>,
}

impl TidTable {
    pub fn new(first_transaction: Tid, last_transaction: Tid) -> Self {
        Self {
            last_transaction,
            first_transaction,
            readers: BTreeMap::new(),
        }
    }

    /// Registers a reader at the current `last_transaction` and returns
    /// its tid.
    pub fn begin_read(&mut self) -> Tid {
        let tid = self.last_transaction;
        *self.readers.entry(tid).or_insert(0) += 1;
        tid
    }

    /// Removes one occurrence of `tid`; unknown tids are an error.
    pub fn end_read(&mut self, tid: Tid) -> Result<()> {
        match self.readers.get_mut(&tid) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Ok(())
            }
            Some(_) => {
                self.readers.remove(&tid);
                Ok(())
            }
            None => Err(eyre::Report::new(StoreError::Invalid)
                .wrap_err(format!("no live read transaction with tid {}", tid))),
        }
    }

    pub fn oldest_reader(&self) -> Option<Tid> {
        self.readers.keys().next().copied()
    }

    pub fn has_readers(&self) -> bool {
        !self.readers.is_empty()
    }

    /// The checkpoint horizon: no fold may pass the oldest live reader,
    /// and with no readers it reaches the last commit.
    pub fn horizon(&self) -> Tid {
        match self.oldest_reader() {
            Some(oldest) => oldest.min(self.last_transaction),
            None => self.last_transaction,
        }
    }
}

/// State owned by whoever holds the write slot.
#[derive(Debug, Default)]
pub struct WriteSlot {
    pub in_progress: bool,
    /// The frame under construction for the current transaction.
    pub log: LogBuffer,
    /// Blocks given a new cached version under the provisional tid, so
    /// an abort can purge them.
    pub touched: SmallVec<[u64; 8]>,
}

impl WriteSlot {
    /// Arms the slot for a new write transaction.
    pub fn arm(&mut self, tid: Tid) {
        self.log.reset(tid);
        self.touched.clear();
        self.in_progress = true;
    }

    /// Discards transaction state, leaving the slot free.
    pub fn disarm(&mut self) {
        self.log.clear();
        self.touched.clear();
        self.in_progress = false;
    }

    pub fn note_touched(&mut self, block_id: u64) {
        if !self.touched.contains(&block_id) {
            self.touched.push(block_id);
        }
    }
}

/// The mutex-and-condvar pair serializing writers and checkpoints.
#[derive(Default, Debug)]
pub struct WriteGate {
    slot: Mutex<WriteSlot>,
    cond: Condvar,
}

impl WriteGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the slot once it is idle. `deadline == None` waits
    /// forever; expiry reports [`StoreError::Timeout`].
    pub fn acquire(&self, deadline: Option<Instant>) -> Result<MutexGuard<'_, WriteSlot>> {
        let mut guard = match deadline {
            Some(deadline) => self
                .slot
                .try_lock_until(deadline)
                .ok_or_else(|| eyre::Report::new(StoreError::Timeout))?,
            None => self.slot.lock(),
        };

        while guard.in_progress {
            match deadline {
                Some(deadline) => {
                    let result = self.cond.wait_until(&mut guard, deadline);
                    if result.timed_out() && guard.in_progress {
                        return Err(eyre::Report::new(StoreError::Timeout));
                    }
                }
                None => self.cond.wait(&mut guard),
            }
        }

        Ok(guard)
    }

    /// Plain acquisition for commit/rollback, which never wait on the
    /// condition.
    pub fn lock(&self) -> MutexGuard<'_, WriteSlot> {
        self.slot.lock()
    }

    /// Wakes one waiter after the slot was disarmed.
    pub fn signal(&self) {
        self.cond.notify_one();
    }
}
