//! Reentrant per-bucket locks.
//!
//! Each bucket has an owner, a hold count and a condition variable that acts
//! as its semaphore. The owner may re-acquire without blocking; only the
//! release that brings the hold count back to zero hands the bucket on.
//!
//! Callers that need several buckets must take them through
//! [`LockTable::acquire_many`], which locks in ascending bucket order. Any two
//! overlapping sets are therefore locked in the same relative order and cannot
//! wait on each other in a cycle.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tracing::warn;

use crate::error::{Error, Result};

/// Identity of a lock holder: a worker, or any caller running a transaction.
pub type OwnerId = u64;

#[derive(Debug, Default)]
struct LockState {
    owner: Option<OwnerId>,
    holds: u32,
}

#[derive(Debug, Default)]
struct BucketLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl BucketLock {
    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self, owner: OwnerId) {
        let mut state = self.state();
        if state.holds > 0 && state.owner == Some(owner) {
            state.holds += 1;
            return;
        }
        while state.holds > 0 {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.owner = Some(owner);
        state.holds = 1;
    }

    fn holds_for(&self, owner: OwnerId) -> u32 {
        let state = self.state();
        if state.owner == Some(owner) {
            state.holds
        } else {
            0
        }
    }

    fn release(&self, bucket: usize, owner: OwnerId) -> Result<()> {
        let mut state = self.state();
        if state.holds == 0 || state.owner != Some(owner) {
            return Err(Error::LockOwnership { bucket, owner });
        }
        state.holds -= 1;
        if state.holds == 0 {
            state.owner = None;
            drop(state);
            self.released.notify_one();
        }
        Ok(())
    }
}

/// One reentrant lock per bucket of the table.
#[derive(Debug)]
pub struct LockTable {
    locks: Vec<BucketLock>,
}

impl LockTable {
    pub fn new(table_size: usize) -> Self {
        Self {
            locks: (0..table_size).map(|_| BucketLock::default()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Blocks until `owner` holds `bucket`.
    pub fn acquire(&self, bucket: usize, owner: OwnerId) {
        self.locks[bucket].acquire(owner);
    }

    /// Acquires every bucket in `buckets` in ascending order, once each.
    ///
    /// Returns the sorted, de-duplicated set that was acquired; pass it back to
    /// [`LockTable::release_many`].
    pub fn acquire_many<I>(&self, buckets: I, owner: OwnerId) -> Vec<usize>
    where
        I: IntoIterator<Item = usize>,
    {
        let ordered = canonical_order(buckets);
        for &bucket in &ordered {
            self.acquire(bucket, owner);
        }
        ordered
    }

    /// Drops one hold on `bucket`.
    pub fn release(&self, bucket: usize, owner: OwnerId) -> Result<()> {
        self.locks[bucket].release(bucket, owner)
    }

    /// Drops one hold on each distinct bucket in `buckets`.
    ///
    /// Ownership of every bucket is checked before anything is released, so a
    /// failed call leaves the lock state untouched.
    pub fn release_many(&self, buckets: &[usize], owner: OwnerId) -> Result<()> {
        let ordered = canonical_order(buckets.iter().copied());
        if let Some(&bucket) = ordered
            .iter()
            .find(|&&bucket| self.locks[bucket].holds_for(owner) == 0)
        {
            warn!(bucket, owner, "release of a bucket the caller does not hold");
            return Err(Error::LockOwnership { bucket, owner });
        }
        for &bucket in ordered.iter().rev() {
            self.release(bucket, owner)?;
        }
        Ok(())
    }

    /// Acquires every bucket, in order.
    pub fn acquire_all(&self, owner: OwnerId) {
        for bucket in 0..self.locks.len() {
            self.acquire(bucket, owner);
        }
    }

    /// Releases one hold on every bucket.
    pub fn release_all(&self, owner: OwnerId) -> Result<()> {
        let all: Vec<usize> = (0..self.locks.len()).collect();
        self.release_many(&all, owner)
    }

    /// Number of buckets `owner` currently holds.
    pub fn held_by(&self, owner: OwnerId) -> usize {
        self.locks
            .iter()
            .filter(|lock| lock.holds_for(owner) > 0)
            .count()
    }

    /// Current owner of `bucket`, if it is held.
    pub fn holder(&self, bucket: usize) -> Option<OwnerId> {
        let state = self.locks[bucket].state();
        if state.holds > 0 {
            state.owner
        } else {
            None
        }
    }
}

/// Sorts and de-duplicates bucket indices into the global lock order.
pub fn canonical_order<I>(buckets: I) -> Vec<usize>
where
    I: IntoIterator<Item = usize>,
{
    let mut ordered: Vec<usize> = buckets.into_iter().collect();
    ordered.sort_unstable();
    ordered.dedup();
    ordered
}
