use super::{CacheEntry, Cacheable};
use crate::error::{Error, Result};
use diskheap_pager::Pager;
use parking_lot::{MappedMutexGuard, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::ops::Deref;

/// How strongly an entry should be locked.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Do not lock at all.
    #[default]
    None,
    /// Shared lock, any number of readers.
    Read,
    /// Exclusive lock, a single writer.
    Write,
}

/// Who is holding, or waiting to hold, the lock of one address.
///
/// A party is counted from the moment it asks for the lock, so a writer blocked behind readers
/// already keeps the address busy.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct LockState {
    pub writers: usize,
    pub readers: usize,
}

impl LockState {
    /// Returns true if anyone holds the address.
    #[inline]
    pub fn is_held(&self) -> bool {
        self.writers > 0 || self.readers > 0
    }

    #[inline]
    pub fn is_exclusive(&self) -> bool {
        self.writers > 0
    }
}

/// A shared lock on a cache entry, released on drop.
pub struct SharedGuard<'a, T: Cacheable, P: Pager> {
    entry: &'a CacheEntry<T, P>,
    /// `None` once released.
    lock: Option<RwLockReadGuard<'a, ()>>,
}

/// An exclusive lock on a cache entry, released on drop.
pub struct ExclusiveGuard<'a, T: Cacheable, P: Pager> {
    entry: &'a CacheEntry<T, P>,
    lock: Option<RwLockWriteGuard<'a, ()>>,
}

/// A lock of the strength picked at runtime through a [`LockMode`].
pub enum LockGuard<'a, T: Cacheable, P: Pager> {
    None(&'a CacheEntry<T, P>),
    Shared(SharedGuard<'a, T, P>),
    Exclusive(ExclusiveGuard<'a, T, P>),
}

impl<'a, T: Cacheable, P: Pager> SharedGuard<'a, T, P> {
    pub(super) fn new(entry: &'a CacheEntry<T, P>, lock: RwLockReadGuard<'a, ()>) -> Self {
        Self {
            entry,
            lock: Some(lock),
        }
    }

    /// Return the value, loading it on first access. The borrow ends before the lock does.
    pub fn materialize(&self) -> Result<MappedMutexGuard<'_, T>> {
        self.entry.materialize()
    }

    /// Release the lock and run a flush deferred while it was held.
    pub fn unlock(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        match self.lock.take() {
            Some(lock) => {
                drop(lock);
                self.entry.release(LockMode::Read)
            }
            None => Ok(()),
        }
    }
}

impl<'a, T: Cacheable, P: Pager> ExclusiveGuard<'a, T, P> {
    pub(super) fn new(entry: &'a CacheEntry<T, P>, lock: RwLockWriteGuard<'a, ()>) -> Self {
        Self {
            entry,
            lock: Some(lock),
        }
    }

    /// Return the value, loading it on first access. The borrow ends before the lock does.
    pub fn materialize(&self) -> Result<MappedMutexGuard<'_, T>> {
        self.entry.materialize()
    }

    /// Release the lock and run a flush deferred while it was held.
    pub fn unlock(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        match self.lock.take() {
            Some(lock) => {
                drop(lock);
                self.entry.release(LockMode::Write)
            }
            None => Ok(()),
        }
    }
}

impl<'a, T: Cacheable, P: Pager> LockGuard<'a, T, P> {
    pub fn mode(&self) -> LockMode {
        match self {
            LockGuard::None(_) => LockMode::None,
            LockGuard::Shared(_) => LockMode::Read,
            LockGuard::Exclusive(_) => LockMode::Write,
        }
    }

    /// Return the value, loading it on first access.
    ///
    /// With [`LockMode::None`] nothing keeps other holders out: the borrow blocks their deferred
    /// flush until it ends, and taking a lock on the same entry while it is alive can deadlock.
    pub fn materialize(&self) -> Result<MappedMutexGuard<'_, T>> {
        match self {
            LockGuard::None(entry) => entry.materialize(),
            LockGuard::Shared(guard) => guard.materialize(),
            LockGuard::Exclusive(guard) => guard.materialize(),
        }
    }

    /// Release whatever lock this guard holds.
    pub fn unlock(self) -> Result<()> {
        match self {
            LockGuard::None(_) => Ok(()),
            LockGuard::Shared(guard) => guard.unlock(),
            LockGuard::Exclusive(guard) => guard.unlock(),
        }
    }
}

impl<T: Cacheable, P: Pager> Deref for SharedGuard<'_, T, P> {
    type Target = CacheEntry<T, P>;

    fn deref(&self) -> &Self::Target {
        self.entry
    }
}

impl<T: Cacheable, P: Pager> Deref for ExclusiveGuard<'_, T, P> {
    type Target = CacheEntry<T, P>;

    fn deref(&self) -> &Self::Target {
        self.entry
    }
}

impl<T: Cacheable, P: Pager> Deref for LockGuard<'_, T, P> {
    type Target = CacheEntry<T, P>;

    fn deref(&self) -> &Self::Target {
        match self {
            LockGuard::None(entry) => *entry,
            LockGuard::Shared(guard) => guard.entry,
            LockGuard::Exclusive(guard) => guard.entry,
        }
    }
}

impl<T: Cacheable, P: Pager> Drop for SharedGuard<'_, T, P> {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            deferred_flush_failed(self.entry.ptr().addr(), err);
        }
    }
}

impl<T: Cacheable, P: Pager> Drop for ExclusiveGuard<'_, T, P> {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            deferred_flush_failed(self.entry.ptr().addr(), err);
        }
    }
}

/// A write-back that fails means the storage is broken under us, there is no caller left to
/// return the error to.
fn deferred_flush_failed(address: u64, err: Error) {
    tracing::error!(address, %err, "deferred flush failed");
    if !std::thread::panicking() {
        panic!("deferred flush of block {} failed: {}", address, err);
    }
}
