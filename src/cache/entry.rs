use super::lock::{ExclusiveGuard, LockGuard, LockMode, SharedGuard};
use super::{Cacheable, Shared};
use crate::error::{BoxError, Result};
use crate::pointer::{BlockPointer, Marshal, Unmarshal};
use diskheap_pager::Pager;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

/// A block address wrapped with a lazily loaded value, a lock and write-back bookkeeping.
pub struct CacheEntry<T, P> {
    shared: Arc<Shared<T, P>>,
    ptr: BlockPointer,
    /// The per-entry lock handed out through the guards. It does not protect `value` directly,
    /// it keeps holders from stepping on each other for the duration of their critical section.
    lock: RwLock<()>,
    /// `None` until the value is loaded or assigned.
    value: Mutex<Option<T>>,
    /// A flush was requested while the address was held.
    pending: AtomicBool,
}

impl<T: Cacheable, P: Pager> CacheEntry<T, P> {
    pub(super) fn new(shared: Arc<Shared<T, P>>, ptr: BlockPointer) -> Self {
        Self {
            shared,
            ptr,
            lock: RwLock::new(()),
            value: Mutex::new(None),
            pending: AtomicBool::new(false),
        }
    }

    /// The underlying block pointer.
    #[inline]
    pub fn ptr(&self) -> BlockPointer {
        self.ptr
    }

    /// Returns true once the value was loaded or assigned.
    pub fn is_loaded(&self) -> bool {
        self.value.lock().is_some()
    }

    /// Returns true if a flush is waiting for the current holders to unlock.
    pub fn has_pending_flush(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Acquire a shared lock, blocking while a writer holds the entry.
    pub fn shared_lock(&self) -> SharedGuard<'_, T, P> {
        self.shared.acquire(self.ptr.addr(), LockMode::Read);
        SharedGuard::new(self, self.lock.read())
    }

    /// Acquire an exclusive lock, blocking while anyone else holds the entry.
    pub fn exclusive_lock(&self) -> ExclusiveGuard<'_, T, P> {
        self.shared.acquire(self.ptr.addr(), LockMode::Write);
        ExclusiveGuard::new(self, self.lock.write())
    }

    /// Lock with the given strength, [`LockMode::None`] does not lock at all.
    pub fn lock(&self, mode: LockMode) -> LockGuard<'_, T, P> {
        match mode {
            LockMode::None => LockGuard::None(self),
            LockMode::Read => LockGuard::Shared(self.shared_lock()),
            LockMode::Write => LockGuard::Exclusive(self.exclusive_lock()),
        }
    }

    /// Return the value, reading it from storage on the first access.
    ///
    /// The block is read at most once per entry, later calls return the cached value even if the
    /// storage changed underneath. Callers reach this through a lock guard, so the borrow cannot
    /// outlive the lock it was taken under.
    pub(super) fn materialize(&self) -> Result<MappedMutexGuard<'_, T>> {
        let mut slot = self.value.lock();
        if slot.is_none() {
            let mut value = (self.shared.factory)();
            self.ptr.get(&*self.shared.pager, &mut value)?;
            trace!(ptr = %self.ptr, "loaded entry");
            *slot = Some(value);
        }

        Ok(MutexGuard::map(slot, |slot| {
            slot.get_or_insert_with(|| (self.shared.factory)())
        }))
    }

    /// Replace the value and mark it dirty, nothing is written until the next flush.
    ///
    /// Blocks while the value is borrowed through `materialize`, so it must not be called from a
    /// thread that still holds such a borrow.
    pub fn assign(&self, mut value: T) {
        value.set_dirty(true);
        *self.value.lock() = Some(value);
    }

    /// Start the entry over with a fresh, clean value from the factory without reading storage.
    ///
    /// Meant for blocks that were just carved and hold no value yet. Same blocking rules as
    /// [`CacheEntry::assign`].
    pub fn create(&self) {
        *self.value.lock() = Some((self.shared.factory)());
        trace!(ptr = %self.ptr, "created entry");
    }

    /// Write the value back to storage if it is dirty and not nil.
    ///
    /// While anyone holds the address the write is deferred to the moment the last holder
    /// unlocks. Otherwise this waits for any outstanding `materialize` borrow, calling it while
    /// the current thread holds one through an unlocked guard deadlocks.
    pub fn flush(&self) -> Result<()> {
        if self.defer_if_held() {
            return Ok(());
        }

        self.write_back(self.value.lock())
    }

    /// Drop the bookkeeping of one holder and retry a deferred flush. Called after the entry
    /// lock itself was released.
    pub(super) fn release(&self, mode: LockMode) -> Result<()> {
        self.shared.release(self.ptr.addr(), mode);

        if !self.has_pending_flush() || self.shared.is_held(self.ptr.addr()) {
            return Ok(());
        }

        // Waits for unlocked readers that still borrow the value.
        let slot = self.value.lock();
        if !self.pending.swap(false, Ordering::AcqRel) || self.defer_if_held() {
            return Ok(());
        }

        self.write_back(slot)
    }

    fn defer_if_held(&self) -> bool {
        let deferred = self.shared.defer_if_held(self.ptr.addr(), &self.pending);
        if deferred {
            trace!(ptr = %self.ptr, "deferred flush");
        }
        deferred
    }

    fn write_back(&self, mut slot: MutexGuard<'_, Option<T>>) -> Result<()> {
        let value = match slot.as_mut() {
            Some(value) if !value.is_nil() && value.is_dirty() => value,
            _ => return Ok(()),
        };

        self.ptr.set(&*self.shared.pager, &*value)?;
        value.set_dirty(false);
        trace!(ptr = %self.ptr, "flushed entry");
        Ok(())
    }
}

/// An entry is stored inside other values as its block pointer.
impl<T, P> Marshal for CacheEntry<T, P> {
    fn marshal(&self) -> Result<Vec<u8>, BoxError> {
        self.ptr.marshal()
    }
}

/// Decoding re-targets the entry at another block and forgets the loaded value.
impl<T, P> Unmarshal for CacheEntry<T, P> {
    fn unmarshal(&mut self, data: &[u8]) -> Result<(), BoxError> {
        self.ptr.unmarshal(data)?;
        *self.value.get_mut() = None;
        *self.pending.get_mut() = false;
        Ok(())
    }
}

impl<T: fmt::Debug, P> fmt::Display for CacheEntry<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value.try_lock() {
            Some(value) => write!(f, "{} -> {:?}", self.ptr, *value),
            None => write!(f, "{} -> <locked>", self.ptr),
        }
    }
}

impl<T, P> fmt::Debug for CacheEntry<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("ptr", &self.ptr)
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
