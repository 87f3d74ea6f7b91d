//! A typed write-back cache over heap blocks.
//!
//! A [`Cache`] hands out one [`CacheEntry`] per block address. An entry loads its value lazily,
//! keeps modifications in memory until it is flushed, and carries a read/write lock. Next to the
//! per-entry locks the cache keeps a small table of who is holding which address, guarded by a
//! short lived mutex that is never held across I/O, so a flush can tell cheaply whether it has to
//! be deferred until the address is unlocked.

mod entry;
mod lock;

use crate::error::Result;
use crate::pointer::{BlockAddress, BlockPointer, Marshal, Unmarshal};
use diskheap_pager::Pager;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::hash_map;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

pub use entry::CacheEntry;
pub use lock::{ExclusiveGuard, LockGuard, LockMode, LockState, SharedGuard};

/// Any value that can live in a [`Cache`].
pub trait Cacheable: Marshal + Unmarshal + Send + 'static {
    /// Returns true if the value changed since it was last written.
    fn is_dirty(&self) -> bool;

    fn set_dirty(&mut self, dirty: bool);

    /// Returns true for the empty value, which is never written back.
    fn is_nil(&self) -> bool;
}

/// State shared between a cache and all of its entries.
pub(crate) struct Shared<T, P> {
    pager: Arc<P>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    /// Addresses currently locked or waiting for a lock. An address with nobody on it has no
    /// record here.
    locks: Mutex<HashMap<BlockAddress, LockState>>,
}

impl<T, P> Shared<T, P> {
    fn acquire(&self, address: BlockAddress, mode: LockMode) {
        if mode == LockMode::None {
            return;
        }

        let mut locks = self.locks.lock();
        let state = locks.entry(address).or_default();
        if mode == LockMode::Read {
            state.readers += 1;
        } else {
            state.writers += 1;
        }
    }

    fn release(&self, address: BlockAddress, mode: LockMode) {
        let mut locks = self.locks.lock();
        if let hash_map::Entry::Occupied(mut o) = locks.entry(address) {
            let state = o.get_mut();
            match mode {
                LockMode::None => {}
                LockMode::Read => state.readers = state.readers.saturating_sub(1),
                LockMode::Write => state.writers = state.writers.saturating_sub(1),
            }

            if !state.is_held() {
                o.remove();
            }
        }
    }

    fn state(&self, address: BlockAddress) -> LockState {
        self.locks
            .lock()
            .get(&address)
            .copied()
            .unwrap_or_default()
    }

    fn is_held(&self, address: BlockAddress) -> bool {
        self.state(address).is_held()
    }

    /// Raise `pending` if the address is held. Both happen under the table lock, so a holder
    /// releasing concurrently either sees the flag or leaves the address free for the caller.
    fn defer_if_held(&self, address: BlockAddress, pending: &AtomicBool) -> bool {
        let locks = self.locks.lock();
        let held = locks.get(&address).map_or(false, LockState::is_held);
        if held {
            pending.store(true, Ordering::Release);
        }
        held
    }
}

/// A cache of typed values stored in heap blocks.
pub struct Cache<T, P> {
    shared: Arc<Shared<T, P>>,
    /// Only this many entries are tracked before idle ones get evicted.
    capacity: usize,
    entries: Mutex<LruCache<BlockAddress, Arc<CacheEntry<T, P>>>>,
}

impl<T: Cacheable, P: Pager> Cache<T, P> {
    /// Create a cache over the given pager. `factory` produces the empty value a block is decoded
    /// into.
    pub fn new<F>(pager: Arc<P>, capacity: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                pager,
                factory: Box::new(factory),
                locks: Mutex::new(HashMap::with_capacity(32)),
            }),
            capacity: capacity.max(1),
            entries: Mutex::new(LruCache::unbounded()),
        }
    }

    pub fn pager(&self) -> &Arc<P> {
        &self.shared.pager
    }

    /// Return the entry tracking the block, creating it on first access.
    ///
    /// Entries are keyed by address, an entry that is already tracked is returned as is even if
    /// `ptr` carries different metadata.
    pub fn entry(&self, ptr: BlockPointer) -> Result<Arc<CacheEntry<T, P>>> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(&ptr.addr()) {
            return Ok(entry.clone());
        }

        let entry = Arc::new(CacheEntry::new(self.shared.clone(), ptr));
        entries.put(ptr.addr(), entry.clone());
        self.evict(&mut entries)?;
        Ok(entry)
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, address: BlockAddress) -> bool {
        self.entries.lock().contains(&address)
    }

    /// Returns true if anyone holds, or waits for, a lock on the address.
    pub fn is_held(&self, address: BlockAddress) -> bool {
        self.shared.is_held(address)
    }

    /// Number of shared holders of the address.
    pub fn readers(&self, address: BlockAddress) -> usize {
        self.shared.state(address).readers
    }

    /// The lock bookkeeping of the address.
    pub fn lock_state(&self, address: BlockAddress) -> LockState {
        self.shared.state(address)
    }

    /// Flush every tracked entry. Entries that are currently held flush when they are unlocked.
    pub fn flush_all(&self) -> Result<()> {
        let entries: Vec<_> = self
            .entries
            .lock()
            .iter()
            .map(|(_, entry)| entry.clone())
            .collect();

        for entry in entries {
            entry.flush()?;
        }

        Ok(())
    }

    /// Flush everything and stop tracking all entries.
    pub fn close(self) -> Result<()> {
        self.flush_all()?;
        let mut entries = self.entries.lock();
        debug!(entries = entries.len(), "closed cache");
        entries.clear();
        Ok(())
    }

    /// Evict least recently used entries that nobody holds or references until the cache is back
    /// under its capacity. Evicted entries are flushed first.
    fn evict(&self, entries: &mut LruCache<BlockAddress, Arc<CacheEntry<T, P>>>) -> Result<()> {
        let excess = entries.len().saturating_sub(self.capacity);
        if excess == 0 {
            return Ok(());
        }

        let victims: Vec<BlockAddress> = entries
            .iter()
            .rev()
            .filter(|(address, entry)| {
                Arc::strong_count(entry) == 1 && !self.shared.is_held(**address)
            })
            .map(|(address, _)| *address)
            .take(excess)
            .collect();

        for address in victims {
            if let Some(entry) = entries.peek(&address) {
                entry.flush()?;
            }
            entries.pop(&address);
            trace!(address, "evicted entry");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BoxError, Error};
    use crate::pointer::META_SIZE;
    use diskheap_pager::MemoryPager;

    /// A counter stored as a big endian u64.
    #[derive(Debug, Default, Clone, PartialEq)]
    struct Counter {
        count: u64,
        dirty: bool,
    }

    impl Marshal for Counter {
        fn marshal(&self) -> Result<Vec<u8>, BoxError> {
            Ok(self.count.to_be_bytes().to_vec())
        }
    }

    impl Unmarshal for Counter {
        fn unmarshal(&mut self, data: &[u8]) -> Result<(), BoxError> {
            let bytes: [u8; 8] = data
                .get(..8)
                .ok_or("short counter")?
                .try_into()
                .map_err(|_| "short counter")?;
            self.count = u64::from_be_bytes(bytes);
            Ok(())
        }
    }

    impl Cacheable for Counter {
        fn is_dirty(&self) -> bool {
            self.dirty
        }

        fn set_dirty(&mut self, dirty: bool) {
            self.dirty = dirty;
        }

        fn is_nil(&self) -> bool {
            false
        }
    }

    fn setup(capacity: usize) -> (Arc<MemoryPager>, Cache<Counter, MemoryPager>) {
        let pager = Arc::new(MemoryPager::with_pages(256, 4).unwrap());
        let cache = Cache::new(pager.clone(), capacity, Counter::default);
        (pager, cache)
    }

    fn block(n: u64) -> BlockPointer {
        BlockPointer::new(100 + n * (16 + 2 * META_SIZE), 16, false)
    }

    fn stored(pager: &MemoryPager, ptr: BlockPointer) -> u64 {
        let mut counter = Counter::default();
        ptr.get(pager, &mut counter).unwrap();
        counter.count
    }

    #[test]
    fn entry_is_tracked_once() {
        let (_, cache) = setup(8);
        let a = cache.entry(block(0)).unwrap();
        let b = cache.entry(block(0)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(block(0).addr()));
    }

    #[test]
    fn single_load() {
        let (pager, cache) = setup(8);
        block(0)
            .set(&*pager, &Counter {
                count: 7,
                dirty: false,
            })
            .unwrap();

        let entry = cache.entry(block(0)).unwrap();
        assert!(!entry.is_loaded());
        let reads = pager.stats().reads;

        assert_eq!(entry.materialize().unwrap().count, 7);
        assert_eq!(entry.materialize().unwrap().count, 7);
        assert!(entry.is_loaded());
        assert_eq!(pager.stats().reads, reads + 1);
    }

    #[test]
    fn materialize_failure_propagates() {
        let (_, cache) = setup(8);
        let entry = cache.entry(BlockPointer::new(100, 4, false)).unwrap();
        assert!(matches!(entry.materialize(), Err(Error::Unmarshal(_))));
        assert!(!entry.is_loaded());
    }

    #[test]
    fn assign_then_flush() {
        let (pager, cache) = setup(8);
        let entry = cache.entry(block(1)).unwrap();
        entry.assign(Counter {
            count: 42,
            dirty: false,
        });
        assert!(entry.materialize().unwrap().dirty);

        let writes = pager.stats().writes;
        entry.flush().unwrap();
        assert_eq!(pager.stats().writes, writes + 1);
        assert!(!entry.materialize().unwrap().dirty);
        assert_eq!(stored(&pager, block(1)), 42);

        // Clean now, flushing again is a no-op.
        entry.flush().unwrap();
        assert_eq!(pager.stats().writes, writes + 1);
    }

    #[test]
    fn flush_without_value_is_noop() {
        let (pager, cache) = setup(8);
        let entry = cache.entry(block(1)).unwrap();
        let stats = pager.stats();
        entry.flush().unwrap();
        assert_eq!(pager.stats(), stats);
    }

    #[test]
    fn flush_is_deferred_while_locked() {
        let (pager, cache) = setup(8);
        let entry = cache.entry(block(2)).unwrap();

        let guard = entry.exclusive_lock();
        assert!(cache.is_held(block(2).addr()));
        assert!(cache.lock_state(block(2).addr()).is_exclusive());
        guard.assign(Counter {
            count: 9,
            dirty: false,
        });

        let writes = pager.stats().writes;
        entry.flush().unwrap();
        assert!(entry.has_pending_flush());
        assert_eq!(pager.stats().writes, writes);

        guard.unlock().unwrap();
        assert_eq!(pager.stats().writes, writes + 1);
        assert!(!entry.has_pending_flush());
        assert!(!cache.is_held(block(2).addr()));
        assert!(!entry.materialize().unwrap().dirty);
        assert_eq!(stored(&pager, block(2)), 9);
    }

    #[test]
    fn deferred_flush_waits_for_last_reader() {
        let (pager, cache) = setup(8);
        let entry = cache.entry(block(3)).unwrap();
        entry.assign(Counter {
            count: 3,
            dirty: false,
        });

        let first = entry.shared_lock();
        let second = entry.shared_lock();
        assert_eq!(cache.readers(block(3).addr()), 2);

        let writes = pager.stats().writes;
        entry.flush().unwrap();

        drop(first);
        assert_eq!(cache.readers(block(3).addr()), 1);
        assert_eq!(pager.stats().writes, writes);
        assert!(entry.has_pending_flush());

        drop(second);
        assert_eq!(cache.readers(block(3).addr()), 0);
        assert!(!cache.is_held(block(3).addr()));
        assert_eq!(pager.stats().writes, writes + 1);
        assert_eq!(stored(&pager, block(3)), 3);
    }

    #[test]
    fn lock_modes() {
        let (_, cache) = setup(8);
        let entry = cache.entry(block(4)).unwrap();
        let address = block(4).addr();

        let guard = entry.lock(LockMode::None);
        assert_eq!(guard.mode(), LockMode::None);
        assert!(!cache.is_held(address));
        guard.unlock().unwrap();

        let guard = entry.lock(LockMode::Read);
        assert_eq!(guard.mode(), LockMode::Read);
        assert_eq!(cache.readers(address), 1);
        guard.unlock().unwrap();
        assert!(!cache.is_held(address));

        let guard = entry.lock(LockMode::Write);
        assert_eq!(guard.mode(), LockMode::Write);
        assert!(cache.lock_state(address).is_exclusive());
        assert_eq!(cache.readers(address), 0);
        guard.unlock().unwrap();
        assert!(!cache.is_held(address));
    }

    #[test]
    fn eviction_skips_busy_entries() {
        let (pager, cache) = setup(2);
        let held = cache.entry(block(0)).unwrap();
        let guard = held.shared_lock();

        let dirty = cache.entry(block(1)).unwrap();
        dirty.assign(Counter {
            count: 11,
            dirty: false,
        });
        drop(dirty);

        cache.entry(block(2)).unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(block(0).addr()));
        assert!(!cache.contains(block(1).addr()));
        assert_eq!(stored(&pager, block(1)), 11);

        drop(guard);
    }

    #[test]
    fn close_flushes_everything() {
        let (pager, cache) = setup(8);
        for n in 0..4 {
            cache.entry(block(n)).unwrap().assign(Counter {
                count: n * 10,
                dirty: false,
            });
        }

        cache.close().unwrap();
        for n in 0..4 {
            assert_eq!(stored(&pager, block(n)), n * 10);
        }
    }

    #[test]
    fn entry_marshals_as_pointer() {
        let (_, cache) = setup(8);
        let entry = cache.entry(block(5)).unwrap();
        assert_eq!(entry.marshal().unwrap(), block(5).to_bytes().unwrap());
        assert_eq!(entry.to_string(), format!("{} -> None", block(5)));
    }
}
