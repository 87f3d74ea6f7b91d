//! A disk backed heap.
//!
//! Blocks are carved out of a paged file and surrounded by boundary tags, so neighbouring blocks
//! can be found and merged without a separate index. On top of the blocks a typed [`Cache`] lets
//! higher level structures treat a block address as a lazily loaded, lockable value with
//! write-back semantics.
//!
//! ```no_run
//! use diskheap::{Heap, Options};
//!
//! let mut options = Options::default();
//! options.pager.path = Some("/tmp/example.heap".into());
//!
//! let heap = Heap::open(options)?;
//! let block = heap.carve(64)?;
//! let released = heap.release(block)?;
//! assert!(released.block.is_free());
//! heap.close()?;
//! # Ok::<(), diskheap::Error>(())
//! ```

mod cache;
mod error;
mod freelist;
mod heap;
mod options;
mod pointer;

pub use cache::{
    Cache, CacheEntry, Cacheable, ExclusiveGuard, LockGuard, LockMode, LockState, SharedGuard,
};
pub use error::{BoxError, Error, Result};
pub use freelist::{FreeKey, FREE_KEY_SIZE};
pub use heap::{Heap, Released, Split, FIRST_BLOCK, HEADER_SIZE};
pub use options::{Options, PagerOptions};
pub use pointer::{
    BlockAddress, BlockMeta, BlockPointer, BlockSize, Marshal, Unmarshal, META_SIZE, POINTER_SIZE,
};

// Re-export the storage backends.
pub use diskheap_pager as pager;
pub use diskheap_pager::{MemoryPager, MmapPager, Pager, PagerError};
