//! Page granular storage backends used by `diskheap`.
//!
//! A [`Pager`] exposes one growable, byte addressable space that is divided into fixed size
//! pages. Reads and writes are positional and must fall inside the currently allocated pages,
//! the only way to get more space is an explicit call to [`Pager::grow`].

mod memory;
mod mmap;

use std::sync::atomic::{AtomicU64, Ordering};

pub use memory::MemoryPager;
pub use mmap::MmapPager;

/// The default page size used when none is configured.
pub const DEFAULT_PAGE_SIZE: u64 = 4096;

/// A possible error value when dealing with a pager.
#[derive(Debug, thiserror::Error)]
pub enum PagerError {
    /// Attempted to access a range outside of the allocated pages.
    #[error("access out of bounds: offset={offset} len={len} size={size}")]
    OutOfBounds { offset: u64, len: usize, size: u64 },
    /// The page size is zero or not a power of two.
    #[error("invalid page size: {0}")]
    InvalidPageSize(u64),
    /// The backing file length is not a whole number of pages.
    #[error("file length {len} is not a multiple of the page size {page_size}")]
    Misaligned { len: u64, page_size: u64 },
    /// Growing the storage would overflow the address space.
    #[error("cannot grow by {0} pages")]
    Overflow(u64),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = PagerError> = std::result::Result<T, E>;

/// The storage interface.
pub trait Pager: Send + Sync {
    /// Size of a single page in bytes.
    fn page_size(&self) -> u64;

    /// Number of pages currently allocated.
    fn pages(&self) -> u64;

    /// Allocate `new_pages` zero filled pages at the end of the storage and return the number of
    /// pages that existed before the call.
    fn grow(&self, new_pages: u64) -> Result<u64>;

    /// Fill `buf` with the bytes starting at `offset`.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;

    /// Write all of `buf` starting at `offset`.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()>;

    /// Persist any buffered writes.
    fn sync(&self) -> Result<()> {
        Ok(())
    }

    /// I/O counters since this pager was created.
    fn stats(&self) -> PagerStats;

    /// Total number of addressable bytes.
    fn len(&self) -> u64 {
        self.pages() * self.page_size()
    }

    fn is_empty(&self) -> bool {
        self.pages() == 0
    }
}

/// Number of calls served by a pager.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PagerStats {
    pub reads: u64,
    pub writes: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
}

impl Counters {
    pub(crate) fn read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PagerStats {
        PagerStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn check_page_size(page_size: u64) -> Result<()> {
    if page_size == 0 || !page_size.is_power_of_two() {
        return Err(PagerError::InvalidPageSize(page_size));
    }
    Ok(())
}

/// Returns the byte range `offset..offset + len` if it fits in `size` bytes.
pub(crate) fn check_range(offset: u64, len: usize, size: u64) -> Result<std::ops::Range<usize>> {
    let out_of_bounds = || PagerError::OutOfBounds { offset, len, size };
    let end = offset.checked_add(len as u64).ok_or_else(out_of_bounds)?;
    if end > size {
        return Err(out_of_bounds());
    }
    Ok(offset as usize..end as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_must_be_power_of_two() {
        assert!(check_page_size(4096).is_ok());
        assert!(check_page_size(1).is_ok());
        assert!(matches!(
            check_page_size(0),
            Err(PagerError::InvalidPageSize(0))
        ));
        assert!(matches!(
            check_page_size(1000),
            Err(PagerError::InvalidPageSize(1000))
        ));
    }

    #[test]
    fn range_checks() {
        assert_eq!(check_range(0, 16, 16).unwrap(), 0..16);
        assert_eq!(check_range(10, 0, 10).unwrap(), 10..10);
        assert!(check_range(10, 7, 16).is_err());
        assert!(check_range(u64::MAX, 2, 16).is_err());
    }
}
