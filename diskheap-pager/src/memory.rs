use crate::{check_page_size, check_range, Counters, Pager, PagerError, PagerStats, Result};
use parking_lot::RwLock;

/// A pager that stores everything in the heap.
#[derive(Debug)]
pub struct MemoryPager {
    page_size: u64,
    data: RwLock<Vec<u8>>,
    counters: Counters,
}

impl MemoryPager {
    /// Create an empty pager with the given page size.
    pub fn new(page_size: u64) -> Result<Self> {
        check_page_size(page_size)?;
        Ok(Self {
            page_size,
            data: RwLock::new(Vec::new()),
            counters: Counters::default(),
        })
    }

    /// Create a pager with `pages` zero filled pages already allocated.
    pub fn with_pages(page_size: u64, pages: u64) -> Result<Self> {
        let pager = Self::new(page_size)?;
        pager.grow(pages)?;
        Ok(pager)
    }
}

impl Default for MemoryPager {
    fn default() -> Self {
        Self {
            page_size: crate::DEFAULT_PAGE_SIZE,
            data: RwLock::new(Vec::new()),
            counters: Counters::default(),
        }
    }
}

impl Pager for MemoryPager {
    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn pages(&self) -> u64 {
        self.data.read().len() as u64 / self.page_size
    }

    fn grow(&self, new_pages: u64) -> Result<u64> {
        let mut data = self.data.write();
        let old_pages = data.len() as u64 / self.page_size;
        let new_len = new_pages
            .checked_add(old_pages)
            .and_then(|pages| pages.checked_mul(self.page_size))
            .and_then(|len| usize::try_from(len).ok())
            .ok_or(PagerError::Overflow(new_pages))?;
        data.resize(new_len, 0);
        Ok(old_pages)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.counters.read();
        let data = self.data.read();
        let range = check_range(offset, buf.len(), data.len() as u64)?;
        buf.copy_from_slice(&data[range]);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.counters.write();
        let mut data = self.data.write();
        let range = check_range(offset, buf.len(), data.len() as u64)?;
        data[range].copy_from_slice(buf);
        Ok(())
    }

    fn stats(&self) -> PagerStats {
        self.counters.snapshot()
    }
}
