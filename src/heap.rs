//! The heap file layout and the physical mechanics of carving, splitting and coalescing blocks.
//!
//! ```text
//!   0          8          16          21
//!   [ magic  ] [ end    ] [ prologue ] [ tag | block | tag ] ... [ epilogue ]
//!                                                                ^ end
//! ```
//!
//! The prologue and the epilogue are used tags of size zero, so walking past the first or the last
//! block always lands on a block that is never free and never merged. Which free block serves an
//! allocation is decided by the free block index on top of this, not here.

use crate::cache::{Cache, Cacheable};
use crate::error::{Error, Result};
use crate::freelist::FreeKey;
use crate::options::Options;
use crate::pointer::{codec, BlockAddress, BlockMeta, BlockPointer, BlockSize, META_SIZE};
use bincode::Options as _;
use diskheap_pager::{MemoryPager, MmapPager, Pager};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

const MAGIC: [u8; 8] = *b"DSKHEAP1";

/// Size of the encoded [`Header`].
pub const HEADER_SIZE: u64 = 16;

/// Address of the first block of every heap.
pub const FIRST_BLOCK: BlockAddress = HEADER_SIZE + 2 * META_SIZE;

/// The smallest block a split leaves behind: two tags and a single byte of data.
const MIN_REMAINDER: BlockSize = 2 * META_SIZE as BlockSize + 1;

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    magic: [u8; 8],
    /// Offset of the epilogue tag.
    end: u64,
}

/// The outcome of [`Heap::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    /// The free block after coalescing.
    pub block: BlockPointer,
    /// Keys of the free neighbours that were absorbed into `block`, they must be dropped from the
    /// free block index.
    pub absorbed: Vec<FreeKey>,
}

/// The outcome of [`Heap::split`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    /// The shrunk block, it keeps the address and the free flag of the original block.
    pub block: BlockPointer,
    /// The new free block formed by the cut off bytes.
    pub remainder: Option<BlockPointer>,
    /// Key of a free neighbour merged into the remainder.
    pub absorbed: Option<FreeKey>,
}

/// A heap of boundary tagged blocks on top of a pager.
pub struct Heap<P: Pager> {
    pager: Arc<P>,
    options: Options,
    /// Offset of the epilogue tag. The lock also serializes every change to the block layout.
    end: Mutex<u64>,
}

impl Heap<MmapPager> {
    /// Open the file backed heap described by the options, formatting the file if it is empty.
    pub fn open(options: Options) -> Result<Self> {
        options.validate()?;
        let path = options
            .pager
            .path
            .clone()
            .ok_or_else(|| Error::InvalidOptions("pager.path is required".into()))?;
        let pager = MmapPager::open(path, options.pager.page_size)?;
        Self::with_pager(pager, options)
    }
}

impl Heap<MemoryPager> {
    /// Create an empty heap that lives in memory.
    pub fn memory(options: Options) -> Result<Self> {
        options.validate()?;
        let pager = MemoryPager::new(options.pager.page_size)?;
        Self::with_pager(pager, options)
    }
}

impl<P: Pager> Heap<P> {
    /// Bind a heap to the given pager. An empty pager is formatted, otherwise it must already
    /// contain a heap.
    pub fn with_pager(pager: P, options: Options) -> Result<Self> {
        options.validate()?;
        let pager = Arc::new(pager);

        let end = if pager.is_empty() {
            format(&*pager)?
        } else {
            let end = read_header(&*pager)?;
            debug!(end, pages = pager.pages(), "opened heap");
            end
        };

        Ok(Self {
            pager,
            options,
            end: Mutex::new(end),
        })
    }

    pub fn pager(&self) -> &Arc<P> {
        &self.pager
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Offset of the epilogue tag, everything before it belongs to a block.
    pub fn end(&self) -> u64 {
        *self.end.lock()
    }

    /// Create a cache of typed values bound to this heap's pager.
    pub fn cache<T, F>(&self, factory: F) -> Cache<T, P>
    where
        T: Cacheable,
        F: Fn() -> T + Send + Sync + 'static,
    {
        Cache::new(self.pager.clone(), self.options.cache_capacity, factory)
    }

    /// Append a new used block of `size` bytes at the end of the heap.
    pub fn carve(&self, size: BlockSize) -> Result<BlockPointer> {
        if size == 0 {
            return Err(Error::InvalidSize(size));
        }

        let mut end = self.end.lock();
        let ptr = BlockPointer::new(*end + META_SIZE, size, false);
        let new_end = ptr.addr() + size as u64 + META_SIZE;
        self.reserve(new_end + META_SIZE)?;

        write_tag(&*self.pager, new_end, BlockMeta::default())?;
        ptr.write_meta(&*self.pager)?;
        write_header(&*self.pager, new_end)?;
        *end = new_end;

        debug!(%ptr, end = new_end, "carved block");
        Ok(ptr)
    }

    /// Mark the block free and merge it with its free physical neighbours.
    pub fn release(&self, ptr: BlockPointer) -> Result<Released> {
        let end = self.end.lock();
        let pager = &*self.pager;

        let block = self.load(ptr.addr(), *end)?;
        if block.is_free() {
            return Err(Error::DoubleFree(block.addr()));
        }

        let mut merged = block;
        merged.set_free(true);
        let mut absorbed = Vec::new();

        let prev = block.prev(pager)?;
        if prev.is_free() {
            if let Some(size) = merged_size(prev.size(), merged.size()) {
                absorbed.push(prev.key()?);
                merged = BlockPointer::new(prev.addr(), size, true);
            }
        }

        let next = block.next(pager)?;
        if next.is_free() {
            if let Some(size) = merged_size(merged.size(), next.size()) {
                absorbed.push(next.key()?);
                merged.set_size(size);
            }
        }

        merged.write_meta(pager)?;
        debug!(%block, %merged, absorbed = absorbed.len(), "released block");
        Ok(Released {
            block: merged,
            absorbed,
        })
    }

    /// Shrink the block to `size` bytes and turn what is left into a free block.
    ///
    /// When the leftover is too small to form a block of its own the block is returned untouched.
    pub fn split(&self, ptr: BlockPointer, size: BlockSize) -> Result<Split> {
        let end = self.end.lock();
        let pager = &*self.pager;

        let block = self.load(ptr.addr(), *end)?;
        if size == 0 || size > block.size() {
            return Err(Error::InvalidSize(size));
        }

        let left = block.size() - size;
        if left < MIN_REMAINDER {
            return Ok(Split {
                block,
                remainder: None,
                absorbed: None,
            });
        }

        let mut shrunk = block;
        shrunk.set_size(size);
        let mut remainder = BlockPointer::new(
            block.addr() + size as u64 + 2 * META_SIZE,
            left - 2 * META_SIZE as BlockSize,
            true,
        );

        let mut absorbed = None;
        let next = block.next(pager)?;
        if next.is_free() {
            if let Some(size) = merged_size(remainder.size(), next.size()) {
                absorbed = Some(next.key()?);
                remainder.set_size(size);
            }
        }

        remainder.write_meta(pager)?;
        shrunk.write_meta(pager)?;

        trace!(%shrunk, %remainder, "split block");
        Ok(Split {
            block: shrunk,
            remainder: Some(remainder),
            absorbed,
        })
    }

    /// Mark a free block as used, after the free block index handed it out.
    pub fn occupy(&self, ptr: BlockPointer) -> Result<BlockPointer> {
        let end = self.end.lock();
        let mut block = self.load(ptr.addr(), *end)?;
        if !block.is_free() {
            return Err(Error::InUse(block.addr()));
        }

        block.set_free(false);
        block.write_meta(&*self.pager)?;
        trace!(%block, "occupied block");
        Ok(block)
    }

    /// Walk every block from the first to the last one using only the boundary tags.
    pub fn blocks(&self) -> Result<Vec<BlockPointer>> {
        let end = *self.end.lock();
        let mut blocks = Vec::new();
        let mut ptr = BlockPointer::read_meta(&*self.pager, FIRST_BLOCK)?;

        while ptr.addr() - META_SIZE < end {
            ptr.check_tags(&*self.pager)?;
            blocks.push(ptr);
            ptr = ptr.next(&*self.pager)?;
        }

        Ok(blocks)
    }

    /// Sync the pager. Caches bound to this heap must be closed before.
    pub fn close(self) -> Result<()> {
        self.pager.sync()?;
        debug!(end = *self.end.lock(), "closed heap");
        Ok(())
    }

    /// Re-derive the block at `address` from storage and verify its tags. The block must lie
    /// between the prologue and the epilogue at `end`.
    fn load(&self, address: BlockAddress, end: u64) -> Result<BlockPointer> {
        let outside = |detail: &str| Error::Corrupted {
            address,
            detail: detail.into(),
        };

        if address < FIRST_BLOCK {
            return Err(outside("address precedes the first block"));
        }
        if address - META_SIZE >= end {
            return Err(outside("address is past the last block"));
        }

        let block = BlockPointer::read_meta(&*self.pager, address)?;
        let tail = address
            .checked_add(block.size() as u64)
            .ok_or_else(|| outside("block ends past the address space"))?;
        if tail >= end {
            return Err(outside("block overlaps the epilogue"));
        }

        block.check_tags(&*self.pager)?;
        Ok(block)
    }

    /// Grow the pager so at least `len` bytes are addressable.
    fn reserve(&self, len: u64) -> Result<()> {
        let current = self.pager.len();
        if len <= current {
            return Ok(());
        }

        let page_size = self.pager.page_size();
        let pages = (len - current + page_size - 1) / page_size;
        self.pager.grow(pages)?;
        trace!(pages, "grew heap");
        Ok(())
    }
}

/// Size of the block formed by two adjacent blocks, their inner tags become data.
fn merged_size(a: BlockSize, b: BlockSize) -> Option<BlockSize> {
    a.checked_add(b)?.checked_add(2 * META_SIZE as BlockSize)
}

fn format<P: Pager + ?Sized>(pager: &P) -> Result<u64> {
    let end = HEADER_SIZE + META_SIZE;
    let len = end + META_SIZE;
    pager.grow((len + pager.page_size() - 1) / pager.page_size())?;

    write_tag(pager, HEADER_SIZE, BlockMeta::default())?;
    write_tag(pager, end, BlockMeta::default())?;
    write_header(pager, end)?;

    debug!(page_size = pager.page_size(), "formatted heap");
    Ok(end)
}

fn read_header<P: Pager + ?Sized>(pager: &P) -> Result<u64> {
    let mut buf = [0u8; HEADER_SIZE as usize];
    pager.read_at(&mut buf, 0).map_err(|_| Error::InvalidHeader)?;
    let header: Header = codec().deserialize(&buf).map_err(|_| Error::InvalidHeader)?;
    if header.magic != MAGIC
        || header.end < HEADER_SIZE + META_SIZE
        || header
            .end
            .checked_add(META_SIZE)
            .map_or(true, |len| len > pager.len())
    {
        return Err(Error::InvalidHeader);
    }
    Ok(header.end)
}

fn write_header<P: Pager + ?Sized>(pager: &P, end: u64) -> Result<()> {
    let header = Header { magic: MAGIC, end };
    let bytes = codec()
        .serialize(&header)
        .map_err(|err| Error::Marshal(err.into()))?;
    pager.write_at(&bytes, 0).map_err(Error::invalid_pointer(0))
}

fn write_tag<P: Pager + ?Sized>(pager: &P, offset: u64, meta: BlockMeta) -> Result<()> {
    pager
        .write_at(&meta.to_bytes()?, offset)
        .map_err(Error::invalid_pointer(offset))
}
