//! Keys for the free block index.
//!
//! The index itself lives outside of this crate, all it needs from us is a key describing the
//! entire physical span of a free block, boundary tags included, so that adjacency and coalescing
//! can be computed with plain offsets.

use crate::error::{Error, Result};
use crate::pointer::{codec, BlockAddress, BlockPointer, BlockSize, META_SIZE};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Size of an encoded [`FreeKey`].
pub const FREE_KEY_SIZE: usize = 12;

/// The physical footprint of a block.
///
/// Keys order by size first and then by address so an ordered index can answer "the smallest
/// block that is at least this large" with a single range lookup.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FreeKey {
    pub size: BlockSize,
    pub address: BlockAddress,
}

impl FreeKey {
    /// First byte after the span.
    pub fn end(&self) -> Result<u64> {
        self.address
            .checked_add(self.size as u64)
            .ok_or_else(|| self.invalid("span ends past the address space"))
    }

    /// Returns the free block this key was derived from.
    pub fn pointer(&self) -> Result<BlockPointer> {
        let size = self
            .size
            .checked_sub(2 * META_SIZE as BlockSize)
            .ok_or_else(|| self.invalid("span is smaller than two boundary tags"))?;
        let address = self
            .address
            .checked_add(META_SIZE)
            .ok_or_else(|| self.invalid("span starts past the address space"))?;
        Ok(BlockPointer::new(address, size, true))
    }

    fn invalid(&self, detail: &str) -> Error {
        Error::Corrupted {
            address: self.address,
            detail: format!("free key {:?}: {}", self, detail),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        codec()
            .serialize(self)
            .map_err(|err| Error::Marshal(err.into()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let data = data.get(..FREE_KEY_SIZE).ok_or_else(|| {
            Error::Unmarshal(format!("expected {} bytes, got {}", FREE_KEY_SIZE, data.len()).into())
        })?;
        codec()
            .deserialize(data)
            .map_err(|err| Error::Unmarshal(err.into()))
    }
}

impl TryFrom<&BlockPointer> for FreeKey {
    type Error = Error;

    fn try_from(ptr: &BlockPointer) -> Result<Self> {
        let corrupted = |detail: &str| Error::Corrupted {
            address: ptr.addr(),
            detail: detail.into(),
        };

        Ok(FreeKey {
            size: ptr
                .size()
                .checked_add(2 * META_SIZE as BlockSize)
                .ok_or_else(|| corrupted("block too large for a free key"))?,
            address: ptr
                .addr()
                .checked_sub(META_SIZE)
                .ok_or_else(|| corrupted("block has no leading boundary tag"))?,
        })
    }
}

impl Ord for FreeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.size
            .cmp(&other.size)
            .then(self.address.cmp(&other.address))
    }
}

impl PartialOrd for FreeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
