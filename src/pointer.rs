//! Block pointers and the boundary tags that surround every block.
//!
//! A block on the heap looks like this:
//!
//! ```text
//!   address - META_SIZE     address                 address + size
//!   |                       |                       |
//!   [ meta: size | free   ] [ data (size bytes)   ] [ meta: size | free   ]
//! ```
//!
//! Both tags carry the same [`BlockMeta`], so from any block we can find its physical neighbours
//! in O(1) without consulting an index: the tag right after our trailing tag is the leading tag of
//! the next block, and the tag right before our leading tag is the trailing tag of the previous
//! one.

use crate::error::{BoxError, Error, Result};
use crate::freelist::FreeKey;
use bincode::Options;
use diskheap_pager::Pager;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type BlockAddress = u64;

pub type BlockSize = u32;

/// Size of one encoded boundary tag: 4 bytes of size and 1 byte of free flag.
pub const META_SIZE: u64 = 5;

/// Size of an encoded [`BlockPointer`]: the metadata followed by the 8 byte address.
pub const POINTER_SIZE: usize = 8 + META_SIZE as usize;

/// Any value that can be written to a block.
pub trait Marshal {
    fn marshal(&self) -> Result<Vec<u8>, BoxError>;
}

/// Any value that can be read back from a block.
///
/// The data passed to `unmarshal` is the whole block, which may be longer than what `marshal`
/// produced, so implementations must tolerate trailing bytes.
pub trait Unmarshal {
    fn unmarshal(&mut self, data: &[u8]) -> Result<(), BoxError>;
}

/// Fixed width big endian encoding used for every on-disk record of the heap.
pub(crate) fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
}

/// The content of a boundary tag.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockMeta {
    pub size: BlockSize,
    pub free: bool,
}

impl BlockMeta {
    pub fn new(size: BlockSize, free: bool) -> Self {
        Self { size, free }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        codec()
            .serialize(self)
            .map_err(|err| Error::Marshal(err.into()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        codec()
            .deserialize(data)
            .map_err(|err| Error::Unmarshal(err.into()))
    }

    /// Read the tag stored at the given offset.
    pub fn read<P: Pager + ?Sized>(pager: &P, offset: u64) -> Result<Self> {
        let mut buf = [0u8; META_SIZE as usize];
        pager
            .read_at(&mut buf, offset)
            .map_err(Error::invalid_pointer(offset))?;
        Self::from_bytes(&buf)
    }
}

/// The location and bookkeeping of one block.
///
/// This is plain data: it is cheap to copy and does not own the pager, every method that performs
/// I/O takes the pager as an argument. Equality is structural over the address, the size and the
/// free flag.
///
/// Field order matters, the serialized form is `[meta][address]`.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPointer {
    meta: BlockMeta,
    address: BlockAddress,
}

impl BlockPointer {
    pub fn new(address: BlockAddress, size: BlockSize, free: bool) -> Self {
        Self {
            meta: BlockMeta::new(size, free),
            address,
        }
    }

    /// The nil pointer.
    pub fn nil() -> Self {
        Self::default()
    }

    /// Re-derive a pointer from the leading boundary tag of the block starting at `address`.
    pub fn read_meta<P: Pager + ?Sized>(pager: &P, address: BlockAddress) -> Result<Self> {
        let at = address
            .checked_sub(META_SIZE)
            .ok_or_else(|| corrupted(address, "address precedes the first boundary tag"))?;
        let meta = BlockMeta::read(pager, at)?;
        Ok(Self { meta, address })
    }

    #[inline]
    pub fn addr(&self) -> BlockAddress {
        self.address
    }

    #[inline]
    pub fn size(&self) -> BlockSize {
        self.meta.size
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.meta.free
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        self.address == 0
    }

    #[inline]
    pub fn meta(&self) -> BlockMeta {
        self.meta
    }

    pub(crate) fn set_size(&mut self, size: BlockSize) {
        self.meta.size = size;
    }

    pub(crate) fn set_free(&mut self, free: bool) {
        self.meta.free = free;
    }

    /// Returns a pointer to the same address with zeroed metadata.
    ///
    /// This is an address copy, not a clone: the metadata must be refreshed from storage (see
    /// [`BlockPointer::read_meta`]) before the size or the free flag of the result is trusted.
    /// Use `Clone`/`Copy` for a full copy.
    pub fn copy(&self) -> Self {
        Self {
            meta: BlockMeta::default(),
            address: self.address,
        }
    }

    /// The key of this block in the free block index.
    pub fn key(&self) -> Result<FreeKey> {
        FreeKey::try_from(self)
    }

    /// Read the content of the block and decode it into `into`.
    pub fn get<P, T>(&self, pager: &P, into: &mut T) -> Result<()>
    where
        P: Pager + ?Sized,
        T: Unmarshal + ?Sized,
    {
        if self.is_nil() {
            return Err(Error::NilPointer);
        }

        let mut buf = vec![0u8; self.meta.size as usize];
        pager
            .read_at(&mut buf, self.address)
            .map_err(Error::invalid_pointer(self.address))?;
        into.unmarshal(&buf).map_err(Error::Unmarshal)
    }

    /// Encode `from` and write it to the data region of the block.
    pub fn set<P, T>(&self, pager: &P, from: &T) -> Result<()>
    where
        P: Pager + ?Sized,
        T: Marshal + ?Sized,
    {
        if self.is_nil() {
            return Err(Error::NilPointer);
        }

        let bytes = from.marshal().map_err(Error::Marshal)?;
        if bytes.len() > self.meta.size as usize {
            return Err(Error::Overflow {
                address: self.address,
                len: bytes.len(),
                size: self.meta.size,
            });
        }

        pager
            .write_at(&bytes, self.address)
            .map_err(Error::invalid_pointer(self.address))
    }

    /// Offset of the trailing boundary tag.
    fn tail(&self) -> Result<u64> {
        self.address
            .checked_add(self.meta.size as u64)
            .ok_or_else(|| corrupted(self.address, "block ends past the address space"))
    }

    /// Returns the block physically following this one.
    pub fn next<P: Pager + ?Sized>(&self, pager: &P) -> Result<Self> {
        let address = self
            .tail()?
            .checked_add(2 * META_SIZE)
            .ok_or_else(|| corrupted(self.address, "no boundary tag after block"))?;
        let meta = BlockMeta::read(pager, address - META_SIZE)?;
        Ok(Self { meta, address })
    }

    /// Returns the block physically preceding this one.
    pub fn prev<P: Pager + ?Sized>(&self, pager: &P) -> Result<Self> {
        let at = self
            .address
            .checked_sub(2 * META_SIZE)
            .ok_or_else(|| corrupted(self.address, "no boundary tag before block"))?;
        let meta = BlockMeta::read(pager, at)?;
        let address = at
            .checked_sub(meta.size as u64)
            .ok_or_else(|| corrupted(self.address, "previous block starts before the heap"))?;
        Ok(Self { meta, address })
    }

    /// Write the metadata to both boundary tags.
    ///
    /// Any change to the size or the free flag of a block is only persisted through this method,
    /// which keeps the leading and the trailing tag identical.
    pub fn write_meta<P: Pager + ?Sized>(&self, pager: &P) -> Result<()> {
        let head = self
            .address
            .checked_sub(META_SIZE)
            .ok_or_else(|| corrupted(self.address, "no room for the leading boundary tag"))?;
        let tail = self.tail()?;
        let bytes = self.meta.to_bytes()?;
        pager
            .write_at(&bytes, head)
            .map_err(Error::invalid_pointer(head))?;
        pager
            .write_at(&bytes, tail)
            .map_err(Error::invalid_pointer(tail))
    }

    /// Verify that both boundary tags on storage match this pointer.
    pub fn check_tags<P: Pager + ?Sized>(&self, pager: &P) -> Result<()> {
        let head = Self::read_meta(pager, self.address)?.meta;
        if head != self.meta {
            return Err(corrupted(
                self.address,
                format!("leading tag {:?} does not match {:?}", head, self.meta),
            ));
        }

        let tail = BlockMeta::read(pager, self.tail()?)?;
        if tail != head {
            return Err(corrupted(
                self.address,
                format!("leading tag {:?} does not match trailing tag {:?}", head, tail),
            ));
        }

        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        codec()
            .serialize(self)
            .map_err(|err| Error::Marshal(err.into()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let data = data.get(..POINTER_SIZE).ok_or_else(|| {
            Error::Unmarshal(format!("expected {} bytes, got {}", POINTER_SIZE, data.len()).into())
        })?;
        codec()
            .deserialize(data)
            .map_err(|err| Error::Unmarshal(err.into()))
    }
}

fn corrupted(address: BlockAddress, detail: impl Into<String>) -> Error {
    Error::Corrupted {
        address,
        detail: detail.into(),
    }
}

impl Marshal for BlockPointer {
    fn marshal(&self) -> Result<Vec<u8>, BoxError> {
        Ok(self.to_bytes()?)
    }
}

impl Unmarshal for BlockPointer {
    fn unmarshal(&mut self, data: &[u8]) -> Result<(), BoxError> {
        *self = Self::from_bytes(data)?;
        Ok(())
    }
}

impl fmt::Display for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ptr:'{}', size:'{}', free:'{}'}}",
            self.address, self.meta.size, self.meta.free
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diskheap_pager::MemoryPager;

    #[derive(Debug, Default, PartialEq)]
    struct Bytes(Vec<u8>);

    impl Marshal for Bytes {
        fn marshal(&self) -> Result<Vec<u8>, BoxError> {
            Ok(self.0.clone())
        }
    }

    impl Unmarshal for Bytes {
        fn unmarshal(&mut self, data: &[u8]) -> Result<(), BoxError> {
            self.0 = data.to_vec();
            Ok(())
        }
    }

    struct Broken;

    impl Marshal for Broken {
        fn marshal(&self) -> Result<Vec<u8>, BoxError> {
            Err("nope".into())
        }
    }

    impl Unmarshal for Broken {
        fn unmarshal(&mut self, _: &[u8]) -> Result<(), BoxError> {
            Err("nope".into())
        }
    }

    fn pager() -> MemoryPager {
        MemoryPager::with_pages(1024, 2).unwrap()
    }

    #[test]
    fn meta_encoding() {
        assert_eq!(
            BlockMeta::new(0x01020304, true).to_bytes().unwrap(),
            vec![1, 2, 3, 4, 1]
        );
        assert_eq!(
            BlockMeta::from_bytes(&[0, 0, 0, 32, 0]).unwrap(),
            BlockMeta::new(32, false)
        );
        assert!(matches!(
            BlockMeta::from_bytes(&[0, 0, 0, 32, 7]),
            Err(Error::Unmarshal(_))
        ));
    }

    #[test]
    fn pointer_layout() {
        let ptr = BlockPointer::new(0x0102030405060708, 32, true);
        let bytes = ptr.to_bytes().unwrap();
        assert_eq!(bytes.len(), POINTER_SIZE);
        assert_eq!(&bytes[..5], &[0, 0, 0, 32, 1]);
        assert_eq!(&bytes[5..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(BlockPointer::from_bytes(&bytes).unwrap(), ptr);

        let mut decoded = BlockPointer::nil();
        decoded.unmarshal(&bytes).unwrap();
        assert_eq!(decoded, ptr);

        assert!(matches!(
            BlockPointer::from_bytes(&bytes[..10]),
            Err(Error::Unmarshal(_))
        ));
    }

    #[test]
    fn accessors() {
        let ptr = BlockPointer::new(1000, 32, false);
        assert_eq!(ptr.addr(), 1000);
        assert_eq!(ptr.size(), 32);
        assert!(!ptr.is_free());
        assert!(!ptr.is_nil());
        assert!(BlockPointer::nil().is_nil());
        assert_eq!(ptr.to_string(), "{ptr:'1000', size:'32', free:'false'}");
    }

    #[test]
    fn copy_resets_meta() {
        let ptr = BlockPointer::new(1000, 32, true);
        let copy = ptr.copy();
        assert_eq!(copy.addr(), 1000);
        assert_eq!(copy.size(), 0);
        assert!(!copy.is_free());
        assert_ne!(copy, ptr);
    }

    #[test]
    fn equality_is_structural() {
        let a = BlockPointer::new(1000, 32, false);
        assert_eq!(a, BlockPointer::new(1000, 32, false));
        assert_ne!(a, BlockPointer::new(1000, 32, true));
        assert_ne!(a, BlockPointer::new(1000, 33, false));
        assert_ne!(a, BlockPointer::new(1001, 32, false));
    }

    #[test]
    fn write_meta_is_symmetric() {
        let pager = pager();
        let ptr = BlockPointer::new(1000, 32, false);
        ptr.write_meta(&pager).unwrap();

        let head = BlockMeta::read(&pager, 995).unwrap();
        let tail = BlockMeta::read(&pager, 1032).unwrap();
        assert_eq!(head, tail);
        assert_eq!(head, ptr.meta());
        ptr.check_tags(&pager).unwrap();
        assert_eq!(BlockPointer::read_meta(&pager, 1000).unwrap(), ptr);
    }

    #[test]
    fn check_tags_detects_mismatch() {
        let pager = pager();
        let ptr = BlockPointer::new(1000, 32, false);
        ptr.write_meta(&pager).unwrap();
        pager
            .write_at(&BlockMeta::new(32, true).to_bytes().unwrap(), 1032)
            .unwrap();
        assert!(matches!(
            ptr.check_tags(&pager),
            Err(Error::Corrupted { address: 1000, .. })
        ));
    }

    #[test]
    fn traversal() {
        let pager = pager();
        let a = BlockPointer::new(100, 40, false);
        let b = BlockPointer::new(100 + 40 + 2 * META_SIZE, 17, true);
        let c = BlockPointer::new(b.addr() + 17 + 2 * META_SIZE, 3, false);
        a.write_meta(&pager).unwrap();
        b.write_meta(&pager).unwrap();
        c.write_meta(&pager).unwrap();

        assert_eq!(a.next(&pager).unwrap(), b);
        assert_eq!(b.next(&pager).unwrap(), c);
        assert_eq!(c.prev(&pager).unwrap(), b);
        assert_eq!(b.prev(&pager).unwrap(), a);
    }

    #[test]
    fn traversal_near_address_space_end() {
        let pager = pager();
        let mut bytes = vec![0, 0, 0, 16, 0];
        bytes.extend_from_slice(&(u64::MAX - 15).to_be_bytes());
        let ptr = BlockPointer::from_bytes(&bytes).unwrap();

        assert!(matches!(ptr.next(&pager), Err(Error::Corrupted { .. })));
        assert!(matches!(ptr.write_meta(&pager), Err(Error::Corrupted { .. })));
        assert!(matches!(ptr.check_tags(&pager), Err(Error::InvalidPointer { .. })));
        assert!(matches!(ptr.key(), Ok(_)));

        let huge = BlockPointer::new(u64::MAX - 2, u32::MAX, false);
        assert!(matches!(huge.next(&pager), Err(Error::Corrupted { .. })));
        assert!(matches!(huge.key(), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn encoding_edge_values() {
        let addresses = [0, 1, META_SIZE, u32::MAX as u64, u64::MAX - 1, u64::MAX];
        let sizes = [0, 1, 32, u32::MAX - 1, u32::MAX];

        for address in addresses {
            for size in sizes {
                for free in [false, true] {
                    let ptr = BlockPointer::new(address, size, free);
                    let bytes = ptr.to_bytes().unwrap();
                    assert_eq!(bytes.len(), POINTER_SIZE, "{}", ptr);
                    assert_eq!(BlockPointer::from_bytes(&bytes).unwrap(), ptr, "{}", ptr);
                }
            }
        }
    }

    #[test]
    fn prev_at_start_is_corrupted() {
        let pager = pager();
        let ptr = BlockPointer::new(6, 4, false);
        assert!(matches!(ptr.prev(&pager), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn get_set() {
        let pager = pager();
        let ptr = BlockPointer::new(200, 8, false);
        ptr.set(&pager, &Bytes(b"abcd".to_vec())).unwrap();

        let mut out = Bytes::default();
        ptr.get(&pager, &mut out).unwrap();
        assert_eq!(out.0, b"abcd\0\0\0\0");
    }

    #[test]
    fn get_set_errors() {
        let pager = pager();
        let ptr = BlockPointer::new(200, 8, false);
        assert!(matches!(
            ptr.set(&pager, &Broken),
            Err(Error::Marshal(_))
        ));
        assert!(matches!(
            ptr.get(&pager, &mut Broken),
            Err(Error::Unmarshal(_))
        ));
        assert!(matches!(
            ptr.set(&pager, &Bytes(vec![0; 9])),
            Err(Error::Overflow {
                address: 200,
                len: 9,
                size: 8
            })
        ));

        let outside = BlockPointer::new(pager.len() - 4, 8, false);
        assert!(matches!(
            outside.get(&pager, &mut Bytes::default()),
            Err(Error::InvalidPointer { .. })
        ));
        assert!(matches!(
            outside.set(&pager, &Bytes(vec![1; 8])),
            Err(Error::InvalidPointer { .. })
        ));
        assert!(matches!(
            BlockPointer::nil().get(&pager, &mut Bytes::default()),
            Err(Error::NilPointer)
        ));
    }
}
