use diskheap_pager::PagerError;

/// Error produced by a payload's own (de)serialization.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A possible error value when dealing with the heap.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The pager rejected a read or write at an offset computed from a pointer.
    #[error("invalid pointer {address}")]
    InvalidPointer {
        address: u64,
        #[source]
        source: PagerError,
    },
    /// A value could not be serialized.
    #[error("marshal error")]
    Marshal(#[source] BoxError),
    /// The bytes on storage could not be decoded into a value.
    #[error("unmarshal error")]
    Unmarshal(#[source] BoxError),
    /// A payload does not fit in the block it is written to.
    #[error("payload of {len} bytes overflows block {address} of size {size}")]
    Overflow { address: u64, len: usize, size: u32 },
    /// The nil pointer was dereferenced.
    #[error("nil pointer dereference")]
    NilPointer,
    /// A block was released twice.
    #[error("double free of block {0}")]
    DoubleFree(u64),
    /// A block expected to be free is in use.
    #[error("block {0} is in use")]
    InUse(u64),
    /// The boundary tags around a block disagree.
    #[error("corrupted block at {address}: {detail}")]
    Corrupted { address: u64, detail: String },
    /// The storage does not start with a heap header.
    #[error("invalid heap header")]
    InvalidHeader,
    #[error("invalid block size {0}")]
    InvalidSize(u32),
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error("failed to parse options")]
    Config(#[from] toml::de::Error),
    #[error(transparent)]
    Pager(#[from] PagerError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn invalid_pointer(address: u64) -> impl FnOnce(PagerError) -> Self {
        move |source| Error::InvalidPointer { address, source }
    }
}
