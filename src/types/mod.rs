#![forbid(unsafe_code)]

//! Identifiers, errors, and the on-disk page contract shared by every
//! buffer pool component.

use std::fmt;

pub mod checksum;
pub mod page;

pub use checksum::{page_crc32, Checksum, Crc32Fast};

/// Tablespace identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SpaceId(pub u32);

/// Page number inside a tablespace.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageNo(pub u32);

/// Log sequence number. `Lsn(0)` means "never modified".
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Lsn(pub u64);

/// Tablespace version stamp captured when a read is issued.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SpaceVersion(pub u64);

/// Unique key of a cached page.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageKey {
    /// Owning tablespace.
    pub space: SpaceId,
    /// Page number within the tablespace.
    pub page_no: PageNo,
}

impl PageKey {
    /// Builds a key from raw numbers.
    pub const fn new(space: u32, page_no: u32) -> Self {
        Self {
            space: SpaceId(space),
            page_no: PageNo(page_no),
        }
    }

    /// Returns the key of another page in the same tablespace.
    pub const fn with_page(self, page_no: u32) -> Self {
        Self {
            space: self.space,
            page_no: PageNo(page_no),
        }
    }

    /// Hash used to pick the owning pool instance.
    ///
    /// Pages of one read-ahead area (64 pages) land in the same instance so
    /// area scans stay on a single structural lock.
    pub fn fold(self) -> u64 {
        let hi = (self.page_no.0 >> 6) as u64;
        (self.space.0 as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ hi.wrapping_mul(0xC2B2_AE3D)
    }
}

impl Lsn {
    /// True when this LSN marks a modified page.
    pub const fn is_set(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PageNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.space.0, self.page_no.0)
    }
}

impl From<u32> for PageNo {
    fn from(value: u32) -> Self {
        PageNo(value)
    }
}

impl From<PageNo> for u32 {
    fn from(value: PageNo) -> Self {
        value.0
    }
}

/// Errors surfaced by the buffer pool and its collaborators.
#[derive(thiserror::Error, Debug)]
pub enum BufferError {
    /// Failure reported by the block I/O backend.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// The tablespace was dropped or re-imported while work was pending.
    #[error("tablespace {space} deleted or replaced")]
    TablespaceDeleted {
        /// Tablespace that vanished.
        space: SpaceId,
    },
    /// A page image failed checksum or LSN consistency validation.
    #[error("checksum mismatch on page {key}")]
    ChecksumMismatch {
        /// Page that failed validation.
        key: PageKey,
    },
    /// Structural corruption other than a checksum failure.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an argument the pool cannot honor.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The pool or gate was shut down while the caller waited.
    #[error("shut down")]
    Shutdown,
}

impl BufferError {
    /// True for errors callers are expected to absorb by discarding work.
    pub fn is_tablespace_deleted(&self) -> bool {
        matches!(self, BufferError::TablespaceDeleted { .. })
    }

    /// Copy of the error for fanning one failure out to several waiters.
    /// I/O errors keep their kind and message but lose their source chain.
    pub fn duplicate(&self) -> Self {
        match self {
            BufferError::Io(err) => BufferError::Io(std::io::Error::new(err.kind(), err.to_string())),
            BufferError::TablespaceDeleted { space } => BufferError::TablespaceDeleted { space: *space },
            BufferError::ChecksumMismatch { key } => BufferError::ChecksumMismatch { key: *key },
            BufferError::Corruption(msg) => BufferError::Corruption(msg),
            BufferError::Invalid(msg) => BufferError::Invalid(msg),
            BufferError::Shutdown => BufferError::Shutdown,
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, BufferError>;
