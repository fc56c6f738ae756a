#![forbid(unsafe_code)]

//! Block I/O backend consumed by the buffer pool.
//!
//! The pool never touches files directly. It hands page-sized requests to a
//! [`BlockIo`] implementation, synchronously or asynchronously, and receives
//! asynchronous completions through [`IoCompletion`].

use std::fmt;
use std::sync::Arc;

use crate::types::{PageKey, Result, SpaceId, SpaceVersion};

mod file;
mod mem;

pub use file::FileBlockIo;
pub use mem::{IoRecord, MemBlockIo, SubmitObserver};

/// Direction of a block request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IoOp {
    /// Fill the buffer from disk.
    Read,
    /// Persist the buffer to disk.
    Write,
}

/// Identifies the frame a request belongs to so its completion can be
/// routed back without a lookup.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IoTicket {
    /// Owning pool instance.
    pub instance: usize,
    /// Frame slot inside the instance.
    pub frame: usize,
}

/// Receives asynchronous completions.
pub trait IoCompletion: Send + Sync {
    /// Called exactly once per queued request, from whichever thread the
    /// backend dispatches on.
    fn io_complete(&self, request: IoRequest, result: Result<()>);
}

/// One page-sized block transfer.
pub struct IoRequest {
    /// Read or write.
    pub op: IoOp,
    /// Page addressed by the transfer.
    pub key: PageKey,
    /// Compressed page size, or 0 for an uncompressed page.
    pub zip_size: u32,
    /// Destination for reads, source for writes. Its length is the block size.
    pub buf: Box<[u8]>,
    /// Routing token for the completion.
    pub ticket: IoTicket,
    /// Completion sink for asynchronous requests.
    pub completion: Option<Arc<dyn IoCompletion>>,
}

impl IoRequest {
    /// Builds a read request for a page of `len` bytes.
    pub fn read(key: PageKey, zip_size: u32, len: usize, ticket: IoTicket) -> Self {
        Self {
            op: IoOp::Read,
            key,
            zip_size,
            buf: vec![0u8; len].into_boxed_slice(),
            ticket,
            completion: None,
        }
    }

    /// Builds a write request from an already stamped image.
    pub fn write(key: PageKey, zip_size: u32, buf: Box<[u8]>, ticket: IoTicket) -> Self {
        Self {
            op: IoOp::Write,
            key,
            zip_size,
            buf,
            ticket,
            completion: None,
        }
    }

    /// Attaches a completion sink.
    pub fn with_completion(mut self, completion: Arc<dyn IoCompletion>) -> Self {
        self.completion = Some(completion);
        self
    }

    /// Byte offset of the block inside its tablespace file.
    pub fn offset(&self) -> u64 {
        self.key.page_no.0 as u64 * self.buf.len() as u64
    }
}

impl fmt::Debug for IoRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoRequest")
            .field("op", &self.op)
            .field("key", &self.key)
            .field("zip_size", &self.zip_size)
            .field("len", &self.buf.len())
            .field("ticket", &self.ticket)
            .finish()
    }
}

/// Result of a successful submission.
pub enum IoStatus {
    /// Synchronous request finished; the request is handed back with its
    /// buffer filled (reads) or consumed (writes).
    Completed(IoRequest),
    /// Asynchronous request accepted; the completion fires later.
    Queued,
}

/// Block device abstraction keyed by (space, page).
pub trait BlockIo: Send + Sync + 'static {
    /// Submits a transfer. Synchronous requests complete before returning.
    fn submit(&self, request: IoRequest, sync: bool) -> Result<IoStatus>;
    /// Size of the tablespace in pages.
    fn space_size(&self, space: SpaceId) -> Result<u32>;
    /// Live version stamp of the tablespace, `None` if it no longer exists.
    fn space_version(&self, space: SpaceId) -> Option<SpaceVersion>;
    /// Makes every completed write to `space` durable.
    fn flush_space(&self, space: SpaceId) -> Result<()>;
    /// Nudges the asynchronous dispatcher after a burst of queued requests.
    fn wake_dispatcher(&self);
    /// Blocks until no asynchronous write is outstanding.
    fn wait_no_pending_writes(&self);
}
