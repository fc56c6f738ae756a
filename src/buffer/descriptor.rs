//! Per-frame control block.
//!
//! A descriptor carries two locks. The page lock guards the bookkeeping in
//! [`PageMeta`] and is always acquired after any structural lock of the
//! owning instance. The content latch guards the frame bytes and is only
//! taken by fixed callers, by the flush path once the page is write-fixed,
//! and by read completion while the page is read-fixed.

use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use crate::types::{Lsn, PageKey, SpaceVersion};

/// Lifecycle state of a descriptor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageState {
    /// Sitting in the free list.
    NotUsed,
    /// Taken off the free list, not yet mapped.
    ReadyForUse,
    /// Holds an uncompressed file page.
    FilePage,
    /// Holds a clean compressed page, possibly with a decoded frame.
    ZipPage,
    /// Holds a dirty compressed page, possibly with a decoded frame.
    ZipDirty,
    /// Frame lent out for internal use; never mapped.
    Memory,
    /// Being unmapped during eviction.
    RemoveHash,
}

impl PageState {
    /// States that represent a tablespace page.
    pub fn is_file_page(self) -> bool {
        matches!(
            self,
            PageState::FilePage | PageState::ZipPage | PageState::ZipDirty
        )
    }

    /// Legal transitions of the descriptor state machine.
    pub fn can_become(self, next: PageState) -> bool {
        use PageState::*;
        matches!(
            (self, next),
            (NotUsed, ReadyForUse)
                | (ReadyForUse, FilePage)
                | (ReadyForUse, ZipPage)
                | (ReadyForUse, Memory)
                | (ReadyForUse, NotUsed)
                | (Memory, NotUsed)
                | (ZipPage, ZipDirty)
                | (ZipDirty, ZipPage)
                | (FilePage, RemoveHash)
                | (ZipPage, RemoveHash)
                | (RemoveHash, NotUsed)
        )
    }
}

/// In-flight I/O on a page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IoFix {
    /// No transfer in progress.
    None,
    /// Being filled from disk; content is not yet valid.
    Read,
    /// Being written back; content may be read but not modified.
    Write,
}

/// Which flush batch wrote a page.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FlushType {
    /// Eviction-driven flush from the LRU tail.
    Lru,
    /// Checkpoint-driven flush from the flush-list tail.
    List,
}

impl FlushType {
    pub(crate) const ALL: [FlushType; 2] = [FlushType::Lru, FlushType::List];

    pub(crate) fn index(self) -> usize {
        match self {
            FlushType::Lru => 0,
            FlushType::List => 1,
        }
    }

    /// Name used in log events.
    pub fn as_str(self) -> &'static str {
        match self {
            FlushType::Lru => "lru",
            FlushType::List => "list",
        }
    }
}

/// Frame memory held by a descriptor.
pub enum PageFrame {
    /// Nothing attached.
    Empty,
    /// Compressed image only.
    CompressedOnly(Box<[u8]>),
    /// Uncompressed image only.
    Uncompressed(Box<[u8]>),
    /// Compressed image with its decoded frame attached.
    Both {
        /// Decoded frame.
        frame: Box<[u8]>,
        /// Compressed image.
        zip: Box<[u8]>,
    },
}

impl PageFrame {
    /// Uncompressed bytes, if attached.
    pub fn frame(&self) -> Option<&[u8]> {
        match self {
            PageFrame::Uncompressed(frame) | PageFrame::Both { frame, .. } => Some(frame),
            _ => None,
        }
    }

    /// Mutable uncompressed bytes, if attached.
    pub fn frame_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            PageFrame::Uncompressed(frame) | PageFrame::Both { frame, .. } => Some(frame),
            _ => None,
        }
    }

    /// Compressed bytes, if attached.
    pub fn zip(&self) -> Option<&[u8]> {
        match self {
            PageFrame::CompressedOnly(zip) | PageFrame::Both { zip, .. } => Some(zip),
            _ => None,
        }
    }

    /// Mutable compressed bytes, if attached.
    pub fn zip_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            PageFrame::CompressedOnly(zip) | PageFrame::Both { zip, .. } => Some(zip),
            _ => None,
        }
    }

    /// The image a write-back persists: the compressed image when there
    /// is one.
    pub fn block(&self) -> Option<&[u8]> {
        self.zip().or_else(|| self.frame())
    }

    pub(crate) fn block_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            PageFrame::CompressedOnly(zip) | PageFrame::Both { zip, .. } => Some(zip),
            PageFrame::Uncompressed(frame) => Some(frame),
            PageFrame::Empty => None,
        }
    }

    /// Attaches a decoded frame to a compressed-only image. Any other
    /// frame is returned unchanged in the error.
    pub(crate) fn attach_frame(self, frame: Box<[u8]>) -> Result<PageFrame, PageFrame> {
        match self {
            PageFrame::CompressedOnly(zip) => Ok(PageFrame::Both { frame, zip }),
            other => Err(other),
        }
    }

    pub(crate) fn for_block(page_size: usize, zip_size: u32) -> Self {
        if zip_size > 0 {
            PageFrame::CompressedOnly(vec![0u8; zip_size as usize].into_boxed_slice())
        } else {
            PageFrame::Uncompressed(vec![0u8; page_size].into_boxed_slice())
        }
    }
}

/// Bookkeeping guarded by the page lock.
#[derive(Debug)]
pub(crate) struct PageMeta {
    pub(crate) key: Option<PageKey>,
    pub(crate) zip_size: u32,
    pub(crate) state: PageState,
    pub(crate) io_fix: IoFix,
    pub(crate) fix_count: u32,
    pub(crate) oldest_modification: Lsn,
    pub(crate) newest_modification: Lsn,
    /// Start LSN of the first change made while a write was in flight.
    pub(crate) redirtied_at: Option<Lsn>,
    pub(crate) space_version: Option<SpaceVersion>,
    /// Logical access clock value of the first access; 0 if never accessed.
    pub(crate) access_seq: u64,
    pub(crate) first_access: Option<Instant>,
    pub(crate) flush_type: Option<FlushType>,
    pub(crate) corrupt: bool,
}

impl PageMeta {
    fn new() -> Self {
        Self {
            key: None,
            zip_size: 0,
            state: PageState::NotUsed,
            io_fix: IoFix::None,
            fix_count: 0,
            oldest_modification: Lsn(0),
            newest_modification: Lsn(0),
            redirtied_at: None,
            space_version: None,
            access_seq: 0,
            first_access: None,
            flush_type: None,
            corrupt: false,
        }
    }

    pub(crate) fn set_state(&mut self, next: PageState) {
        assert!(
            self.state.can_become(next),
            "illegal page state transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.oldest_modification.is_set()
    }

    pub(crate) fn is_accessed(&self) -> bool {
        self.access_seq != 0
    }

    /// Clean, unfixed, no I/O: may be unmapped.
    pub(crate) fn is_replaceable(&self) -> bool {
        matches!(self.state, PageState::FilePage | PageState::ZipPage)
            && self.io_fix == IoFix::None
            && self.fix_count == 0
            && !self.is_dirty()
    }

    /// Dirty and idle. LRU flushes additionally need the page unfixed.
    pub(crate) fn is_ready_for_flush(&self, flush_type: FlushType) -> bool {
        if !self.state.is_file_page() || !self.is_dirty() || self.io_fix != IoFix::None {
            return false;
        }
        match flush_type {
            FlushType::Lru => self.fix_count == 0,
            FlushType::List => true,
        }
    }

    pub(crate) fn reset(&mut self) {
        *self = PageMeta {
            state: self.state,
            ..PageMeta::new()
        };
    }
}

/// Point-in-time view of a cached page.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageInfo {
    /// Page identity.
    pub key: PageKey,
    /// Descriptor state.
    pub state: PageState,
    /// In-flight I/O.
    pub io_fix: IoFix,
    /// Outstanding fixes.
    pub fix_count: u32,
    /// LSN of the first unflushed change, 0 when clean.
    pub oldest_modification: Lsn,
    /// LSN of the latest change.
    pub newest_modification: Lsn,
    /// Whether the page sits in the old LRU sublist.
    pub old: bool,
    /// Whether the page has been accessed since it was mapped.
    pub accessed: bool,
    /// Whether the page failed validation under a tolerant policy.
    pub corrupt: bool,
}

pub(crate) struct PageDesc {
    pub(crate) idx: usize,
    meta: Mutex<PageMeta>,
    io_done: Condvar,
    pub(crate) content: RwLock<PageFrame>,
}

impl PageDesc {
    pub(crate) fn new(idx: usize) -> Self {
        Self {
            idx,
            meta: Mutex::new(PageMeta::new()),
            io_done: Condvar::new(),
            content: RwLock::new(PageFrame::Empty),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PageMeta> {
        self.meta.lock()
    }

    /// Wakes threads parked in [`PageDesc::wait_io`].
    pub(crate) fn notify_io(&self) {
        self.io_done.notify_all();
    }

    /// Parks until the next I/O state change or the timeout.
    pub(crate) fn wait_io(&self, guard: &mut MutexGuard<'_, PageMeta>, timeout: std::time::Duration) {
        let _ = self.io_done.wait_for(guard, timeout);
    }
}
