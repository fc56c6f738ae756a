//! Double-write staging.
//!
//! Page writes are collected into two contiguous reserved blocks of a
//! tablespace, written there sequentially and made durable before the
//! scattered in-place writes are issued. A crash that tears an in-place
//! write leaves an intact copy in the reserved area for
//! [`Doublewrite::recover`] to restore.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::pool::PoolShared;
use crate::backend::{BlockIo, IoRequest, IoStatus, IoTicket};
use crate::types::page::{self, PageCheck};
use crate::types::{BufferError, PageKey, Result, SpaceId};

/// A stamped page image waiting in the double-write buffer.
pub(crate) struct StagedWrite {
    pub(crate) key: PageKey,
    pub(crate) zip_size: u32,
    pub(crate) image: Box<[u8]>,
    pub(crate) ticket: IoTicket,
}

struct DblwrState {
    /// Staged writes; `staged.len()` is the first free slot.
    staged: Vec<StagedWrite>,
    /// Contiguous copy of every staged image, one page-size slot each.
    buffer: Vec<u8>,
}

/// The two reserved blocks and their staging buffer.
pub struct Doublewrite {
    space: SpaceId,
    block1: u32,
    block2: u32,
    pages_per_block: u32,
    page_size: usize,
    state: Mutex<DblwrState>,
}

const RECOVERY_TICKET: IoTicket = IoTicket {
    instance: 0,
    frame: 0,
};

impl Doublewrite {
    /// Reserves `2 * pages_per_block` pages starting at `block1` in `space`.
    pub fn new(space: SpaceId, block1: u32, pages_per_block: u32, page_size: usize) -> Self {
        let slots = 2 * pages_per_block as usize;
        Self {
            space,
            block1,
            block2: block1 + pages_per_block,
            pages_per_block,
            page_size,
            state: Mutex::new(DblwrState {
                staged: Vec::with_capacity(slots),
                buffer: vec![0u8; slots * page_size],
            }),
        }
    }

    /// Staging slots across both blocks.
    pub fn capacity(&self) -> usize {
        2 * self.pages_per_block as usize
    }

    /// Index of the next free staging slot.
    pub fn first_free(&self) -> usize {
        self.state.lock().staged.len()
    }

    /// True if `key` lies inside one of the reserved blocks.
    pub fn contains(&self, key: PageKey) -> bool {
        if key.space != self.space {
            return false;
        }
        let page_no = key.page_no.0;
        let in_block = |start: u32| page_no >= start && page_no < start + self.pages_per_block;
        in_block(self.block1) || in_block(self.block2)
    }

    fn slot_page(&self, slot: usize) -> u32 {
        let slot = slot as u32;
        if slot < self.pages_per_block {
            self.block1 + slot
        } else {
            self.block2 + slot - self.pages_per_block
        }
    }

    /// Stages one write, flushing the buffer first if it is full.
    pub(crate) fn post(&self, pool: &PoolShared, write: StagedWrite) -> Result<()> {
        loop {
            let mut state = self.state.lock();
            if state.staged.len() >= self.capacity() {
                drop(state);
                if let Err(err) = self.flush_buffered(pool) {
                    pool.complete_write(write.ticket, write.key, Err(err.duplicate()));
                    return Err(err);
                }
                continue;
            }
            pool.check_outgoing(write.key, &write.image, true);
            let slot = state.staged.len();
            let dst = &mut state.buffer[slot * self.page_size..(slot + 1) * self.page_size];
            let len = write.image.len().min(self.page_size);
            dst[..len].copy_from_slice(&write.image[..len]);
            dst[len..].fill(0);
            state.staged.push(write);
            let full = state.staged.len() == self.capacity();
            drop(state);
            if full {
                self.flush_buffered(pool)?;
            }
            return Ok(());
        }
    }

    /// Writes every staged page: first sequentially into the reserved
    /// blocks, then a sync of the reserved space, then the in-place writes,
    /// then a sync of every touched space.
    pub(crate) fn flush_buffered(&self, pool: &PoolShared) -> Result<()> {
        let backend = pool.backend();
        let mut state = self.state.lock();
        if state.staged.is_empty() {
            drop(state);
            backend.wake_dispatcher();
            return Ok(());
        }
        let staged = state.staged.len();
        if let Err(err) = self.write_reserved(backend, &state) {
            error!(error = %err, staged, "buffer.dblwr.reserved_write_failed");
            for write in state.staged.drain(..) {
                pool.complete_write(write.ticket, write.key, Err(err.duplicate()));
            }
            return Err(err);
        }
        debug!(staged, space = self.space.0, "buffer.dblwr.flush");

        let mut spaces = BTreeSet::new();
        for write in state.staged.drain(..) {
            spaces.insert(write.key.space);
            let (key, ticket) = (write.key, write.ticket);
            let request = IoRequest::write(key, write.zip_size, write.image, ticket)
                .with_completion(pool.router());
            match backend.submit(request, false) {
                Ok(IoStatus::Queued) => {}
                Ok(IoStatus::Completed(_)) => pool.complete_write(ticket, key, Ok(())),
                Err(err) => pool.complete_write(ticket, key, Err(err)),
            }
        }
        backend.wake_dispatcher();
        backend.wait_no_pending_writes();
        for space in spaces {
            if let Err(err) = backend.flush_space(space) {
                warn!(space = space.0, error = %err, "buffer.dblwr.space_sync_failed");
            }
        }
        Ok(())
    }

    fn write_reserved(&self, backend: &dyn BlockIo, state: &DblwrState) -> Result<()> {
        for slot in 0..state.staged.len() {
            let image = state.buffer[slot * self.page_size..(slot + 1) * self.page_size]
                .to_vec()
                .into_boxed_slice();
            let key = PageKey::new(self.space.0, self.slot_page(slot));
            backend.submit(IoRequest::write(key, 0, image, RECOVERY_TICKET), true)?;
        }
        backend.flush_space(self.space)
    }

    /// Restores torn or missing in-place pages from intact reserved copies.
    ///
    /// Runs before the pool serves any page. Returns the keys rewritten.
    pub fn recover(&self, backend: &dyn BlockIo) -> Result<Vec<PageKey>> {
        let mut restored = Vec::new();
        let mut spaces = BTreeSet::new();
        for slot in 0..self.capacity() {
            let reserved = PageKey::new(self.space.0, self.slot_page(slot));
            let copy = match backend.submit(
                IoRequest::read(reserved, 0, self.page_size, RECOVERY_TICKET),
                true,
            )? {
                IoStatus::Completed(request) => request.buf,
                IoStatus::Queued => continue,
            };
            if copy.iter().all(|&b| b == 0) {
                continue;
            }
            // Compressed images are staged zero-padded to a full slot.
            let Some(len) = page::block_len(&copy).filter(|&len| len <= self.page_size) else {
                continue;
            };
            let copy = &copy[..len];
            let key = PageKey::new(page::space_id(copy), page::page_no(copy));
            if page::verify(copy, key) != PageCheck::Valid {
                continue;
            }
            if backend.space_version(key.space).is_none() {
                continue;
            }
            let zip_size = if len == self.page_size { 0 } else { len as u32 };
            let current = match backend.submit(IoRequest::read(key, zip_size, len, RECOVERY_TICKET), true) {
                Ok(IoStatus::Completed(request)) => Some(request.buf),
                Ok(IoStatus::Queued) => continue,
                Err(BufferError::Corruption(reason)) => {
                    warn!(key = %key, reason, "buffer.dblwr.unreadable_page");
                    None
                }
                Err(err) => return Err(err),
            };
            let stale = match current.as_deref().map(|buf| (buf, page::verify(buf, key))) {
                Some((buf, PageCheck::Valid)) => page::page_lsn(buf) < page::page_lsn(copy),
                _ => true,
            };
            if !stale {
                continue;
            }
            let image = Box::from(copy);
            backend.submit(IoRequest::write(key, zip_size, image, RECOVERY_TICKET), true)?;
            spaces.insert(key.space);
            restored.push(key);
        }
        for space in spaces {
            backend.flush_space(space)?;
        }
        info!(restored = restored.len(), "buffer.dblwr.recovered");
        Ok(restored)
    }
}
