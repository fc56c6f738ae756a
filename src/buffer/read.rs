//! Read engine.
//!
//! Every read funnels through [`PoolShared::read_page_low`]: map a frame
//! with the page under read, submit, and validate the image on completion.
//! Read-ahead and the bulk paths are loops over it that only differ in how
//! they pick pages and how they throttle.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{debug, error, warn};

use super::descriptor::{IoFix, PageMeta};
use super::options::CorruptionPolicy;
use super::pool::{unmap, MapAs, PoolShared};
use super::stats::InstanceCounters;
use crate::backend::{IoRequest, IoStatus, IoTicket};
use crate::types::page::{self, PageCheck, PageKind};
use crate::types::{BufferError, PageKey, Result, SpaceId, SpaceVersion};

/// Poll interval of the recovery read throttle.
const RECOVERY_WAIT: Duration = Duration::from_millis(10);
/// Throttle rounds after which a stalled recovery read is reported.
const RECOVERY_STALL_ROUNDS: usize = 1000;

/// Which pages a low-level read accepts.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReadMode {
    /// Any page.
    AnyPage,
    /// Only tablespace headers and change-buffer bitmap pages; other
    /// requests are skipped.
    MetadataOnly,
}

/// One page of a change-buffer merge batch.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MergeRead {
    /// Page to read.
    pub key: PageKey,
    /// Tablespace version the buffered changes were recorded against.
    pub version: SpaceVersion,
    /// Compressed size, 0 for uncompressed pages.
    pub zip_size: u32,
}

/// Outcome of a bulk read.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BulkRead {
    /// Reads issued.
    pub queued: usize,
    /// Pages whose tablespace is gone; their pending work should be dropped.
    pub discarded: Vec<PageKey>,
}

enum ReadOutcome {
    Good { fresh: bool },
    Corrupt(&'static str),
    Failed(BufferError),
}

impl PoolShared {
    /// Issues a read of `key` unless it is resident. Returns whether a read
    /// was issued. `version`, when given, must match the live tablespace.
    pub(crate) fn read_page_low(
        &self,
        sync: bool,
        mode: ReadMode,
        key: PageKey,
        zip_size: u32,
        version: Option<SpaceVersion>,
    ) -> Result<bool> {
        self.opts.check_zip_size(zip_size)?;
        if self.is_doublewrite_page(key) {
            warn!(key = %key, "buffer.read.doublewrite_area");
            return Ok(false);
        }
        let metadata = page::is_metadata_page(key.page_no.0, self.opts.bitmap_interval(zip_size));
        if mode == ReadMode::MetadataOnly && !metadata {
            return Ok(false);
        }
        // Metadata pages sit below the change buffer in the latch order and
        // cannot complete on the dispatcher.
        let sync = sync || metadata;
        let live = self.backend().space_version(key.space);
        let version = match (live, version) {
            (Some(live), Some(expected)) if live == expected => live,
            (Some(live), None) => live,
            _ => return Err(BufferError::TablespaceDeleted { space: key.space }),
        };

        let inst_id = self.instance_of(key);
        let Some(idx) = self.map_page(inst_id, key, MapAs::Read { zip_size, version })? else {
            return Ok(false);
        };
        let ticket = IoTicket {
            instance: inst_id,
            frame: idx,
        };
        let mut request = IoRequest::read(key, zip_size, self.opts.block_size(zip_size), ticket);
        if !sync {
            request = request.with_completion(self.router());
        }
        match self.backend().submit(request, sync) {
            Ok(IoStatus::Completed(request)) => self.complete_read(ticket, key, &request.buf, Ok(()))?,
            Ok(IoStatus::Queued) => {}
            Err(err) => self.complete_read(ticket, key, &[], Err(err))?,
        }
        Ok(true)
    }

    /// Finishes a read: validates and installs the image, or releases the
    /// frame and reports why.
    pub(crate) fn complete_read(
        &self,
        ticket: IoTicket,
        key: PageKey,
        image: &[u8],
        result: Result<()>,
    ) -> Result<()> {
        let inst = &self.instances[ticket.instance];
        let expected = {
            let page = inst.lock_page_detached(ticket.frame);
            assert!(
                page.key == Some(key) && page.io_fix == IoFix::Read,
                "read completion for {key} hit a frame not under read"
            );
            page.space_version
        };
        let outcome = match result {
            Err(err) => ReadOutcome::Failed(err),
            Ok(()) if self.backend().space_version(key.space) != expected => {
                ReadOutcome::Failed(BufferError::TablespaceDeleted { space: key.space })
            }
            Ok(()) => match page::verify(image, key) {
                PageCheck::Valid => ReadOutcome::Good { fresh: false },
                PageCheck::Fresh => ReadOutcome::Good { fresh: true },
                PageCheck::Corrupt(reason) => ReadOutcome::Corrupt(reason),
            },
        };
        let tolerate = self.opts.corruption_policy == CorruptionPolicy::Tolerate;
        match outcome {
            ReadOutcome::Good { fresh } => {
                self.install_image(ticket, key, image, fresh);
                self.finish_read(ticket, false);
                Ok(())
            }
            ReadOutcome::Corrupt(reason) if tolerate => {
                warn!(key = %key, reason, "buffer.read.corrupt_page");
                self.install_image(ticket, key, image, false);
                self.finish_read(ticket, true);
                Ok(())
            }
            ReadOutcome::Failed(err) if tolerate && !err.is_tablespace_deleted() => {
                warn!(key = %key, error = %err, "buffer.read.failed_page");
                self.finish_read(ticket, true);
                Ok(())
            }
            ReadOutcome::Corrupt(reason) => {
                error!(key = %key, reason, "buffer.read.corrupt_page");
                InstanceCounters::bump(&inst.counters.corrupt_reads, 1);
                self.discard_read(ticket);
                Err(BufferError::ChecksumMismatch { key })
            }
            ReadOutcome::Failed(err) => {
                if err.is_tablespace_deleted() {
                    warn!(key = %key, "buffer.read.tablespace_deleted");
                } else {
                    error!(key = %key, error = %err, "buffer.read.failed");
                }
                self.discard_read(ticket);
                Err(err)
            }
        }
    }

    fn install_image(&self, ticket: IoTicket, key: PageKey, image: &[u8], fresh: bool) {
        let desc = &self.instances[ticket.instance].pages[ticket.frame];
        let mut content = desc.content.write();
        let Some(block) = content.block_mut() else {
            return;
        };
        if fresh {
            page::init_page(block, key, PageKind::Allocated);
        } else if image.len() == block.len() {
            block.copy_from_slice(image);
        }
    }

    fn finish_read(&self, ticket: IoTicket, corrupt: bool) {
        let inst = &self.instances[ticket.instance];
        {
            let mut lru = inst.lock_lru();
            let (_, mut page) = lru.page(ticket.frame);
            page.io_fix = IoFix::None;
            page.corrupt = corrupt;
            page.notify_io();
        }
        inst.pending_reads.fetch_sub(1, Ordering::SeqCst);
        InstanceCounters::bump(&inst.counters.pages_read, 1);
        self.notify_read_progress();
    }

    fn discard_read(&self, ticket: IoTicket) {
        let inst = &self.instances[ticket.instance];
        {
            let mut lru = inst.lock_lru();
            let (state, mut page) = lru.page(ticket.frame);
            let desc = page.desc();
            let mut content = desc.content.write();
            page.io_fix = IoFix::None;
            unmap(state, &mut page, &mut content);
            state.free.push_front(ticket.frame);
            page.notify_io();
        }
        inst.pending_reads.fetch_sub(1, Ordering::SeqCst);
        self.notify_read_progress();
    }

    fn read_ahead_allowed(&self, key: PageKey, zip_size: u32) -> bool {
        if self.is_startup() || self.is_shutdown() || self.opts.check_zip_size(zip_size).is_err() {
            return false;
        }
        if page::is_metadata_page(key.page_no.0, self.opts.bitmap_interval(zip_size)) {
            return false;
        }
        let inst = &self.instances[self.instance_of(key)];
        inst.pending_reads() <= inst.capacity() / 2
    }

    /// Runs `f` on the bookkeeping of a resident page.
    fn peek<R>(&self, key: PageKey, f: impl FnOnce(bool, &PageMeta) -> R) -> Option<R> {
        let inst = &self.instances[self.instance_of(key)];
        let mut lru = inst.lock_lru();
        let idx = *lru.state().hash.get(&key)?;
        let (state, page) = lru.page(idx);
        Some(f(state.lru.is_old(idx), &*page))
    }

    /// Issues asynchronous reads for the non-metadata pages of
    /// `low..high`. Stops at a vanished tablespace.
    fn read_area(&self, space: SpaceId, zip_size: u32, low: u32, high: u32) -> usize {
        let interval = self.opts.bitmap_interval(zip_size);
        let mut queued = 0;
        for page_no in low..high {
            if page::is_metadata_page(page_no, interval) {
                continue;
            }
            let key = PageKey::new(space.0, page_no);
            match self.read_page_low(false, ReadMode::AnyPage, key, zip_size, None) {
                Ok(true) => queued += 1,
                Ok(false) => {}
                Err(err) if err.is_tablespace_deleted() => {
                    warn!(space = space.0, page_no, "buffer.read_ahead.tablespace_deleted");
                    break;
                }
                Err(err) => debug!(key = %key, error = %err, "buffer.read_ahead.skipped"),
            }
        }
        queued
    }

    /// Area `[low, high)` around `page_no`, with `high` widened to `u64`.
    fn area_of(&self, page_no: u32) -> (u32, u64) {
        let area = self.opts.read_ahead_area;
        let low = page_no / area * area;
        (low, low as u64 + area as u64)
    }

    pub(crate) fn read_ahead_random(&self, key: PageKey, zip_size: u32) -> usize {
        if !self.random_read_ahead.load(Ordering::Relaxed) || !self.read_ahead_allowed(key, zip_size) {
            return 0;
        }
        let Ok(size) = self.backend().space_size(key.space) else {
            return 0;
        };
        let (low, high) = self.area_of(key.page_no.0);
        let high = high.min(size as u64) as u32;
        let threshold = 5 + self.opts.read_ahead_area as usize / 8;

        let recent = (low..high)
            .filter(|&page_no| {
                self.peek(key.with_page(page_no), |old, meta| meta.is_accessed() && !old)
                    .unwrap_or(false)
            })
            .count();
        if recent < threshold {
            return 0;
        }

        let queued = self.read_area(key.space, zip_size, low, high);
        self.backend().wake_dispatcher();
        if queued > 0 {
            let inst = &self.instances[self.instance_of(key)];
            InstanceCounters::bump(&inst.counters.read_ahead_random, queued as u64);
            debug!(key = %key, recent, queued, "buffer.read_ahead.random");
        }
        queued
    }

    pub(crate) fn read_ahead_linear(&self, key: PageKey, zip_size: u32) -> usize {
        let offset = key.page_no.0;
        let (low, high) = self.area_of(offset);
        if offset != low && offset as u64 != high - 1 {
            return 0;
        }
        if !self.read_ahead_allowed(key, zip_size) {
            return 0;
        }
        let Ok(size) = self.backend().space_size(key.space) else {
            return 0;
        };
        if high > size as u64 {
            return 0;
        }
        let area = self.opts.read_ahead_area;
        let threshold = 64u32.saturating_sub(self.opts.linear_read_ahead_factor).min(area);
        // Scanning downwards leaves access times that fall as page numbers
        // rise.
        let direction = if offset == low {
            CmpOrdering::Less
        } else {
            CmpOrdering::Greater
        };

        let mut failures = 0;
        let mut pred = 0u64;
        for page_no in low..high as u32 {
            let seq = self
                .peek(key.with_page(page_no), |_, meta| meta.access_seq)
                .unwrap_or(0);
            if seq == 0 {
                failures += 1;
            } else if pred != 0 {
                let order = seq.cmp(&pred);
                if order != CmpOrdering::Equal && order != direction {
                    failures += 1;
                }
            }
            if failures > threshold {
                return 0;
            }
            if seq != 0 {
                pred = seq;
            }
        }

        let Some((prev, next)) = self.sibling_links(key) else {
            return 0;
        };
        let new_offset = if offset == low && next == Some(offset.wrapping_add(1)) {
            prev
        } else if offset as u64 == high - 1 && prev == Some(offset.wrapping_sub(1)) {
            next
        } else {
            None
        };
        let Some(new_offset) = new_offset else {
            return 0;
        };
        let (new_low, new_high) = self.area_of(new_offset);
        if new_offset != new_low && new_offset as u64 != new_high - 1 {
            return 0;
        }
        if new_high > size as u64 {
            return 0;
        }

        let queued = self.read_area(key.space, zip_size, new_low, new_high as u32);
        self.backend().wake_dispatcher();
        if queued > 0 {
            let inst = &self.instances[self.instance_of(key)];
            InstanceCounters::bump(&inst.counters.read_ahead_linear, queued as u64);
            debug!(key = %key, new_low, queued, failures, "buffer.read_ahead.linear");
        }
        queued
    }

    /// Sibling links of a resident, idle page, read without waiting on its
    /// latch. Stale links only cost a useless read-ahead.
    fn sibling_links(&self, key: PageKey) -> Option<(Option<u32>, Option<u32>)> {
        let inst = &self.instances[self.instance_of(key)];
        let mut lru = inst.lock_lru();
        let idx = *lru.state().hash.get(&key)?;
        let (_, page) = lru.page(idx);
        if page.io_fix == IoFix::Read {
            return None;
        }
        let content = page.desc().content.try_read()?;
        let block = content.block()?;
        Some((page::prev_page(block), page::next_page(block)))
    }

    pub(crate) fn read_ibuf_merge_pages(&self, sync: bool, reads: &[MergeRead]) -> Result<BulkRead> {
        for read in reads {
            self.opts.check_zip_size(read.zip_size)?;
        }
        let mut outcome = BulkRead::default();
        let wait = Duration::from_millis(self.opts.bulk_read_wait_ms);
        for (i, read) in reads.iter().enumerate() {
            let inst = &self.instances[self.instance_of(read.key)];
            while inst.pending_reads() > inst.capacity() / 4 {
                self.check_running()?;
                self.backend().wake_dispatcher();
                self.wait_read_progress(wait);
            }
            let last = i + 1 == reads.len();
            match self.read_page_low(
                sync && last,
                ReadMode::AnyPage,
                read.key,
                read.zip_size,
                Some(read.version),
            ) {
                Ok(true) => outcome.queued += 1,
                Ok(false) => {}
                Err(err) if err.is_tablespace_deleted() => outcome.discarded.push(read.key),
                Err(err) => return Err(err),
            }
        }
        self.backend().wake_dispatcher();
        debug!(
            requested = reads.len(),
            queued = outcome.queued,
            discarded = outcome.discarded.len(),
            "buffer.read.ibuf_merge"
        );
        Ok(outcome)
    }

    fn total_pending_reads(&self) -> usize {
        self.instances.iter().map(|inst| inst.pending_reads()).sum()
    }

    pub(crate) fn read_recovery_pages(
        &self,
        sync: bool,
        space: SpaceId,
        zip_size: u32,
        page_nos: &[u32],
    ) -> Result<BulkRead> {
        self.opts.check_zip_size(zip_size)?;
        let mut outcome = BulkRead::default();
        let limit = (self.opts.recovery_free_frames / 2).max(1);
        for (i, &page_no) in page_nos.iter().enumerate() {
            let mut rounds = 0;
            while self.total_pending_reads() >= limit {
                self.check_running()?;
                self.backend().wake_dispatcher();
                self.wait_read_progress(RECOVERY_WAIT);
                rounds += 1;
                if rounds > RECOVERY_STALL_ROUNDS {
                    error!(
                        pending = self.total_pending_reads(),
                        limit,
                        "buffer.read.recovery_stalled"
                    );
                    rounds = 0;
                }
            }
            let key = PageKey::new(space.0, page_no);
            let last = i + 1 == page_nos.len();
            match self.read_page_low(sync && last, ReadMode::AnyPage, key, zip_size, None) {
                Ok(true) => outcome.queued += 1,
                Ok(false) => {}
                Err(err) if err.is_tablespace_deleted() => outcome.discarded.push(key),
                Err(err) => return Err(err),
            }
        }
        self.backend().wake_dispatcher();
        debug!(
            space = space.0,
            requested = page_nos.len(),
            queued = outcome.queued,
            "buffer.read.recovery"
        );
        Ok(outcome)
    }
}
