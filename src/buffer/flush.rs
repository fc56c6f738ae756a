//! Flush engine.
//!
//! Two batch types walk two lists: LRU batches free frames from the cold
//! end of the LRU list, list batches advance the checkpoint from the oldest
//! end of the flush list. Each instance runs at most one batch per type;
//! the batch stays running until its last write completes.

use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use tracing::{debug, error, warn};

use super::descriptor::{FlushType, IoFix, PageState};
use super::doublewrite::StagedWrite;
use super::instance::{BatchState, PoolInstance};
use super::options::CorruptionPolicy;
use super::pool::{PageReadGuard, PoolShared, IO_WAIT_SLICE};
use super::stats::InstanceCounters;
use crate::backend::{IoRequest, IoStatus, IoTicket};
use crate::log::LogWait;
use crate::types::page::{self, PageCheck};
use crate::types::{BufferError, Lsn, PageKey, Result};

/// Rounds of [`PoolShared::flush_dirty_list_and_wait`] before giving up.
const CHECKPOINT_ROUNDS: usize = 100;

/// Result of an LRU batch request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlushOutcome {
    /// The batch ran and queued this many writes.
    Queued(usize),
    /// A batch of the same type was already running in the instance.
    AlreadyRunning,
}

/// Result of a flush-list pass over every instance.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ListFlush {
    /// Writes queued across instances.
    pub queued: usize,
    /// Instances skipped because a list batch was already running there.
    pub skipped_instances: usize,
}

impl ListFlush {
    /// True if some instance was skipped.
    pub fn is_partial(&self) -> bool {
        self.skipped_instances > 0
    }
}

struct Claim<'a> {
    idx: usize,
    zip_size: u32,
    newest: Lsn,
    latch: Option<PageReadGuard<'a>>,
}

impl PoolShared {
    fn start_batch(&self, inst: &PoolInstance, flush_type: FlushType) -> bool {
        let mut lru = inst.lock_lru();
        let slot = &mut lru.state().batch[flush_type.index()];
        if slot.init || slot.n_flush > 0 {
            return false;
        }
        slot.init = true;
        inst.batch_event(flush_type).reset();
        true
    }

    fn end_batch(&self, inst: &PoolInstance, flush_type: FlushType) {
        let mut lru = inst.lock_lru();
        let slot = &mut lru.state().batch[flush_type.index()];
        slot.init = false;
        if slot.n_flush == 0 {
            inst.batch_event(flush_type).set();
        }
    }

    pub(crate) fn batch_state(&self, instance: usize, flush_type: FlushType) -> BatchState {
        let mut lru = self.instances[instance].lock_lru();
        lru.state().batch[flush_type.index()].state()
    }

    /// Keys of up to `want` pages ready for a `flush_type` flush, coldest
    /// first, leaving out pages this batch already tried.
    fn flush_candidates(
        &self,
        inst: &PoolInstance,
        flush_type: FlushType,
        lsn_limit: Lsn,
        want: usize,
        tried: &FxHashSet<PageKey>,
    ) -> SmallVec<[PageKey; 32]> {
        let mut found = SmallVec::new();
        let mut lru = inst.lock_lru();
        match flush_type {
            FlushType::Lru => {
                let mut cursor = lru.state().lru.tail();
                let mut scanned = 0;
                while let Some(idx) = cursor {
                    if found.len() >= want || scanned >= self.opts.lru_scan_depth {
                        break;
                    }
                    scanned += 1;
                    let (state, page) = lru.page(idx);
                    cursor = state.lru.prev(idx);
                    if page.is_ready_for_flush(FlushType::Lru) {
                        found.extend(page.key.filter(|key| !tried.contains(key)));
                    }
                }
            }
            FlushType::List => {
                let mut both = lru.with_flush_list();
                let mut cursor = both.lists().1.tail();
                while let Some(idx) = cursor {
                    if found.len() >= want {
                        break;
                    }
                    let (_, flush, page) = both.page(idx);
                    if flush.oldest_lsn(idx) >= lsn_limit {
                        break;
                    }
                    cursor = flush.prev(idx);
                    if page.is_ready_for_flush(FlushType::List) {
                        found.extend(page.key.filter(|key| !tried.contains(key)));
                    }
                }
            }
        }
        found
    }

    /// Flushes up to `min_n` pages of one instance. The batch must have been
    /// started by the caller.
    fn flush_batch(&self, inst_id: usize, flush_type: FlushType, min_n: usize, lsn_limit: Lsn) -> usize {
        let inst = &self.instances[inst_id];
        let mut tried = FxHashSet::default();
        let mut count = 0;
        while count < min_n {
            let candidates = self.flush_candidates(inst, flush_type, lsn_limit, min_n - count, &tried);
            if candidates.is_empty() {
                break;
            }
            for key in candidates {
                if count >= min_n {
                    break;
                }
                tried.insert(key);
                count += self.try_neighbors(inst_id, key, flush_type, count, min_n);
            }
        }
        count
    }

    /// Flushes `key` together with the flushable pages of its neighborhood.
    /// Stops once `count` plus the pages flushed here reach `min_n`, but
    /// always tries `key` itself.
    fn try_neighbors(
        &self,
        inst_id: usize,
        key: PageKey,
        flush_type: FlushType,
        count: usize,
        min_n: usize,
    ) -> usize {
        let inst = &self.instances[inst_id];
        let lru_len = inst.lock_lru().state().lru.len();
        let area = if !self.opts.flush_neighbors || lru_len < self.opts.lru_old_min_len {
            1
        } else {
            (self.opts.read_ahead_area as usize)
                .min(self.opts.pages_per_instance / 16)
                .max(1) as u64
        };
        let target = key.page_no.0 as u64;
        let low = target / area * area;
        let size = self.backend().space_size(key.space).unwrap_or(0) as u64;
        let high = (low + area).min(size).max(target + 1);

        let mut flushed = 0;
        let mut i = low;
        while i < high {
            if count + flushed >= min_n {
                if i <= target {
                    i = target;
                } else {
                    break;
                }
            }
            let neighbor = key.with_page(i as u32);
            if (i == target || self.instance_of(neighbor) == inst_id)
                && self.flush_page_if_ready(inst_id, neighbor, flush_type, i == target)
            {
                flushed += 1;
            }
            i += 1;
        }
        flushed
    }

    fn claim_for_flush<'a>(
        &self,
        inst: &'a PoolInstance,
        key: PageKey,
        flush_type: FlushType,
        is_target: bool,
    ) -> Option<Claim<'a>> {
        let mut lru = inst.lock_lru();
        let idx = *lru.state().hash.get(&key)?;
        let desc = &inst.pages[idx];
        let (state, mut page) = lru.page(idx);
        if !page.is_ready_for_flush(flush_type) {
            return None;
        }
        if !is_target && (page.fix_count > 0 || (flush_type == FlushType::Lru && !state.lru.is_old(idx))) {
            return None;
        }
        // An unfixed page has no latch holders that could block us.
        let latch = match flush_type {
            FlushType::Lru => Some(desc.content.try_read()?),
            FlushType::List => None,
        };
        page.io_fix = IoFix::Write;
        page.flush_type = Some(flush_type);
        page.redirtied_at = None;
        state.batch[flush_type.index()].n_flush += 1;
        Some(Claim {
            idx,
            zip_size: page.zip_size,
            newest: page.newest_modification,
            latch,
        })
    }

    fn flush_page_if_ready(&self, inst_id: usize, key: PageKey, flush_type: FlushType, is_target: bool) -> bool {
        let inst = &self.instances[inst_id];
        let Some(claim) = self.claim_for_flush(inst, key, flush_type, is_target) else {
            return false;
        };
        let ticket = IoTicket {
            instance: inst_id,
            frame: claim.idx,
        };
        let (latch, newest) = match claim.latch {
            Some(latch) => (latch, claim.newest),
            None => {
                let latch = inst.pages[claim.idx].content.read();
                // Changes made while we waited for the latch are in the copy.
                let newest = inst.lock_page_detached(claim.idx).newest_modification;
                (latch, newest)
            }
        };
        self.write_page(ticket, key, claim.zip_size, newest, latch);
        true
    }

    fn write_page(&self, ticket: IoTicket, key: PageKey, zip_size: u32, newest: Lsn, latch: PageReadGuard<'_>) {
        if let Err(err) = self.log.force_durable_up_to(newest, LogWait::Durable) {
            drop(latch);
            self.complete_write(ticket, key, Err(err));
            return;
        }
        let image: Option<Box<[u8]>> = latch.block().map(Box::from);
        drop(latch);
        let Some(mut image) = image else {
            self.complete_write(ticket, key, Err(BufferError::Corruption("flushed frame has no block")));
            return;
        };
        page::stamp_for_write(&mut image, key, newest, self.opts.checksums);
        self.submit_write(StagedWrite {
            key,
            zip_size,
            image,
            ticket,
        });
    }

    fn submit_write(&self, write: StagedWrite) {
        if let Some(dblwr) = &self.dblwr {
            if let Err(err) = dblwr.post(self, write) {
                warn!(error = %err, "buffer.dblwr.post_failed");
            }
            return;
        }
        let StagedWrite {
            key,
            zip_size,
            image,
            ticket,
        } = write;
        self.check_outgoing(key, &image, false);
        let request = IoRequest::write(key, zip_size, image, ticket).with_completion(self.router());
        match self.backend().submit(request, false) {
            Ok(IoStatus::Queued) => {}
            Ok(IoStatus::Completed(_)) => self.complete_write(ticket, key, Ok(())),
            Err(err) => self.complete_write(ticket, key, Err(err)),
        }
    }

    /// Validates an image about to leave the pool. Under the abort policy a
    /// corrupt image never reaches the backend.
    pub(crate) fn check_outgoing(&self, key: PageKey, image: &[u8], staged: bool) {
        let PageCheck::Corrupt(reason) = page::verify(image, key) else {
            return;
        };
        match (self.opts.corruption_policy, staged) {
            (CorruptionPolicy::Abort, true) => {
                error!(key = %key, reason, "buffer.dblwr.corrupt_page");
                panic!("refusing to stage corrupt page {key}: {reason}");
            }
            (CorruptionPolicy::Abort, false) => {
                error!(key = %key, reason, "buffer.write.corrupt_page");
                panic!("refusing to write corrupt page {key}: {reason}");
            }
            (CorruptionPolicy::Tolerate, true) => warn!(key = %key, reason, "buffer.dblwr.corrupt_page"),
            (CorruptionPolicy::Tolerate, false) => warn!(key = %key, reason, "buffer.write.corrupt_page"),
        }
    }

    /// Finishes a write. A page changed while its write was in flight stays
    /// dirty, keyed by the first of those changes.
    pub(crate) fn complete_write(&self, ticket: IoTicket, key: PageKey, result: Result<()>) {
        let inst = &self.instances[ticket.instance];
        let idx = ticket.frame;
        let (flush_type, batch_over) = {
            let mut lru = inst.lock_lru();
            let mut both = lru.with_flush_list();
            let (state, flush, mut page) = both.page(idx);
            assert!(
                page.key == Some(key) && page.io_fix == IoFix::Write,
                "write completion for {key} hit a frame not under write"
            );
            let Some(flush_type) = page.flush_type.take() else {
                panic!("page {key} under write has no flush type");
            };
            let written = match &result {
                Ok(()) => {
                    match page.redirtied_at.take() {
                        Some(start) => {
                            page.oldest_modification = start;
                            flush.reposition(idx, start);
                        }
                        None => {
                            page.oldest_modification = Lsn(0);
                            flush.remove(idx);
                            if page.state == PageState::ZipDirty {
                                page.set_state(PageState::ZipPage);
                            }
                        }
                    }
                    true
                }
                Err(err) => {
                    error!(key = %key, error = %err, flush_type = flush_type.as_str(), "buffer.write.failed");
                    page.redirtied_at = None;
                    false
                }
            };
            page.io_fix = IoFix::None;
            let slot = &mut state.batch[flush_type.index()];
            slot.n_flush -= 1;
            let batch_over = slot.n_flush == 0 && !slot.init;
            if written && flush_type == FlushType::Lru {
                state.lru.make_old(idx);
                InstanceCounters::bump(&inst.counters.lru_flushed, 1);
                InstanceCounters::bump(&inst.counters.eviction_io, 1);
            }
            if written {
                InstanceCounters::bump(&inst.counters.pages_written, 1);
            }
            page.notify_io();
            (flush_type, batch_over)
        };
        if batch_over {
            inst.batch_event(flush_type).set();
        }
    }

    pub(crate) fn flush_lru(&self, inst_id: usize, min_n: usize) -> FlushOutcome {
        let inst = &self.instances[inst_id];
        if !self.start_batch(inst, FlushType::Lru) {
            return FlushOutcome::AlreadyRunning;
        }
        debug!(instance = inst_id, flush_type = "lru", min_n, "buffer.flush.batch_start");
        let queued = self.flush_batch(inst_id, FlushType::Lru, min_n, Lsn(u64::MAX));
        self.end_batch(inst, FlushType::Lru);
        self.flush_buffered_writes();
        debug!(instance = inst_id, flush_type = "lru", queued, "buffer.flush.batch_end");
        FlushOutcome::Queued(queued)
    }

    pub(crate) fn flush_dirty_list(&self, min_n: usize, lsn_limit: Lsn) -> ListFlush {
        let per_instance = min_n.div_ceil(self.instances.len());
        let mut outcome = ListFlush::default();
        for (inst_id, inst) in self.instances.iter().enumerate() {
            if !self.start_batch(inst, FlushType::List) {
                outcome.skipped_instances += 1;
                continue;
            }
            debug!(
                instance = inst_id,
                flush_type = "list",
                min_n = per_instance,
                lsn_limit = lsn_limit.0,
                "buffer.flush.batch_start"
            );
            let queued = self.flush_batch(inst_id, FlushType::List, per_instance, lsn_limit);
            self.end_batch(inst, FlushType::List);
            debug!(instance = inst_id, flush_type = "list", queued, "buffer.flush.batch_end");
            outcome.queued += queued;
        }
        self.flush_buffered_writes();
        outcome
    }

    pub(crate) fn flush_buffered_writes(&self) {
        match &self.dblwr {
            Some(dblwr) => {
                if let Err(err) = dblwr.flush_buffered(self) {
                    warn!(error = %err, "buffer.dblwr.flush_failed");
                }
            }
            None => self.backend().wake_dispatcher(),
        }
    }

    /// Waits until no batch of `flush_type` runs in any instance, or the
    /// pool shuts down.
    pub(crate) fn wait_batch_end(&self, flush_type: FlushType) {
        for inst in &self.instances {
            while !inst.batch_event(flush_type).wait_timeout(IO_WAIT_SLICE) {
                if self.is_shutdown() {
                    return;
                }
                self.backend().wake_dispatcher();
            }
        }
    }

    pub(crate) fn flush_dirty_list_and_wait(&self, lsn_limit: Lsn) -> Result<usize> {
        let mut total = 0;
        for _ in 0..CHECKPOINT_ROUNDS {
            self.check_running()?;
            total += self.flush_dirty_list(usize::MAX, lsn_limit).queued;
            self.wait_batch_end(FlushType::List);
            match self.oldest_modification() {
                Some(oldest) if oldest < lsn_limit => continue,
                _ => return Ok(total),
            }
        }
        warn!(lsn_limit = lsn_limit.0, flushed = total, "buffer.flush.checkpoint_stalled");
        Err(BufferError::Invalid("pages below the LSN limit stayed dirty"))
    }
}
