use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use super::descriptor::{FlushType, IoFix, PageFrame, PageInfo, PageState};
use super::doublewrite::Doublewrite;
use super::flush::{FlushOutcome, ListFlush};
use super::flush_rate::FlushRateController;
use super::instance::{BatchState, LruGuard, LruState, PageGuard, PoolInstance};
use super::options::BufferPoolOptions;
use super::read::{BulkRead, MergeRead, ReadMode};
use super::stats::{InstanceCounters, PoolStats};
use crate::backend::{BlockIo, IoCompletion, IoOp, IoRequest};
use crate::log::RedoLog;
use crate::types::page::{self, PageKind};
use crate::types::{BufferError, Lsn, PageKey, Result, SpaceId, SpaceVersion};

/// Rounds of evict-or-flush before a frame request gives up.
const FREE_BLOCK_ATTEMPTS: usize = 64;
/// Pages an allocation-driven LRU batch tries to write.
const FREE_BLOCK_FLUSH_BATCH: usize = 32;
/// Upper bound of one wait for another thread's read.
pub(crate) const IO_WAIT_SLICE: Duration = Duration::from_millis(100);

/// Shared read-only guard over a page frame.
pub type PageReadGuard<'a> = RwLockReadGuard<'a, PageFrame>;
/// Exclusive guard over a page frame.
pub type PageWriteGuard<'a> = RwLockWriteGuard<'a, PageFrame>;

pub(crate) enum MapAs {
    Read {
        zip_size: u32,
        version: SpaceVersion,
    },
    Create {
        version: SpaceVersion,
    },
}

pub(crate) enum FixAttempt {
    Fixed { idx: usize, first_access: bool },
    Busy(usize),
    Missing,
}

/// State shared by the pool handle, page handles and I/O completions.
pub(crate) struct PoolShared {
    pub(crate) opts: BufferPoolOptions,
    pub(crate) instances: Vec<PoolInstance>,
    backend: Arc<dyn BlockIo>,
    pub(crate) log: Arc<dyn RedoLog>,
    pub(crate) dblwr: Option<Doublewrite>,
    flush_rate: Mutex<FlushRateController>,
    router: Arc<dyn IoCompletion>,
    shutdown: AtomicBool,
    startup: AtomicBool,
    pub(crate) random_read_ahead: AtomicBool,
    access_clock: AtomicU64,
    read_progress: Mutex<()>,
    read_done: Condvar,
}

/// Routes asynchronous completions back to the pool without keeping it
/// alive.
struct CompletionRouter(Weak<PoolShared>);

impl IoCompletion for CompletionRouter {
    fn io_complete(&self, request: IoRequest, result: Result<()>) {
        let Some(pool) = self.0.upgrade() else {
            return;
        };
        match request.op {
            IoOp::Read => {
                // Failures are logged and the frame released inside.
                let _ = pool.complete_read(request.ticket, request.key, &request.buf, result);
            }
            IoOp::Write => pool.complete_write(request.ticket, request.key, result),
        }
    }
}

impl PoolShared {
    pub(crate) fn backend(&self) -> &dyn BlockIo {
        &*self.backend
    }

    pub(crate) fn router(&self) -> Arc<dyn IoCompletion> {
        Arc::clone(&self.router)
    }

    pub(crate) fn instance_of(&self, key: PageKey) -> usize {
        (key.fold() % self.instances.len() as u64) as usize
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn is_startup(&self) -> bool {
        self.startup.load(Ordering::SeqCst)
    }

    pub(crate) fn check_running(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(BufferError::Shutdown);
        }
        Ok(())
    }

    pub(crate) fn is_doublewrite_page(&self, key: PageKey) -> bool {
        self.dblwr.as_ref().is_some_and(|d| d.contains(key))
    }

    /// Wakes bulk readers throttled on pending reads.
    pub(crate) fn notify_read_progress(&self) {
        let _guard = self.read_progress.lock();
        self.read_done.notify_all();
    }

    /// Parks a throttled bulk reader until a read completes or `timeout`.
    pub(crate) fn wait_read_progress(&self, timeout: Duration) {
        let mut guard = self.read_progress.lock();
        let _ = self.read_done.wait_for(&mut guard, timeout);
    }

    fn next_access(&self) -> u64 {
        self.access_clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Maps `key` into a frame, evicting or flushing as needed. Returns
    /// `None` when the page is already resident.
    pub(crate) fn map_page(&self, inst_id: usize, key: PageKey, how: MapAs) -> Result<Option<usize>> {
        let inst = &self.instances[inst_id];
        for attempt in 0..FREE_BLOCK_ATTEMPTS {
            {
                let mut lru = inst.lock_lru();
                if lru.state().hash.contains_key(&key) {
                    return Ok(None);
                }
                if let Some(idx) = self.take_free_block(inst, &mut lru) {
                    self.install(inst, &mut lru, idx, key, &how);
                    return Ok(Some(idx));
                }
            }
            self.make_room(inst_id, attempt)?;
        }
        warn!(instance = inst_id, key = %key, "buffer.free_block.exhausted");
        Err(BufferError::Invalid("buffer pool exhausted"))
    }

    /// Lends a free frame for internal use. The frame never enters the
    /// page hash or the LRU and goes back to the free list on release.
    pub(crate) fn alloc_block(&self) -> Result<(usize, usize)> {
        let inst_id = self.next_access() as usize % self.instances.len();
        let inst = &self.instances[inst_id];
        for attempt in 0..FREE_BLOCK_ATTEMPTS {
            {
                let mut lru = inst.lock_lru();
                if let Some(idx) = self.take_free_block(inst, &mut lru) {
                    let (_, mut page) = lru.page(idx);
                    let mut content = page.desc().content.write();
                    *content = PageFrame::for_block(self.opts.page_size, 0);
                    page.set_state(PageState::Memory);
                    return Ok((inst_id, idx));
                }
            }
            self.make_room(inst_id, attempt)?;
        }
        warn!(instance = inst_id, "buffer.free_block.exhausted");
        Err(BufferError::Invalid("buffer pool exhausted"))
    }

    fn free_block(&self, inst_id: usize, idx: usize) {
        let mut lru = self.instances[inst_id].lock_lru();
        let (state, mut page) = lru.page(idx);
        let mut content = page.desc().content.write();
        *content = PageFrame::Empty;
        page.set_state(PageState::NotUsed);
        page.reset();
        state.free.push_front(idx);
    }

    fn take_free_block(&self, inst: &PoolInstance, lru: &mut LruGuard<'_>) -> Option<usize> {
        if let Some(idx) = lru.state().free.pop_front() {
            let (_, mut page) = lru.page(idx);
            page.set_state(PageState::ReadyForUse);
            return Some(idx);
        }
        let mut cursor = lru.state().lru.tail();
        let mut scanned = 0;
        while let Some(idx) = cursor {
            if scanned >= self.opts.lru_scan_depth {
                break;
            }
            scanned += 1;
            let (state, mut page) = lru.page(idx);
            cursor = state.lru.prev(idx);
            if !page.is_replaceable() {
                continue;
            }
            let desc = page.desc();
            let Some(mut content) = desc.content.try_write() else {
                continue;
            };
            let victim = page.key;
            unmap(state, &mut page, &mut content);
            page.set_state(PageState::ReadyForUse);
            InstanceCounters::bump(&inst.counters.evictions, 1);
            if let Some(victim) = victim {
                debug!(key = %victim, instance = inst.id, "buffer.lru.evict");
            }
            return Some(idx);
        }
        None
    }

    fn install(&self, inst: &PoolInstance, lru: &mut LruGuard<'_>, idx: usize, key: PageKey, how: &MapAs) {
        let access = self.next_access();
        let (state, mut page) = lru.page(idx);
        let mut content = page.desc().content.write();
        page.key = Some(key);
        match *how {
            MapAs::Read { zip_size, version } => {
                *content = PageFrame::for_block(self.opts.page_size, zip_size);
                page.set_state(if zip_size > 0 {
                    PageState::ZipPage
                } else {
                    PageState::FilePage
                });
                page.zip_size = zip_size;
                page.space_version = Some(version);
                page.io_fix = IoFix::Read;
                inst.pending_reads.fetch_add(1, Ordering::SeqCst);
                state.lru.add(idx, true);
            }
            MapAs::Create { version } => {
                let mut frame = PageFrame::for_block(self.opts.page_size, 0);
                if let Some(buf) = frame.frame_mut() {
                    page::init_page(buf, key, PageKind::Allocated);
                }
                *content = frame;
                page.set_state(PageState::FilePage);
                page.space_version = Some(version);
                page.fix_count = 1;
                page.access_seq = access;
                page.first_access = Some(Instant::now());
                state.lru.add(idx, false);
            }
        }
        state.hash.insert(key, idx);
    }

    fn make_room(&self, inst_id: usize, attempt: usize) -> Result<()> {
        self.check_running()?;
        self.backend.wake_dispatcher();
        let inst = &self.instances[inst_id];
        match self.flush_lru(inst_id, FREE_BLOCK_FLUSH_BATCH) {
            FlushOutcome::AlreadyRunning => {
                inst.batch_event(FlushType::Lru)
                    .wait_timeout(Duration::from_millis(10));
            }
            FlushOutcome::Queued(0) => {
                if attempt > 0 {
                    thread::sleep(Duration::from_millis(1));
                }
            }
            FlushOutcome::Queued(_) => {
                inst.batch_event(FlushType::Lru)
                    .wait_timeout(IO_WAIT_SLICE);
            }
        }
        Ok(())
    }

    pub(crate) fn try_fix(&self, inst: &PoolInstance, key: PageKey) -> FixAttempt {
        let mut lru = inst.lock_lru();
        let Some(&idx) = lru.state().hash.get(&key) else {
            return FixAttempt::Missing;
        };
        let (state, mut page) = lru.page(idx);
        if page.io_fix == IoFix::Read {
            return FixAttempt::Busy(idx);
        }
        page.fix_count += 1;
        let first_access = !page.is_accessed();
        let too_old = state.lru.is_old(idx)
            && match self.opts.lru_old_threshold_ms {
                0 => true,
                ms => page
                    .first_access
                    .is_some_and(|at| at.elapsed() >= Duration::from_millis(ms)),
            };
        if first_access {
            page.access_seq = self.next_access();
            page.first_access = Some(Instant::now());
        }
        if too_old {
            state.lru.make_young(idx);
            InstanceCounters::bump(&inst.counters.made_young, 1);
        }
        FixAttempt::Fixed { idx, first_access }
    }

    /// Blocks until the read of `key` in frame `idx` is over.
    pub(crate) fn wait_for_read(&self, inst: &PoolInstance, idx: usize, key: PageKey) -> Result<()> {
        self.backend.wake_dispatcher();
        let mut page = inst.lock_page_detached(idx);
        while page.key == Some(key) && page.io_fix == IoFix::Read {
            self.check_running()?;
            page.wait_io(IO_WAIT_SLICE);
        }
        Ok(())
    }

    pub(crate) fn get_page(&self, key: PageKey, zip_size: u32) -> Result<PageHandle<'_>> {
        self.opts.check_zip_size(zip_size)?;
        if self.is_doublewrite_page(key) {
            return Err(BufferError::Invalid("page belongs to the double-write area"));
        }
        let inst_id = self.instance_of(key);
        let inst = &self.instances[inst_id];
        let mut misses = 0;
        loop {
            self.check_running()?;
            match self.try_fix(inst, key) {
                FixAttempt::Fixed { idx, first_access } => {
                    let handle = PageHandle {
                        pool: self,
                        instance: inst_id,
                        idx,
                        key,
                    };
                    if first_access {
                        self.read_ahead_linear(key, zip_size);
                    }
                    return Ok(handle);
                }
                FixAttempt::Busy(idx) => self.wait_for_read(inst, idx, key)?,
                FixAttempt::Missing => {
                    misses += 1;
                    if misses > FREE_BLOCK_ATTEMPTS {
                        return Err(BufferError::Corruption("page keeps disappearing after read"));
                    }
                    if self.random_read_ahead.load(Ordering::Relaxed) {
                        self.read_ahead_random(key, zip_size);
                    }
                    self.read_page_low(true, ReadMode::AnyPage, key, zip_size, None)?;
                }
            }
        }
    }

    pub(crate) fn try_get_page(&self, key: PageKey) -> Option<PageHandle<'_>> {
        let inst_id = self.instance_of(key);
        match self.try_fix(&self.instances[inst_id], key) {
            FixAttempt::Fixed { idx, .. } => Some(PageHandle {
                pool: self,
                instance: inst_id,
                idx,
                key,
            }),
            FixAttempt::Busy(_) | FixAttempt::Missing => None,
        }
    }

    pub(crate) fn create_page(&self, key: PageKey) -> Result<PageHandle<'_>> {
        if self.is_doublewrite_page(key) {
            return Err(BufferError::Invalid("page belongs to the double-write area"));
        }
        let version = self
            .backend
            .space_version(key.space)
            .ok_or(BufferError::TablespaceDeleted { space: key.space })?;
        let inst_id = self.instance_of(key);
        let inst = &self.instances[inst_id];
        loop {
            self.check_running()?;
            if let Some(idx) = self.map_page(inst_id, key, MapAs::Create { version })? {
                InstanceCounters::bump(&inst.counters.pages_created, 1);
                return Ok(PageHandle {
                    pool: self,
                    instance: inst_id,
                    idx,
                    key,
                });
            }
            match self.try_fix(inst, key) {
                FixAttempt::Fixed { idx, .. } => {
                    return Ok(PageHandle {
                        pool: self,
                        instance: inst_id,
                        idx,
                        key,
                    })
                }
                FixAttempt::Busy(idx) => self.wait_for_read(inst, idx, key)?,
                FixAttempt::Missing => {}
            }
        }
    }

    fn mark_dirty(&self, inst_id: usize, idx: usize, start: Lsn, end: Lsn) {
        assert!(
            start.is_set() && start <= end,
            "modification range {start}..{end} is not a valid LSN range"
        );
        let inst = &self.instances[inst_id];
        let mut fl = inst.lock_flush_list();
        let (list, mut page) = fl.page(idx);
        assert!(page.fix_count > 0, "modifying an unfixed page");
        if end > page.newest_modification {
            page.newest_modification = end;
        }
        if !page.is_dirty() {
            page.oldest_modification = start;
            list.insert(idx, start);
            if page.state == PageState::ZipPage {
                page.set_state(PageState::ZipDirty);
            }
        } else if page.io_fix == IoFix::Write && page.redirtied_at.is_none() {
            page.redirtied_at = Some(start);
        }
    }

    fn unfix(&self, inst_id: usize, idx: usize) {
        let mut page = self.instances[inst_id].lock_page_detached(idx);
        assert!(page.fix_count > 0, "unfixing a page with no fixes");
        page.fix_count -= 1;
    }

    fn info_of(&self, lru: &mut LruGuard<'_>, idx: usize) -> Option<PageInfo> {
        let (state, page) = lru.page(idx);
        Some(PageInfo {
            key: page.key?,
            state: page.state,
            io_fix: page.io_fix,
            fix_count: page.fix_count,
            oldest_modification: page.oldest_modification,
            newest_modification: page.newest_modification,
            old: state.lru.is_old(idx),
            accessed: page.is_accessed(),
            corrupt: page.corrupt,
        })
    }

    pub(crate) fn lookup(&self, key: PageKey) -> Option<PageInfo> {
        let inst = &self.instances[self.instance_of(key)];
        let mut lru = inst.lock_lru();
        let idx = *lru.state().hash.get(&key)?;
        self.info_of(&mut lru, idx)
    }

    pub(crate) fn try_evict(&self, key: PageKey) -> bool {
        let inst = &self.instances[self.instance_of(key)];
        let mut lru = inst.lock_lru();
        let Some(&idx) = lru.state().hash.get(&key) else {
            return false;
        };
        evict_frame(&mut lru, idx)
    }

    pub(crate) fn evict_space(&self, space: SpaceId) -> usize {
        let mut evicted = 0;
        for inst in &self.instances {
            let mut lru = inst.lock_lru();
            let frames: Vec<usize> = lru
                .state()
                .hash
                .iter()
                .filter(|(key, _)| key.space == space)
                .map(|(_, &idx)| idx)
                .collect();
            for idx in frames {
                if evict_frame(&mut lru, idx) {
                    evicted += 1;
                }
            }
        }
        debug!(space = space.0, evicted, "buffer.evict_space");
        evicted
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            capacity: self.opts.capacity(),
            ..PoolStats::default()
        };
        for inst in &self.instances {
            {
                let mut lru = inst.lock_lru();
                let state = lru.state();
                stats.free += state.free.len();
                stats.lru_len += state.lru.len();
                stats.old_len += state.lru.old_len();
            }
            stats.dirty += inst.lock_flush_list().state().len();
            stats.pending_reads += inst.pending_reads();
            stats.absorb(&inst.counters);
        }
        stats
    }

    /// Checks the directory, list and flush-list invariants of every
    /// instance.
    pub(crate) fn validate(&self) -> Result<()> {
        for inst in &self.instances {
            let mut lru = inst.lock_lru();
            let mut both = lru.with_flush_list();
            for idx in 0..inst.capacity() {
                let (state, flush, page) = both.page(idx);
                if page.is_dirty() != flush.contains(idx) {
                    return Err(BufferError::Corruption("dirty page outside the flush list"));
                }
                if page.is_dirty() && flush.oldest_lsn(idx) != page.oldest_modification {
                    return Err(BufferError::Corruption("flush list key out of date"));
                }
                if (page.state == PageState::NotUsed) != state.free.contains(idx) {
                    return Err(BufferError::Corruption("free list membership mismatch"));
                }
                let mapped = page.state.is_file_page();
                if mapped != state.lru.contains(idx) {
                    return Err(BufferError::Corruption("LRU membership mismatch"));
                }
                let hashed = page.key.and_then(|key| state.hash.get(&key).copied());
                if mapped != (hashed == Some(idx)) {
                    return Err(BufferError::Corruption("page hash mismatch"));
                }
            }
            let (state, flush) = both.lists();
            if !state.lru.validate() {
                return Err(BufferError::Corruption("LRU old sublist inconsistent"));
            }
            if !flush.is_ordered() {
                return Err(BufferError::Corruption("flush list out of order"));
            }
        }
        Ok(())
    }

    pub(crate) fn lru_flushed_total(&self) -> u64 {
        self.stats().lru_flushed
    }

    pub(crate) fn dirty_pages(&self) -> usize {
        self.instances
            .iter()
            .map(|inst| inst.lock_flush_list().state().len())
            .sum()
    }

    /// Smallest oldest-modification across all flush lists.
    pub(crate) fn oldest_modification(&self) -> Option<Lsn> {
        self.instances
            .iter()
            .filter_map(|inst| inst.lock_flush_list().state().min_lsn())
            .min()
    }
}

/// Unmaps a page: out of the hash and LRU, frame dropped, state reset.
pub(crate) fn unmap(state: &mut LruState, page: &mut PageGuard<'_>, content: &mut PageFrame) {
    let idx = page.desc().idx;
    if let Some(key) = page.key {
        state.hash.remove(&key);
    }
    if state.lru.contains(idx) {
        state.lru.remove(idx);
    }
    page.set_state(PageState::RemoveHash);
    *content = PageFrame::Empty;
    page.set_state(PageState::NotUsed);
    page.reset();
}

fn evict_frame(lru: &mut LruGuard<'_>, idx: usize) -> bool {
    let (state, mut page) = lru.page(idx);
    if !page.is_replaceable() {
        return false;
    }
    let desc = page.desc();
    let Some(mut content) = desc.content.try_write() else {
        return false;
    };
    unmap(state, &mut page, &mut content);
    state.free.push_front(idx);
    true
}

/// A fixed page. The page stays resident until the handle is dropped.
pub struct PageHandle<'p> {
    pool: &'p PoolShared,
    instance: usize,
    idx: usize,
    key: PageKey,
}

impl<'p> PageHandle<'p> {
    /// Identity of the page.
    pub fn key(&self) -> PageKey {
        self.key
    }

    /// Shared latch on the frame.
    pub fn read(&self) -> PageReadGuard<'p> {
        self.pool.instances[self.instance].pages[self.idx].content.read()
    }

    /// Exclusive latch on the frame. Pair every change with
    /// [`PageHandle::mark_dirty`] before releasing it.
    pub fn write(&self) -> PageWriteGuard<'p> {
        self.pool.instances[self.instance].pages[self.idx].content.write()
    }

    /// Records a change logged in `start..=end`.
    pub fn mark_dirty(&self, start: Lsn, end: Lsn) {
        self.pool.mark_dirty(self.instance, self.idx, start, end);
    }

    /// Attaches a decoded uncompressed frame to a compressed page. Write-back
    /// keeps persisting the compressed image.
    pub fn attach_frame(&self, frame: Box<[u8]>) -> Result<()> {
        if frame.len() != self.pool.opts.page_size {
            return Err(BufferError::Invalid("decoded frame must be one page long"));
        }
        let mut content = self.write();
        let current = std::mem::replace(&mut *content, PageFrame::Empty);
        match current.attach_frame(frame) {
            Ok(both) => {
                *content = both;
                Ok(())
            }
            Err(unchanged) => {
                *content = unchanged;
                Err(BufferError::Invalid("page has no compressed-only image"))
            }
        }
    }

    /// Current bookkeeping of the page.
    pub fn info(&self) -> PageInfo {
        let mut lru = self.pool.instances[self.instance].lock_lru();
        match self.pool.info_of(&mut lru, self.idx) {
            Some(info) => info,
            None => panic!("fixed page {} lost its mapping", self.key),
        }
    }
}

impl Drop for PageHandle<'_> {
    fn drop(&mut self) {
        self.pool.unfix(self.instance, self.idx);
    }
}

/// A frame lent out of the pool for internal use. Returned to the free
/// list on drop.
pub struct MemoryBlock<'p> {
    pool: &'p PoolShared,
    instance: usize,
    idx: usize,
}

impl MemoryBlock<'_> {
    /// Shared latch on the frame.
    pub fn read(&self) -> PageReadGuard<'_> {
        self.pool.instances[self.instance].pages[self.idx].content.read()
    }

    /// Exclusive latch on the frame.
    pub fn write(&self) -> PageWriteGuard<'_> {
        self.pool.instances[self.instance].pages[self.idx].content.write()
    }
}

impl Drop for MemoryBlock<'_> {
    fn drop(&mut self) {
        self.pool.free_block(self.instance, self.idx);
    }
}

/// A page cache over a [`BlockIo`] backend, split into independently
/// locked instances.
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Creates a pool with every frame free.
    pub fn new(
        opts: BufferPoolOptions,
        backend: Arc<dyn BlockIo>,
        log: Arc<dyn RedoLog>,
    ) -> Result<Self> {
        opts.validate()?;
        let shared = Arc::new_cyclic(|weak: &Weak<PoolShared>| {
            let dblwr = opts.doublewrite.then(|| {
                Doublewrite::new(
                    SpaceId(opts.doublewrite_space),
                    opts.doublewrite_block1,
                    opts.doublewrite_pages,
                    opts.page_size,
                )
            });
            PoolShared {
                instances: (0..opts.instances)
                    .map(|id| PoolInstance::new(id, &opts))
                    .collect(),
                dblwr,
                flush_rate: Mutex::new(FlushRateController::new(opts.flush_rate_window)),
                router: Arc::new(CompletionRouter(weak.clone())),
                shutdown: AtomicBool::new(false),
                startup: AtomicBool::new(false),
                random_read_ahead: AtomicBool::new(opts.random_read_ahead),
                access_clock: AtomicU64::new(0),
                read_progress: Mutex::new(()),
                read_done: Condvar::new(),
                backend,
                log,
                opts,
            }
        });
        info!(
            instances = shared.opts.instances,
            frames = shared.opts.capacity(),
            page_size = shared.opts.page_size,
            doublewrite = shared.opts.doublewrite,
            "buffer.pool.open"
        );
        Ok(Self { shared })
    }

    /// Options the pool was built with.
    pub fn options(&self) -> &BufferPoolOptions {
        &self.shared.opts
    }

    /// Instance owning `key`.
    pub fn instance_of(&self, key: PageKey) -> usize {
        self.shared.instance_of(key)
    }

    /// Fixes an uncompressed page, reading it on a miss.
    pub fn get_page(&self, key: PageKey) -> Result<PageHandle<'_>> {
        self.shared.get_page(key, 0)
    }

    /// Fixes a compressed page of `zip_size` bytes, reading it on a miss.
    pub fn get_compressed_page(&self, key: PageKey, zip_size: u32) -> Result<PageHandle<'_>> {
        self.shared.get_page(key, zip_size)
    }

    /// Fixes a resident page without I/O.
    pub fn try_get_page(&self, key: PageKey) -> Option<PageHandle<'_>> {
        self.shared.try_get_page(key)
    }

    /// Borrows a free frame for internal use, evicting if needed.
    pub fn alloc_block(&self) -> Result<MemoryBlock<'_>> {
        self.shared.check_running()?;
        let (instance, idx) = self.shared.alloc_block()?;
        Ok(MemoryBlock {
            pool: &self.shared,
            instance,
            idx,
        })
    }

    /// Maps a brand new page without reading it.
    pub fn create_page(&self, key: PageKey) -> Result<PageHandle<'_>> {
        self.shared.create_page(key)
    }

    /// Bookkeeping of a resident page.
    pub fn lookup(&self, key: PageKey) -> Option<PageInfo> {
        self.shared.lookup(key)
    }

    /// Unmaps a page if it is clean, unfixed and idle.
    pub fn try_evict(&self, key: PageKey) -> bool {
        self.shared.try_evict(key)
    }

    /// Unmaps every replaceable page of a tablespace.
    pub fn evict_space(&self, space: SpaceId) -> usize {
        self.shared.evict_space(space)
    }

    /// Issues a single page read. Returns whether a read was queued.
    pub fn read_page(&self, sync: bool, mode: ReadMode, key: PageKey, zip_size: u32) -> Result<bool> {
        self.shared.read_page_low(sync, mode, key, zip_size, None)
    }

    /// Random read-ahead around `key`. Returns pages queued.
    pub fn read_ahead_random(&self, key: PageKey, zip_size: u32) -> usize {
        self.shared.read_ahead_random(key, zip_size)
    }

    /// Linear read-ahead from the border page `key`. Returns pages queued.
    pub fn read_ahead_linear(&self, key: PageKey, zip_size: u32) -> usize {
        self.shared.read_ahead_linear(key, zip_size)
    }

    /// Reads pages with pending buffered changes.
    pub fn read_ibuf_merge_pages(&self, sync: bool, reads: &[MergeRead]) -> Result<BulkRead> {
        self.shared.read_ibuf_merge_pages(sync, reads)
    }

    /// Reads pages named by redo records during recovery.
    pub fn read_recovery_pages(
        &self,
        sync: bool,
        space: SpaceId,
        zip_size: u32,
        page_nos: &[u32],
    ) -> Result<BulkRead> {
        self.shared.read_recovery_pages(sync, space, zip_size, page_nos)
    }

    /// Runs an LRU flush batch in one instance.
    pub fn flush_lru(&self, instance: usize, min_n: usize) -> FlushOutcome {
        self.shared.flush_lru(instance, min_n)
    }

    /// Runs flush-list batches in every instance.
    pub fn flush_dirty_list(&self, min_n: usize, lsn_limit: Lsn) -> ListFlush {
        self.shared.flush_dirty_list(min_n, lsn_limit)
    }

    /// Flushes until no page modified before `lsn_limit` stays dirty.
    pub fn flush_dirty_list_and_wait(&self, lsn_limit: Lsn) -> Result<usize> {
        self.shared.flush_dirty_list_and_wait(lsn_limit)
    }

    /// Blocks until no batch of `flush_type` runs in any instance.
    pub fn wait_flush_batch_end(&self, flush_type: FlushType) {
        self.shared.wait_batch_end(flush_type);
    }

    /// Progress of the `flush_type` batch in `instance`.
    pub fn batch_state(&self, instance: usize, flush_type: FlushType) -> BatchState {
        self.shared.batch_state(instance, flush_type)
    }

    /// Pushes staged double-write pages to disk.
    pub fn flush_buffered_writes(&self) {
        self.shared.flush_buffered_writes();
    }

    /// Closes a flush-rate sampling interval.
    pub fn record_flush_interval(&self) {
        let lru_flushed = self.shared.lru_flushed_total();
        let lsn = self.shared.log.current_lsn();
        self.shared.flush_rate.lock().record_interval(lsn, lru_flushed);
    }

    /// Pages the list flusher should write in the next interval.
    pub fn desired_flush_rate(&self) -> u64 {
        let shared = &self.shared;
        let dirty = shared.dirty_pages();
        let lru_flushed = shared.lru_flushed_total();
        let lsn = shared.log.current_lsn();
        shared
            .flush_rate
            .lock()
            .desired_flush_rate(dirty, lsn, lru_flushed, shared.log.log_capacity())
    }

    /// Keeps flush lists sorted on insert even when modifications arrive
    /// out of LSN order, as during redo application.
    pub fn set_recovery_flush_order(&self, on: bool) {
        for inst in &self.shared.instances {
            inst.lock_flush_list().state().set_recovery_order(on);
        }
    }

    /// Turns random read-ahead on or off.
    pub fn set_random_read_ahead(&self, on: bool) {
        self.shared.random_read_ahead.store(on, Ordering::Relaxed);
    }

    /// While set, read-ahead is suppressed.
    pub fn set_startup_phase(&self, on: bool) {
        self.shared.startup.store(on, Ordering::SeqCst);
    }

    /// Smallest oldest-modification of any dirty page.
    pub fn oldest_modification(&self) -> Option<Lsn> {
        self.shared.oldest_modification()
    }

    /// Activity counters and list lengths.
    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// Checks internal invariants; meant for tests and diagnostics.
    pub fn validate(&self) -> Result<()> {
        self.shared.validate()
    }

    /// The double-write buffer, when enabled.
    pub fn doublewrite(&self) -> Option<&Doublewrite> {
        self.shared.dblwr.as_ref()
    }

    /// Restores torn pages from the double-write area. Call before serving
    /// pages.
    pub fn recover_doublewrite(&self) -> Result<Vec<PageKey>> {
        match &self.shared.dblwr {
            Some(dblwr) => dblwr.recover(self.shared.backend()),
            None => Ok(Vec::new()),
        }
    }

    /// Drains staged and in-flight writes, then rejects further work and
    /// wakes every waiter.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        shared.flush_buffered_writes();
        shared.backend.wait_no_pending_writes();
        shared.shutdown.store(true, Ordering::SeqCst);
        for inst in &shared.instances {
            for flush_type in FlushType::ALL {
                inst.batch_event(flush_type).set();
            }
        }
        shared.notify_read_progress();
        info!("buffer.pool.shutdown");
    }
}
