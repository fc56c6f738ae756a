//! One independently locked slice of the buffer pool.
//!
//! Lock order inside an instance is fixed: the LRU lock (free list, LRU
//! list, page hash, batch state), then the flush-list lock, then a page
//! lock. Page guards are only handed out by a structural guard, borrowing
//! it, so a page lock can never outlive the structural lock it was taken
//! under. Paths that hold no structural lock at all (I/O completion,
//! unfixing) use [`PoolInstance::lock_page_detached`] and must drop the
//! page guard before taking a structural lock.

use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;

use super::descriptor::{FlushType, PageDesc, PageMeta};
use super::list::IndexList;
use super::lru::LruList;
use super::options::BufferPoolOptions;
use super::stats::InstanceCounters;
use crate::primitives::sync::Event;
use crate::types::{Lsn, PageKey};

/// Progress of a flush batch of one type in one instance.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BatchState {
    /// No batch and no write of this type in flight.
    Idle,
    /// A batch claimed the slot and has not queued a write yet.
    Starting,
    /// Writes of this type are in flight.
    Running,
}

#[derive(Copy, Clone, Default, Debug)]
pub(crate) struct BatchSlot {
    pub(crate) init: bool,
    pub(crate) n_flush: usize,
}

impl BatchSlot {
    pub(crate) fn state(&self) -> BatchState {
        match (self.init, self.n_flush) {
            (_, n) if n > 0 => BatchState::Running,
            (true, _) => BatchState::Starting,
            _ => BatchState::Idle,
        }
    }
}

/// State behind the LRU lock.
pub(crate) struct LruState {
    pub(crate) hash: FxHashMap<PageKey, usize>,
    pub(crate) free: IndexList,
    pub(crate) lru: LruList,
    pub(crate) batch: [BatchSlot; 2],
}

/// State behind the flush-list lock.
///
/// The list runs from the newest modification at the head to the oldest at
/// the tail. Each member's sort key is mirrored here so ordering decisions
/// never touch another page's lock.
pub(crate) struct FlushListState {
    list: IndexList,
    lsn: Vec<Lsn>,
    sorted: Option<BTreeSet<(Lsn, usize)>>,
}

impl FlushListState {
    fn new(capacity: usize) -> Self {
        Self {
            list: IndexList::new(capacity),
            lsn: vec![Lsn(0); capacity],
            sorted: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.list.len()
    }

    pub(crate) fn contains(&self, idx: usize) -> bool {
        self.list.contains(idx)
    }

    pub(crate) fn tail(&self) -> Option<usize> {
        self.list.tail()
    }

    pub(crate) fn prev(&self, idx: usize) -> Option<usize> {
        self.list.prev(idx)
    }

    pub(crate) fn oldest_lsn(&self, idx: usize) -> Lsn {
        self.lsn[idx]
    }

    /// Smallest oldest-modification in the list.
    pub(crate) fn min_lsn(&self) -> Option<Lsn> {
        self.list.tail().map(|idx| self.lsn[idx])
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, Lsn)> + '_ {
        self.list.iter().map(move |idx| (idx, self.lsn[idx]))
    }

    pub(crate) fn insert(&mut self, idx: usize, lsn: Lsn) {
        self.lsn[idx] = lsn;
        if let Some(sorted) = self.sorted.as_mut() {
            let successor = sorted
                .range((
                    std::ops::Bound::Excluded((lsn, idx)),
                    std::ops::Bound::Unbounded,
                ))
                .next()
                .map(|&(_, pos)| pos);
            sorted.insert((lsn, idx));
            match successor {
                Some(pos) => self.list.insert_after(pos, idx),
                None => self.list.push_front(idx),
            }
            return;
        }
        match self.list.head() {
            Some(head) if self.lsn[head] > lsn => self.insert_by_walk(idx, lsn),
            _ => self.list.push_front(idx),
        }
    }

    fn insert_by_walk(&mut self, idx: usize, lsn: Lsn) {
        let anchor = self.list.iter().find(|&pos| self.lsn[pos] <= lsn);
        match anchor {
            Some(pos) => self.list.insert_before(pos, idx),
            None => self.list.push_back(idx),
        }
    }

    pub(crate) fn remove(&mut self, idx: usize) {
        self.list.remove(idx);
        if let Some(sorted) = self.sorted.as_mut() {
            sorted.remove(&(self.lsn[idx], idx));
        }
        self.lsn[idx] = Lsn(0);
    }

    /// Moves a member to the position of a new sort key.
    pub(crate) fn reposition(&mut self, idx: usize, lsn: Lsn) {
        self.remove(idx);
        self.insert(idx, lsn);
    }

    pub(crate) fn set_recovery_order(&mut self, on: bool) {
        if !on {
            self.sorted = None;
            return;
        }
        if self.sorted.is_none() {
            let sorted = self.list.iter().map(|idx| (self.lsn[idx], idx)).collect();
            self.sorted = Some(sorted);
        }
    }

    /// True if keys never increase from head to tail.
    pub(crate) fn is_ordered(&self) -> bool {
        let mut prev: Option<Lsn> = None;
        for (_, lsn) in self.iter() {
            if prev.is_some_and(|p| p < lsn) {
                return false;
            }
            prev = Some(lsn);
        }
        true
    }
}

/// A locked page. Derefs to its bookkeeping.
pub(crate) struct PageGuard<'a> {
    desc: &'a PageDesc,
    meta: MutexGuard<'a, PageMeta>,
}

impl<'a> PageGuard<'a> {
    pub(crate) fn desc(&self) -> &'a PageDesc {
        self.desc
    }

    pub(crate) fn notify_io(&self) {
        self.desc.notify_io();
    }

    /// Parks on the page's I/O condition, releasing the page lock while
    /// waiting.
    pub(crate) fn wait_io(&mut self, timeout: std::time::Duration) {
        self.desc.wait_io(&mut self.meta, timeout);
    }
}

impl Deref for PageGuard<'_> {
    type Target = PageMeta;

    fn deref(&self) -> &PageMeta {
        &self.meta
    }
}

impl DerefMut for PageGuard<'_> {
    fn deref_mut(&mut self) -> &mut PageMeta {
        &mut self.meta
    }
}

/// Holder of the LRU lock.
pub(crate) struct LruGuard<'a> {
    inst: &'a PoolInstance,
    state: MutexGuard<'a, LruState>,
}

impl<'a> LruGuard<'a> {
    pub(crate) fn state(&mut self) -> &mut LruState {
        &mut self.state
    }

    /// Locks a page of this instance under the LRU lock.
    pub(crate) fn page(&mut self, idx: usize) -> (&mut LruState, PageGuard<'_>) {
        let inst = self.inst;
        let desc = &inst.pages[idx];
        let meta = desc.lock();
        (&mut *self.state, PageGuard { desc, meta })
    }

    /// Takes the flush-list lock in addition.
    pub(crate) fn with_flush_list(&mut self) -> BothGuard<'_> {
        let inst = self.inst;
        BothGuard {
            inst,
            lru: &mut *self.state,
            flush: inst.flush.lock(),
        }
    }
}

/// Holder of the flush-list lock alone.
pub(crate) struct FlushGuard<'a> {
    inst: &'a PoolInstance,
    state: MutexGuard<'a, FlushListState>,
}

impl<'a> FlushGuard<'a> {
    pub(crate) fn state(&mut self) -> &mut FlushListState {
        &mut self.state
    }

    pub(crate) fn page(&mut self, idx: usize) -> (&mut FlushListState, PageGuard<'_>) {
        let inst = self.inst;
        let desc = &inst.pages[idx];
        let meta = desc.lock();
        (&mut *self.state, PageGuard { desc, meta })
    }
}

/// Holder of both structural locks.
pub(crate) struct BothGuard<'a> {
    inst: &'a PoolInstance,
    lru: &'a mut LruState,
    flush: MutexGuard<'a, FlushListState>,
}

impl BothGuard<'_> {
    pub(crate) fn lists(&mut self) -> (&mut LruState, &mut FlushListState) {
        (&mut *self.lru, &mut *self.flush)
    }

    pub(crate) fn page(
        &mut self,
        idx: usize,
    ) -> (&mut LruState, &mut FlushListState, PageGuard<'_>) {
        let inst = self.inst;
        let desc = &inst.pages[idx];
        let meta = desc.lock();
        (&mut *self.lru, &mut *self.flush, PageGuard { desc, meta })
    }
}

pub(crate) struct PoolInstance {
    pub(crate) id: usize,
    pub(crate) pages: Vec<PageDesc>,
    lru: Mutex<LruState>,
    flush: Mutex<FlushListState>,
    pub(crate) batch_done: [Event; 2],
    pub(crate) pending_reads: AtomicUsize,
    pub(crate) counters: InstanceCounters,
}

impl PoolInstance {
    pub(crate) fn new(id: usize, opts: &BufferPoolOptions) -> Self {
        let capacity = opts.pages_per_instance;
        let mut free = IndexList::new(capacity);
        for idx in 0..capacity {
            free.push_back(idx);
        }
        Self {
            id,
            pages: (0..capacity).map(PageDesc::new).collect(),
            lru: Mutex::new(LruState {
                hash: FxHashMap::default(),
                free,
                lru: LruList::new(capacity, opts.lru_old_pct, opts.lru_old_min_len),
                batch: [BatchSlot::default(); 2],
            }),
            flush: Mutex::new(FlushListState::new(capacity)),
            batch_done: [Event::new(true), Event::new(true)],
            pending_reads: AtomicUsize::new(0),
            counters: InstanceCounters::default(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.pages.len()
    }

    pub(crate) fn lock_lru(&self) -> LruGuard<'_> {
        LruGuard {
            inst: self,
            state: self.lru.lock(),
        }
    }

    /// Takes the flush-list lock. Callers must not hold the LRU lock; use
    /// [`LruGuard::with_flush_list`] for that.
    pub(crate) fn lock_flush_list(&self) -> FlushGuard<'_> {
        FlushGuard {
            inst: self,
            state: self.flush.lock(),
        }
    }

    /// Locks a page without any structural lock.
    pub(crate) fn lock_page_detached(&self, idx: usize) -> PageGuard<'_> {
        let desc = &self.pages[idx];
        PageGuard {
            desc,
            meta: desc.lock(),
        }
    }

    pub(crate) fn pending_reads(&self) -> usize {
        self.pending_reads.load(Ordering::SeqCst)
    }

    pub(crate) fn batch_event(&self, flush_type: FlushType) -> &Event {
        &self.batch_done[flush_type.index()]
    }
}
