use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic per-instance counters.
#[derive(Default)]
pub(crate) struct InstanceCounters {
    pub(crate) pages_read: AtomicU64,
    pub(crate) pages_written: AtomicU64,
    pub(crate) pages_created: AtomicU64,
    pub(crate) read_ahead_random: AtomicU64,
    pub(crate) read_ahead_linear: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) lru_flushed: AtomicU64,
    pub(crate) made_young: AtomicU64,
    pub(crate) corrupt_reads: AtomicU64,
    /// Reads and LRU writes attributed to eviction pressure.
    pub(crate) eviction_io: AtomicU64,
}

impl InstanceCounters {
    pub(crate) fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Snapshot of buffer pool activity, summed over instances.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total frames.
    pub capacity: usize,
    /// Frames in the free lists.
    pub free: usize,
    /// Pages in the LRU lists.
    pub lru_len: usize,
    /// Pages in the old LRU sublists.
    pub old_len: usize,
    /// Pages in the flush lists.
    pub dirty: usize,
    /// Reads still in flight.
    pub pending_reads: usize,
    /// Completed page reads.
    pub pages_read: u64,
    /// Completed page writes.
    pub pages_written: u64,
    /// Pages created without a read.
    pub pages_created: u64,
    /// Pages queued by random read-ahead.
    pub read_ahead_random: u64,
    /// Pages queued by linear read-ahead.
    pub read_ahead_linear: u64,
    /// Clean pages unmapped to make room.
    pub evictions: u64,
    /// Pages written by LRU batches.
    pub lru_flushed: u64,
    /// Old pages promoted to the young sublist.
    pub made_young: u64,
    /// Reads that failed validation.
    pub corrupt_reads: u64,
    /// I/O attributed to eviction.
    pub eviction_io: u64,
}

impl PoolStats {
    pub(crate) fn absorb(&mut self, counters: &InstanceCounters) {
        use InstanceCounters as C;
        self.pages_read += C::load(&counters.pages_read);
        self.pages_written += C::load(&counters.pages_written);
        self.pages_created += C::load(&counters.pages_created);
        self.read_ahead_random += C::load(&counters.read_ahead_random);
        self.read_ahead_linear += C::load(&counters.read_ahead_linear);
        self.evictions += C::load(&counters.evictions);
        self.lru_flushed += C::load(&counters.lru_flushed);
        self.made_young += C::load(&counters.made_young);
        self.corrupt_reads += C::load(&counters.corrupt_reads);
        self.eviction_io += C::load(&counters.eviction_io);
    }

    /// Share of frames holding dirty pages, in percent.
    pub fn dirty_pct(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.dirty as f64 * 100.0 / self.capacity as f64
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "frames: {} total, {} free, {} in lru ({} old), {} dirty ({:.1}%)",
            self.capacity,
            self.free,
            self.lru_len,
            self.old_len,
            self.dirty,
            self.dirty_pct()
        )?;
        writeln!(
            f,
            "io: {} read, {} written, {} created, {} pending reads",
            self.pages_read, self.pages_written, self.pages_created, self.pending_reads
        )?;
        writeln!(
            f,
            "read-ahead: {} random, {} linear",
            self.read_ahead_random, self.read_ahead_linear
        )?;
        write!(
            f,
            "lru: {} evicted, {} flushed, {} made young, {} eviction io, {} corrupt reads",
            self.evictions, self.lru_flushed, self.made_young, self.eviction_io, self.corrupt_reads
        )
    }
}
