//! Background flush-rate estimation.
//!
//! A ring of recent sampling intervals records how much redo was generated
//! and how many pages LRU flushing already wrote back. The desired list
//! flush rate is the share of dirty pages the redo growth would make
//! necessary, minus what LRU flushing covers anyway.

use crate::types::Lsn;

#[derive(Copy, Clone, Default, Debug, Eq, PartialEq)]
struct FlushSample {
    redo: u64,
    lru_flushed: u64,
}

/// Moving-window estimator of how many pages to flush per interval.
#[derive(Debug)]
pub struct FlushRateController {
    ring: Vec<FlushSample>,
    next: usize,
    sum: FlushSample,
    /// Counters at the start of the current interval.
    current: FlushSample,
}

impl FlushRateController {
    /// Creates a controller averaging over `window` intervals.
    pub fn new(window: usize) -> Self {
        Self {
            ring: vec![FlushSample::default(); window.max(1)],
            next: 0,
            sum: FlushSample::default(),
            current: FlushSample::default(),
        }
    }

    /// Closes the current interval.
    ///
    /// `lsn` is the current log position and `lru_flushed` the running total
    /// of pages written by LRU batches. The first call only primes the
    /// interval start.
    pub fn record_interval(&mut self, lsn: Lsn, lru_flushed: u64) {
        if self.current.redo == 0 {
            self.current = FlushSample {
                redo: lsn.0,
                lru_flushed,
            };
            return;
        }
        let sample = FlushSample {
            redo: lsn.0.saturating_sub(self.current.redo),
            lru_flushed: lru_flushed.saturating_sub(self.current.lru_flushed),
        };
        let evicted = self.ring[self.next];
        self.sum.redo = self.sum.redo + sample.redo - evicted.redo;
        self.sum.lru_flushed = self.sum.lru_flushed + sample.lru_flushed - evicted.lru_flushed;
        self.ring[self.next] = sample;
        self.next = (self.next + 1) % self.ring.len();
        self.current = FlushSample {
            redo: lsn.0,
            lru_flushed,
        };
    }

    /// Pages the list flusher should write in the next interval.
    ///
    /// `n_dirty` is the flush-list length across the pool and
    /// `log_capacity` the usable redo capacity in bytes.
    pub fn desired_flush_rate(
        &self,
        n_dirty: usize,
        lsn: Lsn,
        lru_flushed: u64,
        log_capacity: u64,
    ) -> u64 {
        if log_capacity == 0 {
            return 0;
        }
        let window = self.ring.len() as u64;
        let redo_avg =
            self.sum.redo / window + lsn.0.saturating_sub(self.current.redo);
        let lru_avg = self.sum.lru_flushed / window
            + lru_flushed.saturating_sub(self.current.lru_flushed);
        let required = (n_dirty as u128 * redo_avg as u128 / log_capacity as u128) as u64;
        required.saturating_sub(lru_avg)
    }
}
