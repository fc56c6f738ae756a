#![forbid(unsafe_code)]

//! Redo log collaborator. The buffer pool only needs to force the log
//! durable before a write-back and to sample its growth.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::types::{Lsn, Result};

/// How a force call waits.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogWait {
    /// Return once the write is issued.
    NoWait,
    /// Return once the log is durable up to the requested LSN.
    Durable,
}

/// Contract the pool consumes from the write-ahead redo log.
pub trait RedoLog: Send + Sync + 'static {
    /// Makes the log durable at least up to `lsn`.
    fn force_durable_up_to(&self, lsn: Lsn, wait: LogWait) -> Result<()>;
    /// LSN of the next record to be generated.
    fn current_lsn(&self) -> Lsn;
    /// Highest LSN known durable.
    fn durable_lsn(&self) -> Lsn;
    /// Usable log capacity in bytes.
    fn log_capacity(&self) -> u64;
}

/// In-memory log: LSNs are byte offsets, forcing is instantaneous and every
/// force call is recorded.
pub struct MemRedoLog {
    current: AtomicU64,
    durable: AtomicU64,
    capacity: u64,
    forces: Mutex<Vec<Lsn>>,
}

impl MemRedoLog {
    /// Creates a log with `capacity` bytes starting at LSN 1.
    pub fn new(capacity: u64) -> Self {
        Self {
            current: AtomicU64::new(1),
            durable: AtomicU64::new(0),
            capacity,
            forces: Mutex::new(Vec::new()),
        }
    }

    /// Appends `bytes` of redo and returns the (start, end) LSN range.
    pub fn append(&self, bytes: u64) -> (Lsn, Lsn) {
        let start = self.current.fetch_add(bytes, Ordering::SeqCst);
        (Lsn(start), Lsn(start + bytes))
    }

    /// Every LSN passed to `force_durable_up_to`, in call order.
    pub fn forces(&self) -> Vec<Lsn> {
        self.forces.lock().clone()
    }
}

impl RedoLog for MemRedoLog {
    fn force_durable_up_to(&self, lsn: Lsn, _wait: LogWait) -> Result<()> {
        self.forces.lock().push(lsn);
        self.durable.fetch_max(lsn.0, Ordering::SeqCst);
        Ok(())
    }

    fn current_lsn(&self) -> Lsn {
        Lsn(self.current.load(Ordering::SeqCst))
    }

    fn durable_lsn(&self) -> Lsn {
        Lsn(self.durable.load(Ordering::SeqCst))
    }

    fn log_capacity(&self) -> u64 {
        self.capacity
    }
}
