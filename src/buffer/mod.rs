#![forbid(unsafe_code)]

//! The buffer pool: page cache, read engine, flush engine and double-write
//! staging.
//!
//! A pool is split into instances. A page always lives in the instance its
//! key folds to, so every list and lock a page touches belongs to one
//! instance.

mod descriptor;
mod doublewrite;
mod flush;
mod flush_rate;
mod instance;
mod list;
mod lru;
mod options;
mod pool;
mod read;
mod stats;
#[cfg(test)]
mod testutil;

pub use descriptor::{FlushType, IoFix, PageFrame, PageInfo, PageState};
pub use doublewrite::Doublewrite;
pub use flush::{FlushOutcome, ListFlush};
pub use flush_rate::FlushRateController;
pub use instance::BatchState;
pub use options::{BufferPoolOptions, CorruptionPolicy};
pub use pool::{BufferPool, MemoryBlock, PageHandle, PageReadGuard, PageWriteGuard};
pub use read::{BulkRead, MergeRead, ReadMode};
pub use stats::PoolStats;
