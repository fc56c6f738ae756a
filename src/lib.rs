//! Buffered page cache for a page-oriented storage engine.
//!
//! The crate sits between an engine's working set and its block store:
//!
//! - [`buffer`] holds the pool itself, its read-ahead heuristics, the
//!   ordered write-back engine and double-write staging.
//! - [`backend`] and [`log`] are the collaborators the pool drives: block
//!   I/O and the redo log, each with an in-memory implementation for tests.
//! - [`admission`] bounds how many units of work run inside the engine.
//! - [`config`] loads both from TOML.

#![warn(missing_docs)]

pub mod admission;
pub mod backend;
pub mod buffer;
pub mod config;
pub mod log;
pub mod primitives;
pub mod types;

pub use admission::{Admission, AdmissionGate, GateClient, GateOptions, GateTicketState};
pub use buffer::{
    BufferPool, BufferPoolOptions, CorruptionPolicy, FlushOutcome, FlushType, ListFlush,
    PageHandle, PoolStats, ReadMode,
};
pub use config::{ConfigError, StorageConfig};
pub use types::{BufferError, Lsn, PageKey, PageNo, Result, SpaceId, SpaceVersion};
