//! Low-level primitives shared by the backend and the pool.

/// Positioned file I/O.
pub mod io;

/// Blocking events.
pub mod sync;
