use std::sync::{Arc, Once};

use tracing_subscriber::EnvFilter;

use super::options::BufferPoolOptions;
use super::pool::BufferPool;
use crate::backend::MemBlockIo;
use crate::log::MemRedoLog;
use crate::types::page::{self, PageKind};
use crate::types::{Lsn, PageKey, SpaceId};

pub(crate) fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("sombra_bufpool=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

/// 32 frames of 4 KiB, one instance, no double-write.
pub(crate) fn small_opts() -> BufferPoolOptions {
    BufferPoolOptions {
        page_size: 4096,
        pages_per_instance: 32,
        read_ahead_area: 8,
        doublewrite: false,
        lru_old_min_len: 8,
        ..BufferPoolOptions::default()
    }
}

/// A pool over a fresh in-memory device with tablespace 1 (and the
/// double-write space when enabled) created.
pub(crate) fn mem_pool(opts: BufferPoolOptions) -> (BufferPool, Arc<MemBlockIo>, Arc<MemRedoLog>) {
    init_tracing();
    let backend = Arc::new(MemBlockIo::new());
    backend.create_space(SpaceId(1), 1 << 16);
    if opts.doublewrite {
        backend.create_space(
            SpaceId(opts.doublewrite_space),
            opts.doublewrite_block1 + 2 * opts.doublewrite_pages,
        );
    }
    let log = Arc::new(MemRedoLog::new(1 << 24));
    let pool = match BufferPool::new(opts, backend.clone(), log.clone()) {
        Ok(pool) => pool,
        Err(err) => panic!("test pool options rejected: {err}"),
    };
    (pool, backend, log)
}

/// A stamped page image with the given sibling links.
pub(crate) fn image(
    key: PageKey,
    lsn: u64,
    prev: Option<u32>,
    next: Option<u32>,
    page_size: usize,
) -> Vec<u8> {
    let mut buf = vec![0u8; page_size];
    page::init_page(&mut buf, key, PageKind::Index);
    page::set_siblings(&mut buf, prev, next);
    buf[page::PAGE_HDR_LEN..page::PAGE_HDR_LEN + 8].copy_from_slice(&key.page_no.0.to_le_bytes().repeat(2));
    page::stamp_for_write(&mut buf, key, Lsn(lsn), true);
    buf
}
