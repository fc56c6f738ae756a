#![allow(missing_docs)]

use std::sync::Arc;

use proptest::prelude::*;
use sombra_bufpool::backend::MemBlockIo;
use sombra_bufpool::buffer::IoFix;
use sombra_bufpool::log::MemRedoLog;
use sombra_bufpool::{BufferPool, BufferPoolOptions, Lsn, PageHandle, PageKey, SpaceId};

const FIRST_PAGE: u32 = 2;
const PAGES: u32 = 24;

#[derive(Clone, Debug)]
enum Op {
    Dirty { page: u32, lsn: u64, span: u64 },
    Pin(u32),
    Unpin,
    FlushList { min_n: usize, limit: u64 },
    FlushLru(usize),
    Evict(u32),
}

fn op() -> impl Strategy<Value = Op> {
    let page = FIRST_PAGE..FIRST_PAGE + PAGES;
    prop_oneof![
        4 => (page.clone(), 1u64..500, 0u64..20).prop_map(|(page, lsn, span)| Op::Dirty { page, lsn, span }),
        2 => page.clone().prop_map(Op::Pin),
        2 => Just(Op::Unpin),
        2 => (1usize..8, 1u64..600).prop_map(|(min_n, limit)| Op::FlushList { min_n, limit }),
        1 => (1usize..4).prop_map(Op::FlushLru),
        2 => page.prop_map(Op::Evict),
    ]
}

fn pool() -> BufferPool {
    let backend = Arc::new(MemBlockIo::new());
    backend.create_space(SpaceId(1), 256);
    let opts = BufferPoolOptions {
        page_size: 4096,
        pages_per_instance: 16,
        read_ahead_area: 8,
        lru_old_min_len: 8,
        doublewrite: false,
        ..BufferPoolOptions::default()
    };
    match BufferPool::new(opts, backend, Arc::new(MemRedoLog::new(1 << 24))) {
        Ok(pool) => pool,
        Err(err) => panic!("pool rejected options: {err}"),
    }
}

fn key(page: u32) -> PageKey {
    PageKey::new(1, page)
}

fn oldest_resident(pool: &BufferPool) -> Option<Lsn> {
    (FIRST_PAGE..FIRST_PAGE + PAGES)
        .filter_map(|page| pool.lookup(key(page)))
        .map(|info| info.oldest_modification)
        .filter(|lsn| lsn.is_set())
        .min()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(96))]

    #[test]
    fn bookkeeping_survives_any_workload(ops in prop::collection::vec(op(), 1..60)) {
        let pool = pool();
        let mut pinned: Vec<PageHandle<'_>> = Vec::new();
        for op in ops {
            match op {
                Op::Dirty { page, lsn, span } => {
                    let handle = match pool.create_page(key(page)) {
                        Ok(handle) => handle,
                        Err(err) => return Err(TestCaseError::fail(format!("create failed: {err}"))),
                    };
                    handle.mark_dirty(Lsn(lsn), Lsn(lsn + span));
                    let info = handle.info();
                    prop_assert!(info.oldest_modification.is_set());
                    prop_assert!(info.oldest_modification <= info.newest_modification);
                }
                Op::Pin(page) if pinned.len() < 4 => {
                    let handle = pool.get_page(key(page));
                    prop_assert!(handle.is_ok());
                    if let Ok(handle) = handle {
                        pinned.push(handle);
                    }
                }
                Op::Pin(_) => {}
                Op::Unpin => {
                    pinned.pop();
                }
                Op::FlushList { min_n, limit } => {
                    let outcome = pool.flush_dirty_list(min_n, Lsn(limit));
                    prop_assert!(!outcome.is_partial());
                }
                Op::FlushLru(min_n) => {
                    pool.flush_lru(0, min_n);
                }
                Op::Evict(page) => {
                    let before = pool.lookup(key(page));
                    let replaceable = before.as_ref().is_some_and(|info| {
                        info.fix_count == 0
                            && info.io_fix == IoFix::None
                            && !info.oldest_modification.is_set()
                    });
                    prop_assert_eq!(pool.try_evict(key(page)), replaceable);
                    if replaceable {
                        prop_assert!(pool.lookup(key(page)).is_none());
                    }
                }
            }
            prop_assert!(pool.validate().is_ok(), "{:?}", pool.validate());
            prop_assert_eq!(pool.oldest_modification(), oldest_resident(&pool));
        }
        drop(pinned);
        prop_assert!(pool.flush_dirty_list_and_wait(Lsn(u64::MAX)).is_ok());
        prop_assert_eq!(pool.stats().dirty, 0);
        prop_assert!(pool.validate().is_ok());
    }
}

#[test]
fn pinned_dirty_and_busy_pages_are_never_replaced() -> sombra_bufpool::Result<()> {
    let backend = Arc::new(MemBlockIo::new());
    backend.create_space(SpaceId(1), 256);
    let opts = BufferPoolOptions {
        page_size: 4096,
        pages_per_instance: 16,
        doublewrite: false,
        ..BufferPoolOptions::default()
    };
    let pool = BufferPool::new(opts, backend.clone(), Arc::new(MemRedoLog::new(1 << 24)))?;

    let pinned = pool.get_page(key(3))?;
    assert!(!pool.try_evict(key(3)));
    drop(pinned);

    {
        let dirty = pool.create_page(key(4))?;
        dirty.mark_dirty(Lsn(7), Lsn(7));
    }
    assert!(!pool.try_evict(key(4)));

    backend.set_manual_dispatch(true);
    assert!(pool.read_page(false, sombra_bufpool::ReadMode::AnyPage, key(5), 0)?);
    assert_eq!(pool.lookup(key(5)).map(|info| info.io_fix), Some(IoFix::Read));
    assert!(!pool.try_evict(key(5)));
    backend.run_pending();
    backend.set_manual_dispatch(false);

    assert!(pool.try_evict(key(3)));
    assert!(pool.try_evict(key(5)));
    pool.flush_dirty_list_and_wait(Lsn(u64::MAX))?;
    assert!(pool.try_evict(key(4)));
    pool.validate()
}
