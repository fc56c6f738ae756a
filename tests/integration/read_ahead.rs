#![allow(missing_docs)]

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sombra_bufpool::backend::MemBlockIo;
use sombra_bufpool::log::MemRedoLog;
use sombra_bufpool::types::page::{self, PageKind};
use sombra_bufpool::{BufferPool, BufferPoolOptions, Lsn, PageKey, Result, SpaceId};

const PAGE: usize = 4096;

fn pool(pages: usize, area: u32) -> Result<(BufferPool, Arc<MemBlockIo>)> {
    let backend = Arc::new(MemBlockIo::new());
    backend.create_space(SpaceId(1), 4096);
    let log = Arc::new(MemRedoLog::new(1 << 24));
    let opts = BufferPoolOptions {
        page_size: PAGE,
        pages_per_instance: pages,
        read_ahead_area: area,
        doublewrite: false,
        ..BufferPoolOptions::default()
    };
    Ok((BufferPool::new(opts, backend.clone(), log)?, backend))
}

fn image(key: PageKey, prev: Option<u32>, next: Option<u32>) -> Vec<u8> {
    let mut buf = vec![0u8; PAGE];
    page::init_page(&mut buf, key, PageKind::Index);
    page::set_siblings(&mut buf, prev, next);
    page::stamp_for_write(&mut buf, key, Lsn(1), true);
    buf
}

#[test]
fn random_read_ahead_fills_a_hot_area() -> Result<()> {
    let (pool, _backend) = pool(100, 32)?;
    for page_no in 0..=20 {
        pool.get_page(PageKey::new(1, page_no))?;
    }
    assert_eq!(pool.stats().read_ahead_random, 0);

    pool.set_random_read_ahead(true);
    let handle = pool.get_page(PageKey::new(1, 21))?;
    assert_eq!(handle.key(), PageKey::new(1, 21));
    drop(handle);

    // 21..32 were missing; page 21 itself is read through read-ahead.
    assert_eq!(pool.stats().read_ahead_random, 11);
    for page_no in 0..32 {
        assert!(pool.lookup(PageKey::new(1, page_no)).is_some(), "page {page_no} not cached");
    }
    assert!(pool.lookup(PageKey::new(1, 32)).is_none());
    pool.validate()
}

#[test]
fn random_read_ahead_waits_for_enough_recent_pages() -> Result<()> {
    let (pool, _backend) = pool(100, 32)?;
    pool.set_random_read_ahead(true);
    // Nine accessed pages are needed in a 32-page area.
    for page_no in 0..8 {
        pool.get_page(PageKey::new(1, page_no))?;
    }
    assert_eq!(pool.stats().read_ahead_random, 0);
    pool.get_page(PageKey::new(1, 8))?;
    assert_eq!(pool.stats().read_ahead_random, 0);
    pool.get_page(PageKey::new(1, 9))?;
    assert_eq!(pool.stats().read_ahead_random, 23);
    pool.validate()
}

#[test]
fn linear_read_ahead_prefetches_the_next_area() -> Result<()> {
    let (pool, backend) = pool(100, 32)?;
    for page_no in 32..64 {
        let key = PageKey::new(1, page_no);
        backend.put_page(key, &image(key, Some(page_no - 1), Some(page_no + 1)));
    }
    for page_no in 32..64 {
        pool.get_page(PageKey::new(1, page_no))?;
    }
    assert_eq!(pool.stats().read_ahead_linear, 32);
    for page_no in 64..96 {
        assert!(pool.lookup(PageKey::new(1, page_no)).is_some());
    }
    pool.validate()
}

#[test]
fn garbage_sibling_links_are_harmless() -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
    for round in 0..16 {
        let area = 8;
        let (pool, backend) = pool(48, area)?;
        let base = 8 * (1 + round % 4);
        for page_no in base..base + area {
            let key = PageKey::new(1, page_no);
            let prev = if rng.gen_bool(0.5) { Some(page_no - 1) } else { Some(rng.gen()) };
            let next = if rng.gen_bool(0.5) { Some(page_no + 1) } else { Some(rng.gen()) };
            backend.put_page(key, &image(key, prev, next));
        }
        let mut order: Vec<u32> = (base..base + area).collect();
        if rng.gen_bool(0.5) {
            order.reverse();
        }
        for page_no in order {
            pool.get_page(PageKey::new(1, page_no))?;
        }
        for page_no in base..base + area {
            let queued = pool.read_ahead_linear(PageKey::new(1, page_no), 0);
            assert!(queued <= area as usize);
        }
        pool.validate()?;
    }
    Ok(())
}

#[test]
fn startup_phase_disables_read_ahead() -> Result<()> {
    let (pool, _backend) = pool(100, 32)?;
    pool.set_random_read_ahead(true);
    pool.set_startup_phase(true);
    for page_no in 0..16 {
        pool.get_page(PageKey::new(1, page_no))?;
    }
    let stats = pool.stats();
    assert_eq!(stats.read_ahead_random + stats.read_ahead_linear, 0);
    pool.set_startup_phase(false);
    pool.get_page(PageKey::new(1, 16))?;
    assert!(pool.stats().read_ahead_random > 0);
    Ok(())
}
