#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use sombra_bufpool::backend::{IoOp, MemBlockIo};
use sombra_bufpool::log::MemRedoLog;
use sombra_bufpool::types::page::{self, PageCheck};
use sombra_bufpool::{BufferPool, BufferPoolOptions, Lsn, PageKey, Result, SpaceId};

const DATA_SPACE: u32 = 1;

fn opts() -> BufferPoolOptions {
    BufferPoolOptions {
        page_size: 4096,
        pages_per_instance: 32,
        flush_neighbors: false,
        doublewrite: true,
        doublewrite_space: 0,
        doublewrite_block1: 8,
        doublewrite_pages: 4,
        ..BufferPoolOptions::default()
    }
}

fn device() -> Arc<MemBlockIo> {
    let backend = Arc::new(MemBlockIo::new());
    backend.create_space(SpaceId(0), 16);
    backend.create_space(SpaceId(DATA_SPACE), 64);
    backend
}

fn open(backend: &Arc<MemBlockIo>) -> Result<BufferPool> {
    BufferPool::new(opts(), backend.clone(), Arc::new(MemRedoLog::new(1 << 24)))
}

fn dirty(pool: &BufferPool, page_no: u32, lsn: u64, fill: u8) -> Result<()> {
    let handle = pool.create_page(PageKey::new(DATA_SPACE, page_no))?;
    handle.write().frame_mut().unwrap()[page::PAGE_HDR_LEN..1024].fill(fill);
    handle.mark_dirty(Lsn(lsn), Lsn(lsn));
    Ok(())
}

/// Captures every in-place write image, whether or not it lands.
fn capture(backend: &MemBlockIo) -> Arc<Mutex<HashMap<PageKey, Vec<u8>>>> {
    let seen = Arc::new(Mutex::new(HashMap::new()));
    let sink = Arc::clone(&seen);
    backend.set_observer(Box::new(move |request, _sync| {
        if request.op == IoOp::Write && request.key.space == SpaceId(DATA_SPACE) {
            sink.lock().insert(request.key, request.buf.to_vec());
        }
    }));
    seen
}

#[test]
fn reserved_area_is_durable_before_in_place_writes() -> Result<()> {
    let backend = device();
    let pool = open(&backend)?;
    for (i, page_no) in [20u32, 21, 22, 23, 24].into_iter().enumerate() {
        dirty(&pool, page_no, 10 + i as u64, i as u8)?;
    }
    assert_eq!(pool.flush_dirty_list(5, Lsn(u64::MAX)).queued, 5);
    assert_eq!(pool.doublewrite().map(|d| d.first_free()), Some(0));

    let records = backend.records();
    let first_in_place = records
        .iter()
        .position(|r| r.key.space == SpaceId(DATA_SPACE))
        .unwrap();
    let reserved = records[..first_in_place]
        .iter()
        .filter(|r| r.op == IoOp::Write && r.key.space == SpaceId(0))
        .count();
    assert_eq!(reserved, 5);
    assert!(records[..first_in_place].iter().all(|r| r.sync));

    let syncs = backend.syncs();
    assert_eq!(syncs[0], (SpaceId(0), first_in_place));
    let data_sync = syncs
        .iter()
        .find(|(space, _)| *space == SpaceId(DATA_SPACE))
        .unwrap();
    assert_eq!(data_sync.1, records.len());
    assert_eq!(pool.oldest_modification(), None);
    pool.validate()
}

#[test]
fn full_buffer_flushes_before_staging_more() -> Result<()> {
    let backend = device();
    let pool = open(&backend)?;
    for page_no in 0..10u32 {
        dirty(&pool, 30 + page_no, 100 + page_no as u64, page_no as u8)?;
    }
    assert_eq!(pool.flush_dirty_list(10, Lsn(u64::MAX)).queued, 10);
    let reserved_syncs = backend
        .syncs()
        .iter()
        .filter(|(space, _)| *space == SpaceId(0))
        .count();
    assert_eq!(reserved_syncs, 2);
    assert_eq!(pool.stats().pages_written, 10);
    for page_no in 30..40 {
        let key = PageKey::new(DATA_SPACE, page_no);
        assert_eq!(page::verify(&backend.page(key).unwrap(), key), PageCheck::Valid);
    }
    Ok(())
}

#[test]
fn crash_between_in_place_writes_is_repaired() -> Result<()> {
    let backend = device();
    let intended = capture(&backend);
    let pool = open(&backend)?;
    dirty(&pool, 5, 10, 0xA5)?;
    dirty(&pool, 6, 20, 0xB6)?;
    dirty(&pool, 7, 30, 0xC7)?;

    // Three reserved copies and the first in-place write land.
    backend.crash_after_writes(4);
    assert_eq!(pool.flush_dirty_list(3, Lsn(u64::MAX)).queued, 3);
    drop(pool);
    let lost = [PageKey::new(DATA_SPACE, 6), PageKey::new(DATA_SPACE, 7)];
    for key in lost {
        assert!(backend.page(key).is_none());
    }

    backend.power_on();
    let pool = open(&backend)?;
    let restored = pool.recover_doublewrite()?;
    assert_eq!(restored, lost.to_vec());

    let intended = intended.lock();
    for page_no in 5..8 {
        let key = PageKey::new(DATA_SPACE, page_no);
        assert_eq!(backend.page(key).as_ref(), intended.get(&key), "page {page_no}");
    }
    drop(intended);

    let handle = pool.get_page(PageKey::new(DATA_SPACE, 7))?;
    assert_eq!(handle.read().frame().unwrap()[page::PAGE_HDR_LEN], 0xC7);
    assert_eq!(page::page_lsn(handle.read().frame().unwrap()), Lsn(30));
    Ok(())
}

#[test]
fn torn_page_is_replaced_by_its_reserved_copy() -> Result<()> {
    let backend = device();
    let intended = capture(&backend);
    let pool = open(&backend)?;
    dirty(&pool, 12, 40, 0x11)?;
    pool.flush_dirty_list_and_wait(Lsn(u64::MAX))?;
    drop(pool);

    let key = PageKey::new(DATA_SPACE, 12);
    let mut torn = backend.page(key).unwrap();
    torn[2048..].fill(0xFF);
    backend.put_page(key, &torn);

    let pool = open(&backend)?;
    assert_eq!(pool.recover_doublewrite()?, vec![key]);
    assert_eq!(backend.page(key).as_ref(), intended.lock().get(&key));
    // A second pass finds nothing stale.
    assert!(pool.recover_doublewrite()?.is_empty());
    Ok(())
}

#[test]
fn compressed_page_is_restored_at_its_own_size() -> Result<()> {
    let backend = device();
    let intended = capture(&backend);
    let pool = open(&backend)?;
    let key = PageKey::new(DATA_SPACE, 5);
    {
        let handle = pool.get_compressed_page(key, 1024)?;
        handle.write().zip_mut().unwrap()[200] = 0x77;
        handle.mark_dirty(Lsn(25), Lsn(25));
    }

    // Only the reserved copy lands.
    backend.crash_after_writes(1);
    assert_eq!(pool.flush_dirty_list(1, Lsn(u64::MAX)).queued, 1);
    drop(pool);
    assert!(backend.page(key).is_none());

    backend.power_on();
    let pool = open(&backend)?;
    assert_eq!(pool.recover_doublewrite()?, vec![key]);
    let on_disk = backend.page(key).unwrap();
    assert_eq!(on_disk.len(), 1024);
    assert_eq!(Some(&on_disk), intended.lock().get(&key));
    assert_eq!(on_disk[200], 0x77);
    assert_eq!(page::page_lsn(&on_disk), Lsn(25));

    let handle = pool.get_compressed_page(key, 1024)?;
    assert_eq!(handle.read().zip().unwrap()[200], 0x77);
    Ok(())
}
