#![allow(missing_docs)]

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sombra_bufpool::backend::{IoOp, MemBlockIo};
use sombra_bufpool::log::{MemRedoLog, RedoLog};
use sombra_bufpool::types::page;
use sombra_bufpool::{
    BufferError, BufferPool, BufferPoolOptions, CorruptionPolicy, FlushOutcome, FlushType, Lsn,
    PageKey, Result, SpaceId,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
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

struct Fixture {
    pool: BufferPool,
    backend: Arc<MemBlockIo>,
    log: Arc<MemRedoLog>,
}

fn fixture(opts: BufferPoolOptions, log_capacity: u64) -> Result<Fixture> {
    init_tracing();
    let backend = Arc::new(MemBlockIo::new());
    backend.create_space(SpaceId(1), 1024);
    if opts.doublewrite {
        backend.create_space(
            SpaceId(opts.doublewrite_space),
            opts.doublewrite_block1 + 2 * opts.doublewrite_pages,
        );
    }
    let log = Arc::new(MemRedoLog::new(log_capacity));
    let pool = BufferPool::new(opts, backend.clone(), log.clone())?;
    Ok(Fixture { pool, backend, log })
}

fn opts() -> BufferPoolOptions {
    BufferPoolOptions {
        page_size: 4096,
        pages_per_instance: 64,
        flush_neighbors: false,
        doublewrite: false,
        ..BufferPoolOptions::default()
    }
}

#[test]
fn list_batch_takes_the_oldest_pages_in_order() -> Result<()> {
    let fx = fixture(opts(), 1 << 24)?;
    let mut lsns: Vec<u64> = (1..=15).collect();
    lsns.shuffle(&mut ChaCha8Rng::seed_from_u64(7));
    for &lsn in &lsns {
        let handle = fx.pool.create_page(PageKey::new(1, 100 + lsn as u32))?;
        handle.mark_dirty(Lsn(lsn), Lsn(lsn));
    }
    fx.pool.validate()?;

    let outcome = fx.pool.flush_dirty_list(10, Lsn(1_000));
    assert_eq!(outcome.queued, 10);
    assert!(!outcome.is_partial());
    let written: Vec<u64> = fx.backend.writes().iter().map(|w| w.lsn.0).collect();
    assert_eq!(written, (1..=10).collect::<Vec<_>>());
    assert_eq!(fx.pool.oldest_modification(), Some(Lsn(11)));
    assert_eq!(fx.pool.stats().dirty, 5);
    fx.pool.validate()
}

#[test]
fn log_is_durable_before_every_page_write() -> Result<()> {
    for doublewrite in [false, true] {
        let fx = fixture(
            BufferPoolOptions {
                doublewrite,
                doublewrite_pages: 4,
                flush_neighbors: true,
                ..opts()
            },
            1 << 24,
        )?;
        let violations = Arc::new(AtomicUsize::new(0));
        {
            let log = Arc::clone(&fx.log);
            let violations = Arc::clone(&violations);
            fx.backend.set_observer(Box::new(move |request, _sync| {
                if request.op == IoOp::Write && page::page_lsn(&request.buf) > log.durable_lsn() {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for round in 0..5u32 {
            for page_no in 0..12u32 {
                let key = PageKey::new(1, 200 + page_no * 3 + round % 2);
                let handle = fx.pool.create_page(key)?;
                let (start, end) = fx.log.append(64);
                handle.write().frame_mut().unwrap()[page::PAGE_HDR_LEN] = round as u8;
                handle.mark_dirty(start, end);
            }
            fx.pool.flush_dirty_list(8, fx.log.current_lsn());
            if round % 2 == 1 {
                assert!(matches!(fx.pool.flush_lru(0, 4), FlushOutcome::Queued(_)));
            }
        }
        fx.pool.flush_dirty_list_and_wait(Lsn(u64::MAX))?;
        assert!(!fx.backend.writes().is_empty());
        assert_eq!(violations.load(Ordering::SeqCst), 0, "doublewrite = {doublewrite}");
        assert_eq!(fx.pool.oldest_modification(), None);
        fx.pool.validate()?;
    }
    Ok(())
}

#[test]
fn corrupt_outgoing_page_aborts_before_submission() -> Result<()> {
    let fx = fixture(opts(), 1 << 24)?;
    let key = PageKey::new(1, 42);
    {
        let handle = fx.pool.create_page(key)?;
        let mut frame = handle.write();
        // Claim to be a different page; the checksum is recomputed on
        // write-back, the identity is not.
        frame.frame_mut().unwrap()[4..8].copy_from_slice(&43u32.to_be_bytes());
        drop(frame);
        handle.mark_dirty(Lsn(5), Lsn(5));
    }
    let result = panic::catch_unwind(AssertUnwindSafe(|| fx.pool.flush_dirty_list(1, Lsn(100))));
    assert!(result.is_err(), "corrupt write-back must abort");
    assert!(fx.backend.writes().is_empty());
    assert!(fx.backend.page(key).is_none());
    Ok(())
}

#[test]
fn tolerant_policy_writes_corrupt_page_anyway() -> Result<()> {
    let fx = fixture(
        BufferPoolOptions {
            corruption_policy: CorruptionPolicy::Tolerate,
            ..opts()
        },
        1 << 24,
    )?;
    let key = PageKey::new(1, 42);
    {
        let handle = fx.pool.create_page(key)?;
        handle.write().frame_mut().unwrap()[4..8].copy_from_slice(&43u32.to_be_bytes());
        handle.mark_dirty(Lsn(5), Lsn(5));
    }
    assert_eq!(fx.pool.flush_dirty_list(1, Lsn(100)).queued, 1);
    assert_eq!(fx.backend.writes().len(), 1);
    assert_eq!(fx.pool.oldest_modification(), None);
    Ok(())
}

#[test]
fn damaged_checksum_is_caught_when_the_page_comes_back() -> Result<()> {
    // Header checksum field and a body byte covered by it.
    for offset in [0usize, 1000] {
        for policy in [CorruptionPolicy::Abort, CorruptionPolicy::Tolerate] {
            let fx = fixture(
                BufferPoolOptions {
                    corruption_policy: policy,
                    ..opts()
                },
                1 << 24,
            )?;
            let key = PageKey::new(1, 77);
            {
                let handle = fx.pool.create_page(key)?;
                handle.write().frame_mut().unwrap()[page::PAGE_HDR_LEN..2048].fill(0x3C);
                handle.mark_dirty(Lsn(9), Lsn(9));
            }
            fx.pool.flush_dirty_list_and_wait(Lsn(u64::MAX))?;
            assert!(fx.pool.try_evict(key));

            let mut image = fx.backend.page(key).unwrap();
            image[offset] ^= 0x5A;
            fx.backend.put_page(key, &image);

            match policy {
                CorruptionPolicy::Abort => {
                    assert!(matches!(
                        fx.pool.get_page(key),
                        Err(BufferError::ChecksumMismatch { .. })
                    ));
                    assert!(fx.pool.lookup(key).is_none());
                }
                CorruptionPolicy::Tolerate => {
                    let handle = fx.pool.get_page(key)?;
                    assert!(handle.info().corrupt, "offset {offset}");
                }
            }
            fx.pool.validate()?;
        }
    }
    Ok(())
}

#[test]
fn recovery_order_keeps_out_of_order_inserts_sorted() -> Result<()> {
    let fx = fixture(opts(), 1 << 24)?;
    fx.pool.set_recovery_flush_order(true);
    for (page_no, lsn) in [(1u32, 50u64), (2, 10), (3, 70), (4, 30), (5, 60), (6, 20)] {
        let handle = fx.pool.create_page(PageKey::new(1, 300 + page_no))?;
        handle.mark_dirty(Lsn(lsn), Lsn(lsn));
    }
    fx.pool.validate()?;
    fx.pool.set_recovery_flush_order(false);
    assert_eq!(fx.pool.flush_dirty_list(3, Lsn(u64::MAX)).queued, 3);
    let written: Vec<u64> = fx.backend.writes().iter().map(|w| w.lsn.0).collect();
    assert_eq!(written, vec![10, 20, 30]);
    fx.pool.validate()
}

#[test]
fn waiting_for_a_batch_returns_once_it_ends() -> Result<()> {
    let fx = fixture(opts(), 1 << 24)?;
    fx.backend.set_manual_dispatch(true);
    {
        let handle = fx.pool.create_page(PageKey::new(1, 9))?;
        handle.mark_dirty(Lsn(3), Lsn(3));
    }
    assert_eq!(fx.pool.flush_dirty_list(1, Lsn(10)).queued, 1);
    let second = fx.pool.flush_dirty_list(1, Lsn(10));
    assert_eq!(second.skipped_instances, 1);
    assert!(second.is_partial());

    std::thread::scope(|scope| {
        let waiter = scope.spawn(|| fx.pool.wait_flush_batch_end(FlushType::List));
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!waiter.is_finished());
        fx.backend.run_pending();
        waiter.join().unwrap();
    });
    assert_eq!(fx.pool.oldest_modification(), None);
    Ok(())
}

#[test]
fn desired_rate_follows_redo_generation() -> Result<()> {
    let fx = fixture(
        BufferPoolOptions {
            flush_rate_window: 4,
            ..opts()
        },
        10_000,
    )?;
    for page_no in 0..40 {
        let handle = fx.pool.create_page(PageKey::new(1, 500 + page_no))?;
        let (start, end) = fx.log.append(1);
        handle.mark_dirty(start, end);
    }
    fx.pool.record_flush_interval();
    assert_eq!(fx.pool.desired_flush_rate(), 0);

    for _ in 0..4 {
        fx.log.append(2_000);
        fx.pool.record_flush_interval();
    }
    // Average redo per interval is 2000 bytes: 40 * 2000 / 10000.
    assert_eq!(fx.pool.desired_flush_rate(), 8);

    // LRU write-back covers part of the demand.
    assert_eq!(fx.pool.flush_lru(0, 3), FlushOutcome::Queued(3));
    assert_eq!(fx.pool.desired_flush_rate(), (37 * 2_000 / 10_000) - 3);
    Ok(())
}
