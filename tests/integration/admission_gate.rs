#![allow(missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use proptest::prelude::*;
use sombra_bufpool::admission::NoClient;
use sombra_bufpool::{
    Admission, AdmissionGate, BufferError, GateOptions, GateTicketState, Result,
};

/// Runs `threads` workers, each entering and leaving `rounds` times, and
/// returns the highest occupancy any worker observed while inside.
fn hammer(gate: &Arc<AdmissionGate>, threads: usize, rounds: usize) -> usize {
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(threads));
    let workers: Vec<_> = (0..threads)
        .map(|_| {
            let gate = Arc::clone(gate);
            let inside = Arc::clone(&inside);
            let peak = Arc::clone(&peak);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut ticket = GateTicketState::default();
                for _ in 0..rounds {
                    gate.enter(&NoClient, &mut ticket).unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_micros(200));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    gate.exit_force(&mut ticket);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    peak.load(Ordering::SeqCst)
}

#[test]
fn large_slot_table_never_exceeds_the_limit() -> Result<()> {
    let gate = Arc::new(AdmissionGate::new(GateOptions {
        concurrency_limit: 3,
        wait_slots: 16,
        free_tickets: 0,
        enter_sleep_us: 50,
    })?);
    let observed = hammer(&gate, 12, 40);
    assert!(observed <= 3, "observed {observed} inside");
    assert!(gate.peak_active() <= 3);
    assert_eq!(gate.overruns(), 0);
    assert_eq!(gate.active(), 0);
    assert_eq!(gate.queued(), 0);
    Ok(())
}

#[test]
fn small_slot_table_overruns_are_accounted() -> Result<()> {
    let gate = Arc::new(AdmissionGate::new(GateOptions {
        concurrency_limit: 2,
        wait_slots: 2,
        free_tickets: 0,
        enter_sleep_us: 0,
    })?);
    hammer(&gate, 10, 30);
    assert!(gate.peak_active() as u64 <= 2 + gate.overruns());
    assert_eq!(gate.active(), 0);
    Ok(())
}

#[test]
fn forced_entry_always_gets_in() -> Result<()> {
    let gate = AdmissionGate::new(GateOptions {
        concurrency_limit: 1,
        enter_sleep_us: 0,
        ..GateOptions::default()
    })?;
    let mut holders: Vec<GateTicketState> = vec![GateTicketState::default(); 4];
    assert_eq!(gate.enter(&NoClient, &mut holders[0])?, Admission::Admitted);
    for ticket in &mut holders[1..] {
        gate.force_enter(ticket);
    }
    assert_eq!(gate.active(), 4);
    for ticket in &mut holders {
        gate.exit_force(ticket);
    }
    assert_eq!(gate.active(), 0);
    Ok(())
}

#[test]
fn entry_after_spending_every_ticket_goes_through_the_gate() -> Result<()> {
    let gate = AdmissionGate::new(GateOptions {
        concurrency_limit: 1,
        wait_slots: 4,
        free_tickets: 2,
        enter_sleep_us: 0,
    })?;
    let mut ticket = GateTicketState::default();
    assert_eq!(gate.enter(&NoClient, &mut ticket)?, Admission::Admitted);
    assert_eq!(gate.enter(&NoClient, &mut ticket)?, Admission::Ticket);
    assert_eq!(gate.enter(&NoClient, &mut ticket)?, Admission::Ticket);
    // No exit in between: the caller's own place is handed back first, so
    // a limit of one still admits it.
    assert_eq!(gate.enter(&NoClient, &mut ticket)?, Admission::Admitted);
    assert_eq!(gate.active(), 1);
    assert_eq!(gate.overruns(), 0);
    assert_eq!(ticket.free_tickets, 2);
    gate.exit_force(&mut ticket);
    assert_eq!(gate.active(), 0);
    Ok(())
}

#[test]
fn shutdown_never_strands_a_late_waiter() -> Result<()> {
    for round in 0..200 {
        let gate = Arc::new(AdmissionGate::new(GateOptions {
            concurrency_limit: 1,
            wait_slots: 4,
            free_tickets: 0,
            enter_sleep_us: 0,
        })?);
        let mut holder = GateTicketState::default();
        gate.enter(&NoClient, &mut holder)?;

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let result = gate.enter(&NoClient, &mut GateTicketState::default());
                let _ = tx.send(result.map_err(|err| err.to_string()));
            })
        };
        if round % 2 == 0 {
            thread::yield_now();
        }
        gate.shutdown();

        let result = rx.recv_timeout(Duration::from_secs(5));
        assert!(result.is_ok(), "waiter stranded in round {round}");
        waiter.join().unwrap();
        assert!(matches!(
            gate.enter(&NoClient, &mut GateTicketState::default()),
            Err(BufferError::Shutdown)
        ));
        assert_eq!(gate.queued(), 0);
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn tickets_are_spent_one_per_entry(tickets in 0u32..64, limit in 1usize..4) {
        let gate = AdmissionGate::new(GateOptions {
            concurrency_limit: limit,
            wait_slots: 4,
            free_tickets: tickets,
            enter_sleep_us: 0,
        }).unwrap();
        let mut ticket = GateTicketState::default();
        prop_assert_eq!(gate.enter(&NoClient, &mut ticket).unwrap(), Admission::Admitted);
        prop_assert_eq!(ticket.free_tickets, tickets);
        for _ in 0..tickets {
            prop_assert_eq!(gate.enter(&NoClient, &mut ticket).unwrap(), Admission::Ticket);
            prop_assert_eq!(gate.active(), 1);
        }
        prop_assert_eq!(ticket.free_tickets, 0);
        // Out of tickets: the soft exit really leaves, the next entry goes
        // through the gate again.
        gate.exit(&mut ticket);
        prop_assert_eq!(gate.active(), 0);
        prop_assert_eq!(gate.enter(&NoClient, &mut ticket).unwrap(), Admission::Admitted);
        prop_assert_eq!(gate.active(), 1);
    }
}
