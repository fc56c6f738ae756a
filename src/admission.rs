#![forbid(unsafe_code)]

//! Admission gate bounding how many units of work run inside the engine.
//!
//! A caller that finds the gate full sleeps once, then queues in a FIFO
//! of wait slots. Releasers credit the first uncredited waiter before
//! waking it, so the active count never under-reports occupancy. When the
//! slot table is exhausted the caller is admitted over the limit instead of
//! blocking.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::primitives::sync::Event;
use crate::types::{BufferError, Result};

/// Gate configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GateOptions {
    /// Units of work allowed inside at once.
    pub concurrency_limit: usize,
    /// Size of the wait-slot table.
    pub wait_slots: usize,
    /// Tickets granted on each admission.
    pub free_tickets: u32,
    /// Grace sleep before queueing, in microseconds.
    pub enter_sleep_us: u64,
}

impl Default for GateOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: 8,
            wait_slots: 64,
            free_tickets: 500,
            enter_sleep_us: 10_000,
        }
    }
}

impl GateOptions {
    /// Rejects a gate that could never admit anyone.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency_limit == 0 {
            return Err(BufferError::Invalid("concurrency_limit must be positive"));
        }
        Ok(())
    }
}

/// The caller side of the gate, usually a transaction.
pub trait GateClient {
    /// True while the caller holds locks others may be waiting on. Such a
    /// caller skips the grace sleep.
    fn has_resource_holds(&self) -> bool {
        false
    }

    /// Drops a reentrant latch the caller holds before it blocks in the
    /// queue.
    fn release_reentrant_latch(&self) {}

    /// Publishes what the caller is doing.
    fn set_op_info(&self, _info: &'static str) {}
}

/// A client with no holds and nothing to release.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoClient;

impl GateClient for NoClient {}

/// Per-caller gate bookkeeping.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GateTicketState {
    /// Whether the caller currently counts toward the active total.
    pub declared_inside: bool,
    /// Entries the caller may still make without touching the gate.
    pub free_tickets: u32,
}

/// How a call to [`AdmissionGate::enter`] got in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Spent one of the caller's free tickets.
    Ticket,
    /// Found room under the limit.
    Admitted,
    /// Queued and was woken by a releaser.
    AdmittedAfterWait,
    /// No wait slot was free, admitted over the limit.
    Overrun,
}

#[derive(Debug, Default, Clone, Copy)]
struct Slot {
    reserved: bool,
    /// A releaser already credited this waiter.
    wait_ended: bool,
}

struct GateState {
    active: usize,
    peak: usize,
    overruns: u64,
    slots: Vec<Slot>,
    queue: VecDeque<usize>,
}

impl GateState {
    fn credit(&mut self) {
        self.active += 1;
        self.peak = self.peak.max(self.active);
    }
}

/// Bounded-parallelism gate.
pub struct AdmissionGate {
    opts: GateOptions,
    state: Mutex<GateState>,
    events: Vec<Event>,
    shutdown: AtomicBool,
}

impl AdmissionGate {
    /// Creates a gate with every slot free.
    pub fn new(opts: GateOptions) -> Result<Self> {
        opts.validate()?;
        let slots = opts.wait_slots;
        Ok(Self {
            state: Mutex::new(GateState {
                active: 0,
                peak: 0,
                overruns: 0,
                slots: vec![Slot::default(); slots],
                queue: VecDeque::with_capacity(slots),
            }),
            events: (0..slots).map(|_| Event::new(false)).collect(),
            shutdown: AtomicBool::new(false),
            opts,
        })
    }

    /// The gate's configuration.
    pub fn options(&self) -> &GateOptions {
        &self.opts
    }

    /// Enters the engine, blocking in the wait queue when it is full.
    ///
    /// Returns [`BufferError::Shutdown`] if the gate shut down before the
    /// caller got in.
    pub fn enter(
        &self,
        client: &dyn GateClient,
        ticket: &mut GateTicketState,
    ) -> Result<Admission> {
        if ticket.free_tickets > 0 {
            ticket.free_tickets -= 1;
            return Ok(Admission::Ticket);
        }
        if ticket.declared_inside {
            // Out of tickets without an exit: give the place back and queue
            // like any other caller.
            error!("admission.enter_while_inside");
            self.exit_force(ticket);
        }
        let mut slept = false;
        loop {
            let mut state = self.state.lock();
            // Shutdown wakes only slots queued under this lock.
            if self.shutdown.load(Ordering::Acquire) {
                return Err(BufferError::Shutdown);
            }
            if state.active < self.opts.concurrency_limit {
                state.credit();
                drop(state);
                self.grant(ticket);
                return Ok(Admission::Admitted);
            }

            if !slept && self.opts.enter_sleep_us > 0 && !client.has_resource_holds() {
                slept = true;
                drop(state);
                client.set_op_info("sleeping before entering");
                thread::sleep(Duration::from_micros(self.opts.enter_sleep_us));
                client.set_op_info("");
                continue;
            }

            let Some(slot) = state.slots.iter().position(|slot| !slot.reserved) else {
                state.credit();
                state.overruns += 1;
                let active = state.active;
                drop(state);
                warn!(active, limit = self.opts.concurrency_limit, "admission.overrun");
                self.grant(ticket);
                return Ok(Admission::Overrun);
            };

            client.release_reentrant_latch();
            state.slots[slot] = Slot {
                reserved: true,
                wait_ended: false,
            };
            state.queue.push_back(slot);
            self.events[slot].reset();
            drop(state);

            client.set_op_info("waiting in admission queue");
            self.events[slot].wait();
            client.set_op_info("");

            let mut state = self.state.lock();
            let credited = state.slots[slot].wait_ended;
            state.slots[slot] = Slot::default();
            state.queue.retain(|&queued| queued != slot);
            drop(state);
            if !credited {
                debug!(slot, "admission.wait_aborted");
                return Err(BufferError::Shutdown);
            }
            self.grant(ticket);
            return Ok(Admission::AdmittedAfterWait);
        }
    }

    /// Admits the caller unconditionally. Used by callers resuming after an
    /// external wait, who must not queue behind threads they may block.
    pub fn force_enter(&self, ticket: &mut GateTicketState) {
        if ticket.declared_inside {
            error!("admission.force_enter_while_inside");
        } else {
            self.state.lock().credit();
        }
        ticket.declared_inside = true;
        ticket.free_tickets = 1;
    }

    /// Leaves the engine unless the caller still has tickets to spend.
    pub fn exit(&self, ticket: &mut GateTicketState) {
        if !ticket.declared_inside || ticket.free_tickets > 0 {
            return;
        }
        self.exit_force(ticket);
    }

    /// Leaves the engine and hands the freed place to the first waiter.
    ///
    /// A caller that is not inside is left alone.
    pub fn exit_force(&self, ticket: &mut GateTicketState) {
        if !ticket.declared_inside {
            return;
        }
        ticket.declared_inside = false;
        ticket.free_tickets = 0;

        let mut state = self.state.lock();
        assert!(state.active > 0, "admission: active count underflow");
        state.active -= 1;
        let mut wake = None;
        if state.active < self.opts.concurrency_limit {
            let next = state
                .queue
                .iter()
                .copied()
                .find(|&slot| !state.slots[slot].wait_ended);
            if let Some(slot) = next {
                state.slots[slot].wait_ended = true;
                state.credit();
                wake = Some(slot);
            }
        }
        drop(state);
        if let Some(slot) = wake {
            self.events[slot].set();
        }
    }

    /// Wakes every queued caller without admitting it. Later entries fail.
    pub fn shutdown(&self) {
        let state = self.state.lock();
        self.shutdown.store(true, Ordering::Release);
        let queued: Vec<usize> = state.queue.iter().copied().collect();
        drop(state);
        for slot in queued {
            self.events[slot].set();
        }
    }

    /// Units of work currently inside.
    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    /// Highest active count observed since creation.
    pub fn peak_active(&self) -> usize {
        self.state.lock().peak
    }

    /// Admissions granted over the limit.
    pub fn overruns(&self) -> u64 {
        self.state.lock().overruns
    }

    /// Callers blocked in the wait queue.
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn grant(&self, ticket: &mut GateTicketState) {
        ticket.declared_inside = true;
        ticket.free_tickets = self.opts.free_tickets;
    }
}
