#![forbid(unsafe_code)]

//! Manual-reset event used for batch-end notification and admission slots.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A manual-reset event: once set, every waiter passes until `reset`.
#[derive(Default)]
pub struct Event {
    signaled: Mutex<bool>,
    cv: Condvar,
}

impl Event {
    /// Creates an event in the given state.
    pub fn new(signaled: bool) -> Self {
        Self {
            signaled: Mutex::new(signaled),
            cv: Condvar::new(),
        }
    }

    /// Signals the event and wakes every waiter.
    pub fn set(&self) {
        let mut state = self.signaled.lock();
        *state = true;
        self.cv.notify_all();
    }

    /// Clears the event so later waiters block.
    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    /// True if the event is currently signaled.
    pub fn is_set(&self) -> bool {
        *self.signaled.lock()
    }

    /// Blocks until the event is signaled.
    pub fn wait(&self) {
        let mut state = self.signaled.lock();
        while !*state {
            self.cv.wait(&mut state);
        }
    }

    /// Blocks until signaled or `timeout` elapses. Returns whether the
    /// event was signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut state = self.signaled.lock();
        if !*state {
            let _ = self.cv.wait_for(&mut state, timeout);
        }
        *state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn set_releases_waiter() {
        let event = Arc::new(Event::new(false));
        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait())
        };
        thread::sleep(Duration::from_millis(10));
        event.set();
        waiter.join().unwrap();
        assert!(event.is_set());
    }

    #[test]
    fn reset_blocks_again() {
        let event = Event::new(true);
        assert!(event.wait_timeout(Duration::from_millis(1)));
        event.reset();
        assert!(!event.wait_timeout(Duration::from_millis(5)));
    }
}
