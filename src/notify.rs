//! Single-slot coalescing wakeup signal.
//!
//! Each scheduler owns one [`TickSignal`]. Firing it makes exactly one
//! notification available to a single waiter; firing again before the waiter
//! runs coalesces into the same slot instead of queueing. This matches the
//! "at most one outstanding fire per scheduler" invariant, and it means
//! dispatch never blocks on a slow consumer.
//!
//! The signal also counts deliveries and consumptions so the clock controller
//! can wait (bounded) for a fired consumer to pick up its tick before the
//! next advance batch is computed, instead of relying on a fixed sleep.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Outcome of waiting on a scheduler's wakeup signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// The schedule came due.
    Tick,
    /// The signal was cancelled by a timeline mode reset (or task shutdown);
    /// no further ticks will ever arrive on this scheduler.
    Cancelled,
}

#[derive(Debug, Default)]
struct SignalState {
    pending: bool,
    cancelled: bool,
    /// Total notifications delivered into the slot.
    delivered: u64,
    /// High-water mark of deliveries observed by a waiter.
    consumed: u64,
}

#[derive(Debug, Default)]
pub(crate) struct TickSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl TickSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make one notification available, coalescing with any still-pending
    /// one. Returns the delivery generation, usable with
    /// [`await_consumed`](Self::await_consumed).
    pub(crate) fn notify(&self) -> u64 {
        let mut state = self.state.lock();
        state.pending = true;
        state.delivered += 1;
        self.cond.notify_all();
        state.delivered
    }

    /// Permanently cancel the signal. Pending and future waiters observe
    /// [`Wakeup::Cancelled`]; barrier waiters are released.
    pub(crate) fn cancel(&self) {
        let mut state = self.state.lock();
        state.cancelled = true;
        state.pending = false;
        state.consumed = state.delivered;
        self.cond.notify_all();
    }

    /// Block until a tick is pending or the signal is cancelled.
    pub(crate) fn wait(&self) -> Wakeup {
        let mut state = self.state.lock();
        loop {
            if state.pending {
                state.pending = false;
                state.consumed = state.delivered;
                self.cond.notify_all();
                return Wakeup::Tick;
            }
            if state.cancelled {
                return Wakeup::Cancelled;
            }
            self.cond.wait(&mut state);
        }
    }

    /// Non-blocking probe of the signal.
    pub(crate) fn try_wait(&self) -> Option<Wakeup> {
        let mut state = self.state.lock();
        if state.pending {
            state.pending = false;
            state.consumed = state.delivered;
            self.cond.notify_all();
            return Some(Wakeup::Tick);
        }
        if state.cancelled {
            return Some(Wakeup::Cancelled);
        }
        None
    }

    /// Wait until the delivery identified by `generation` has been consumed,
    /// or `timeout` elapses. Returns whether it was consumed.
    pub(crate) fn await_consumed(&self, generation: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.consumed < generation {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return state.consumed >= generation;
            }
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn delivered(&self) -> u64 {
        self.state.lock().delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn notify_then_wait_yields_tick() {
        let signal = TickSignal::new();
        signal.notify();
        assert_eq!(signal.wait(), Wakeup::Tick);
        assert_eq!(signal.try_wait(), None);
    }

    #[test]
    fn double_notify_coalesces_into_one_tick() {
        let signal = TickSignal::new();
        signal.notify();
        signal.notify();
        assert_eq!(signal.try_wait(), Some(Wakeup::Tick));
        assert_eq!(signal.try_wait(), None);
        assert_eq!(signal.delivered(), 2);
    }

    #[test]
    fn cancel_unblocks_waiters() {
        let signal = Arc::new(TickSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait())
        };
        // Let the waiter block before cancelling.
        thread::sleep(Duration::from_millis(10));
        signal.cancel();
        assert_eq!(waiter.join().expect("waiter thread"), Wakeup::Cancelled);
        assert_eq!(signal.try_wait(), Some(Wakeup::Cancelled));
    }

    #[test]
    fn await_consumed_times_out_without_a_waiter() {
        let signal = TickSignal::new();
        let generation = signal.notify();
        assert!(!signal.await_consumed(generation, Duration::from_millis(5)));
    }

    #[test]
    fn await_consumed_returns_once_waiter_picks_up() {
        let signal = Arc::new(TickSignal::new());
        let generation = signal.notify();
        let consumer = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait())
        };
        assert!(signal.await_consumed(generation, Duration::from_secs(2)));
        assert_eq!(consumer.join().expect("consumer thread"), Wakeup::Tick);
    }

    #[test]
    fn await_consumed_already_satisfied_is_immediate() {
        let signal = TickSignal::new();
        let generation = signal.notify();
        assert_eq!(signal.wait(), Wakeup::Tick);
        assert!(signal.await_consumed(generation, Duration::ZERO));
    }
}
