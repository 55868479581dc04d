//! The dual-mode scheduler handle.
//!
//! A [`Scheduler`] is one source of time-based wakeups, one-shot or
//! repeating, created from a [`Timeline`](crate::Timeline). The configuration
//! surface (`at` / `after` / `every` / `stop`) and the wakeup read (`tick`)
//! behave identically in both clock modes:
//!
//! - In real mode a lazily-spawned worker thread waits out the armed deadline
//!   and fires autonomously (unless the timeline is paused).
//! - In test mode configuration only mutates the timeline's trigger queue;
//!   firing happens exclusively through the clock controller.
//!
//! Repeating schedules are grid-aligned: fire times are fixed multiples of
//! the interval from the start time, so processing delay never accumulates
//! drift.

use crate::clock::{Clock, WallClock};
use crate::notify::{TickSignal, Wakeup};
use crate::timeline::{ClockMode, TimelineShared};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Next grid point strictly after `now_ms` for a repeating schedule anchored
/// at `start_ms` with period `interval_ms`. Before the anchor, the first grid
/// point is the anchor itself's first interval boundary.
pub(crate) fn next_grid_ms(now_ms: u64, start_ms: u64, interval_ms: u64) -> u64 {
    if now_ms < start_ms {
        return start_ms;
    }
    let elapsed_intervals = (now_ms - start_ms) / interval_ms;
    start_ms.saturating_add(interval_ms.saturating_mul(elapsed_intervals + 1))
}

pub(crate) fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Schedule {
    /// Nothing armed.
    Unset,
    /// One-shot wakeup at an absolute time.
    At { deadline_ms: u64 },
    /// Grid-aligned repeating wakeup.
    Every { start_ms: u64, interval_ms: u64 },
}

#[derive(Debug)]
pub(crate) struct ScheduleState {
    pub(crate) schedule: Schedule,
    /// Deadline the real worker is currently waiting out. In test mode it
    /// mirrors the trigger queue entry, for introspection only.
    pub(crate) armed_deadline_ms: Option<u64>,
    /// Bumped on every reconfiguration so in-flight waits re-evaluate.
    pub(crate) generation: u64,
    pub(crate) worker_spawned: bool,
    closed: bool,
}

/// Shared per-scheduler record. The trigger queue and the resume-waiter list
/// refer to it only by `id`; the registry holds a `Weak` so a dropped
/// scheduler can never be fired through a stale reference.
pub(crate) struct SchedulerRecord {
    pub(crate) id: u64,
    pub(crate) epoch: u64,
    pub(crate) mode: ClockMode,
    pub(crate) signal: TickSignal,
    pub(crate) state: Mutex<ScheduleState>,
    pub(crate) cfg_cond: Condvar,
}

impl SchedulerRecord {
    pub(crate) fn new(id: u64, epoch: u64, mode: ClockMode) -> Self {
        Self {
            id,
            epoch,
            mode,
            signal: TickSignal::new(),
            state: Mutex::new(ScheduleState {
                schedule: Schedule::Unset,
                armed_deadline_ms: None,
                generation: 0,
                worker_spawned: false,
                closed: false,
            }),
            cfg_cond: Condvar::new(),
        }
    }

    /// Disarm and wake the worker so it re-evaluates (and exits, when
    /// closing). Called by timeline resets and by the last handle dropping.
    pub(crate) fn disarm(&self, close: bool) {
        let mut state = self.state.lock();
        state.schedule = Schedule::Unset;
        state.armed_deadline_ms = None;
        state.generation += 1;
        if close {
            state.closed = true;
        }
        self.cfg_cond.notify_all();
    }
}

struct HandleGuard {
    timeline: Arc<TimelineShared>,
    record: Arc<SchedulerRecord>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.record.disarm(true);
        self.timeline.release(self.record.id);
    }
}

/// A handle representing one source of time-based wakeups.
///
/// Cloneable; all clones share the same schedule and wakeup slot, so a
/// consumer thread typically owns a clone and blocks on [`tick`](Self::tick)
/// while another component reconfigures the schedule. Identity is the
/// timeline-allocated [`id`](Self::id); two schedulers are never equal by
/// value.
///
/// A scheduler whose wakeups are never read leaks nothing permanent, but its
/// record (and, in real mode, its worker thread) stays alive until the last
/// handle is dropped.
#[derive(Clone)]
pub struct Scheduler {
    guard: Arc<HandleGuard>,
}

impl Scheduler {
    pub(crate) fn from_parts(timeline: Arc<TimelineShared>, record: Arc<SchedulerRecord>) -> Self {
        Self {
            guard: Arc::new(HandleGuard { timeline, record }),
        }
    }

    /// Stable opaque identity of this scheduler within its timeline.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.guard.record.id
    }

    /// Current time on the clock authoritative for this scheduler's mode.
    fn now_ms(&self) -> u64 {
        match self.guard.record.mode {
            ClockMode::Test => self.guard.timeline.virtual_now_ms(),
            ClockMode::Real => WallClock.now_ms(),
        }
    }

    /// Arm a one-shot wakeup at an absolute time (milliseconds since the
    /// Unix epoch). Replaces any pending wakeup.
    pub fn at(&self, when_ms: u64) -> &Self {
        tracing::trace!(
            event = "scheduler.at",
            id = self.id(),
            mode = ?self.guard.record.mode,
            when_ms,
            "One-shot wakeup armed"
        );
        self.configure(Schedule::At { deadline_ms: when_ms }, Some(when_ms));
        self
    }

    /// Arm a one-shot wakeup `delay` from now. Replaces any pending wakeup.
    pub fn after(&self, delay: Duration) -> &Self {
        let when_ms = self.now_ms().saturating_add(duration_to_ms(delay));
        tracing::trace!(
            event = "scheduler.after",
            id = self.id(),
            mode = ?self.guard.record.mode,
            delay_ms = duration_to_ms(delay),
            when_ms,
            "One-shot wakeup armed"
        );
        self.configure(Schedule::At { deadline_ms: when_ms }, Some(when_ms));
        self
    }

    /// Arm a repeating wakeup on a fixed grid anchored at the current time.
    /// The first fire is one whole interval from now.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is shorter than one millisecond. A zero or
    /// sub-millisecond interval is a programmer error, not a recoverable
    /// condition.
    pub fn every(&self, interval: Duration) -> &Self {
        let interval_ms = duration_to_ms(interval);
        assert!(interval_ms > 0, "non-positive interval for Scheduler::every");
        let start_ms = self.now_ms();
        tracing::trace!(
            event = "scheduler.every",
            id = self.id(),
            mode = ?self.guard.record.mode,
            start_ms,
            interval_ms,
            "Repeating wakeup armed"
        );
        let first = next_grid_ms(start_ms, start_ms, interval_ms);
        self.configure(
            Schedule::Every {
                start_ms,
                interval_ms,
            },
            Some(first),
        );
        self
    }

    /// Cancel any pending wakeup, one-shot or repeating, without destroying
    /// the scheduler. It can be reconfigured afterwards.
    pub fn stop(&self) {
        tracing::trace!(
            event = "scheduler.stop",
            id = self.id(),
            mode = ?self.guard.record.mode,
            "Pending wakeup cancelled"
        );
        self.configure(Schedule::Unset, None);
    }

    /// Block until the schedule fires (one yield per fire) or the owning
    /// timeline performs a mode reset.
    pub fn tick(&self) -> Wakeup {
        self.guard.record.signal.wait()
    }

    /// Non-blocking probe of the wakeup slot.
    pub fn try_tick(&self) -> Option<Wakeup> {
        self.guard.record.signal.try_wait()
    }

    /// The next armed fire time, if any. Diagnostic; racy by nature against
    /// concurrent advancement.
    #[must_use]
    pub fn next_fire_ms(&self) -> Option<u64> {
        match self.guard.record.mode {
            ClockMode::Test => self.guard.timeline.trigger_time(self.guard.record.id),
            ClockMode::Real => self.guard.record.state.lock().armed_deadline_ms,
        }
    }

    /// Permanently cancel the wakeup signal. Used by task wrappers to
    /// unblock their consumer thread on shutdown.
    pub(crate) fn cancel(&self) {
        self.guard.record.signal.cancel();
    }

    /// Total notifications ever delivered into the wakeup slot, including
    /// coalesced ones.
    #[cfg(test)]
    pub(crate) fn delivered_count(&self) -> u64 {
        self.guard.record.signal.delivered()
    }

    fn configure(&self, schedule: Schedule, target_ms: Option<u64>) {
        let record = &self.guard.record;
        if !self.guard.timeline.configure(record, schedule, target_ms) {
            tracing::warn!(
                event = "scheduler.stale_epoch",
                id = record.id,
                "Configuration ignored: scheduler predates a timeline mode reset"
            );
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.guard.record.id)
            .field("mode", &self.guard.record.mode)
            .field("next_fire_ms", &self.next_fire_ms())
            .finish()
    }
}

/// Real-mode worker loop: wait out the armed deadline (re-evaluating on
/// every reconfiguration), then deliver, or defer to the pause coordinator.
pub(crate) fn run_real_worker(timeline: &Arc<TimelineShared>, record: &Arc<SchedulerRecord>) {
    let mut state = record.state.lock();
    loop {
        if state.closed {
            return;
        }
        let Some(deadline_ms) = state.armed_deadline_ms else {
            record.cfg_cond.wait(&mut state);
            continue;
        };
        let now_ms = WallClock.now_ms();
        if now_ms < deadline_ms {
            let _ = record
                .cfg_cond
                .wait_for(&mut state, Duration::from_millis(deadline_ms - now_ms));
            // Re-evaluate: the wait may have ended on a reconfiguration, a
            // close, a spurious wake, or the deadline passing.
            continue;
        }
        // Due. Re-arm repeating schedules on their grid before delivering so
        // a paused stretch keeps the grid forward-looking.
        match state.schedule {
            Schedule::Every {
                start_ms,
                interval_ms,
            } => {
                state.armed_deadline_ms = Some(next_grid_ms(now_ms, start_ms, interval_ms));
            }
            Schedule::At { .. } | Schedule::Unset => {
                state.schedule = Schedule::Unset;
                state.armed_deadline_ms = None;
            }
        }
        // Deliver without holding the schedule state, so the pause check and
        // notification can never contend with a concurrent reconfiguration.
        parking_lot::MutexGuard::unlocked(&mut state, || {
            if timeline.defer_fire_if_paused(record.id) {
                tracing::trace!(
                    event = "scheduler.fire.deferred",
                    id = record.id,
                    deadline_ms,
                    "Due while paused; deferred until resume"
                );
            } else {
                tracing::trace!(
                    event = "scheduler.fire",
                    id = record.id,
                    deadline_ms,
                    "Schedule fired"
                );
                record.signal.notify();
            }
        });
    }
}
