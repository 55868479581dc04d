//! Process-scoped scheduling context: trigger queue, clock controller and
//! pause coordinator.
//!
//! A [`Timeline`] owns everything schedulers share: the clock mode, the
//! virtual clock, the ordered trigger queue, the paused flag and the
//! scheduler registry. Instead of ambient globals, every scheduler holds a
//! reference to the timeline that created it, so independent timelines (one
//! per test, say) can coexist in one process.
//!
//! Two coarse locks guard the shared state: one for clock/mode/pause
//! transitions, one for the trigger queue plus registry. Lock order is
//! control before queue, and queue before any per-scheduler state; nothing
//! ever acquires them in the opposite direction.
//!
//! # Invariants
//!
//! - At most one trigger per live scheduler exists in the queue; configuring
//!   a scheduler atomically replaces (or removes) its entry.
//! - Triggers due at the same instant fire in registration-sequence order.
//! - A mode switch is a full reset: triggers, resume waiters and the pause
//!   flag are cleared, and schedulers from before the switch are detached
//!   (their blocked consumers observe [`Wakeup::Cancelled`]).
//!
//! [`Wakeup::Cancelled`]: crate::Wakeup::Cancelled

use crate::clock::{Clock, TEST_EPOCH_MS, VirtualClock, WallClock};
use crate::scheduler::{Schedule, Scheduler, SchedulerRecord, next_grid_ms, run_real_worker};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Bounded grace given to the consumers of a dispatched batch before the
/// next advance batch is evaluated. A scheduler whose notification is not
/// picked up within this window is not fired again for the rest of the
/// advance; its re-armed trigger stays pending.
const ADVANCE_GRACE: Duration = Duration::from_millis(25);

/// Which clock is authoritative for a timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    /// The system wall clock; schedulers fire autonomously.
    Real,
    /// The manually-advanced virtual clock; schedulers fire only through the
    /// clock controller.
    Test,
}

/// A pending wakeup: scheduler handle plus fire time. `seq` is the
/// registration sequence used as the deterministic tie-break for triggers
/// due at the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Trigger {
    id: u64,
    seq: u64,
    when_ms: u64,
}

struct ControlState {
    mode: ClockMode,
    /// Bumped on every mode reset; schedulers carry the epoch they were
    /// created under and go inert once it is stale.
    epoch: u64,
    paused: bool,
    /// Real schedulers that came due while paused, in arrival order. Each
    /// gets exactly one catch-up tick on resume.
    resume_waiters: Vec<u64>,
}

struct QueueState {
    triggers: Vec<Trigger>,
    registry: HashMap<u64, Weak<SchedulerRecord>>,
    next_seq: u64,
}

impl QueueState {
    fn alloc_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

pub(crate) struct TimelineShared {
    control: Mutex<ControlState>,
    queue: Mutex<QueueState>,
    virtual_clock: VirtualClock,
    next_id: AtomicU64,
}

impl TimelineShared {
    pub(crate) fn virtual_now_ms(&self) -> u64 {
        self.virtual_clock.now_ms()
    }

    /// Apply a scheduler configuration. The epoch check, the schedule state
    /// write and the trigger-queue update all happen under the control and
    /// queue locks, so neither a clone reconfiguring concurrently nor a mode
    /// reset in flight can leave the record and the queue disagreeing.
    /// Returns `false` when the scheduler predates the current epoch.
    pub(crate) fn configure(
        self: &Arc<Self>,
        record: &Arc<SchedulerRecord>,
        schedule: Schedule,
        target_ms: Option<u64>,
    ) -> bool {
        let mut control = self.control.lock();
        if record.epoch != control.epoch {
            return false;
        }
        // Reconfiguring forfeits any catch-up tick owed from a paused fire;
        // the new schedule starts clean.
        control.resume_waiters.retain(|waiter| *waiter != record.id);
        let mut queue = self.queue.lock();
        {
            let mut state = record.state.lock();
            state.schedule = schedule;
            state.armed_deadline_ms = target_ms;
            state.generation += 1;
            if record.mode == ClockMode::Real {
                if target_ms.is_some() && !state.worker_spawned {
                    state.worker_spawned = true;
                    let timeline = Arc::clone(self);
                    let worker_record = Arc::clone(record);
                    thread::spawn(move || run_real_worker(&timeline, &worker_record));
                }
                record.cfg_cond.notify_all();
            }
        }
        if record.mode == ClockMode::Test {
            queue.triggers.retain(|trigger| trigger.id != record.id);
            if let Some(when_ms) = target_ms {
                let seq = queue.alloc_seq();
                queue.triggers.push(Trigger {
                    id: record.id,
                    seq,
                    when_ms,
                });
            }
        }
        true
    }

    pub(crate) fn trigger_time(&self, id: u64) -> Option<u64> {
        self.queue
            .lock()
            .triggers
            .iter()
            .find(|trigger| trigger.id == id)
            .map(|trigger| trigger.when_ms)
    }

    /// Real-mode fire path: while paused, record the scheduler as owed one
    /// catch-up tick (idempotently) instead of delivering. Returns whether
    /// the fire was deferred.
    pub(crate) fn defer_fire_if_paused(&self, id: u64) -> bool {
        let mut control = self.control.lock();
        if !control.paused {
            return false;
        }
        if !control.resume_waiters.contains(&id) {
            control.resume_waiters.push(id);
        }
        true
    }

    /// Forget any catch-up tick owed to `id`. Reconfiguring or stopping a
    /// scheduler forfeits its deferred fire.
    pub(crate) fn clear_resume_waiter(&self, id: u64) {
        self.control.lock().resume_waiters.retain(|w| *w != id);
    }

    /// Drop every reference the timeline holds to `id`. Called when the last
    /// scheduler handle is dropped.
    pub(crate) fn release(&self, id: u64) {
        self.clear_resume_waiter(id);
        let mut queue = self.queue.lock();
        queue.triggers.retain(|trigger| trigger.id != id);
        queue.registry.remove(&id);
    }

    /// One batch-advance pass. Sorts the queue, moves the virtual clock and
    /// removes the batch of triggers sharing the earliest due instant,
    /// re-arming repeating members synchronously. Triggers whose scheduler id
    /// is in `held` stay armed and are ignored when picking the batch.
    /// Returns the records to notify, or `None` when the pass completed the
    /// advance (the clock has been jumped to `target_ms`).
    fn take_due_batch(
        &self,
        target_ms: u64,
        held: &HashSet<u64>,
    ) -> Option<Vec<Arc<SchedulerRecord>>> {
        let mut queue = self.queue.lock();
        queue
            .triggers
            .sort_by_key(|trigger| (trigger.when_ms, trigger.seq));
        let earliest = queue
            .triggers
            .iter()
            .filter(|trigger| !held.contains(&trigger.id))
            .map(|trigger| trigger.when_ms)
            .min();
        let Some(earliest) = earliest else {
            self.virtual_clock.set(target_ms);
            return None;
        };
        if earliest > target_ms {
            self.virtual_clock.set(target_ms);
            return None;
        }
        // Fired schedulers must observe a clock exactly at their fire time,
        // never beyond it.
        if earliest > self.virtual_clock.now_ms() {
            self.virtual_clock.set(earliest);
        }
        let mut due = Vec::new();
        queue.triggers.retain(|trigger| {
            if trigger.when_ms == earliest && !held.contains(&trigger.id) {
                due.push(*trigger);
                return false;
            }
            true
        });
        let mut fired = Vec::with_capacity(due.len());
        for trigger in due {
            let Some(record) = queue.registry.get(&trigger.id).and_then(Weak::upgrade) else {
                continue;
            };
            // Re-arm repeating schedules before anyone can observe the queue
            // without them; one-shots consume their armed state.
            let rearm = {
                let mut state = record.state.lock();
                match state.schedule {
                    Schedule::Every {
                        start_ms,
                        interval_ms,
                    } => {
                        let next =
                            next_grid_ms(self.virtual_clock.now_ms(), start_ms, interval_ms);
                        state.armed_deadline_ms = Some(next);
                        Some(next)
                    }
                    Schedule::At { .. } | Schedule::Unset => {
                        state.schedule = Schedule::Unset;
                        state.armed_deadline_ms = None;
                        None
                    }
                }
            };
            if let Some(next) = rearm {
                let seq = queue.alloc_seq();
                queue.triggers.push(Trigger {
                    id: trigger.id,
                    seq,
                    when_ms: next,
                });
            }
            fired.push(record);
        }
        Some(fired)
    }
}

/// Explicit process-scoped scheduling context.
///
/// Cheap to clone; clones share all state. Starts in [`ClockMode::Real`].
#[derive(Clone)]
pub struct Timeline {
    shared: Arc<TimelineShared>,
}

impl Timeline {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(TimelineShared {
                control: Mutex::new(ControlState {
                    mode: ClockMode::Real,
                    epoch: 0,
                    paused: false,
                    resume_waiters: Vec::new(),
                }),
                queue: Mutex::new(QueueState {
                    triggers: Vec::new(),
                    registry: HashMap::new(),
                    next_seq: 0,
                }),
                virtual_clock: VirtualClock::new(),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn mode(&self) -> ClockMode {
        self.shared.control.lock().mode
    }

    /// Current time on the authoritative clock for the current mode.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        match self.mode() {
            ClockMode::Test => self.shared.virtual_clock.now_ms(),
            ClockMode::Real => WallClock.now_ms(),
        }
    }

    /// Create a scheduler bound to the current mode.
    #[must_use]
    pub fn scheduler(&self) -> Scheduler {
        let (mode, epoch) = {
            let control = self.shared.control.lock();
            (control.mode, control.epoch)
        };
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let record = Arc::new(SchedulerRecord::new(id, epoch, mode));
        self.shared
            .queue
            .lock()
            .registry
            .insert(id, Arc::downgrade(&record));
        tracing::trace!(
            event = "timeline.scheduler.created",
            id,
            mode = ?mode,
            "Scheduler created"
        );
        Scheduler::from_parts(Arc::clone(&self.shared), record)
    }

    /// Switch to test mode. Full reset: all triggers, pending wait state and
    /// the pause flag are cleared, schedulers created before the switch are
    /// detached, and the virtual clock is seeded with
    /// [`TEST_EPOCH_MS`](crate::TEST_EPOCH_MS).
    pub fn enter_test_mode(&self) {
        self.reset(ClockMode::Test);
    }

    /// Switch back to the real wall clock. Full reset, as with
    /// [`enter_test_mode`](Self::enter_test_mode); schedulers created
    /// afterwards are real.
    pub fn exit_test_mode(&self) {
        self.reset(ClockMode::Real);
    }

    fn reset(&self, new_mode: ClockMode) {
        let records: Vec<Arc<SchedulerRecord>> = {
            let mut control = self.shared.control.lock();
            control.mode = new_mode;
            control.epoch += 1;
            control.paused = false;
            control.resume_waiters.clear();
            let mut queue = self.shared.queue.lock();
            queue.triggers.clear();
            let records = queue.registry.values().filter_map(Weak::upgrade).collect();
            queue.registry.clear();
            records
        };
        self.shared.virtual_clock.set(TEST_EPOCH_MS);
        for record in records {
            record.disarm(false);
            record.signal.cancel();
        }
        tracing::debug!(
            event = "timeline.reset",
            mode = ?new_mode,
            "Timeline reset"
        );
    }

    /// Advance the virtual clock to exactly the earliest pending trigger's
    /// time, firing it. With an empty queue this is a no-op. Returns the
    /// (possibly unchanged) virtual time.
    pub fn next_tick(&self) -> u64 {
        if self.mode() != ClockMode::Test {
            tracing::warn!(
                event = "timeline.next_tick.ignored",
                "next_tick outside test mode is a no-op"
            );
            return self.now_ms();
        }
        let earliest = {
            let queue = self.shared.queue.lock();
            queue.triggers.iter().map(|trigger| trigger.when_ms).min()
        };
        if let Some(when_ms) = earliest {
            self.advance_to(when_ms);
        }
        self.now_ms()
    }

    /// Advance the virtual clock by `duration`, firing every trigger that
    /// comes due along the way.
    pub fn advance_by(&self, duration: Duration) {
        let target = self
            .now_ms()
            .saturating_add(crate::scheduler::duration_to_ms(duration));
        self.advance_to(target);
    }

    /// Advance the virtual clock to `target_ms`, batch by batch.
    ///
    /// Each pass fires every trigger due at the earliest pending instant
    /// (ties broken by registration order), re-arms repeating schedulers on
    /// their grid, and dispatches notifications without holding the queue
    /// lock. Consumers get a short grace window to pick up their tick; a
    /// scheduler whose tick is still unconsumed after it is not fired again
    /// within this call (its re-armed trigger stays pending), while every
    /// other due trigger still fires. The clock always lands exactly on
    /// `target_ms`, never beyond.
    ///
    /// Outside test mode this is a traced no-op.
    pub fn advance_to(&self, target_ms: u64) {
        if self.mode() != ClockMode::Test {
            tracing::warn!(
                event = "timeline.advance.ignored",
                target_ms,
                "advance_to outside test mode is a no-op"
            );
            return;
        }
        // Schedulers holding an unconsumed tick from an earlier batch of
        // this call. Re-firing them would only coalesce into the full slot.
        let mut held = HashSet::new();
        loop {
            let Some(fired) = self.shared.take_due_batch(target_ms, &held) else {
                return;
            };
            let mut batch = Vec::with_capacity(fired.len());
            for record in fired {
                let generation = record.signal.notify();
                batch.push((record, generation));
            }
            if !batch.is_empty() {
                tracing::debug!(
                    event = "timeline.advance.batch",
                    fired = batch.len(),
                    now_ms = self.shared.virtual_clock.now_ms(),
                    target_ms,
                    "Dispatched due triggers"
                );
            }
            if self.shared.virtual_clock.now_ms() >= target_ms {
                return;
            }
            let grace_start = Instant::now();
            for (record, generation) in &batch {
                let remaining = ADVANCE_GRACE.saturating_sub(grace_start.elapsed());
                if !record.signal.await_consumed(*generation, remaining) {
                    held.insert(record.id);
                }
            }
        }
    }

    /// Suspend autonomous firing of real schedulers. A real schedule that
    /// comes due while paused defers its notification until
    /// [`resume`](Self::resume); a repeating schedule paused through several
    /// grid points collapses them into a single catch-up tick. Test-mode
    /// advancement is unaffected.
    pub fn pause(&self) {
        let mut control = self.shared.control.lock();
        control.paused = true;
        tracing::trace!(event = "timeline.pause", "Real-mode firing suspended");
    }

    /// Resume autonomous firing and deliver one catch-up tick to every
    /// scheduler that came due while paused.
    pub fn resume(&self) {
        let waiters = {
            let mut control = self.shared.control.lock();
            control.paused = false;
            std::mem::take(&mut control.resume_waiters)
        };
        let records: Vec<Arc<SchedulerRecord>> = {
            let queue = self.shared.queue.lock();
            waiters
                .iter()
                .filter_map(|id| queue.registry.get(id).and_then(Weak::upgrade))
                .collect()
        };
        tracing::trace!(
            event = "timeline.resume",
            catchup = records.len(),
            "Real-mode firing resumed"
        );
        for record in records {
            record.signal.notify();
        }
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.shared.control.lock().paused
    }

    /// Number of pending triggers in the queue. Diagnostic.
    #[must_use]
    pub fn pending_triggers(&self) -> usize {
        self.shared.queue.lock().triggers.len()
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Timeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeline")
            .field("mode", &self.mode())
            .field("now_ms", &self.now_ms())
            .field("pending_triggers", &self.pending_triggers())
            .field("paused", &self.is_paused())
            .finish()
    }
}
