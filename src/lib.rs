//! Dual-mode scheduling: real timers in production, a manually-advanced
//! virtual clock in tests, behind one contract.
//!
//! A [`Timeline`] is the process-scoped scheduling context. Schedulers
//! created from it expose the same configuration surface in both modes
//! ([`Scheduler::at`], [`Scheduler::after`], [`Scheduler::every`],
//! [`Scheduler::stop`]) and a blocking [`Scheduler::tick`] that yields once
//! per fire, so calling code never branches on mode.
//!
//! - **Real mode** (the default): schedules are backed by per-scheduler
//!   timer threads reading the wall clock. [`Timeline::pause`] defers due
//!   fires; [`Timeline::resume`] delivers a single catch-up tick per
//!   deferred scheduler, however many grid points were missed.
//! - **Test mode** ([`Timeline::enter_test_mode`]): time stands still until
//!   the clock controller moves it. [`Timeline::advance_to`] (and
//!   [`advance_by`](Timeline::advance_by) / [`next_tick`](Timeline::next_tick))
//!   fires due schedulers batch by batch, deterministically.
//!
//! Repeating schedules fire on a fixed grid, at multiples of the interval
//! from the start time, so processing delay never accumulates drift in
//! either mode.
//!
//! ```
//! use std::time::Duration;
//! use tickgrid::{Timeline, Wakeup};
//!
//! let timeline = Timeline::new();
//! timeline.enter_test_mode();
//!
//! let scheduler = timeline.scheduler();
//! scheduler.every(Duration::from_secs(60));
//!
//! timeline.advance_by(Duration::from_secs(60));
//! assert_eq!(scheduler.try_tick(), Some(Wakeup::Tick));
//! ```

pub mod clock;
mod notify;
pub mod scheduler;
pub mod task;
pub mod timeline;

pub use clock::{Clock, TEST_EPOCH_MS, WallClock};
pub use notify::Wakeup;
pub use scheduler::Scheduler;
pub use task::RepeatingTask;
pub use timeline::{ClockMode, Timeline};
