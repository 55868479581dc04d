//! Periodic task wrapper over the scheduler.
//!
//! A [`RepeatingTask`] runs a closure, then blocks on a grid-aligned
//! repeating schedule until the next tick, forever: the run-then-wait shape
//! a polling loop wants. In test mode the closure runs once at spawn and
//! once per grid point the clock controller advances across.

use crate::notify::Wakeup;
use crate::scheduler::Scheduler;
use crate::timeline::Timeline;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A closure run on a fixed schedule in its own thread.
///
/// Shutting down (explicitly or by dropping the handle) stops the schedule,
/// unblocks the worker and joins it.
#[derive(Debug)]
pub struct RepeatingTask {
    scheduler: Scheduler,
    worker: Option<JoinHandle<()>>,
}

impl RepeatingTask {
    /// Spawn a worker thread that runs `work` immediately and again after
    /// every `interval` tick of `timeline`.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is shorter than one millisecond (see
    /// [`Scheduler::every`]).
    pub fn spawn<F>(timeline: &Timeline, interval: Duration, mut work: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let scheduler = timeline.scheduler();
        scheduler.every(interval);
        let ticker = scheduler.clone();
        let worker = thread::spawn(move || {
            loop {
                work();
                if ticker.tick() == Wakeup::Cancelled {
                    return;
                }
            }
        });
        Self {
            scheduler,
            worker: Some(worker),
        }
    }

    /// Stop the schedule, unblock the worker and wait for it to exit.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        self.scheduler.stop();
        self.scheduler.cancel();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!(
                    event = "task.worker.panicked",
                    id = self.scheduler.id(),
                    "Repeating task worker panicked"
                );
            }
        }
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn wait_for_count(counter: &AtomicU32, at_least: u32) -> u32 {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let seen = counter.load(Ordering::SeqCst);
            if seen >= at_least || Instant::now() >= deadline {
                return seen;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn runs_immediately_and_once_per_advanced_interval() {
        let timeline = Timeline::new();
        timeline.enter_test_mode();
        let counter = Arc::new(AtomicU32::new(0));
        let task = {
            let counter = Arc::clone(&counter);
            RepeatingTask::spawn(&timeline, Duration::from_secs(1), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        };
        // First run happens at spawn, before any time passes.
        assert_eq!(wait_for_count(&counter, 1), 1);

        timeline.advance_by(Duration::from_millis(2_500));
        assert_eq!(wait_for_count(&counter, 3), 3);

        task.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn shutdown_unblocks_a_waiting_worker() {
        let timeline = Timeline::new();
        timeline.enter_test_mode();
        let task = RepeatingTask::spawn(&timeline, Duration::from_secs(3600), || {});
        // The worker is parked waiting on a tick an hour away; shutdown must
        // still return promptly.
        task.shutdown();
    }

    #[test]
    fn dropping_the_handle_shuts_down() {
        let timeline = Timeline::new();
        timeline.enter_test_mode();
        let counter = Arc::new(AtomicU32::new(0));
        {
            let worker_counter = Arc::clone(&counter);
            let _task = RepeatingTask::spawn(&timeline, Duration::from_secs(1), move || {
                worker_counter.fetch_add(1, Ordering::SeqCst);
            });
            assert_eq!(wait_for_count(&counter, 1), 1);
        }
        let settled = counter.load(Ordering::SeqCst);
        timeline.advance_by(Duration::from_secs(10));
        assert_eq!(counter.load(Ordering::SeqCst), settled);
    }
}
