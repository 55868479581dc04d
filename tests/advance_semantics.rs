//! Cross-thread test-mode scenarios: consumers blocking on `tick()` while
//! the clock controller advances the virtual clock.

use pretty_assertions::assert_eq;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tickgrid::{TEST_EPOCH_MS, Timeline, Wakeup};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_timeline() -> Timeline {
    init_tracing();
    let timeline = Timeline::new();
    timeline.enter_test_mode();
    timeline
}

#[test]
fn repeating_consumer_sees_one_tick_per_grid_point() {
    let timeline = test_timeline();
    let scheduler = timeline.scheduler();
    scheduler.every(Duration::from_secs(1));

    let consumer = {
        let ticker = scheduler.clone();
        thread::spawn(move || {
            let mut fires = 0_u32;
            while fires < 5 {
                match ticker.tick() {
                    Wakeup::Tick => fires += 1,
                    Wakeup::Cancelled => break,
                }
            }
            fires
        })
    };

    // Two separate advances crossing five grid points in total.
    timeline.advance_by(Duration::from_millis(2_500));
    timeline.advance_by(Duration::from_millis(2_500));

    assert_eq!(consumer.join().expect("consumer thread"), 5);
    assert_eq!(timeline.now_ms(), TEST_EPOCH_MS + 5_000);
    assert_eq!(scheduler.next_fire_ms(), Some(TEST_EPOCH_MS + 6_000));
}

#[test]
fn one_shot_chain_re_arms_between_advances() {
    let timeline = test_timeline();
    let scheduler = timeline.scheduler();
    scheduler.after(Duration::from_secs(1));

    let (rearmed_tx, rearmed_rx) = mpsc::channel();
    let consumer = {
        let ticker = scheduler.clone();
        thread::spawn(move || {
            let mut fires = 0_u32;
            while fires < 3 {
                match ticker.tick() {
                    Wakeup::Tick => {
                        fires += 1;
                        ticker.after(Duration::from_secs(1));
                        rearmed_tx.send(()).expect("report re-arm");
                    }
                    Wakeup::Cancelled => break,
                }
            }
            fires
        })
    };

    for _ in 0..3 {
        timeline.advance_by(Duration::from_secs(1));
        rearmed_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("consumer re-armed in time");
    }

    assert_eq!(consumer.join().expect("consumer thread"), 3);
    assert_eq!(timeline.now_ms(), TEST_EPOCH_MS + 3_000);
}

#[test]
fn two_consumers_fire_independently_at_the_same_instant() {
    let timeline = test_timeline();
    let repeating = timeline.scheduler();
    let one_shot = timeline.scheduler();
    repeating.every(Duration::from_secs(1));
    one_shot.after(Duration::from_secs(1));

    let spawn_waiter = |scheduler: tickgrid::Scheduler| {
        thread::spawn(move || scheduler.tick())
    };
    let waiter_a = spawn_waiter(repeating.clone());
    let waiter_b = spawn_waiter(one_shot.clone());

    timeline.advance_to(TEST_EPOCH_MS + 1_000);

    assert_eq!(waiter_a.join().expect("waiter a"), Wakeup::Tick);
    assert_eq!(waiter_b.join().expect("waiter b"), Wakeup::Tick);
    assert_eq!(one_shot.next_fire_ms(), None);
    assert_eq!(repeating.next_fire_ms(), Some(TEST_EPOCH_MS + 2_000));
}

#[test]
fn independent_timelines_do_not_interact() {
    init_tracing();
    let alpha = Timeline::new();
    let beta = Timeline::new();
    alpha.enter_test_mode();
    beta.enter_test_mode();

    let on_alpha = alpha.scheduler();
    let on_beta = beta.scheduler();
    on_alpha.after(Duration::from_secs(1));
    on_beta.after(Duration::from_secs(1));

    alpha.advance_by(Duration::from_secs(5));

    assert_eq!(on_alpha.try_tick(), Some(Wakeup::Tick));
    assert_eq!(on_beta.try_tick(), None);
    assert_eq!(beta.now_ms(), TEST_EPOCH_MS);
    assert_eq!(beta.pending_triggers(), 1);
}

#[test]
fn slow_consumer_does_not_block_other_schedulers() {
    let timeline = test_timeline();
    let never_read = timeline.scheduler();
    let active = timeline.scheduler();
    never_read.after(Duration::from_secs(1));
    active.after(Duration::from_secs(1));

    let waiter = {
        let ticker = active.clone();
        thread::spawn(move || ticker.tick())
    };

    // The unread scheduler's slot simply stays full; dispatch is
    // fire-and-forget, so the active consumer still gets its tick.
    timeline.advance_by(Duration::from_secs(2));
    assert_eq!(waiter.join().expect("active waiter"), Wakeup::Tick);
    assert_eq!(never_read.try_tick(), Some(Wakeup::Tick));
}
