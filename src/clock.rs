//! Clock sources.
//!
//! A [`Timeline`](crate::Timeline) reads time through exactly one of two
//! sources: [`WallClock`] in real mode, or a process-scoped [`VirtualClock`]
//! while test mode is active. Schedulers never read the system clock
//! directly; everything goes through the timeline so both modes share one
//! code path.

use std::sync::atomic::{AtomicU64, Ordering};

/// Virtual timestamp a timeline's clock is seeded with on entering test mode
/// (2016-11-25T20:47:00Z, in milliseconds since the Unix epoch).
///
/// Deliberately non-zero so that "is this timestamp unset" checks against a
/// zero value never spuriously match a freshly-entered test clock.
pub const TEST_EPOCH_MS: u64 = 1_480_106_820_000;

/// A monotonic-enough source of the current time.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Real wall clock implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl Clock for WallClock {
    fn now_ms(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        u64::try_from(millis).unwrap_or(u64::MAX)
    }
}

/// Manually-advanced clock backing test mode.
///
/// Only the clock controller ([`Timeline::advance_to`] and friends) writes
/// it; the stored value is meaningless while the owning timeline is in real
/// mode.
///
/// [`Timeline::advance_to`]: crate::Timeline::advance_to
#[derive(Debug)]
pub(crate) struct VirtualClock {
    current_ms: AtomicU64,
}

impl VirtualClock {
    pub(crate) const fn new() -> Self {
        Self {
            current_ms: AtomicU64::new(TEST_EPOCH_MS),
        }
    }

    pub(crate) fn set(&self, now_ms: u64) {
        self.current_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for VirtualClock {
    fn now_ms(&self) -> u64 {
        self.current_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wall_clock_returns_positive_ms() {
        let now = WallClock.now_ms();
        assert!(now > 0, "WallClock should return a positive timestamp");
    }

    #[test]
    fn virtual_clock_starts_at_test_epoch() {
        let clock = VirtualClock::new();
        assert_eq!(clock.now_ms(), TEST_EPOCH_MS);
        assert_ne!(TEST_EPOCH_MS, 0);
    }

    #[test]
    fn virtual_clock_set_overwrites() {
        let clock = VirtualClock::new();
        clock.set(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.set(5_000);
        assert_eq!(clock.now_ms(), 5_000);
    }
}
