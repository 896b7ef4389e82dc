//! Time sources.
//!
//! The core reads two clocks: a monotonic microsecond counter for all
//! scheduling decisions, and a best-effort wall clock (Unix µs) that is
//! only used to relate sender NTP time to local time.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Monotonic and wall-clock time in microseconds.
pub trait WallClock: Send + Sync {
    /// Microseconds since an arbitrary fixed origin. Never decreases.
    fn now_monotonic_us(&self) -> u64;

    /// Microseconds since the Unix epoch.
    fn now_wall_us(&self) -> i64;
}

/// System-backed clock.
///
/// The monotonic origin is offset by one second so that a reading of zero
/// never occurs; zero is reserved as "unset" in timing state.
#[derive(Debug, Clone)]
pub struct SystemClock {
    // ---
    origin: Instant,
}

impl SystemClock {
    // ---
    pub fn new() -> Self {
        // ---
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        // ---
        Self::new()
    }
}

impl WallClock for SystemClock {
    fn now_monotonic_us(&self) -> u64 {
        // ---
        1_000_000 + self.origin.elapsed().as_micros() as u64
    }

    fn now_wall_us(&self) -> i64 {
        // ---
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for deterministic tests and simulations.
///
/// Cloning shares the underlying time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    // ---
    mono_us: Arc<AtomicU64>,
    wall_us: Arc<AtomicI64>,
}

impl ManualClock {
    // ---
    /// Starts at the given monotonic and wall readings.
    pub fn new(mono_us: u64, wall_us: i64) -> Self {
        // ---
        Self {
            mono_us: Arc::new(AtomicU64::new(mono_us)),
            wall_us: Arc::new(AtomicI64::new(wall_us)),
        }
    }

    /// Advances both clocks by `us`.
    pub fn advance_us(&self, us: u64) {
        // ---
        self.mono_us.fetch_add(us, Ordering::SeqCst);
        self.wall_us.fetch_add(us as i64, Ordering::SeqCst);
    }

    /// Steps only the wall clock, as an NTP correction would.
    pub fn step_wall_us(&self, delta_us: i64) {
        // ---
        self.wall_us.fetch_add(delta_us, Ordering::SeqCst);
    }
}

impl WallClock for ManualClock {
    fn now_monotonic_us(&self) -> u64 {
        self.mono_us.load(Ordering::SeqCst)
    }

    fn now_wall_us(&self) -> i64 {
        self.wall_us.load(Ordering::SeqCst)
    }
}

impl<C: WallClock + ?Sized> WallClock for Arc<C> {
    fn now_monotonic_us(&self) -> u64 {
        (**self).now_monotonic_us()
    }

    fn now_wall_us(&self) -> i64 {
        (**self).now_wall_us()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_system_clock_is_nonzero_and_monotonic() {
        // ---
        let clock = SystemClock::new();
        let a = clock.now_monotonic_us();
        let b = clock.now_monotonic_us();
        assert!(a >= 1_000_000);
        assert!(b >= a);
        assert!(clock.now_wall_us() > 1_600_000_000_000_000);
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        // ---
        let clock = ManualClock::new(10, 1_000);
        let other = clock.clone();
        clock.advance_us(5);
        assert_eq!(other.now_monotonic_us(), 15);
        assert_eq!(other.now_wall_us(), 1_005);

        other.step_wall_us(-500);
        assert_eq!(clock.now_wall_us(), 505);
        assert_eq!(clock.now_monotonic_us(), 15);
    }
}
