//! Wall-clock pauses between simulated training steps.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Source of blocking pauses.
pub trait Clock {
    fn sleep(&self, duration: Duration);
}

/// Blocks the current thread for the requested duration.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Records requested pauses and returns immediately.
#[derive(Debug, Default)]
pub struct ManualClock {
    pauses: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pauses(&self) -> Vec<Duration> {
        self.lock().clone()
    }

    /// Sum of all requested pauses.
    pub fn elapsed(&self) -> Duration {
        self.pauses().iter().sum()
    }

    // A panic elsewhere must not lose recorded pauses.
    fn lock(&self) -> MutexGuard<'_, Vec<Duration>> {
        self.pauses.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clock for ManualClock {
    fn sleep(&self, duration: Duration) {
        self.lock().push(duration);
    }
}
