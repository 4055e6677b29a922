//! Time source used for `lastAccessed` stamps and the sweep throttle.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;

/// Source of the current time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// Handy for exercising expiry windows without sleeping.
///
/// ```
/// use armature_docsession::{Clock, ManualClock};
///
/// let clock = ManualClock::default();
/// let start = clock.now();
/// clock.advance(chrono::Duration::minutes(5));
/// assert_eq!(clock.now() - start, chrono::Duration::minutes(5));
/// ```
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward (or backward, for negative deltas).
    pub fn advance(&self, delta: chrono::Duration) {
        let mut now = self.now.lock();
        *now += delta;
    }

    /// Jump to an absolute time.
    pub fn set(&self, time: DateTime<Utc>) {
        *self.now.lock() = time;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
