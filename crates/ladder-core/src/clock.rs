//! Wall-clock seam for every timestamp the engine stamps.
//!
//! Tree operations take their timestamp as an argument so a single mutation
//! stamps every touched node with the same instant. The engine reads that
//! instant from a [`Clock`] once per mutation.

use std::sync::Mutex;
use std::sync::PoisonError;

use chrono::{DateTime, Duration, Utc};

/// Source of "now".
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// Real system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and simulation.
///
/// Time only moves when [`ManualClock::advance`] or [`ManualClock::set`] is
/// called, which makes snapshot comparisons deterministic.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    #[must_use]
    pub const fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Create a clock frozen at the given Unix timestamp in milliseconds.
    ///
    /// Out-of-range inputs fall back to the Unix epoch.
    #[must_use]
    pub fn from_millis(millis: i64) -> Self {
        Self::new(DateTime::from_timestamp_millis(millis).unwrap_or_default())
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    /// Jump to an absolute instant.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_moves_when_told() {
        let clock = ManualClock::from_millis(1_700_000_000_000);
        let first = clock.now();
        assert_eq!(clock.now(), first);

        clock.advance(Duration::seconds(5));
        assert_eq!(clock.now() - first, Duration::seconds(5));
    }

    #[test]
    fn manual_clock_set_jumps() {
        let clock = ManualClock::from_millis(0);
        let target = DateTime::from_timestamp_millis(42_000).unwrap();
        clock.set(target);
        assert_eq!(clock.now(), target);
    }
}
