//! Time source abstraction so challenge expiry and regulation windows can be tested.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock.
/// WARNING: testing only - time never moves unless advanced.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Default for FixedClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|now| *now).unwrap_or_else(|e| *e.into_inner())
    }
}

/// Longest span accepted from configuration, one hundred years.
pub const MAX_CONFIGURED_SECS: i64 = 100 * 365 * 86_400;

/// A configured number of seconds as a [`Duration`] timestamps can be moved by.
pub fn seconds(secs: i64) -> Option<Duration> {
    if !(0..=MAX_CONFIGURED_SECS).contains(&secs) {
        return None;
    }
    Duration::try_seconds(secs)
}

/// Parse a configured number of seconds; out of range values are `None`.
pub fn parse_seconds(value: &str) -> Option<Duration> {
    value.trim().parse().ok().and_then(seconds)
}
