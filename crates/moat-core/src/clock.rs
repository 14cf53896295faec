// SPDX-License-Identifier: MIT OR Apache-2.0
//! Wall-clock seam.
//!
//! Budget period keys, idempotency deadlines, and routing-status
//! sustain-windows are all derived from UTC wall time. Components take a
//! [`Clock`] so tests can cross UTC-midnight and 24-hour boundaries without
//! sleeping.

use chrono::{DateTime, Utc};
use std::sync::Mutex;

/// Source of UTC wall time.
pub trait Clock: Send + Sync {
    /// The current instant in UTC.
    fn now_utc(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A manually-driven clock for tests.
///
/// # Examples
///
/// ```
/// use moat_core::clock::{Clock, ManualClock};
/// use chrono::{Duration, TimeZone, Utc};
///
/// let clock = ManualClock::starting_at(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
/// clock.advance(Duration::hours(13));
/// assert_eq!(clock.now_utc().date_naive().to_string(), "2026-03-02");
/// ```
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock pinned to `start`.
    #[must_use]
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward by `delta`.
    pub fn advance(&self, delta: chrono::Duration) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now = *now + delta;
    }

    /// Pin the clock to an absolute instant.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().expect("clock lock poisoned") = at;
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock poisoned")
    }
}
