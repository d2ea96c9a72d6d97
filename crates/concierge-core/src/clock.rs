//! Time sources. Lockouts and rate windows use the monotonic `Instant`; time-window
//! resolution uses the calendar date in the account's fixed UTC offset.

use chrono::{FixedOffset, NaiveDate, Offset, Utc};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    /// Monotonic instant, immune to wall-clock changes.
    fn now(&self) -> Instant;

    /// Calendar date used to resolve "today" and "yesterday".
    fn today(&self) -> NaiveDate;
}

/// Production clock.
#[derive(Debug, Clone)]
pub struct SystemClock {
    offset: FixedOffset,
}

impl SystemClock {
    /// Clock whose calendar date is taken at the given UTC offset (minutes east).
    pub fn with_utc_offset_minutes(minutes: i32) -> Self {
        let offset = FixedOffset::east_opt(minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix());
        Self { offset }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self { offset: Utc.fix() }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.offset).date_naive()
    }
}

/// Clock driven explicitly; used by tests and replay tooling.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Mutex<Duration>,
    today: Mutex<NaiveDate>,
}

impl ManualClock {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
            today: Mutex::new(today),
        }
    }

    /// Move monotonic time forward.
    pub fn advance(&self, by: Duration) {
        let mut elapsed = self.elapsed.lock().unwrap_or_else(|e| e.into_inner());
        *elapsed += by;
    }

    pub fn set_today(&self, date: NaiveDate) {
        *self.today.lock().unwrap_or_else(|e| e.into_inner()) = date;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.elapsed.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn today(&self) -> NaiveDate {
        *self.today.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_monotonic_time_only() {
        let day = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        let clock = ManualClock::new(day);
        let start = clock.now();
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now().duration_since(start), Duration::from_secs(90));
        assert_eq!(clock.today(), day);
    }

    #[test]
    fn out_of_range_offset_falls_back_to_utc() {
        let clock = SystemClock::with_utc_offset_minutes(i32::MAX);
        assert_eq!(clock.offset, Utc.fix());
    }
}
