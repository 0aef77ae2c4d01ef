//! Time sources.
//!
//! Jobs and ledger operations read time through [`Clock`] so tests can pin it.
//! Slot windows are local calendar times; timestamps on records are UTC.

use chrono::{DateTime, Duration, Local, NaiveDate, NaiveDateTime, Utc};
use parking_lot::Mutex;

pub trait Clock: Send + Sync {
    /// Current instant, for record timestamps.
    fn now(&self) -> DateTime<Utc>;

    /// Current local wall-clock time, for comparing against slot windows.
    fn local_now(&self) -> NaiveDateTime;

    fn local_today(&self) -> NaiveDate {
        self.local_now().date()
    }
}

/// Production clock backed by the system time and local timezone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn local_now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Manually driven clock. Local time is the UTC time with the offset stripped.
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

    /// Pins the clock to a local wall-clock time.
    pub fn at_local(local: NaiveDateTime) -> Self {
        Self::new(local.and_utc())
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    fn local_now(&self) -> NaiveDateTime {
        self.now.lock().naive_utc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock_advances() {
        let start: NaiveDateTime = "2024-06-10T09:00:00".parse().unwrap();
        let clock = FixedClock::at_local(start);
        assert_eq!(clock.local_now(), start);
        assert_eq!(clock.local_today(), start.date());

        clock.advance(Duration::days(1));
        assert_eq!(clock.local_now(), start + Duration::days(1));
        assert_eq!(clock.now(), (start + Duration::days(1)).and_utc());
    }

    #[test]
    fn test_system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
