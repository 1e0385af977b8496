use chrono::{DateTime, Duration, Utc};

/// A source of the current time for records created by the engine.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that always reports the same instant.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FixedClock(DateTime<Utc>);

impl FixedClock {
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(now)
    }

    /// Returns a clock set `duration` later than this one.
    #[must_use]
    pub fn advanced_by(self, duration: Duration) -> Self {
        Self(self.0 + duration)
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{Clock, FixedClock, SystemClock};

    #[test]
    fn fixed_clock() {
        let t = Utc.with_ymd_and_hms(2025, 5, 1, 6, 0, 0).unwrap();
        let clock = FixedClock::new(t);
        assert_eq!(clock.now(), t);
        assert_eq!(clock.now(), t);
        assert_eq!(
            clock.advanced_by(Duration::minutes(5)).now(),
            t + Duration::minutes(5)
        );
    }

    #[test]
    fn system_clock_moves_forward() {
        let a = SystemClock.now();
        let b = SystemClock.now();
        assert!(a <= b);
    }
}
