use std::sync::Mutex;

use chrono::{DateTime, Duration, TimeZone, Utc};

/// Source of "now" for every time-dependent decision in the queue: claim
/// eligibility, backoff deadlines, heartbeats and telemetry timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn epoch_secs(&self) -> i64 {
        self.now().timestamp()
    }

    fn epoch_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(initial: DateTime<Utc>) -> Self {
        Self {
            current: Mutex::new(initial),
        }
    }

    /// Start at the given epoch second.
    pub fn at_epoch(secs: i64) -> Self {
        Self::new(Utc.timestamp_opt(secs, 0).single().unwrap_or_default())
    }

    pub fn set(&self, time: DateTime<Utc>) {
        *self.lock() = time;
    }

    pub fn advance(&self, by: Duration) {
        *self.lock() += by;
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(Duration::seconds(secs));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        // A poisoned clock still holds a valid timestamp.
        self.current.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_moves_when_advanced() {
        let clock = ManualClock::at_epoch(1_000);
        assert_eq!(clock.epoch_secs(), 1_000);
        assert_eq!(clock.epoch_secs(), 1_000);
        clock.advance_secs(5);
        assert_eq!(clock.epoch_secs(), 1_005);
        assert_eq!(clock.epoch_millis(), 1_005_000);
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.epoch_secs() > 1_577_836_800);
    }
}
