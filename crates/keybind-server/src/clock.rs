//! Injectable wall clock so expiry checks can be pinned in tests.

use chrono::{DateTime, Utc};

/// Source of the current time for liveness checks and key creation.
pub trait Clock: Send + Sync {
    /// Get the current UTC time.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Current time as Unix microseconds, the unit stored on key records.
    fn now_micros(&self) -> i64 {
        self.now_utc().timestamp_micros()
    }
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at a fixed instant.
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct MockClock {
    now: DateTime<Utc>,
}

#[cfg(test)]
impl MockClock {
    pub fn from_rfc3339(s: &str) -> Self {
        Self {
            now: DateTime::parse_from_rfc3339(s)
                .expect("valid RFC 3339")
                .with_timezone(&Utc),
        }
    }

    pub fn from_micros(micros: i64) -> Self {
        Self {
            now: DateTime::from_timestamp_micros(micros).expect("timestamp in range"),
        }
    }

    pub fn advance(&mut self, duration: chrono::Duration) {
        self.now += duration;
    }
}

#[cfg(test)]
impl Clock for MockClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.now
    }
}
