//! Time types for GANTRY.
//!
//! Wall-clock timestamps are metadata: they feed status hashes, liveness
//! checks and run records. Anything that has to be tested deterministically
//! reads time through a [`Clock`].

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

/// Wall clock timestamp with millisecond precision on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Get current timestamp, truncated to the millisecond
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now().trunc_subsecs(3))
    }

    /// Create from milliseconds since the Unix epoch
    ///
    /// # Errors
    ///
    /// Returns error if the value is outside chrono's representable range
    pub fn from_millis(millis: i64) -> CoreResult<Self> {
        DateTime::<Utc>::from_timestamp_millis(millis)
            .map(Self)
            .ok_or_else(|| CoreError::InvalidTimestamp {
                reason: format!("out of range: {}", millis),
            })
    }

    /// Parse an RFC 3339 string
    ///
    /// # Errors
    ///
    /// Returns error if the string is not RFC 3339
    pub fn parse(value: &str) -> CoreResult<Self> {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| Self(dt.with_timezone(&Utc)))
            .map_err(|e| CoreError::InvalidTimestamp {
                reason: e.to_string(),
            })
    }

    /// Milliseconds since the Unix epoch
    #[must_use]
    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// RFC 3339 with millisecond precision and a `Z` suffix
    #[must_use]
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Elapsed time since `earlier`, zero if `earlier` is in the future
    #[must_use]
    pub fn duration_since(&self, earlier: &Timestamp) -> Duration {
        (self.0 - earlier.0).to_std().unwrap_or(Duration::ZERO)
    }

    /// Add a duration
    #[must_use]
    pub fn add(&self, duration: Duration) -> Self {
        match chrono::Duration::from_std(duration) {
            Ok(d) => Self(self.0 + d),
            Err(_) => *self,
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

impl TryFrom<String> for Timestamp {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Timestamp> for String {
    fn from(ts: Timestamp) -> Self {
        ts.to_rfc3339()
    }
}

/// Source of wall-clock time
pub trait Clock: Send + Sync + 'static {
    /// Current time
    fn now(&self) -> Timestamp;
}

/// The system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    #[must_use]
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now = now.add(by);
    }

    /// Set the clock to an absolute time
    pub fn set(&self, to: Timestamp) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc3339_millis_z() {
        let ts = Timestamp::from_millis(1_700_000_000_123).unwrap();
        assert_eq!(ts.to_rfc3339(), "2023-11-14T22:13:20.123Z");
        assert_eq!(Timestamp::parse(&ts.to_rfc3339()).unwrap(), ts);
    }

    #[test]
    fn test_duration_since_saturates() {
        let a = Timestamp::from_millis(1_000).unwrap();
        let b = Timestamp::from_millis(3_500).unwrap();
        assert_eq!(b.duration_since(&a), Duration::from_millis(2_500));
        assert_eq!(a.duration_since(&b), Duration::ZERO);
    }

    #[test]
    fn test_now_survives_wire_round_trip() {
        let now = Timestamp::now();
        assert_eq!(Timestamp::parse(&now.to_rfc3339()).unwrap(), now);
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(Timestamp::from_millis(0).unwrap());
        clock.advance(Duration::from_secs(15));
        assert_eq!(clock.now().as_millis(), 15_000);
    }

    #[test]
    fn test_timestamp_serde() {
        let ts = Timestamp::from_millis(0).unwrap();
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, "\"1970-01-01T00:00:00.000Z\"");
        assert!(serde_json::from_str::<Timestamp>("\"yesterday\"").is_err());
    }
}
