use std::fmt;

use chrono::{DateTime, Duration, Utc};

/// Buffer before expiry inside which a token is already treated as stale,
/// so it never lapses in the middle of a slow request (5 minutes).
pub const REFRESH_BUFFER_MS: i64 = 5 * 60 * 1000;

/// Lifetime assumed when a grant does not say how long its token lives.
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Absolute instant (epoch milliseconds) after which an access token is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExpiryTimestamp(i64);

impl ExpiryTimestamp {
    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// `now + expires_in`, with `expires_in` defaulting to one hour.
    pub fn from_expires_in(now: DateTime<Utc>, expires_in_secs: Option<u64>) -> Self {
        let secs = expires_in_secs.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let millis = i64::try_from(secs).unwrap_or(i64::MAX).saturating_mul(1000);
        Self(now.timestamp_millis().saturating_add(millis))
    }

    /// Parse the stored representation (decimal epoch-ms). Garbage yields `None`.
    pub fn parse(value: &str) -> Option<Self> {
        value.trim().parse().ok().map(Self)
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }

    pub fn time_until(self, now: DateTime<Utc>) -> Duration {
        Duration::milliseconds(self.0.saturating_sub(now.timestamp_millis()))
    }
}

impl fmt::Display for ExpiryTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a token expiring at `expiry` must be refreshed before use at `now`.
///
/// Stale when `expiry - now <= 5 minutes`; a missing expiry is always stale.
pub fn is_stale(expiry: Option<ExpiryTimestamp>, now: DateTime<Utc>) -> bool {
    match expiry {
        Some(expiry) => {
            expiry.as_millis().saturating_sub(now.timestamp_millis()) <= REFRESH_BUFFER_MS
        }
        None => true,
    }
}

/// Source of the current time, injectable for tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
