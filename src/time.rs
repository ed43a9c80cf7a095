// Timestamps as (seconds, nanoseconds) pairs
//
// Absolute times keep integer nanosecond precision; burst-time differences
// between detectors are at the millisecond scale and must not lose digits to
// a float Unix epoch.

use std::fmt;
use std::ops::{Add, Sub};

use chrono::DateTime;
use serde::{Serialize, Serializer};

use crate::constants::{NS_PER_S, NS_PER_S_F};

/// A point in time, normalised so that `0 <= ns < 1e9`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp {
    pub s: i64,
    pub ns: i64,
}

impl Timestamp {
    pub fn new(s: i64, ns: i64) -> Self {
        Self::from_ns(s as i128 * NS_PER_S as i128 + ns as i128)
    }

    pub fn from_ns(total: i128) -> Self {
        let per = NS_PER_S as i128;
        Timestamp {
            s: total.div_euclid(per) as i64,
            ns: total.rem_euclid(per) as i64,
        }
    }

    pub fn from_secs_f64(t: f64) -> Self {
        let s = t.floor();
        let ns = ((t - s) * NS_PER_S_F).round() as i64;
        Timestamp::new(s as i64, ns)
    }

    /// Parse an RFC 3339 string such as `2026-01-02T03:04:05.5Z`.
    pub fn parse_rfc3339(text: &str) -> Option<Self> {
        let dt = DateTime::parse_from_rfc3339(text).ok()?;
        Some(Timestamp::new(dt.timestamp(), dt.timestamp_subsec_nanos() as i64))
    }

    pub fn total_ns(&self) -> i128 {
        self.s as i128 * NS_PER_S as i128 + self.ns as i128
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.s as f64 + self.ns as f64 / NS_PER_S_F
    }

    pub fn as_millis_f64(&self) -> f64 {
        self.s as f64 * 1e3 + self.ns as f64 * 1e-6
    }

    /// Whole Unix second, used as the pixel cache key.
    pub fn unix_second(&self) -> i64 {
        self.s
    }

    pub fn add_ns(&self, offset: i64) -> Self {
        Timestamp::from_ns(self.total_ns() + offset as i128)
    }

    /// Signed offset of `self` from `base`, in ns.
    pub fn offset_from(&self, base: &Timestamp) -> i64 {
        (self.total_ns() - base.total_ns()) as i64
    }
}

impl Add for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Timestamp) -> Timestamp {
        Timestamp::from_ns(self.total_ns() + rhs.total_ns())
    }
}

impl Sub for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Timestamp) -> Timestamp {
        Timestamp::from_ns(self.total_ns() - rhs.total_ns())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.s, self.ns)
    }
}

/// Written as `[s, ns]`, the same form payload times take.
impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.s, self.ns).serialize(serializer)
    }
}
