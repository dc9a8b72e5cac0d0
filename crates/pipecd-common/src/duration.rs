//! Human readable durations (`30s`, `5m`, `1h30m`, `250ms`)
//!
//! Configuration files and persisted stage metadata carry durations in this
//! textual form. [`Duration`] wraps `std::time::Duration` and round-trips
//! through serde as a string.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A `std::time::Duration` that (de)serializes as `1h2m3s`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration(pub std::time::Duration);

impl Duration {
    pub const ZERO: Self = Self(std::time::Duration::ZERO);

    pub const fn from_secs(secs: u64) -> Self {
        Self(std::time::Duration::from_secs(secs))
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(std::time::Duration::from_millis(millis))
    }

    pub const fn as_std(&self) -> std::time::Duration {
        self.0
    }

    pub fn parse(s: &str) -> Result<Self> {
        parse_duration(s).map(Self)
    }
}

impl From<std::time::Duration> for Duration {
    fn from(d: std::time::Duration) -> Self {
        Self(d)
    }
}

impl From<Duration> for std::time::Duration {
    fn from(d: Duration) -> Self {
        d.0
    }
}

impl FromStr for Duration {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_duration(self.0))
    }
}

impl Serialize for Duration {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Parse `30s`, `5m`, `1h30m` or `1h 30m`; a bare `0` is zero
pub fn parse_duration(input: &str) -> Result<std::time::Duration> {
    let s = input.trim();
    if s == "0" {
        return Ok(std::time::Duration::ZERO);
    }
    humantime::parse_duration(&s.replace("µs", "us"))
        .map_err(|e| Error::invalid_argument(format!("invalid duration {input:?}: {e}")))
}

/// Format without separators, e.g. `4m`, `1h30m`, `1s500ms`; zero is `0s`
pub fn format_duration(d: std::time::Duration) -> String {
    humantime::format_duration(d).to_string().replace(' ', "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), StdDuration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), StdDuration::from_secs(300));
        assert_eq!(parse_duration("1h30m").unwrap(), StdDuration::from_secs(5400));
        assert_eq!(parse_duration("1h 30m").unwrap(), StdDuration::from_secs(5400));
        assert_eq!(parse_duration("4m0s").unwrap(), StdDuration::from_secs(240));
        assert_eq!(parse_duration("250ms").unwrap(), StdDuration::from_millis(250));
        assert_eq!(parse_duration("1s500ms").unwrap(), StdDuration::from_millis(1500));
        assert_eq!(parse_duration("20µs").unwrap(), StdDuration::from_micros(20));
        assert_eq!(parse_duration(" 0 ").unwrap(), StdDuration::ZERO);
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(StdDuration::ZERO), "0s");
        assert_eq!(format_duration(StdDuration::from_secs(240)), "4m");
        assert_eq!(format_duration(StdDuration::from_secs(5400)), "1h30m");
        assert_eq!(format_duration(StdDuration::from_millis(1500)), "1s500ms");
        assert_eq!(format_duration(StdDuration::from_millis(250)), "250ms");
    }

    #[test]
    fn test_format_parses_back() {
        for secs in [1, 59, 61, 3599, 3661, 86_400 + 7] {
            let d = StdDuration::from_secs(secs);
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
    }

    #[test]
    fn test_duration_serde() {
        let d: Duration = serde_json::from_str("\"4m0s\"").unwrap();
        assert_eq!(d.as_std(), StdDuration::from_secs(240));
        assert_eq!(serde_json::to_string(&d).unwrap(), "\"4m\"");
    }
}
