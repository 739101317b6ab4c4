//! Time intervals and rate limits as they appear in the configuration file.
//!
//! Intervals are written `<value><unit>` with unit one of `s m h d w`; rate
//! limits are written `<threshold>/<interval>`, e.g. `10/1h` for "at most ten
//! messages per hour".

use std::fmt;

use anyhow::{anyhow, Result};
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl TimeUnit {
    pub fn parse(unit: &str) -> Result<TimeUnit> {
        match unit {
            "s" => Ok(TimeUnit::Seconds),
            "m" => Ok(TimeUnit::Minutes),
            "h" => Ok(TimeUnit::Hours),
            "d" => Ok(TimeUnit::Days),
            "w" => Ok(TimeUnit::Weeks),
            other => Err(anyhow!("invalid time unit: '{}'", other)),
        }
    }

    fn seconds_per_unit(self) -> i64 {
        match self {
            TimeUnit::Seconds => 1,
            TimeUnit::Minutes => 60,
            TimeUnit::Hours => 60 * 60,
            TimeUnit::Days => 60 * 60 * 24,
            TimeUnit::Weeks => 60 * 60 * 24 * 7,
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimeUnit::Seconds => "s",
            TimeUnit::Minutes => "m",
            TimeUnit::Hours => "h",
            TimeUnit::Days => "d",
            TimeUnit::Weeks => "w",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeInterval {
    pub value: i64,
    pub unit: TimeUnit,
}

impl TimeInterval {
    /// Parse `"30m"`, `"2h"`, ... Trailing garbage after the unit is rejected.
    pub fn parse(interval: &str) -> Result<TimeInterval> {
        let re = Regex::new(r"^(\d+)([smhdw])$").unwrap();
        let caps = re
            .captures(interval.trim())
            .ok_or_else(|| anyhow!("invalid time interval string: '{}'", interval))?;
        let value: i64 = caps[1]
            .parse()
            .map_err(|_| anyhow!("invalid time interval string: '{}'", interval))?;
        let unit = TimeUnit::parse(&caps[2])?;
        Ok(TimeInterval { value, unit })
    }

    pub fn as_seconds(&self) -> i64 {
        self.value * self.unit.seconds_per_unit()
    }
}

impl fmt::Display for TimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.value, self.unit)
    }
}

impl PartialOrd for TimeInterval {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeInterval {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_seconds().cmp(&other.as_seconds())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub threshold: usize,
    pub interval: TimeInterval,
}

impl RateLimit {
    /// Parse `"<threshold>/<interval>"`, e.g. `"2/1h"`. Empty or blank input
    /// means "not configured" and yields `None`.
    pub fn parse(rate_limit: &str) -> Result<Option<RateLimit>> {
        if rate_limit.trim().is_empty() {
            return Ok(None);
        }
        let re = Regex::new(r"^(\d+)/(\d+[smhdw])$").unwrap();
        let caps = re
            .captures(rate_limit.trim())
            .ok_or_else(|| anyhow!("invalid rate limit string: '{}'", rate_limit))?;
        let threshold: usize = caps[1]
            .parse()
            .map_err(|_| anyhow!("invalid rate limit string (threshold): '{}'", rate_limit))?;
        let interval = TimeInterval::parse(&caps[2])
            .map_err(|_| anyhow!("invalid rate limit string (interval): '{}'", rate_limit))?;
        Ok(Some(RateLimit {
            threshold,
            interval,
        }))
    }

    /// Strictly greater: a count equal to the threshold is still allowed.
    pub fn is_threshold_exceeded(&self, count: usize) -> bool {
        count > self.threshold
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.threshold, self.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_seconds() {
        assert_eq!(TimeInterval::parse("45s").unwrap().as_seconds(), 45);
        assert_eq!(TimeInterval::parse("3m").unwrap().as_seconds(), 180);
        assert_eq!(TimeInterval::parse("2h").unwrap().as_seconds(), 7200);
        assert_eq!(TimeInterval::parse("1d").unwrap().as_seconds(), 86400);
        assert_eq!(TimeInterval::parse("1w").unwrap().as_seconds(), 604800);
    }

    #[test]
    fn interval_rejects_garbage() {
        assert!(TimeInterval::parse("").is_err());
        assert!(TimeInterval::parse("5x").is_err());
        assert!(TimeInterval::parse("m5").is_err());
        assert!(TimeInterval::parse("5mm").is_err());
    }

    #[test]
    fn interval_ordering() {
        let a = TimeInterval::parse("90s").unwrap();
        let b = TimeInterval::parse("1m").unwrap();
        assert!(a > b);
        assert_eq!(a, TimeInterval::parse("90s").unwrap());
    }

    #[test]
    fn rate_limit_parsing() {
        let rl = RateLimit::parse("2/1h").unwrap().unwrap();
        assert_eq!(rl.threshold, 2);
        assert_eq!(rl.interval.as_seconds(), 3600);
        assert_eq!(rl.to_string(), "2/1h");

        assert!(RateLimit::parse("").unwrap().is_none());
        assert!(RateLimit::parse("   ").unwrap().is_none());
        assert!(RateLimit::parse("2-1h").is_err());
        assert!(RateLimit::parse("x/1h").is_err());
        assert!(RateLimit::parse("2/1y").is_err());
    }

    #[test]
    fn threshold_is_strict() {
        let rl = RateLimit::parse("2/1h").unwrap().unwrap();
        assert!(!rl.is_threshold_exceeded(1));
        assert!(!rl.is_threshold_exceeded(2));
        assert!(rl.is_threshold_exceeded(3));
    }
}
