// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Human-readable durations (`500ms`, `30s`, `1h30m`, `2w`).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Component, CoreError};

/// Parse a duration made of `<number><unit>` pairs. Units: `ms`, `s`, `m`, `h`, `d`, `w`.
pub fn parse_duration(input: &str) -> Result<Duration, CoreError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(invalid(input, "empty duration"));
    }

    let mut total = Duration::zero();
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| invalid(input, "missing unit"))?;
        if digits == 0 {
            return Err(invalid(input, "expected a number"));
        }
        let value: i64 = rest[..digits]
            .parse()
            .map_err(|_| invalid(input, "number out of range"))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::try_milliseconds(value),
            "s" => Duration::try_seconds(value),
            "m" => Duration::try_minutes(value),
            "h" => Duration::try_hours(value),
            "d" => Duration::try_days(value),
            "w" => Duration::try_weeks(value),
            _ => return Err(invalid(input, "unknown unit")),
        }
        .ok_or_else(|| invalid(input, "duration out of range"))?;
        total = total
            .checked_add(&part)
            .ok_or_else(|| invalid(input, "duration out of range"))?;
        rest = &rest[unit_len..];
    }
    Ok(total)
}

/// Resolve a sleep target: either a duration from `now` or an RFC 3339 instant.
pub fn resolve_until(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, CoreError> {
    if let Ok(at) = DateTime::parse_from_rfc3339(input.trim()) {
        return Ok(at.with_timezone(&Utc));
    }
    Ok(now + parse_duration(input)?)
}

fn invalid(input: &str, reason: &str) -> CoreError {
    CoreError::validation(
        Component::Config,
        format!("invalid duration '{input}': {reason}"),
    )
}

/// A duration that (de)serializes as its textual form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Period(Duration);

impl Period {
    pub fn new(duration: Duration) -> Self {
        Self(duration)
    }

    pub fn duration(&self) -> Duration {
        self.0
    }

    pub fn to_std(&self) -> std::time::Duration {
        self.0.to_std().unwrap_or_default()
    }
}

impl FromStr for Period {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s).map(Self)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.0.num_milliseconds();
        if ms % 1000 != 0 {
            write!(f, "{ms}ms")
        } else {
            write!(f, "{}s", ms / 1000)
        }
    }
}

impl Serialize for Period {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::milliseconds(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::seconds(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::minutes(5));
        assert_eq!(parse_duration("1h").unwrap(), Duration::hours(1));
        assert_eq!(parse_duration("2d").unwrap(), Duration::days(2));
        assert_eq!(parse_duration("1w").unwrap(), Duration::weeks(1));
    }

    #[test]
    fn test_parse_combined() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::minutes(90));
        assert_eq!(
            parse_duration("1m500ms").unwrap(),
            Duration::milliseconds(60_500)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("10y").is_err());
        assert!(parse_duration("-5s").is_err());
    }

    #[test]
    fn test_resolve_until() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            resolve_until("2h", now).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 1, 14, 0, 0).unwrap()
        );
        assert_eq!(
            resolve_until("2025-03-02T00:00:00Z", now).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 2, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_period_serde() {
        let period: Period = serde_json::from_str("\"1h30m\"").unwrap();
        assert_eq!(period.duration(), Duration::minutes(90));
        assert_eq!(serde_json::to_string(&period).unwrap(), "\"5400s\"");
        assert!(serde_json::from_str::<Period>("\"soon\"").is_err());
    }
}
