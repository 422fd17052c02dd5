//! Calendar bucket widths and time range helpers for aggregation requests.

use crate::error::{Result, ServiceError};
use chrono::{DateTime, Datelike, Duration, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Closed interval `[start, end]` over measurement time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(ServiceError::InvalidRequest(
                "time range start must not be after end".to_string(),
            ));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketWidth {
    Minute,
    Hour,
    Day,
    Week,
}

impl BucketWidth {
    pub const ALL: [BucketWidth; 4] = [
        BucketWidth::Minute,
        BucketWidth::Hour,
        BucketWidth::Day,
        BucketWidth::Week,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BucketWidth::Minute => "minute",
            BucketWidth::Hour => "hour",
            BucketWidth::Day => "day",
            BucketWidth::Week => "week",
        }
    }

    /// Unit name accepted by PostgreSQL `date_trunc`. Its `week` unit is ISO,
    /// so it starts on Monday like [`BucketWidth::floor`].
    pub fn trunc_unit(self) -> &'static str {
        self.as_str()
    }

    /// Aligns `ts` to the start of its bucket in UTC: smaller calendar fields
    /// are zeroed, and weeks start on Monday at midnight.
    pub fn floor(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let naive = ts.naive_utc();
        let date = naive.date();
        let floored = match self {
            BucketWidth::Minute => date.and_hms_opt(naive.hour(), naive.minute(), 0),
            BucketWidth::Hour => date.and_hms_opt(naive.hour(), 0, 0),
            BucketWidth::Day => date.and_hms_opt(0, 0, 0),
            BucketWidth::Week => {
                let back = i64::from(date.weekday().num_days_from_monday());
                date.checked_sub_signed(Duration::days(back))
                    .and_then(|monday| monday.and_hms_opt(0, 0, 0))
            }
        };

        floored.map(|value| value.and_utc()).unwrap_or(ts)
    }
}

impl fmt::Display for BucketWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BucketWidth {
    type Err = ServiceError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "minute" | "min" | "m" => Ok(BucketWidth::Minute),
            "hour" | "h" => Ok(BucketWidth::Hour),
            "day" | "d" => Ok(BucketWidth::Day),
            "week" | "w" => Ok(BucketWidth::Week),
            other => Err(ServiceError::InvalidRequest(format!(
                "unsupported bucket width '{other}'"
            ))),
        }
    }
}

/// Accepts RFC 3339 or `YYYY-MM-DD HH:MM:SS` (read as UTC).
pub fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc));
    }
    Err(ServiceError::InvalidRequest(format!(
        "invalid time literal '{value}'"
    )))
}

/// Serde adapter for request fields that take either timestamp format.
pub mod flexible {
    use chrono::{DateTime, Utc};
    use serde::{de::Error as _, Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_datetime(&raw).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(value: &str) -> DateTime<Utc> {
        parse_datetime(value).unwrap()
    }

    #[test]
    fn floors_minute_hour_day() {
        let ts = at("2025-03-12T14:37:45.250Z");
        assert_eq!(BucketWidth::Minute.floor(ts), at("2025-03-12 14:37:00"));
        assert_eq!(BucketWidth::Hour.floor(ts), at("2025-03-12 14:00:00"));
        assert_eq!(BucketWidth::Day.floor(ts), at("2025-03-12 00:00:00"));
    }

    #[test]
    fn week_starts_on_monday() {
        // 2025-03-12 is a Wednesday.
        assert_eq!(
            BucketWidth::Week.floor(at("2025-03-12 14:37:45")),
            at("2025-03-10 00:00:00")
        );
        // Sunday belongs to the week that began six days earlier.
        assert_eq!(
            BucketWidth::Week.floor(at("2025-03-16 23:59:59")),
            at("2025-03-10 00:00:00")
        );
        // Monday midnight is its own bucket start.
        assert_eq!(
            BucketWidth::Week.floor(at("2025-03-17 00:00:00")),
            at("2025-03-17 00:00:00")
        );
    }

    #[test]
    fn week_floor_crosses_year_boundary() {
        // 2025-01-01 is a Wednesday; its week began on 2024-12-30.
        assert_eq!(
            BucketWidth::Week.floor(at("2025-01-01 08:00:00")),
            at("2024-12-30 00:00:00")
        );
    }

    #[test]
    fn week_floor_before_the_first_monday_keeps_the_timestamp() {
        let earliest = DateTime::<Utc>::MIN_UTC;
        assert_eq!(BucketWidth::Week.floor(earliest), earliest);
        assert_eq!(BucketWidth::Day.floor(earliest), earliest);
    }

    #[test]
    fn floor_is_idempotent() {
        let ts = at("2024-02-29T23:59:59.999Z");
        for width in BucketWidth::ALL {
            let once = width.floor(ts);
            assert_eq!(width.floor(once), once, "{width}");
            assert!(once <= ts);
        }
    }

    #[test]
    fn parses_bucket_names() {
        assert_eq!("HOUR".parse::<BucketWidth>().unwrap(), BucketWidth::Hour);
        assert_eq!(" week ".parse::<BucketWidth>().unwrap(), BucketWidth::Week);
        assert!("fortnight".parse::<BucketWidth>().is_err());
    }

    #[test]
    fn rejects_inverted_range() {
        let start = at("2025-01-02 00:00:00");
        let end = at("2025-01-01 00:00:00");
        assert!(TimeRange::new(start, end).is_err());
        assert!(TimeRange::new(end, end).is_ok());
    }

    #[test]
    fn range_is_inclusive_on_both_ends() {
        let range = TimeRange::new(at("2025-01-01 00:00:00"), at("2025-01-01 01:00:00")).unwrap();
        assert!(range.contains(range.start));
        assert!(range.contains(range.end));
        assert!(!range.contains(at("2025-01-01 01:00:01")));
    }
}
