use std::fmt;
use chrono::{Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use crate::core::error::{Error, Result};

/// Calendar-day key of a segment: `year * 10000 + month * 100 + day` (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DateBucket(pub i32);

impl DateBucket {
    pub fn from_date(date: NaiveDate) -> Self {
        DateBucket(date.year() * 10000 + date.month() as i32 * 100 + date.day() as i32)
    }

    pub fn today() -> Self {
        Self::from_date(Utc::now().date_naive())
    }

    pub fn value(&self) -> i32 {
        self.0
    }

    pub fn to_date(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.0 / 10000, (self.0 / 100 % 100) as u32, (self.0 % 100) as u32)
    }

    /// Bucket of the day `days` before this one.
    pub fn days_before(&self, days: u64) -> Option<DateBucket> {
        let date = self.to_date()?;
        let shifted = date.checked_sub_signed(Duration::days(i64::try_from(days).ok()?))?;
        Some(Self::from_date(shifted))
    }
}

impl fmt::Display for DateBucket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parse `YYYY-M-D` (zero padding optional).
pub fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|e| Error::invalid_argument(format!("invalid date '{}': {}", value, e)))
}

/// Half-open range of calendar days: `[start, start + |end - start|)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        DateRange { start, end }
    }

    pub fn parse(start: &str, end: &str) -> Result<Self> {
        Ok(DateRange::new(parse_date(start)?, parse_date(end)?))
    }

    /// Every day bucket covered by the range. A zero-length range is empty.
    pub fn buckets(&self) -> Vec<DateBucket> {
        let (from, to) = if self.start <= self.end {
            (self.start, self.end)
        } else {
            (self.end, self.start)
        };
        let days = (to - from).num_days();
        (0..days)
            .filter_map(|i| from.checked_add_signed(Duration::days(i)))
            .map(DateBucket::from_date)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}
