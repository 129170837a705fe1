//! BarRecord (one persisted time-series sample) and its dedup key.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

/// Bar granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Day,
    Min1,
    Min5,
}

impl Period {
    pub const ALL: [Period; 3] = [Period::Min1, Period::Min5, Period::Day];

    pub fn seconds(&self) -> i64 {
        match self {
            Period::Day => 86_400,
            Period::Min1 => 60,
            Period::Min5 => 300,
        }
    }

    /// Short tag used in flat-file names (`rb_HOT_m1.csv`).
    pub fn tag(&self) -> &'static str {
        match self {
            Period::Day => "d",
            Period::Min1 => "m1",
            Period::Min5 => "m5",
        }
    }

    /// Directory name inside the store (`his/min1/...`).
    pub fn dir_name(&self) -> &'static str {
        match self {
            Period::Day => "day",
            Period::Min1 => "min1",
            Period::Min5 => "min5",
        }
    }

    pub fn is_intraday(&self) -> bool {
        !matches!(self, Period::Day)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for Period {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "day" | "d" | "1d" => Ok(Period::Day),
            "min1" | "m1" | "1m" => Ok(Period::Min1),
            "min5" | "m5" | "5m" => Ok(Period::Min5),
            other => Err(SyncError::Config(format!(
                "unknown period '{other}' (expected day, min1 or min5)"
            ))),
        }
    }
}

/// Identity of a bar slot: date alone for day bars, date + HHMM otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BarKey {
    pub date: NaiveDate,
    pub time: u32,
}

impl fmt::Display for BarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:04}", self.date.format("%Y%m%d"), self.time)
    }
}

/// One OHLCV + open-interest sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarRecord {
    pub date: NaiveDate,
    /// Wall-clock HHMM (`931` = 09:31); 0 for day bars.
    pub time: u32,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub settle: f64,
    pub volume: f64,
    pub turnover: f64,
    pub open_interest: f64,
    pub open_interest_delta: f64,
}

impl BarRecord {
    /// Build an all-zero record stamped at `ts`, truncated to the period.
    pub fn at(ts: NaiveDateTime, period: Period) -> Self {
        let time = if period.is_intraday() {
            ts.hour() * 100 + ts.minute()
        } else {
            0
        };
        Self {
            date: ts.date(),
            time,
            open: 0.0,
            high: 0.0,
            low: 0.0,
            close: 0.0,
            settle: 0.0,
            volume: 0.0,
            turnover: 0.0,
            open_interest: 0.0,
            open_interest_delta: 0.0,
        }
    }

    pub fn key(&self, period: Period) -> BarKey {
        BarKey {
            date: self.date,
            time: if period.is_intraday() { self.time } else { 0 },
        }
    }

    /// Wall-clock instant of the bar. Malformed HHMM values clamp to midnight.
    pub fn timestamp(&self) -> NaiveDateTime {
        let time = NaiveTime::from_hms_opt(self.time / 100, self.time % 100, 0)
            .unwrap_or(NaiveTime::MIN);
        self.date.and_time(time)
    }

    pub fn has_valid_time(&self) -> bool {
        self.time / 100 < 24 && self.time % 100 < 60
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(date: (i32, u32, u32), time: u32) -> BarRecord {
        let d = NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap();
        let mut b = BarRecord::at(d.and_hms_opt(0, 0, 0).unwrap(), Period::Day);
        b.time = time;
        b
    }

    #[test]
    fn day_key_ignores_time() {
        let b = bar((2024, 1, 2), 1500);
        assert_eq!(b.key(Period::Day).time, 0);
        assert_eq!(b.key(Period::Min1).time, 1500);
    }

    #[test]
    fn keys_order_by_date_then_time() {
        let a = bar((2024, 1, 2), 2359).key(Period::Min1);
        let b = bar((2024, 1, 3), 1).key(Period::Min1);
        assert!(a < b);
    }

    #[test]
    fn timestamp_roundtrips_through_at() {
        let ts = NaiveDate::from_ymd_opt(2024, 3, 4)
            .unwrap()
            .and_hms_opt(21, 5, 0)
            .unwrap();
        let b = BarRecord::at(ts, Period::Min5);
        assert_eq!(b.time, 2105);
        assert_eq!(b.timestamp(), ts);
    }

    #[test]
    fn period_parsing_accepts_aliases() {
        assert_eq!("m1".parse::<Period>().unwrap(), Period::Min1);
        assert_eq!("DAY".parse::<Period>().unwrap(), Period::Day);
        assert_eq!("5m".parse::<Period>().unwrap(), Period::Min5);
        assert!("h1".parse::<Period>().is_err());
    }

    #[test]
    fn invalid_time_is_detected() {
        assert!(bar((2024, 1, 2), 2360).has_valid_time() == false);
        assert!(bar((2024, 1, 2), 2359).has_valid_time());
    }
}
