//! Session definitions: the day and night wall-clock intervals an instrument
//! trades in.
//!
//! Interval strings look like `"09:00-10:15"`. Night intervals that run past
//! midnight may be written either as `"21:00-02:30"` or `"21:00-26:30"`; both
//! normalise to an end of `(day_offset = 1, 02:30)`.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::domain::Period;
use crate::error::SyncError;

/// End-of-interval wall time, relative to the calendar date the interval
/// starts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WallTime {
    pub day_offset: u8,
    pub time: NaiveTime,
}

impl WallTime {
    pub fn same_day(time: NaiveTime) -> Self {
        Self { day_offset: 0, time }
    }

    pub fn next_day(time: NaiveTime) -> Self {
        Self { day_offset: 1, time }
    }

    /// Absolute instant of this wall time for an interval anchored on `anchor`.
    pub fn on(&self, anchor: NaiveDate) -> NaiveDateTime {
        anchor.and_time(self.time) + Duration::days(i64::from(self.day_offset))
    }
}

/// One contiguous trading interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInterval {
    pub start: NaiveTime,
    pub end: WallTime,
}

impl SessionInterval {
    pub fn new(start: NaiveTime, end: WallTime) -> Self {
        Self { start, end }
    }

    /// Parse `"HH:MM-HH:MM"`. End hours of 24..47 mean "next day".
    pub fn parse(spec: &str) -> Result<Self, SyncError> {
        let invalid = |reason: &str| SyncError::InvalidSession {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let (start_s, end_s) = spec
            .trim()
            .split_once('-')
            .ok_or_else(|| invalid("expected HH:MM-HH:MM"))?;
        let (start_h, start_m) = parse_hhmm(start_s).ok_or_else(|| invalid("bad start time"))?;
        let (end_h, end_m) = parse_hhmm(end_s).ok_or_else(|| invalid("bad end time"))?;
        if start_h >= 24 {
            return Err(invalid("start must be before 24:00"));
        }
        if end_h >= 48 {
            return Err(invalid("end must be before 48:00"));
        }

        let start = NaiveTime::from_hms_opt(start_h, start_m, 0)
            .ok_or_else(|| invalid("bad start time"))?;
        let end_time = NaiveTime::from_hms_opt(end_h % 24, end_m, 0)
            .ok_or_else(|| invalid("bad end time"))?;

        let end = if end_h >= 24 {
            WallTime::next_day(end_time)
        } else if end_time <= start {
            // "21:00-02:30" wraps past midnight.
            WallTime::next_day(end_time)
        } else {
            WallTime::same_day(end_time)
        };

        let interval = Self { start, end };
        if interval.minutes() <= 0 {
            return Err(invalid("interval is empty"));
        }
        if interval.minutes() > 24 * 60 {
            return Err(invalid("interval is longer than a day"));
        }
        Ok(interval)
    }

    /// Absolute `[start, end]` of this interval when anchored on `anchor`.
    pub fn span_on(&self, anchor: NaiveDate) -> (NaiveDateTime, NaiveDateTime) {
        (anchor.and_time(self.start), self.end.on(anchor))
    }

    pub fn minutes(&self) -> i64 {
        let anchor = NaiveDate::MIN;
        let (start, end) = self.span_on(anchor);
        (end - start).num_minutes()
    }
}

fn parse_hhmm(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.trim().split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    (m < 60).then_some((h, m))
}

/// Day and night interval lists for one product.
///
/// An empty definition means the product is treated as always trading.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDefinition {
    pub day: Vec<SessionInterval>,
    pub night: Vec<SessionInterval>,
}

impl SessionDefinition {
    pub fn new(day: Vec<SessionInterval>, night: Vec<SessionInterval>) -> Self {
        Self { day, night }
    }

    /// Build a definition from interval strings (config format).
    pub fn parse<S: AsRef<str>>(day: &[S], night: &[S]) -> Result<Self, SyncError> {
        let day = day
            .iter()
            .map(|s| SessionInterval::parse(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let night = night
            .iter()
            .map(|s| SessionInterval::parse(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { day, night })
    }

    pub fn is_empty(&self) -> bool {
        self.day.is_empty() && self.night.is_empty()
    }

    pub fn has_night(&self) -> bool {
        !self.night.is_empty()
    }

    pub fn intervals(&self) -> impl Iterator<Item = &SessionInterval> {
        self.day.iter().chain(self.night.iter())
    }

    pub fn trading_minutes_per_day(&self) -> i64 {
        self.intervals().map(|i| i.minutes()).sum()
    }

    /// Expected bars per trading day for `period`, or `None` when the
    /// definition is empty and nothing can be inferred.
    pub fn bars_per_day(&self, period: Period) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        match period {
            Period::Day => Some(1.0),
            Period::Min1 | Period::Min5 => {
                let minutes = self.trading_minutes_per_day() as f64;
                Some((minutes * 60.0 / period.seconds() as f64).max(1.0))
            }
        }
    }

    /// Typical domestic futures session: three day segments, no night.
    pub fn cn_futures_day() -> Self {
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN);
        Self {
            day: vec![
                SessionInterval::new(t(9, 0), WallTime::same_day(t(10, 15))),
                SessionInterval::new(t(10, 30), WallTime::same_day(t(11, 30))),
                SessionInterval::new(t(13, 30), WallTime::same_day(t(15, 0))),
            ],
            night: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn parses_plain_day_interval() {
        let i = SessionInterval::parse("09:30-15:00").unwrap();
        assert_eq!(i.start, t(9, 30));
        assert_eq!(i.end, WallTime::same_day(t(15, 0)));
        assert_eq!(i.minutes(), 330);
    }

    #[test]
    fn both_night_notations_normalise_identically() {
        let wrapped = SessionInterval::parse("21:00-02:30").unwrap();
        let extended = SessionInterval::parse("21:00-26:30").unwrap();
        assert_eq!(wrapped, extended);
        assert_eq!(wrapped.end, WallTime::next_day(t(2, 30)));
        assert_eq!(wrapped.minutes(), 330);
    }

    #[test]
    fn night_ending_at_midnight() {
        let i = SessionInterval::parse("21:00-24:00").unwrap();
        assert_eq!(i.end, WallTime::next_day(t(0, 0)));
        assert_eq!(i.minutes(), 180);
    }

    #[test]
    fn rejects_garbage() {
        assert!(SessionInterval::parse("0930-1500").is_err());
        assert!(SessionInterval::parse("09:30").is_err());
        assert!(SessionInterval::parse("25:00-26:00").is_err());
        assert!(SessionInterval::parse("09:75-10:00").is_err());
        assert!(SessionInterval::parse("21:00-50:00").is_err());
    }

    #[test]
    fn span_on_crosses_date() {
        let i = SessionInterval::parse("21:00-02:30").unwrap();
        let d = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        let (start, end) = i.span_on(d);
        assert_eq!(start, d.and_time(t(21, 0)));
        assert_eq!(end, d.succ_opt().unwrap().and_time(t(2, 30)));
    }

    #[test]
    fn bars_per_day_from_minutes() {
        let def = SessionDefinition::cn_futures_day();
        assert_eq!(def.trading_minutes_per_day(), 225);
        assert_eq!(def.bars_per_day(Period::Min1), Some(225.0));
        assert_eq!(def.bars_per_day(Period::Min5), Some(45.0));
        assert_eq!(def.bars_per_day(Period::Day), Some(1.0));
        assert_eq!(SessionDefinition::default().bars_per_day(Period::Min1), None);
    }
}
