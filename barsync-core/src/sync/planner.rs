//! Window planner: turns a record budget into a bounded calendar window.
//!
//! Calendar arithmetic uses a business-day approximation (weekends excluded,
//! holidays not modelled). The density model absorbs the error.

use chrono::{Datelike, Duration, NaiveDateTime, Weekday};
use serde::{Deserialize, Serialize};

use super::density::DensityModel;
use crate::domain::{Direction, Period};

/// Half-open calendar range `[start, end)` still to be covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Span {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        self.start <= ts && ts < self.end
    }
}

/// One bounded query window, half-open `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FetchWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    /// Records the density model expects inside the window.
    pub target_records: usize,
    pub direction: Direction,
    /// True when the remaining span cut the window short, so a small result
    /// says nothing about density.
    pub clipped: bool,
}

impl FetchWindow {
    /// Pull the far boundary back toward the cursor by `margin`. `None` when
    /// nothing would be left.
    pub fn narrowed(&self, margin: Duration) -> Option<FetchWindow> {
        let mut w = *self;
        match self.direction {
            Direction::Forward => w.end = self.end - margin,
            Direction::Backward => w.start = self.start + margin,
        }
        (w.start < w.end).then_some(w)
    }

    pub fn trading_days(&self) -> f64 {
        trading_days(self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WindowPlanner {
    max_records_per_call: usize,
}

impl WindowPlanner {
    pub fn new(max_records_per_call: usize) -> Self {
        Self {
            max_records_per_call: max_records_per_call.max(1),
        }
    }

    pub fn max_records_per_call(&self) -> usize {
        self.max_records_per_call
    }

    /// Plan the next window over `span`. Forward windows start at
    /// `span.start`; backward windows end at `span.end`. Returns `None` for an
    /// empty span.
    pub fn plan(
        &self,
        span: Span,
        direction: Direction,
        period: Period,
        density: &DensityModel,
    ) -> Option<FetchWindow> {
        if span.is_empty() {
            return None;
        }
        let per_day = density.get(period).max(DensityModel::floor(period));
        let days_needed = (self.max_records_per_call as f64 / per_day).ceil().max(1.0) as u64;

        let (start, end, clipped) = match direction {
            Direction::Forward => {
                let far = step_business_days(span.start, days_needed, Direction::Forward, span.end);
                (span.start, far.min(span.end), far >= span.end)
            }
            Direction::Backward => {
                let far =
                    step_business_days(span.end, days_needed, Direction::Backward, span.start);
                (far.max(span.start), span.end, far <= span.start)
            }
        };

        let expected = (trading_days(start, end) * per_day).ceil() as usize;
        let target_records = expected.clamp(1, self.max_records_per_call);

        Some(FetchWindow {
            start,
            end,
            target_records,
            direction,
            clipped,
        })
    }
}

fn is_business_day(ts: NaiveDateTime) -> bool {
    !matches!(ts.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Move `n` business days from `from`, stopping early once `limit` is passed.
pub fn step_business_days(
    from: NaiveDateTime,
    n: u64,
    direction: Direction,
    limit: NaiveDateTime,
) -> NaiveDateTime {
    let step = match direction {
        Direction::Forward => Duration::days(1),
        Direction::Backward => Duration::days(-1),
    };
    let mut at = from;
    let mut left = n;
    while left > 0 {
        at += step;
        if is_business_day(at) {
            left -= 1;
        }
        let past = match direction {
            Direction::Forward => at >= limit,
            Direction::Backward => at <= limit,
        };
        if past {
            break;
        }
    }
    at
}

/// Weekday time between `start` and `end`, in fractional days.
pub fn trading_days(start: NaiveDateTime, end: NaiveDateTime) -> f64 {
    if start >= end {
        return 0.0;
    }
    let mut total = Duration::zero();
    let mut day = start.date();
    while day.and_hms_opt(0, 0, 0).map_or(false, |d| d < end) {
        let day_start = day.and_hms_opt(0, 0, 0).unwrap_or(start);
        let next = day_start + Duration::days(1);
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            let lo = day_start.max(start);
            let hi = next.min(end);
            if hi > lo {
                total += hi - lo;
            }
        }
        day = next.date();
    }
    total.num_seconds() as f64 / 86_400.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    #[test]
    fn trading_days_skips_weekend() {
        // Fri 00:00 -> Mon 00:00 is one weekday.
        assert_eq!(trading_days(at(2024, 1, 12, 0), at(2024, 1, 15, 0)), 1.0);
        // Two full weeks.
        assert_eq!(trading_days(at(2024, 1, 1, 0), at(2024, 1, 15, 0)), 10.0);
        assert_eq!(trading_days(at(2024, 1, 8, 9), at(2024, 1, 8, 15)), 0.25);
        assert_eq!(trading_days(at(2024, 1, 13, 0), at(2024, 1, 14, 12)), 0.0);
    }

    #[test]
    fn forward_window_starts_at_cursor() {
        let planner = WindowPlanner::new(10_000);
        let span = Span::new(at(2024, 1, 1, 0), at(2025, 1, 1, 0));
        let w = planner
            .plan(span, Direction::Forward, Period::Min1, &DensityModel::new())
            .unwrap();
        assert_eq!(w.start, span.start);
        assert!(!w.clipped);
        // ceil(10000 / 600) = 17 business days from Monday = Wed 3 weeks later.
        assert_eq!(w.end, at(2024, 1, 24, 0));
        assert_eq!(w.target_records, 10_000);
    }

    #[test]
    fn backward_window_ends_at_cursor() {
        let planner = WindowPlanner::new(10_000);
        let span = Span::new(at(2023, 1, 1, 0), at(2024, 1, 15, 0));
        let w = planner
            .plan(span, Direction::Backward, Period::Min5, &DensityModel::new())
            .unwrap();
        assert_eq!(w.end, span.end);
        assert!(w.start < w.end);
        assert!(!w.clipped);
        assert!(w.trading_days() >= 83.0);
    }

    #[test]
    fn short_span_is_clipped() {
        let planner = WindowPlanner::new(10_000);
        let span = Span::new(at(2024, 1, 8, 9), at(2024, 1, 8, 15));
        let w = planner
            .plan(span, Direction::Forward, Period::Min1, &DensityModel::new())
            .unwrap();
        assert_eq!((w.start, w.end), (span.start, span.end));
        assert!(w.clipped);
        assert_eq!(w.target_records, 150);
    }

    #[test]
    fn weekend_only_span_targets_one_record() {
        let planner = WindowPlanner::new(10_000);
        let span = Span::new(at(2024, 1, 13, 0), at(2024, 1, 14, 0));
        let w = planner
            .plan(span, Direction::Forward, Period::Min1, &DensityModel::new())
            .unwrap();
        assert_eq!(w.target_records, 1);
    }

    #[test]
    fn empty_span_plans_nothing() {
        let planner = WindowPlanner::new(10_000);
        let t = at(2024, 1, 8, 0);
        assert!(planner
            .plan(Span::new(t, t), Direction::Forward, Period::Day, &DensityModel::new())
            .is_none());
    }

    #[test]
    fn lower_density_widens_window() {
        let planner = WindowPlanner::new(10_000);
        let span = Span::new(at(2020, 1, 1, 0), at(2024, 1, 1, 0));
        let mut density = DensityModel::new();
        let before = planner
            .plan(span, Direction::Forward, Period::Min1, &density)
            .unwrap();
        density.record_shortfall(Period::Min1, 100.0);
        let after = planner
            .plan(span, Direction::Forward, Period::Min1, &density)
            .unwrap();
        assert!(after.end > before.end);
    }

    #[test]
    fn narrowing_retreats_far_boundary() {
        let w = FetchWindow {
            start: at(2024, 1, 1, 0),
            end: at(2024, 1, 20, 0),
            target_records: 100,
            direction: Direction::Forward,
            clipped: false,
        };
        let n = w.narrowed(Duration::days(3)).unwrap();
        assert_eq!((n.start, n.end), (w.start, at(2024, 1, 17, 0)));

        let b = FetchWindow {
            direction: Direction::Backward,
            ..w
        };
        let n = b.narrowed(Duration::days(3)).unwrap();
        assert_eq!((n.start, n.end), (at(2024, 1, 4, 0), w.end));

        assert!(w.narrowed(Duration::days(19)).is_none());
    }
}
