//! Session clock: decides whether a persisted series is stale.
//!
//! Intervals are expanded into absolute occurrences over a short lookback so
//! that cross-midnight and weekend cases reduce to plain datetime comparisons:
//!
//! - Day intervals occur on Monday to Friday.
//! - Night intervals are anchored on Monday to Friday evenings, so a Friday
//!   night interval that crosses midnight is live on Saturday morning.
//! - Sunday never trades.

use chrono::{Datelike, Duration, NaiveDateTime, Weekday};
use serde::{Deserialize, Serialize};

use super::definition::SessionDefinition;

/// Days walked back from `now`; always reaches the previous Friday.
const LOOKBACK_DAYS: i64 = 7;

/// Verdict of [`SessionClock::needs_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Freshness {
    pub stale: bool,
    /// `now` while trading is live, otherwise the most recent session end
    /// strictly before `now`.
    pub boundary: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct SessionClock {
    definition: SessionDefinition,
}

impl SessionClock {
    pub fn new(definition: SessionDefinition) -> Self {
        Self { definition }
    }

    pub fn definition(&self) -> &SessionDefinition {
        &self.definition
    }

    /// Absolute `[start, end]` spans of every interval anchored within the
    /// lookback window ending at `now`'s date.
    fn occurrences(&self, now: NaiveDateTime) -> Vec<(NaiveDateTime, NaiveDateTime)> {
        let today = now.date();
        let mut spans = Vec::new();
        for back in (0..=LOOKBACK_DAYS).rev() {
            let anchor = today - Duration::days(back);
            if is_weekend(anchor.weekday()) {
                continue;
            }
            for interval in self.definition.intervals() {
                spans.push(interval.span_on(anchor));
            }
        }
        spans.sort();
        spans
    }

    /// True when `now` lies inside an interval (both ends inclusive).
    /// An empty definition is always trading.
    pub fn is_trading(&self, now: NaiveDateTime) -> bool {
        if self.definition.is_empty() {
            return true;
        }
        self.occurrences(now)
            .iter()
            .any(|(start, end)| *start <= now && now <= *end)
    }

    /// The latest interval end strictly before `now`.
    pub fn last_close_before(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        self.occurrences(now)
            .into_iter()
            .map(|(_, end)| end)
            .filter(|end| *end < now)
            .max()
    }

    /// Whether a series whose newest persisted bar is stamped `last` needs a
    /// sync at `now`. `None` means nothing is persisted yet.
    pub fn needs_update(&self, now: NaiveDateTime, last: Option<NaiveDateTime>) -> Freshness {
        if self.is_trading(now) {
            return Freshness {
                stale: true,
                boundary: now,
            };
        }
        match self.last_close_before(now) {
            Some(boundary) => Freshness {
                stale: last.map_or(true, |l| l < boundary),
                boundary,
            },
            None => Freshness {
                stale: true,
                boundary: now,
            },
        }
    }
}

fn is_weekend(day: Weekday) -> bool {
    matches!(day, Weekday::Sat | Weekday::Sun)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn day_only() -> SessionClock {
        SessionClock::new(SessionDefinition::parse(&["09:30-15:00"], &[]).unwrap())
    }

    fn with_night() -> SessionClock {
        SessionClock::new(
            SessionDefinition::parse(
                &["09:00-10:15", "10:30-11:30", "13:30-15:00"],
                &["21:00-02:30"],
            )
            .unwrap(),
        )
    }

    // 2024-01-08 is a Monday; 2024-01-12 Friday; 13 Saturday; 14 Sunday.

    #[test]
    fn live_session_is_stale() {
        let now = at(2024, 1, 8, 10, 0);
        let last = now - Duration::seconds(1);
        let verdict = day_only().needs_update(now, Some(last));
        assert!(verdict.stale);
        assert_eq!(verdict.boundary, now);
    }

    #[test]
    fn session_bounds_are_inclusive() {
        let clock = day_only();
        assert!(clock.is_trading(at(2024, 1, 8, 9, 30)));
        assert!(clock.is_trading(at(2024, 1, 8, 15, 0)));
        assert!(!clock.is_trading(at(2024, 1, 8, 15, 1)));
    }

    #[test]
    fn dead_weekend_is_fresh_after_friday_close() {
        let now = at(2024, 1, 13, 12, 0);
        let friday_close = at(2024, 1, 12, 15, 0);
        let verdict = day_only().needs_update(now, Some(friday_close));
        assert!(!verdict.stale);
        assert_eq!(verdict.boundary, friday_close);
    }

    #[test]
    fn dead_weekend_is_stale_before_friday_close() {
        let now = at(2024, 1, 14, 18, 0);
        let verdict = day_only().needs_update(now, Some(at(2024, 1, 12, 14, 0)));
        assert!(verdict.stale);
        assert_eq!(verdict.boundary, at(2024, 1, 12, 15, 0));
    }

    #[test]
    fn friday_night_runs_into_saturday() {
        let clock = with_night();
        assert!(clock.is_trading(at(2024, 1, 13, 1, 0)));
        assert!(!clock.is_trading(at(2024, 1, 13, 3, 0)));
        // Sunday night has no anchor.
        assert!(!clock.is_trading(at(2024, 1, 14, 22, 0)));
        assert!(!clock.is_trading(at(2024, 1, 15, 1, 0)));
    }

    #[test]
    fn saturday_boundary_is_night_tail() {
        let clock = with_night();
        let now = at(2024, 1, 13, 12, 0);
        assert_eq!(clock.last_close_before(now), Some(at(2024, 1, 13, 2, 30)));
    }

    #[test]
    fn monday_morning_before_open_points_at_saturday_tail() {
        let clock = with_night();
        let now = at(2024, 1, 15, 8, 0);
        let verdict = clock.needs_update(now, Some(at(2024, 1, 13, 2, 30)));
        assert!(!verdict.stale);
        assert_eq!(verdict.boundary, at(2024, 1, 13, 2, 30));
    }

    #[test]
    fn lunch_break_boundary_is_morning_close() {
        let clock = with_night();
        let now = at(2024, 1, 9, 12, 0);
        assert!(!clock.is_trading(now));
        assert_eq!(clock.last_close_before(now), Some(at(2024, 1, 9, 11, 30)));
    }

    #[test]
    fn empty_store_is_stale() {
        let verdict = day_only().needs_update(at(2024, 1, 13, 12, 0), None);
        assert!(verdict.stale);
    }

    #[test]
    fn empty_definition_always_trades() {
        let clock = SessionClock::new(SessionDefinition::default());
        let now = at(2024, 1, 14, 3, 0);
        let verdict = clock.needs_update(now, Some(now));
        assert!(verdict.stale);
        assert_eq!(verdict.boundary, now);
        assert_eq!(clock.last_close_before(now), None);
    }
}
