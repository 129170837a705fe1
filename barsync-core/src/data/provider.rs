//! Upstream bar provider contract.
//!
//! The `BarProvider` trait abstracts over data sources (flat CSV exports, an
//! HTTP bar service, in-memory fixtures) so the fetch loop can be driven
//! against any of them and mocked in tests. Providers know nothing about the
//! store; the sync layer sits above this trait.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::domain::{BarRecord, Direction, Exchange, Instrument, Period};
use crate::error::SyncError;

/// One bounded query: at most `max_records` bars of `period` with timestamps
/// in `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowQuery {
    pub instrument: Instrument,
    pub period: Period,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub max_records: usize,
    /// Which end of the window to keep when more than `max_records` match:
    /// the earliest for forward, the latest for backward.
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    /// Ascending bars inside the window. May be empty.
    Records(Vec<BarRecord>),
    /// The window lies entirely outside the source's coverage in the query's
    /// direction; there is nothing further to fetch.
    WindowExhausted,
}

/// A scoped provider connection. Opened per window and dropped right after.
pub trait ProviderSession {
    fn query(&mut self, query: &WindowQuery) -> Result<QueryOutcome, SyncError>;

    /// Continuous instruments the provider knows for an exchange.
    fn list_instruments(&mut self, exchange: Exchange) -> Result<Vec<Instrument>, SyncError>;
}

pub trait BarProvider: Send + Sync {
    fn name(&self) -> &str;

    fn open_session(&self) -> Result<Box<dyn ProviderSession + '_>, SyncError>;

    /// False while the provider is refusing requests (e.g. breaker open).
    fn is_available(&self) -> bool {
        true
    }
}

/// Answer a window query from an ascending, key-unique slice of bars.
///
/// Shared by file-backed and in-memory providers so both honour the same
/// truncation and exhaustion rules.
pub fn select_window(bars: &[BarRecord], query: &WindowQuery) -> QueryOutcome {
    let (first, last) = match (bars.first(), bars.last()) {
        (Some(f), Some(l)) => (f.timestamp(), l.timestamp()),
        _ => return QueryOutcome::WindowExhausted,
    };
    let beyond = match query.direction {
        Direction::Forward => query.start > last,
        Direction::Backward => query.end <= first,
    };
    if beyond {
        return QueryOutcome::WindowExhausted;
    }

    let lo = bars.partition_point(|b| b.timestamp() < query.start);
    let hi = bars.partition_point(|b| b.timestamp() < query.end);
    let in_window = &bars[lo..hi.max(lo)];
    let take = in_window.len().min(query.max_records);
    let selected = match query.direction {
        Direction::Forward => &in_window[..take],
        Direction::Backward => &in_window[in_window.len() - take..],
    };
    QueryOutcome::Records(selected.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    fn minutes(n: usize) -> Vec<BarRecord> {
        let base = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        (0..n)
            .map(|i| BarRecord::at(base + Duration::minutes(i as i64), Period::Min1))
            .collect()
    }

    fn query(bars: &[BarRecord], lo: usize, hi: usize, max: usize, dir: Direction) -> WindowQuery {
        WindowQuery {
            instrument: "SHFE.rb.HOT".parse().unwrap(),
            period: Period::Min1,
            start: bars[lo].timestamp(),
            end: bars[hi].timestamp(),
            max_records: max,
            direction: dir,
        }
    }

    #[test]
    fn forward_truncation_keeps_earliest() {
        let bars = minutes(100);
        let q = query(&bars, 10, 50, 5, Direction::Forward);
        match select_window(&bars, &q) {
            QueryOutcome::Records(r) => {
                assert_eq!(r.len(), 5);
                assert_eq!(r[0], bars[10]);
                assert_eq!(r[4], bars[14]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn backward_truncation_keeps_latest_ascending() {
        let bars = minutes(100);
        let q = query(&bars, 10, 50, 5, Direction::Backward);
        match select_window(&bars, &q) {
            QueryOutcome::Records(r) => {
                assert_eq!(r.len(), 5);
                assert_eq!(r[0], bars[45]);
                assert_eq!(r[4], bars[49]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn exhaustion_depends_on_direction() {
        let bars = minutes(10);
        let mut q = query(&bars, 0, 5, 100, Direction::Backward);
        q.end = bars[0].timestamp();
        q.start = q.end - Duration::days(1);
        assert_eq!(select_window(&bars, &q), QueryOutcome::WindowExhausted);

        q.direction = Direction::Forward;
        assert_eq!(select_window(&bars, &q), QueryOutcome::Records(vec![]));

        assert_eq!(select_window(&[], &q), QueryOutcome::WindowExhausted);
    }
}
