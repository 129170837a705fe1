//! Fetch-retry controller: drives one (instrument, period) task through
//! bounded provider queries until the task bound is reached or the provider
//! runs dry.
//!
//! State machine:
//!
//! ```text
//! Planning ──► Fetching ──► Accumulating ──► Planning ...
//!    │            │
//!    │            └──► Retrying ──► Planning
//!    └──► Done
//! ```
//!
//! - Connection failures retry the same window after exponential backoff.
//! - Window rejections narrow the window (or skip it) after a fixed backoff.
//! - Authentication and breaker refusals are terminal.
//! - Accepted records are buffered and handed to a flush sink whenever the
//!   buffer reaches the flush threshold, and once more when the task ends,
//!   including when it ends by cancellation or failure.

use chrono::{Duration as ChronoDuration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::density::DensityModel;
use super::planner::{FetchWindow, Span, WindowPlanner};
use crate::config::FetchConfig;
use crate::data::{BarProvider, QueryOutcome, WindowQuery};
use crate::domain::{BarKey, BarRecord, Direction, Instrument, Period};
use crate::error::SyncError;

/// Receives buffered records. Returning an error fails the task.
pub type FlushSink<'s> = dyn FnMut(Vec<BarRecord>) -> Result<(), SyncError> + 's;

/// One unit of fetch work: every bar of `period` with timestamp in
/// `[start, end)`, walked in `direction`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchTask {
    pub instrument: Instrument,
    pub period: Period,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchOutcome {
    /// The cursor covered the whole `[start, end)` bound.
    ReachedBound,
    /// The provider reported no further data in the walk direction.
    Exhausted,
    /// Consecutive windows produced no new records.
    NoProgress,
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchStats {
    pub windows_attempted: usize,
    pub records_accepted: usize,
    pub duplicates_skipped: usize,
    pub out_of_bound_skipped: usize,
    /// Connection retries actually performed.
    pub retries: u32,
    pub window_rejections: u32,
    pub windows_skipped: usize,
    pub flushes: usize,
    pub outcome: Option<FetchOutcome>,
}

#[derive(Debug)]
pub enum FetchState {
    Planning,
    Fetching(FetchWindow),
    Accumulating {
        window: FetchWindow,
        records: Vec<BarRecord>,
    },
    Retrying {
        window: FetchWindow,
        error: SyncError,
    },
    Done(FetchOutcome),
}

/// Mutable bookkeeping for one `run`.
struct RunState {
    cursor: NaiveDateTime,
    seen: HashSet<BarKey>,
    buffer: Vec<BarRecord>,
    /// Window to retry (as-is or narrowed) instead of planning a fresh one.
    pending: Option<FetchWindow>,
    connection_failures: u32,
    rejections: u32,
    zero_progress: u32,
    stats: FetchStats,
}

impl RunState {
    fn remaining(&self, task: &FetchTask) -> Span {
        match task.direction {
            Direction::Forward => Span::new(self.cursor, task.end),
            Direction::Backward => Span::new(task.start, self.cursor),
        }
    }

    /// Move the cursor past `window` entirely.
    fn skip_past(&mut self, window: &FetchWindow) {
        self.cursor = match window.direction {
            Direction::Forward => window.end,
            Direction::Backward => window.start,
        };
    }
}

pub struct FetchController<'a> {
    provider: &'a dyn BarProvider,
    config: &'a FetchConfig,
    planner: WindowPlanner,
    density: DensityModel,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> FetchController<'a> {
    pub fn new(provider: &'a dyn BarProvider, config: &'a FetchConfig, density: DensityModel) -> Self {
        Self {
            provider,
            config,
            planner: WindowPlanner::new(config.max_records_per_call),
            density,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Density estimates after any in-run calibration.
    pub fn density(&self) -> &DensityModel {
        &self.density
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_some_and(|c| c.load(Ordering::Relaxed))
    }

    /// Sleep for `delay`, waking early on cancellation.
    fn pause(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        while !self.cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(100)));
        }
    }

    /// Run `task` to completion, handing buffered records to `sink`.
    pub fn run(&mut self, task: &FetchTask, sink: &mut FlushSink<'_>) -> Result<FetchStats, SyncError> {
        let mut st = RunState {
            cursor: match task.direction {
                Direction::Forward => task.start,
                Direction::Backward => task.end,
            },
            seen: HashSet::new(),
            buffer: Vec::new(),
            pending: None,
            connection_failures: 0,
            rejections: 0,
            zero_progress: 0,
            stats: FetchStats::default(),
        };

        let driven = self.drive(task, &mut st, sink);
        let flushed = flush(&mut st, sink);

        match (driven, flushed) {
            (Ok(outcome), Ok(())) => {
                st.stats.outcome = Some(outcome);
                debug!(
                    instrument = %task.instrument,
                    period = %task.period,
                    ?outcome,
                    windows = st.stats.windows_attempted,
                    accepted = st.stats.records_accepted,
                    "fetch task finished"
                );
                Ok(st.stats)
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(flush_err)) => {
                warn!(instrument = %task.instrument, error = %flush_err, "final flush failed after task error");
                Err(e)
            }
        }
    }

    fn drive(
        &mut self,
        task: &FetchTask,
        st: &mut RunState,
        sink: &mut FlushSink<'_>,
    ) -> Result<FetchOutcome, SyncError> {
        let mut state = FetchState::Planning;
        loop {
            state = match state {
                FetchState::Planning => self.plan(task, st),
                FetchState::Fetching(window) => self.fetch(task, window, st),
                FetchState::Accumulating { window, records } => {
                    self.accumulate(task, window, records, st, sink)?
                }
                FetchState::Retrying { window, error } => self.retry(task, window, error, st)?,
                FetchState::Done(outcome) => return Ok(outcome),
            };
        }
    }

    fn plan(&self, task: &FetchTask, st: &mut RunState) -> FetchState {
        if self.cancelled() {
            return FetchState::Done(FetchOutcome::Cancelled);
        }
        let span = st.remaining(task);
        if span.is_empty() {
            return FetchState::Done(FetchOutcome::ReachedBound);
        }
        if let Some(window) = st.pending.take() {
            return FetchState::Fetching(window);
        }
        match self
            .planner
            .plan(span, task.direction, task.period, &self.density)
        {
            Some(window) => FetchState::Fetching(window),
            None => FetchState::Done(FetchOutcome::ReachedBound),
        }
    }

    fn fetch(&self, task: &FetchTask, window: FetchWindow, st: &mut RunState) -> FetchState {
        st.stats.windows_attempted += 1;
        let query = WindowQuery {
            instrument: task.instrument.clone(),
            period: task.period,
            start: window.start,
            end: window.end,
            max_records: self.planner.max_records_per_call(),
            direction: task.direction,
        };
        debug!(
            instrument = %task.instrument,
            period = %task.period,
            start = %window.start,
            end = %window.end,
            target = window.target_records,
            "querying window"
        );

        // The session lives only for this one query.
        let result = self
            .provider
            .open_session()
            .and_then(|mut session| session.query(&query));

        match result {
            Ok(QueryOutcome::Records(records)) => FetchState::Accumulating { window, records },
            Ok(QueryOutcome::WindowExhausted) => FetchState::Done(FetchOutcome::Exhausted),
            Err(error) => FetchState::Retrying { window, error },
        }
    }

    fn accumulate(
        &mut self,
        task: &FetchTask,
        window: FetchWindow,
        records: Vec<BarRecord>,
        st: &mut RunState,
        sink: &mut FlushSink<'_>,
    ) -> Result<FetchState, SyncError> {
        st.connection_failures = 0;
        st.rejections = 0;

        let received = records.len();
        self.calibrate(task.period, &window, received);

        let truncated = received >= self.planner.max_records_per_call();
        let first_ts = records.first().map(BarRecord::timestamp);
        let last_ts = records.last().map(BarRecord::timestamp);
        let bound = Span::new(task.start, task.end);

        let mut accepted = 0usize;
        for rec in records {
            if !bound.contains(rec.timestamp()) {
                st.stats.out_of_bound_skipped += 1;
                continue;
            }
            if !st.seen.insert(rec.key(task.period)) {
                st.stats.duplicates_skipped += 1;
                continue;
            }
            st.buffer.push(rec);
            accepted += 1;
        }
        st.stats.records_accepted += accepted;

        // A truncated answer resumes just past its far edge; a complete one
        // covered the whole window.
        let previous = st.cursor;
        match task.direction {
            Direction::Forward => {
                st.cursor = match (truncated, last_ts) {
                    (true, Some(last)) => last + ChronoDuration::seconds(1),
                    _ => window.end,
                };
                if st.cursor <= previous {
                    st.cursor = window.end;
                }
            }
            Direction::Backward => {
                st.cursor = match (truncated, first_ts) {
                    (true, Some(first)) => first,
                    _ => window.start,
                };
                if st.cursor >= previous {
                    st.cursor = window.start;
                }
            }
        }

        debug!(
            instrument = %task.instrument,
            received,
            accepted,
            cursor = %st.cursor,
            "window accumulated"
        );

        if st.buffer.len() >= self.config.flush_threshold {
            flush(st, sink)?;
        }

        if st.remaining(task).is_empty() {
            return Ok(FetchState::Done(FetchOutcome::ReachedBound));
        }
        if accepted == 0 {
            st.zero_progress += 1;
            if st.zero_progress >= self.config.zero_progress_limit {
                return Ok(FetchState::Done(FetchOutcome::NoProgress));
            }
        } else {
            st.zero_progress = 0;
        }
        Ok(FetchState::Planning)
    }

    /// Shrink the density estimate when an unclipped window came back
    /// materially short of its target.
    fn calibrate(&mut self, period: Period, window: &FetchWindow, received: usize) {
        if window.clipped {
            return;
        }
        let target = window.target_records as f64;
        if received as f64 >= target * self.config.shortfall_ratio {
            return;
        }
        let days = window.trading_days();
        if days <= 0.0 {
            return;
        }
        let before = self.density.get(period);
        let after = self.density.record_shortfall(period, received as f64 / days);
        if after < before {
            debug!(%period, before, after, received, "density lowered after shortfall");
        }
    }

    fn retry(
        &self,
        task: &FetchTask,
        window: FetchWindow,
        error: SyncError,
        st: &mut RunState,
    ) -> Result<FetchState, SyncError> {
        if !error.is_retryable() {
            return Err(error);
        }
        match error {
            SyncError::ProviderConnection(reason) => {
                st.connection_failures += 1;
                if st.connection_failures > self.config.max_retries {
                    return Err(SyncError::ProviderConnection(format!(
                        "giving up after {} consecutive failures: {reason}",
                        st.connection_failures
                    )));
                }
                st.stats.retries += 1;
                let delay = self.config.connection_backoff(st.connection_failures);
                warn!(
                    instrument = %task.instrument,
                    period = %task.period,
                    attempt = st.connection_failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "provider connection failed, retrying window"
                );
                self.pause(delay);
                st.pending = Some(window);
                Ok(FetchState::Planning)
            }
            SyncError::ProviderWindow(reason) => {
                st.rejections += 1;
                st.stats.window_rejections += 1;
                if st.rejections > self.config.max_window_rejections {
                    return Err(SyncError::ProviderWindow(format!(
                        "giving up after {} consecutive rejections: {reason}",
                        st.rejections
                    )));
                }
                match window.narrowed(self.config.rejection_margin()) {
                    Some(narrowed) => {
                        warn!(
                            instrument = %task.instrument,
                            start = %narrowed.start,
                            end = %narrowed.end,
                            error = %reason,
                            "window rejected, narrowing"
                        );
                        st.pending = Some(narrowed);
                    }
                    None => {
                        warn!(
                            instrument = %task.instrument,
                            start = %window.start,
                            end = %window.end,
                            error = %reason,
                            "window rejected and too small to narrow, skipping"
                        );
                        st.stats.windows_skipped += 1;
                        st.skip_past(&window);
                    }
                }
                self.pause(self.config.window_backoff());
                Ok(FetchState::Planning)
            }
            other => Err(other),
        }
    }
}

fn flush(st: &mut RunState, sink: &mut FlushSink<'_>) -> Result<(), SyncError> {
    if st.buffer.is_empty() {
        return Ok(());
    }
    let batch = std::mem::take(&mut st.buffer);
    sink(batch)?;
    st.stats.flushes += 1;
    Ok(())
}
