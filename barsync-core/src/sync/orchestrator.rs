//! Sync orchestrator: turns a request into per-(instrument, period) tasks,
//! runs them on a bounded worker pool and aggregates a report.
//!
//! Failures stay scoped to their task. The only errors `run` itself returns
//! are startup conditions under which no task could be attempted: rejected
//! credentials, an empty instrument set, or an empty range.

use chrono::{Duration as ChronoDuration, NaiveDateTime};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

use super::controller::{FetchController, FetchOutcome, FetchStats, FetchTask};
use super::density::DensityModel;
use super::locks::StoreLocks;
use super::merge::{merge_and_write, MergeStats};
use super::progress::SyncProgress;
use crate::config::SyncConfig;
use crate::data::{BarProvider, BarStore};
use crate::domain::{Direction, Exchange, Instrument, Period};
use crate::error::SyncError;
use crate::session::SessionClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Catch up forward from the last persisted bar.
    Incremental,
    /// Backfill backward from the range end to the range start.
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentSet {
    Explicit(Vec<Instrument>),
    /// Every continuous instrument of an exchange.
    Exchange(Exchange),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub instruments: InstrumentSet,
    pub periods: Vec<Period>,
    /// Earliest timestamp a full backfill reaches.
    pub start: NaiveDateTime,
    /// Exclusive upper bound; `None` means `as_of`.
    pub end: Option<NaiveDateTime>,
    pub mode: SyncMode,
    /// Exchange wall-clock "now" for freshness decisions.
    pub as_of: NaiveDateTime,
}

impl SyncRequest {
    /// Upper bound of every task: `min(end, as_of)`.
    pub fn effective_end(&self) -> NaiveDateTime {
        self.end.map_or(self.as_of, |end| end.min(self.as_of))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Synced { outcome: FetchOutcome },
    /// The store already covers the last session boundary.
    UpToDate { boundary: NaiveDateTime },
    Cancelled,
    Failed { kind: String, error: String },
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Synced { .. } => "synced",
            TaskStatus::UpToDate { .. } => "up_to_date",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Failed { .. } => "failed",
        }
    }

    fn failed(error: &SyncError) -> Self {
        TaskStatus::Failed {
            kind: error.kind().to_string(),
            error: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub instrument: Instrument,
    pub period: Period,
    /// Mode actually used; incremental requests on an empty store run full.
    pub mode: SyncMode,
    pub status: TaskStatus,
    pub fetch: Option<FetchStats>,
    pub merge: MergeStats,
    pub elapsed_ms: u64,
}

impl TaskReport {
    pub fn label(&self) -> String {
        format!("{} {}", self.instrument, self.period)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, TaskStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub tasks: Vec<TaskReport>,
    pub succeeded: usize,
    pub failed: usize,
    pub up_to_date: usize,
    pub cancelled: usize,
}

impl SyncReport {
    pub fn from_tasks(tasks: Vec<TaskReport>) -> Self {
        let mut report = SyncReport::default();
        for task in &tasks {
            match task.status {
                TaskStatus::Synced { .. } => report.succeeded += 1,
                TaskStatus::UpToDate { .. } => report.up_to_date += 1,
                TaskStatus::Cancelled => report.cancelled += 1,
                TaskStatus::Failed { .. } => report.failed += 1,
            }
        }
        report.tasks = tasks;
        report
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    pub fn total_stored(&self) -> usize {
        self.tasks.iter().map(|t| t.merge.net_new).sum()
    }
}

/// What a task will do once the store and clock have been consulted.
enum TaskPlan {
    Fetch { task: FetchTask, mode: SyncMode },
    UpToDate { boundary: NaiveDateTime },
}

pub struct SyncEngine<'a> {
    provider: &'a dyn BarProvider,
    store: &'a dyn BarStore,
    config: &'a SyncConfig,
    locks: StoreLocks,
    /// Shared across tasks; only ever lowered.
    density: Mutex<DensityModel>,
    cancel: Arc<AtomicBool>,
    /// Set once any task is refused credentials; later tasks fail fast.
    auth_failed: AtomicBool,
}

impl<'a> SyncEngine<'a> {
    pub fn new(provider: &'a dyn BarProvider, store: &'a dyn BarStore, config: &'a SyncConfig) -> Self {
        Self {
            provider,
            store,
            config,
            locks: StoreLocks::new(),
            density: Mutex::new(DensityModel::from_seeds(&config.density)),
            cancel: Arc::new(AtomicBool::new(false)),
            auth_failed: AtomicBool::new(false),
        }
    }

    /// Share an external cancellation flag (e.g. set by a Ctrl-C handler).
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Current shared density estimates.
    pub fn density(&self) -> DensityModel {
        *self.density.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn run(&self, request: &SyncRequest, progress: &dyn SyncProgress) -> Result<SyncReport, SyncError> {
        let end = request.effective_end();
        if request.start >= end {
            return Err(SyncError::Config(format!(
                "empty sync range: {} .. {end}",
                request.start
            )));
        }

        let instruments = self.resolve(&request.instruments)?;
        if instruments.is_empty() || request.periods.is_empty() {
            return Err(SyncError::Config("nothing to sync: no instruments or periods".into()));
        }

        let jobs: Vec<(Instrument, Period)> = instruments
            .iter()
            .flat_map(|inst| request.periods.iter().map(move |p| (inst.clone(), *p)))
            .collect();
        let total = jobs.len();
        info!(
            provider = self.provider.name(),
            tasks = total,
            workers = self.config.workers,
            mode = ?request.mode,
            "starting sync"
        );

        let run_one = |(i, (inst, period)): (usize, &(Instrument, Period))| {
            progress.on_start(&format!("{inst} {period}"), i, total);
            let report = self.run_task(inst, *period, request);
            progress.on_complete(&report, total);
            report
        };

        let tasks: Vec<TaskReport> = if self.config.workers > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.config.workers)
                .thread_name(|i| format!("barsync-worker-{i}"))
                .build()
                .map_err(|e| SyncError::Config(format!("failed to build worker pool: {e}")))?;
            pool.install(|| jobs.par_iter().enumerate().map(run_one).collect())
        } else {
            jobs.iter().enumerate().map(run_one).collect()
        };

        let report = SyncReport::from_tasks(tasks);
        progress.on_batch_complete(report.succeeded + report.up_to_date, report.failed, total);
        Ok(report)
    }

    /// Expand the instrument set. Opening this session doubles as the startup
    /// credential probe.
    fn resolve(&self, set: &InstrumentSet) -> Result<Vec<Instrument>, SyncError> {
        let mut session = match self.provider.open_session() {
            Ok(session) => Some(session),
            Err(e @ SyncError::Authentication(_)) => return Err(e),
            Err(e) => {
                warn!(provider = self.provider.name(), error = %e, "startup probe failed, tasks will retry");
                None
            }
        };

        let exchange = match set {
            InstrumentSet::Explicit(list) => return Ok(list.clone()),
            InstrumentSet::Exchange(exchange) => *exchange,
        };

        let listed = match session.as_mut().map(|s| s.list_instruments(exchange)) {
            Some(Ok(list)) if !list.is_empty() => list,
            Some(Err(e @ SyncError::Authentication(_))) => return Err(e),
            Some(Err(e)) => {
                warn!(%exchange, error = %e, "provider could not list instruments, using configured universe");
                Vec::new()
            }
            _ => Vec::new(),
        };
        if !listed.is_empty() {
            return Ok(listed);
        }
        let configured = self.config.universe_for(exchange);
        debug!(%exchange, count = configured.len(), "instruments from configured universe");
        Ok(configured)
    }

    fn plan_task(&self, instrument: &Instrument, period: Period, request: &SyncRequest) -> TaskPlan {
        let end = request.effective_end();
        let full = TaskPlan::Fetch {
            task: FetchTask {
                instrument: instrument.clone(),
                period,
                start: request.start,
                end,
                direction: Direction::Backward,
            },
            mode: SyncMode::Full,
        };
        if request.mode == SyncMode::Full {
            return full;
        }

        let last = match self.store.last_record(instrument, period) {
            Ok(Some(last)) => last,
            Ok(None) => {
                debug!(%instrument, %period, "empty store, running full backfill");
                return full;
            }
            Err(e) => {
                warn!(%instrument, %period, error = %e, "store unreadable, running full backfill");
                return full;
            }
        };

        // A persisted bar covers up to its close.
        let persisted_until = last.timestamp() + ChronoDuration::seconds(period.seconds());
        let clock = SessionClock::new(self.config.session_for(instrument));
        let freshness = clock.needs_update(request.as_of, Some(persisted_until));
        let start = last.timestamp() + ChronoDuration::seconds(1);
        if !freshness.stale || start >= end {
            return TaskPlan::UpToDate {
                boundary: freshness.boundary,
            };
        }

        TaskPlan::Fetch {
            task: FetchTask {
                instrument: instrument.clone(),
                period,
                start,
                end,
                direction: Direction::Forward,
            },
            mode: SyncMode::Incremental,
        }
    }

    fn run_task(&self, instrument: &Instrument, period: Period, request: &SyncRequest) -> TaskReport {
        let started = Instant::now();
        let mut report = TaskReport {
            instrument: instrument.clone(),
            period,
            mode: request.mode,
            status: TaskStatus::Cancelled,
            fetch: None,
            merge: MergeStats::default(),
            elapsed_ms: 0,
        };

        if self.cancel.load(Ordering::Relaxed) {
            return report;
        }
        if self.auth_failed.load(Ordering::Relaxed) {
            report.status = TaskStatus::failed(&SyncError::Authentication(
                "credentials rejected by an earlier task".into(),
            ));
            return report;
        }
        if !self.provider.is_available() {
            report.status = TaskStatus::failed(&SyncError::CircuitBreakerTripped { remaining_secs: 0 });
            return report;
        }

        let (task, mode) = match self.plan_task(instrument, period, request) {
            TaskPlan::UpToDate { boundary } => {
                debug!(%instrument, %period, %boundary, "store is up to date");
                report.status = TaskStatus::UpToDate { boundary };
                report.elapsed_ms = started.elapsed().as_millis() as u64;
                return report;
            }
            TaskPlan::Fetch { task, mode } => (task, mode),
        };
        report.mode = mode;

        // The session cap is specific to this product and stays out of the
        // shared model; only shortfall calibration is folded back.
        let mut density = self.density();
        density.cap_to_session(&self.config.session_for(instrument));
        let baseline = density;

        let mut merged = MergeStats::default();
        let mut controller =
            FetchController::new(self.provider, &self.config.fetch, density).with_cancel(&self.cancel);
        let result = controller.run(&task, &mut |batch| {
            let stats = merge_and_write(self.store, &self.locks, &task.instrument, task.period, batch)?;
            merged.absorb(&stats);
            Ok(())
        });
        self.density
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .fold_calibrated(&baseline, controller.density());

        report.merge = merged;
        report.status = match result {
            Ok(stats) => {
                let status = match stats.outcome {
                    Some(FetchOutcome::Cancelled) => TaskStatus::Cancelled,
                    Some(outcome) => TaskStatus::Synced { outcome },
                    None => TaskStatus::Synced {
                        outcome: FetchOutcome::ReachedBound,
                    },
                };
                report.fetch = Some(stats);
                status
            }
            Err(e) => {
                if matches!(e, SyncError::Authentication(_)) {
                    self.auth_failed.store(true, Ordering::Relaxed);
                }
                TaskStatus::failed(&e)
            }
        };
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        report
    }
}
