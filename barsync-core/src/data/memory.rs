//! In-memory provider for fixtures, dry runs and tests.
//!
//! Faults can be scripted: each query first consumes the next queued fault (if
//! any) and fails with it instead of answering.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::provider::{select_window, BarProvider, ProviderSession, QueryOutcome, WindowQuery};
use crate::domain::{BarRecord, Exchange, Instrument, Period};
use crate::error::SyncError;

/// A scripted provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Connection,
    RejectWindow,
    Authentication,
}

impl Fault {
    fn into_error(self) -> SyncError {
        match self {
            Fault::Connection => SyncError::ProviderConnection("scripted connection reset".into()),
            Fault::RejectWindow => SyncError::ProviderWindow("scripted no-session window".into()),
            Fault::Authentication => SyncError::Authentication("scripted bad token".into()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryProvider {
    series: BTreeMap<(Instrument, Period), Vec<BarRecord>>,
    faults: Mutex<VecDeque<Fault>>,
    fail_open: Option<Fault>,
    queries: AtomicUsize,
    sessions: AtomicUsize,
    log: Mutex<Vec<WindowQuery>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a series. Bars are sorted and deduplicated by key.
    pub fn with_series(mut self, instrument: Instrument, period: Period, mut bars: Vec<BarRecord>) -> Self {
        bars.sort_by_key(|b| b.key(period));
        bars.dedup_by_key(|b| b.key(period));
        self.series.insert((instrument, period), bars);
        self
    }

    pub fn with_faults(self, faults: impl IntoIterator<Item = Fault>) -> Self {
        if let Ok(mut q) = self.faults.lock() {
            q.extend(faults);
        }
        self
    }

    /// Make every `open_session` call fail.
    pub fn failing_open(mut self, fault: Fault) -> Self {
        self.fail_open = Some(fault);
        self
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::Relaxed)
    }

    /// Every query received, in order.
    pub fn queries(&self) -> Vec<WindowQuery> {
        self.log
            .lock()
            .map(|l| l.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }
}

impl BarProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    fn open_session(&self) -> Result<Box<dyn ProviderSession + '_>, SyncError> {
        if let Some(fault) = self.fail_open {
            return Err(fault.into_error());
        }
        self.sessions.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemorySession { provider: self }))
    }
}

struct MemorySession<'a> {
    provider: &'a MemoryProvider,
}

impl ProviderSession for MemorySession<'_> {
    fn query(&mut self, query: &WindowQuery) -> Result<QueryOutcome, SyncError> {
        let p = self.provider;
        p.queries.fetch_add(1, Ordering::Relaxed);
        match p.log.lock() {
            Ok(mut l) => l.push(query.clone()),
            Err(e) => e.into_inner().push(query.clone()),
        }

        let fault = match p.faults.lock() {
            Ok(mut q) => q.pop_front(),
            Err(e) => e.into_inner().pop_front(),
        };
        if let Some(fault) = fault {
            return Err(fault.into_error());
        }

        let bars = p
            .series
            .get(&(query.instrument.clone(), query.period))
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        Ok(select_window(bars, query))
    }

    fn list_instruments(&mut self, exchange: Exchange) -> Result<Vec<Instrument>, SyncError> {
        let mut out: Vec<Instrument> = self
            .provider
            .series
            .keys()
            .map(|(inst, _)| inst)
            .filter(|inst| inst.exchange == exchange && inst.continuous)
            .cloned()
            .collect();
        out.dedup();
        Ok(out)
    }
}
