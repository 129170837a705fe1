//! Provider backed by a directory of flat CSV exports.
//!
//! Files are named `{STD_CODE}_{tag}.csv`, e.g. `SHFE.rb.HOT_m1.csv`. Each
//! file is parsed once per provider and kept in memory.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::flatfile::read_csv;
use super::provider::{select_window, BarProvider, ProviderSession, QueryOutcome, WindowQuery};
use crate::domain::{BarKey, BarRecord, Exchange, Instrument, Period};
use crate::error::SyncError;

pub struct CsvProvider {
    dir: PathBuf,
    loaded: Mutex<HashMap<PathBuf, Arc<Vec<BarRecord>>>>,
}

impl CsvProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_path(&self, instrument: &Instrument, period: Period) -> PathBuf {
        self.dir.join(format!("{instrument}_{}.csv", period.tag()))
    }

    /// Sorted, key-unique bars for a series; empty when no file exists.
    fn series(&self, instrument: &Instrument, period: Period) -> Result<Arc<Vec<BarRecord>>, SyncError> {
        let path = self.file_path(instrument, period);
        let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bars) = loaded.get(&path) {
            return Ok(Arc::clone(bars));
        }

        let rows = if path.exists() {
            read_csv(&path, period).map_err(|e| SyncError::ProviderConnection(e.to_string()))?
        } else {
            Vec::new()
        };
        // Later rows win on a repeated key.
        let by_key: BTreeMap<BarKey, BarRecord> =
            rows.into_iter().map(|b| (b.key(period), b)).collect();
        let bars: Vec<BarRecord> = by_key.into_values().collect();
        debug!(path = %path.display(), bars = bars.len(), "loaded CSV series");

        let bars = Arc::new(bars);
        loaded.insert(path, Arc::clone(&bars));
        Ok(bars)
    }
}

impl BarProvider for CsvProvider {
    fn name(&self) -> &str {
        "csv"
    }

    fn open_session(&self) -> Result<Box<dyn ProviderSession + '_>, SyncError> {
        if !self.dir.is_dir() {
            return Err(SyncError::ProviderConnection(format!(
                "CSV directory {} does not exist",
                self.dir.display()
            )));
        }
        Ok(Box::new(CsvSession { provider: self }))
    }
}

struct CsvSession<'a> {
    provider: &'a CsvProvider,
}

impl ProviderSession for CsvSession<'_> {
    fn query(&mut self, query: &WindowQuery) -> Result<QueryOutcome, SyncError> {
        if query.start >= query.end {
            return Err(SyncError::ProviderWindow(format!(
                "empty window {} .. {}",
                query.start, query.end
            )));
        }
        let bars = self.provider.series(&query.instrument, query.period)?;
        Ok(select_window(&bars, query))
    }

    fn list_instruments(&mut self, exchange: Exchange) -> Result<Vec<Instrument>, SyncError> {
        let entries = fs::read_dir(&self.provider.dir)
            .map_err(|e| SyncError::ProviderConnection(format!("read dir: {e}")))?;

        let mut found = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(stem) = name.strip_suffix(".csv") else {
                continue;
            };
            let Some((code, _tag)) = stem.rsplit_once('_') else {
                continue;
            };
            if let Ok(inst) = code.parse::<Instrument>() {
                if inst.exchange == exchange && inst.continuous && !found.contains(&inst) {
                    found.push(inst);
                }
            }
        }
        found.sort();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Direction;
    use chrono::NaiveDate;

    fn write_fixture(dir: &Path) {
        fs::write(
            dir.join("SHFE.rb.HOT_m1.csv"),
            "date,time,open,high,low,close,volume,open_interest\n\
             2024-01-02,09:02:00,1,1,1,2,1,1\n\
             2024-01-02,09:01:00,1,1,1,1,1,1\n\
             2024-01-02,09:01:00,1,1,1,9,1,1\n\
             2024-01-02,09:03:00,1,1,1,3,1,1\n",
        )
        .unwrap();
        fs::write(dir.join("SHFE.hc.HOT_d.csv"), "date,time\n").unwrap();
        fs::write(dir.join("DCE.m.HOT_d.csv"), "date,time\n").unwrap();
        fs::write(dir.join("notes.txt"), "x").unwrap();
    }

    #[test]
    fn serves_sorted_window() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let provider = CsvProvider::new(dir.path());
        let mut session = provider.open_session().unwrap();

        let d = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let q = WindowQuery {
            instrument: "SHFE.rb.HOT".parse().unwrap(),
            period: Period::Min1,
            start: d.and_hms_opt(9, 0, 0).unwrap(),
            end: d.and_hms_opt(9, 3, 0).unwrap(),
            max_records: 100,
            direction: Direction::Forward,
        };
        match session.query(&q).unwrap() {
            QueryOutcome::Records(r) => {
                assert_eq!(r.iter().map(|b| b.time).collect::<Vec<_>>(), vec![901, 902]);
                // The repeated 09:01 row keeps the later values.
                assert_eq!(r[0].close, 9.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_series_is_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let provider = CsvProvider::new(dir.path());
        let mut session = provider.open_session().unwrap();
        let d = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let q = WindowQuery {
            instrument: "SHFE.cu.HOT".parse().unwrap(),
            period: Period::Day,
            start: d.and_hms_opt(0, 0, 0).unwrap(),
            end: d.and_hms_opt(23, 0, 0).unwrap(),
            max_records: 100,
            direction: Direction::Backward,
        };
        assert_eq!(session.query(&q).unwrap(), QueryOutcome::WindowExhausted);
    }

    #[test]
    fn lists_continuous_instruments_by_exchange() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let provider = CsvProvider::new(dir.path());
        let mut session = provider.open_session().unwrap();
        let shfe = session.list_instruments(Exchange::Shfe).unwrap();
        let codes: Vec<String> = shfe.iter().map(|i| i.to_string()).collect();
        assert_eq!(codes, vec!["SHFE.hc.HOT", "SHFE.rb.HOT"]);
    }

    #[test]
    fn missing_directory_fails_to_connect() {
        let provider = CsvProvider::new("/nonexistent/barsync-csv");
        let err = provider.open_session().err().unwrap();
        assert_eq!(err.kind(), "provider_connection");
    }
}
