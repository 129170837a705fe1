//! Persisted bar store.
//!
//! Layout: `{root}/his/{period_dir}/{EXCHANGE}/{code}.parquet`, where `code`
//! is the instrument's file code (`rb_HOT`, `rb2501`, `SR501`).
//!
//! - Whole-file replace: write to `.parquet.tmp`, then rename into place
//! - Metadata sidecar `{code}.meta.json` (bar count, key range, blake3 hash)
//! - Corrupt files are quarantined to `.parquet.quarantined` and read as empty
//!
//! The store does no locking of its own; callers serialise writers per
//! location (see `sync::locks`).

use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::domain::{BarKey, BarRecord, Exchange, Instrument, Period};
use crate::error::SyncError;

const COLUMNS: [&str; 11] = [
    "date",
    "time",
    "open",
    "high",
    "low",
    "close",
    "settle",
    "volume",
    "turnover",
    "open_interest",
    "open_interest_delta",
];

/// Read-all / write-all keyed store of bar series.
pub trait BarStore: Send + Sync {
    /// Every persisted bar, ascending. A missing series is `Ok(vec![])`;
    /// a corrupt one is quarantined and reported as `StoreRead`.
    fn read_all(&self, instrument: &Instrument, period: Period) -> Result<Vec<BarRecord>, SyncError>;

    /// Atomically replace the series with `records`.
    fn write_all(
        &self,
        instrument: &Instrument,
        period: Period,
        records: &[BarRecord],
    ) -> Result<(), SyncError>;

    /// Stable identifier of the series' storage location (used as lock key).
    fn location(&self, instrument: &Instrument, period: Period) -> String;

    /// Newest persisted bar, if any.
    fn last_record(&self, instrument: &Instrument, period: Period) -> Result<Option<BarRecord>, SyncError> {
        Ok(self.read_all(instrument, period)?.pop())
    }
}

/// Metadata sidecar for a stored series.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreMeta {
    pub instrument: String,
    pub period: Period,
    pub bar_count: usize,
    pub first: Option<BarKey>,
    pub last: Option<BarKey>,
    pub data_hash: String,
    pub written_at: NaiveDateTime,
}

pub struct ParquetStore {
    root: PathBuf,
}

impl ParquetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn series_dir(&self, exchange: Exchange, period: Period) -> PathBuf {
        self.root
            .join("his")
            .join(period.dir_name())
            .join(exchange.as_str())
    }

    pub fn series_path(&self, instrument: &Instrument, period: Period) -> PathBuf {
        self.series_dir(instrument.exchange, period)
            .join(format!("{}.parquet", instrument.file_code()))
    }

    fn meta_path(&self, instrument: &Instrument, period: Period) -> PathBuf {
        self.series_dir(instrument.exchange, period)
            .join(format!("{}.meta.json", instrument.file_code()))
    }

    /// Read a series without side effects: a corrupt file is reported as
    /// `StoreRead` and left where it is.
    pub fn inspect(&self, instrument: &Instrument, period: Period) -> Result<Vec<BarRecord>, SyncError> {
        let path = self.series_path(instrument, period);
        if !path.exists() {
            return Ok(Vec::new());
        }
        load_and_validate_parquet(&path).map_err(|reason| SyncError::StoreRead {
            location: path.display().to_string(),
            reason,
        })
    }

    pub fn get_meta(&self, instrument: &Instrument, period: Period) -> Option<StoreMeta> {
        let content = fs::read_to_string(self.meta_path(instrument, period)).ok()?;
        serde_json::from_str(&content).ok()
    }
}

impl BarStore for ParquetStore {
    fn read_all(&self, instrument: &Instrument, period: Period) -> Result<Vec<BarRecord>, SyncError> {
        let path = self.series_path(instrument, period);
        if !path.exists() {
            return Ok(Vec::new());
        }
        match load_and_validate_parquet(&path) {
            Ok(bars) => {
                debug!(path = %path.display(), bars = bars.len(), "loaded series");
                Ok(bars)
            }
            Err(reason) => {
                let quarantine = path.with_extension("parquet.quarantined");
                warn!(
                    path = %path.display(),
                    error = %reason,
                    "quarantining corrupt store file"
                );
                let _ = fs::rename(&path, &quarantine);
                Err(SyncError::StoreRead {
                    location: path.display().to_string(),
                    reason,
                })
            }
        }
    }

    fn write_all(
        &self,
        instrument: &Instrument,
        period: Period,
        records: &[BarRecord],
    ) -> Result<(), SyncError> {
        let path = self.series_path(instrument, period);
        let write_err = |reason: String| SyncError::StoreWrite {
            location: path.display().to_string(),
            reason,
        };

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| write_err(format!("failed to create dir: {e}")))?;
        }

        let mut df = bars_to_dataframe(records).map_err(write_err)?;
        let tmp_path = path.with_extension("parquet.tmp");
        write_parquet(&mut df, &tmp_path).map_err(write_err)?;
        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            write_err(format!("atomic rename failed: {e}"))
        })?;

        let meta = StoreMeta {
            instrument: instrument.to_string(),
            period,
            bar_count: records.len(),
            first: records.first().map(|b| b.key(period)),
            last: records.last().map(|b| b.key(period)),
            data_hash: blake3::hash(
                &serde_json::to_vec(records)
                    .map_err(|e| write_err(format!("hash serialization: {e}")))?,
            )
            .to_hex()
            .to_string(),
            written_at: chrono::Local::now().naive_local(),
        };
        let meta_json = serde_json::to_string_pretty(&meta)
            .map_err(|e| write_err(format!("meta serialization: {e}")))?;
        fs::write(self.meta_path(instrument, period), meta_json)
            .map_err(|e| write_err(format!("meta write: {e}")))?;

        debug!(path = %path.display(), bars = records.len(), "wrote series");
        Ok(())
    }

    fn location(&self, instrument: &Instrument, period: Period) -> String {
        self.series_path(instrument, period).display().to_string()
    }
}

/// One line of `status` output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeriesStatus {
    pub instrument: String,
    pub period: Period,
    pub bar_count: usize,
    pub first: Option<BarKey>,
    pub last: Option<BarKey>,
    pub size_bytes: u64,
    pub path: PathBuf,
}

/// List every stored series under `root`, sorted by period then instrument.
///
/// Sidecar metadata is used when present; otherwise the file is read.
pub fn status(root: &Path) -> Vec<SeriesStatus> {
    let mut out = Vec::new();

    for period in Period::ALL {
        let period_dir = root.join("his").join(period.dir_name());
        let Ok(exchanges) = fs::read_dir(&period_dir) else {
            continue;
        };
        for ex_entry in exchanges.flatten() {
            let ex_name = ex_entry.file_name().to_string_lossy().into_owned();
            let Ok(exchange) = ex_name.parse::<Exchange>() else {
                continue;
            };
            let Ok(files) = fs::read_dir(ex_entry.path()) else {
                continue;
            };
            for file in files.flatten() {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("parquet") {
                    continue;
                }
                let size_bytes = file.metadata().map(|m| m.len()).unwrap_or(0);
                let meta_path = path.with_extension("meta.json");
                let meta: Option<StoreMeta> = fs::read_to_string(&meta_path)
                    .ok()
                    .and_then(|c| serde_json::from_str(&c).ok());

                let entry = match meta {
                    Some(m) => SeriesStatus {
                        instrument: m.instrument,
                        period,
                        bar_count: m.bar_count,
                        first: m.first,
                        last: m.last,
                        size_bytes,
                        path,
                    },
                    None => {
                        let bars = load_and_validate_parquet(&path).unwrap_or_default();
                        let code = path
                            .file_stem()
                            .map(|s| s.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        SeriesStatus {
                            instrument: format!("{exchange}.{code}"),
                            period,
                            bar_count: bars.len(),
                            first: bars.first().map(|b| b.key(period)),
                            last: bars.last().map(|b| b.key(period)),
                            size_bytes,
                            path,
                        }
                    }
                };
                out.push(entry);
            }
        }
    }

    out.sort_by(|a, b| (a.period, &a.instrument).cmp(&(b.period, &b.instrument)));
    out
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or(NaiveDate::MIN)
}

fn bars_to_dataframe(bars: &[BarRecord]) -> Result<DataFrame, String> {
    let epoch = epoch();
    let dates: Vec<i32> = bars
        .iter()
        .map(|b| (b.date - epoch).num_days() as i32)
        .collect();
    let times: Vec<u64> = bars.iter().map(|b| u64::from(b.time)).collect();
    let f = |pick: fn(&BarRecord) -> f64| -> Vec<f64> { bars.iter().map(pick).collect() };

    DataFrame::new(vec![
        Column::new("date".into(), dates)
            .cast(&DataType::Date)
            .map_err(|e| format!("date cast: {e}"))?,
        Column::new("time".into(), times),
        Column::new("open".into(), f(|b| b.open)),
        Column::new("high".into(), f(|b| b.high)),
        Column::new("low".into(), f(|b| b.low)),
        Column::new("close".into(), f(|b| b.close)),
        Column::new("settle".into(), f(|b| b.settle)),
        Column::new("volume".into(), f(|b| b.volume)),
        Column::new("turnover".into(), f(|b| b.turnover)),
        Column::new("open_interest".into(), f(|b| b.open_interest)),
        Column::new("open_interest_delta".into(), f(|b| b.open_interest_delta)),
    ])
    .map_err(|e| format!("dataframe creation: {e}"))
}

fn write_parquet(df: &mut DataFrame, path: &Path) -> Result<(), String> {
    let file = fs::File::create(path).map_err(|e| format!("create file: {e}"))?;
    ParquetWriter::new(file)
        .finish(df)
        .map_err(|e| format!("write parquet: {e}"))?;
    Ok(())
}

fn load_and_validate_parquet(path: &Path) -> Result<Vec<BarRecord>, String> {
    let file = fs::File::open(path).map_err(|e| format!("open: {e}"))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| format!("read: {e}"))?;

    for col_name in &COLUMNS {
        if df.column(col_name).is_err() {
            return Err(format!("missing column '{col_name}'"));
        }
    }
    dataframe_to_bars(&df)
}

fn dataframe_to_bars(df: &DataFrame) -> Result<Vec<BarRecord>, String> {
    let column = |name: &str| df.column(name).map_err(|e| format!("column read: {e}"));
    let floats = |name: &str| -> Result<Vec<f64>, String> {
        let ca = column(name)?
            .f64()
            .map_err(|e| format!("{name} column type: {e}"))?;
        Ok((0..df.height()).map(|i| ca.get(i).unwrap_or(f64::NAN)).collect())
    };

    let date_ca = column("date")?
        .date()
        .map_err(|e| format!("date column type: {e}"))?;
    let time_ca = column("time")?
        .u64()
        .map_err(|e| format!("time column type: {e}"))?;
    let open = floats("open")?;
    let high = floats("high")?;
    let low = floats("low")?;
    let close = floats("close")?;
    let settle = floats("settle")?;
    let volume = floats("volume")?;
    let turnover = floats("turnover")?;
    let open_interest = floats("open_interest")?;
    let oi_delta = floats("open_interest_delta")?;

    let epoch = epoch();
    let n = df.height();
    let mut bars = Vec::with_capacity(n);
    for i in 0..n {
        let days = date_ca.get(i).ok_or_else(|| format!("null date at row {i}"))?;
        let time = time_ca.get(i).ok_or_else(|| format!("null time at row {i}"))?;
        let bar = BarRecord {
            date: epoch + chrono::Duration::days(i64::from(days)),
            time: u32::try_from(time).map_err(|_| format!("time out of range at row {i}"))?,
            open: open[i],
            high: high[i],
            low: low[i],
            close: close[i],
            settle: settle[i],
            volume: volume[i],
            turnover: turnover[i],
            open_interest: open_interest[i],
            open_interest_delta: oi_delta[i],
        };
        if !bar.has_valid_time() {
            return Err(format!("invalid HHMM time {} at row {i}", bar.time));
        }
        bars.push(bar);
    }
    Ok(bars)
}
