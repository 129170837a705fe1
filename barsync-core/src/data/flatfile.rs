//! Flat CSV bar files.
//!
//! Columns: `date,time,open,high,low,close,volume,open_interest`, optionally
//! followed by `settle,turnover`. Dates are `YYYY-MM-DD` (also accepted:
//! `YYYYMMDD`, `YYYY/MM/DD`); times are `HH:MM:SS` for sub-day bars and `0`
//! for day bars (also accepted: `HH:MM` and integer `HHMM`).

use chrono::NaiveDate;
use std::fs;
use std::path::Path;
use tracing::warn;

use crate::domain::{BarRecord, Period};
use crate::error::SyncError;

pub const HEADER: [&str; 10] = [
    "date",
    "time",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "open_interest",
    "settle",
    "turnover",
];

/// Write `records` as CSV to `path`, replacing any existing file.
pub fn export_csv(records: &[BarRecord], period: Period, path: &Path) -> Result<usize, SyncError> {
    let write_err = |reason: String| SyncError::StoreWrite {
        location: path.display().to_string(),
        reason,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| write_err(format!("create dir: {e}")))?;
        }
    }

    let mut wtr = csv::Writer::from_path(path).map_err(|e| write_err(e.to_string()))?;
    wtr.write_record(HEADER).map_err(|e| write_err(e.to_string()))?;
    for r in records {
        let time = if period.is_intraday() {
            format!("{:02}:{:02}:00", r.time / 100, r.time % 100)
        } else {
            "0".to_string()
        };
        wtr.write_record([
            &r.date.format("%Y-%m-%d").to_string(),
            &time,
            &r.open.to_string(),
            &r.high.to_string(),
            &r.low.to_string(),
            &r.close.to_string(),
            &r.volume.to_string(),
            &r.open_interest.to_string(),
            &r.settle.to_string(),
            &r.turnover.to_string(),
        ])
        .map_err(|e| write_err(e.to_string()))?;
    }
    wtr.flush().map_err(|e| write_err(format!("flush: {e}")))?;
    Ok(records.len())
}

/// Read a bar CSV. Rows that fail to parse are skipped and counted in a
/// warning. The result is in file order.
pub fn read_csv(path: &Path, period: Period) -> Result<Vec<BarRecord>, SyncError> {
    let read_err = |reason: String| SyncError::StoreRead {
        location: path.display().to_string(),
        reason,
    };

    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(|e| read_err(e.to_string()))?;

    let headers = rdr.headers().map_err(|e| read_err(e.to_string()))?.clone();
    let col = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));
    let (Some(date_i), Some(time_i)) = (col("date"), col("time")) else {
        return Err(read_err("missing date/time columns".into()));
    };
    let fields: Vec<Option<usize>> = HEADER[2..].iter().map(|h| col(h)).collect();

    let mut bars = Vec::new();
    let mut skipped = 0usize;
    for row in rdr.records() {
        let Ok(row) = row else {
            skipped += 1;
            continue;
        };
        let date = row.get(date_i).and_then(parse_date);
        let time = row.get(time_i).and_then(parse_time);
        let (Some(date), Some(time)) = (date, time) else {
            skipped += 1;
            continue;
        };
        let num = |i: usize| -> f64 {
            fields[i]
                .and_then(|c| row.get(c))
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0)
        };
        bars.push(BarRecord {
            date,
            time: if period.is_intraday() { time } else { 0 },
            open: num(0),
            high: num(1),
            low: num(2),
            close: num(3),
            volume: num(4),
            open_interest: num(5),
            settle: num(6),
            turnover: num(7),
            open_interest_delta: 0.0,
        });
    }

    if skipped > 0 {
        warn!(path = %path.display(), skipped, "skipped unparseable CSV rows");
    }
    Ok(bars)
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    ["%Y-%m-%d", "%Y%m%d", "%Y/%m/%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

/// Parse a bar time into HHMM.
fn parse_time(s: &str) -> Option<u32> {
    let hhmm = if s.contains(':') {
        let mut parts = s.split(':');
        let h: u32 = parts.next()?.parse().ok()?;
        let m: u32 = parts.next()?.parse().ok()?;
        if h >= 24 || m >= 60 {
            return None;
        }
        h * 100 + m
    } else {
        s.parse().ok()?
    };
    (hhmm / 100 < 24 && hhmm % 100 < 60).then_some(hhmm)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(period: Period) -> Vec<BarRecord> {
        let d = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        [(931, 10.0), (932, 11.0)]
            .iter()
            .map(|&(time, close)| {
                let mut b = BarRecord::at(d.and_hms_opt(0, 0, 0).unwrap(), period);
                b.time = time;
                b.close = close;
                b.volume = 5.0;
                b
            })
            .collect()
    }

    #[test]
    fn export_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("SHFE.rb.HOT_m1.csv");
        let bars = sample(Period::Min1);

        assert_eq!(export_csv(&bars, Period::Min1, &path).unwrap(), 2);
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("date,time,open,high,low,close,volume,open_interest"));
        assert!(text.contains("2024-01-02,09:31:00"));

        let loaded = read_csv(&path, Period::Min1).unwrap();
        assert_eq!(loaded, bars);
    }

    #[test]
    fn reads_original_download_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SHFE.rb.HOT_d.csv");
        fs::write(
            &path,
            "date,time,open,high,low,close,volume,open_interest\n\
             2024-01-02,0,1,2,0.5,1.5,100,2000\n\
             not-a-date,0,1,1,1,1,1,1\n\
             20240103,0,1.5,2.5,1,2,120,2100\n",
        )
        .unwrap();

        let bars = read_csv(&path, Period::Day).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[1].date, NaiveDate::from_ymd_opt(2024, 1, 3).unwrap());
        assert_eq!(bars[1].open_interest, 2100.0);
        assert_eq!(bars[1].settle, 0.0);
    }

    #[test]
    fn time_formats() {
        assert_eq!(parse_time("09:31:00"), Some(931));
        assert_eq!(parse_time("21:05"), Some(2105));
        assert_eq!(parse_time("1500"), Some(1500));
        assert_eq!(parse_time("0"), Some(0));
        assert_eq!(parse_time("24:00:00"), None);
        assert_eq!(parse_time("09:150"), None);
        assert_eq!(parse_time("4294967295:00"), None);
        assert_eq!(parse_time("99999999:00"), None);
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = read_csv(Path::new("/nonexistent/x.csv"), Period::Day).unwrap_err();
        assert_eq!(err.kind(), "store_read");
    }
}
