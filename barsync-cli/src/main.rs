//! barsync CLI: sync, status, check and export commands.
//!
//! Commands:
//! - `sync`: bring stored bar series up to date from the configured provider
//! - `status`: list stored series with bar counts, key ranges and sizes
//! - `check`: show the session clock's verdict for one instrument
//! - `export`: dump a stored series to flat CSV

use anyhow::{bail, Context, Result};
use barsync_core::config::ProviderKind;
use barsync_core::data::{build_provider, export_csv, status, ParquetStore};
use barsync_core::domain::{Exchange, Instrument, Period};
use barsync_core::session::SessionClock;
use barsync_core::sync::{
    InstrumentSet, LogProgress, SyncEngine, SyncMode, SyncReport, SyncRequest, TaskStatus,
};
use barsync_core::SyncConfig;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Config file picked up from the working directory when `--config` is absent.
const DEFAULT_CONFIG: &str = "barsync.toml";

#[derive(Parser)]
#[command(name = "barsync", about = "barsync: session-aware incremental bar synchronisation")]
struct Cli {
    /// Path to a TOML config file. Defaults to ./barsync.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Compact, global = true)]
    log_format: LogFormat,

    /// Default log level when RUST_LOG is unset.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring stored series up to date.
    Sync {
        /// Instrument codes (e.g. SHFE.rb.HOT DCE.m.2501).
        codes: Vec<Instrument>,

        /// Sync every continuous instrument of this exchange instead.
        #[arg(long, conflicts_with = "codes")]
        exchange: Option<Exchange>,

        /// Periods to sync.
        #[arg(long, value_delimiter = ',', default_value = "day,min1,min5")]
        periods: Vec<Period>,

        /// Earliest date a full backfill reaches (YYYY-MM-DD). Defaults to 10 years ago.
        #[arg(long)]
        start: Option<String>,

        /// Last date to sync, inclusive (YYYY-MM-DD). Defaults to now.
        #[arg(long)]
        end: Option<String>,

        /// Full backward backfill instead of incremental catch-up.
        #[arg(long, default_value_t = false)]
        full: bool,

        /// Worker threads. Overrides the config file.
        #[arg(long)]
        workers: Option<usize>,

        /// Store root. Overrides the config file.
        #[arg(long)]
        store: Option<PathBuf>,

        /// Read from this directory of CSV exports instead of the configured provider.
        #[arg(long)]
        provider_dir: Option<PathBuf>,

        /// Print the full report as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// List stored series.
    Status {
        /// Store root. Overrides the config file.
        #[arg(long)]
        store: Option<PathBuf>,
    },
    /// Show whether a stored series needs an update.
    Check {
        code: Instrument,

        #[arg(long, default_value = "day")]
        period: Period,

        /// Evaluate at this wall-clock time (YYYY-MM-DD HH:MM) instead of now.
        #[arg(long)]
        at: Option<String>,

        /// Store root. Overrides the config file.
        #[arg(long)]
        store: Option<PathBuf>,
    },
    /// Dump a stored series to CSV.
    Export {
        code: Instrument,

        #[arg(long)]
        period: Period,

        /// Output CSV path.
        #[arg(long)]
        out: PathBuf,

        /// Store root. Overrides the config file.
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format, &cli.log_level)?;
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Sync {
            codes,
            exchange,
            periods,
            start,
            end,
            full,
            workers,
            store,
            provider_dir,
            json,
        } => {
            if let Some(workers) = workers {
                config.workers = workers;
            }
            if let Some(store) = store {
                config.storage.root = store;
            }
            if let Some(dir) = provider_dir {
                config.provider.kind = ProviderKind::Csv;
                config.provider.csv_dir = dir;
            }
            config.validate()?;

            let instruments = match exchange {
                Some(exchange) => InstrumentSet::Exchange(exchange),
                None if codes.is_empty() => bail!("give instrument codes or --exchange"),
                None => InstrumentSet::Explicit(codes),
            };
            let mode = if full { SyncMode::Full } else { SyncMode::Incremental };
            run_sync(&config, instruments, periods, start, end, mode, json)
        }
        Commands::Status { store } => {
            let root = store.unwrap_or(config.storage.root);
            run_status(&root)
        }
        Commands::Check {
            code,
            period,
            at,
            store,
        } => {
            if let Some(store) = store {
                config.storage.root = store;
            }
            run_check(&config, &code, period, at)
        }
        Commands::Export {
            code,
            period,
            out,
            store,
        } => {
            let root = store.unwrap_or(config.storage.root);
            run_export(&root, &code, period, &out)
        }
    }
}

fn init_logging(format: LogFormat, default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let result = match format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("failed to initialise logging: {e}"))
}

fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    match path {
        Some(path) => Ok(SyncConfig::from_file(path)?),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            Ok(SyncConfig::from_file(Path::new(DEFAULT_CONFIG))?)
        }
        None => Ok(SyncConfig::default()),
    }
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid date '{s}'"))
}

fn run_sync(
    config: &SyncConfig,
    instruments: InstrumentSet,
    periods: Vec<Period>,
    start: Option<String>,
    end: Option<String>,
    mode: SyncMode,
    json: bool,
) -> Result<()> {
    let as_of = config.now();
    let start = start
        .as_deref()
        .map(parse_date)
        .transpose()?
        .map(|d| d.and_time(NaiveTime::MIN))
        .unwrap_or_else(|| as_of - chrono::Duration::days(365 * 10));
    // The end date is inclusive on the command line.
    let end = end
        .as_deref()
        .map(parse_date)
        .transpose()?
        .map(|d| d.and_time(NaiveTime::MIN) + chrono::Duration::days(1));

    let provider = build_provider(&config.provider)?;
    let store = ParquetStore::new(config.storage.root.clone());

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        ctrlc::set_handler(move || {
            cancel.store(true, Ordering::SeqCst);
            warn!("interrupt received, finishing in-flight merges");
        })
        .context("failed to install Ctrl-C handler")?;
    }

    let request = SyncRequest {
        instruments,
        periods,
        start,
        end,
        mode,
        as_of,
    };
    let engine = SyncEngine::new(provider.as_ref(), &store, config).with_cancel(Arc::clone(&cancel));
    let report = engine.run(&request, &LogProgress::new())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if cancel.load(Ordering::SeqCst) {
        info!("sync interrupted");
    }
    if !report.all_succeeded() {
        for task in report.tasks.iter().filter(|t| t.is_failed()) {
            if let TaskStatus::Failed { error, .. } = &task.status {
                eprintln!("Error for {}: {error}", task.label());
            }
        }
        std::process::exit(1);
    }
    Ok(())
}

fn print_report(report: &SyncReport) {
    println!();
    println!(
        "{:<20} {:<6} {:<12} {:>8} {:>10} {:>10} {:>9}",
        "Series", "Period", "Status", "Windows", "New", "Stored", "Time"
    );
    println!("{}", "-".repeat(81));
    for task in &report.tasks {
        let windows = task.fetch.as_ref().map_or(0, |f| f.windows_attempted);
        println!(
            "{:<20} {:<6} {:<12} {:>8} {:>10} {:>10} {:>8.1}s",
            task.instrument.to_string(),
            task.period.to_string(),
            task.status.as_str(),
            windows,
            task.merge.net_new,
            task.merge.final_count,
            task.elapsed_ms as f64 / 1000.0,
        );
    }
    println!();
    println!(
        "Synced: {}  Up to date: {}  Cancelled: {}  Failed: {}  New bars: {}",
        report.succeeded,
        report.up_to_date,
        report.cancelled,
        report.failed,
        report.total_stored()
    );
}

fn run_status(root: &Path) -> Result<()> {
    if !root.exists() {
        println!("Store directory does not exist: {}", root.display());
        return Ok(());
    }

    let rows = status(root);
    let total_size: u64 = rows.iter().map(|r| r.size_bytes).sum();

    println!("Store: {}", root.display());
    println!("Series: {}", rows.len());
    println!("Total size: {}", format_size(total_size));
    println!();
    println!(
        "{:<20} {:<6} {:>10} {:<15} {:<15} {:>10}",
        "Series", "Period", "Bars", "First", "Last", "Size"
    );
    println!("{}", "-".repeat(81));
    for row in &rows {
        let key = |k: &Option<barsync_core::domain::BarKey>| {
            k.as_ref().map(|k| k.to_string()).unwrap_or_else(|| "-".into())
        };
        println!(
            "{:<20} {:<6} {:>10} {:<15} {:<15} {:>10}",
            row.instrument,
            row.period.to_string(),
            row.bar_count,
            key(&row.first),
            key(&row.last),
            format_size(row.size_bytes)
        );
    }
    Ok(())
}

fn run_check(config: &SyncConfig, code: &Instrument, period: Period, at: Option<String>) -> Result<()> {
    let now = match at.as_deref() {
        Some(s) => NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M")
            .with_context(|| format!("invalid time '{s}', expected YYYY-MM-DD HH:MM"))?,
        None => config.now(),
    };

    let store = ParquetStore::new(config.storage.root.clone());
    let last = store.inspect(code, period)?.pop();
    let persisted_until = last
        .as_ref()
        .map(|b| b.timestamp() + chrono::Duration::seconds(period.seconds()));

    let clock = SessionClock::new(config.session_for(code));
    let verdict = clock.needs_update(now, persisted_until);

    println!("Instrument:     {code}");
    println!("Period:         {period}");
    println!("Now:            {now}");
    println!(
        "Session:        {} trading minutes/day{}",
        clock.definition().trading_minutes_per_day(),
        if clock.definition().has_night() { " (with night)" } else { "" }
    );
    println!("Trading now:    {}", if clock.is_trading(now) { "yes" } else { "no" });
    println!("Boundary:       {}", verdict.boundary);
    match last {
        Some(bar) => println!("Last stored:    {}", bar.key(period)),
        None => println!("Last stored:    (empty)"),
    }
    println!("Needs update:   {}", if verdict.stale { "yes" } else { "no" });
    Ok(())
}

fn run_export(root: &Path, code: &Instrument, period: Period, out: &Path) -> Result<()> {
    let store = ParquetStore::new(root);
    let records = store.inspect(code, period)?;
    if records.is_empty() {
        bail!("no stored bars for {code} {period} under {}", root.display());
    }
    let written = export_csv(&records, period, out)?;
    println!("Exported {written} bars to {}", out.display());
    Ok(())
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
