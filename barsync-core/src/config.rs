//! TOML run configuration.
//!
//! Every section is optional; a missing file section falls back to the
//! defaults below, so an empty document is a valid config.
//!
//! ```toml
//! workers = 4
//! utc_offset_hours = 8
//!
//! [storage]
//! root = "storage"
//!
//! [provider]
//! kind = "csv"
//! csv_dir = "csv"
//!
//! [fetch]
//! max_records_per_call = 10000
//!
//! [sessions.rb]
//! day = ["09:00-10:15", "10:30-11:30", "13:30-15:00"]
//! night = ["21:00-23:00"]
//!
//! [universe]
//! SHFE = ["rb", "hc"]
//! ```

use chrono::{Duration as ChronoDuration, FixedOffset, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::{Exchange, Instrument, Period};
use crate::error::SyncError;
use crate::session::SessionDefinition;

/// Upper bound for `fetch.rejection_margin_days` (ten years).
pub const MAX_REJECTION_MARGIN_DAYS: i64 = 3650;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub storage: StorageConfig,
    pub provider: ProviderConfig,
    pub fetch: FetchConfig,
    pub density: DensitySeeds,
    /// Worker-pool size for independent (instrument, period) tasks.
    pub workers: usize,
    /// Exchange wall-clock offset from UTC, used to compute "now".
    pub utc_offset_hours: i32,
    /// Per-product trading sessions, keyed by product code (`rb`, `IF`).
    pub sessions: BTreeMap<String, SessionConfig>,
    /// Fallback instrument universe per exchange, as product codes.
    pub universe: BTreeMap<String, Vec<String>>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            provider: ProviderConfig::default(),
            fetch: FetchConfig::default(),
            density: DensitySeeds::default(),
            workers: 4,
            utc_offset_hours: 8,
            sessions: BTreeMap::new(),
            universe: BTreeMap::new(),
        }
    }
}

impl SyncConfig {
    pub fn from_file(path: &Path) -> Result<Self, SyncError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, SyncError> {
        let config: Self =
            toml::from_str(content).map_err(|e| SyncError::Config(format!("parse TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or spin the fetch loop.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.workers == 0 {
            return Err(SyncError::Config("workers must be at least 1".into()));
        }
        if self.fetch.max_records_per_call == 0 {
            return Err(SyncError::Config(
                "fetch.max_records_per_call must be at least 1".into(),
            ));
        }
        if self.fetch.flush_threshold == 0 {
            return Err(SyncError::Config("fetch.flush_threshold must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.fetch.shortfall_ratio) {
            return Err(SyncError::Config(
                "fetch.shortfall_ratio must be within 0..=1".into(),
            ));
        }
        if !(1..=MAX_REJECTION_MARGIN_DAYS).contains(&self.fetch.rejection_margin_days) {
            return Err(SyncError::Config(format!(
                "fetch.rejection_margin_days must be within 1..={MAX_REJECTION_MARGIN_DAYS}"
            )));
        }
        if self.fetch.zero_progress_limit == 0 {
            return Err(SyncError::Config(
                "fetch.zero_progress_limit must be at least 1".into(),
            ));
        }
        if !(-12..=14).contains(&self.utc_offset_hours) {
            return Err(SyncError::Config("utc_offset_hours out of range".into()));
        }
        for seed in [self.density.day, self.density.min1, self.density.min5]
            .into_iter()
            .flatten()
        {
            if !(seed.is_finite() && seed > 0.0) {
                return Err(SyncError::Config("density seeds must be positive".into()));
            }
        }
        for (product, session) in &self.sessions {
            session
                .definition()
                .map_err(|e| SyncError::Config(format!("sessions.{product}: {e}")))?;
        }
        for exchange in self.universe.keys() {
            exchange.parse::<Exchange>()?;
        }
        Ok(())
    }

    /// Current exchange wall-clock time.
    pub fn now(&self) -> NaiveDateTime {
        match FixedOffset::east_opt(self.utc_offset_hours * 3600) {
            Some(offset) => Utc::now().with_timezone(&offset).naive_local(),
            None => Utc::now().naive_utc(),
        }
    }

    /// Session definition for an instrument's product. Products without an
    /// entry get the exchange day session; a product configured with no
    /// intervals trades around the clock.
    pub fn session_for(&self, instrument: &Instrument) -> SessionDefinition {
        let entry = self.sessions.get(&instrument.product).or_else(|| {
            self.sessions
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(&instrument.product))
                .map(|(_, v)| v)
        });
        entry
            .filter(|s| {
                s.exchange
                    .as_deref()
                    .map_or(true, |ex| ex.eq_ignore_ascii_case(instrument.exchange.as_str()))
            })
            .and_then(|s| s.definition().ok())
            .unwrap_or_else(SessionDefinition::cn_futures_day)
    }

    /// Continuous instruments configured for `exchange` in `[universe]`.
    pub fn universe_for(&self, exchange: Exchange) -> Vec<Instrument> {
        self.universe
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(exchange.as_str()))
            .flat_map(|(_, products)| products.iter())
            .map(|p| Instrument::continuous(exchange, p.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("storage"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Csv,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// Directory of `{CODE}_{tag}.csv` files for the CSV provider.
    pub csv_dir: PathBuf,
    pub base_url: String,
    /// Name of the environment variable holding the bearer token.
    pub token_env: String,
    pub timeout_secs: u64,
    pub breaker_cooldown_secs: u64,
    pub breaker_threshold: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Csv,
            csv_dir: PathBuf::from("csv"),
            base_url: "http://127.0.0.1:8080".to_string(),
            token_env: "BARSYNC_TOKEN".to_string(),
            timeout_secs: 30,
            breaker_cooldown_secs: 30 * 60,
            breaker_threshold: 3,
        }
    }
}

/// Fetch-loop bounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FetchConfig {
    /// Provider's hard cap on records returned by one query.
    pub max_records_per_call: usize,
    /// Buffered records that trigger an intermediate merge-write.
    pub flush_threshold: usize,
    /// Consecutive connection failures tolerated before the task fails.
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Fixed delay after a window rejection.
    pub window_backoff_ms: u64,
    pub rejection_margin_days: i64,
    pub max_window_rejections: u32,
    /// A window returning fewer than `target * ratio` records is a shortfall.
    pub shortfall_ratio: f64,
    pub zero_progress_limit: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_records_per_call: 10_000,
            flush_threshold: 50_000,
            max_retries: 5,
            base_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            window_backoff_ms: 2_000,
            rejection_margin_days: 3,
            max_window_rejections: 8,
            shortfall_ratio: 0.8,
            zero_progress_limit: 2,
        }
    }
}

impl FetchConfig {
    /// Backoff before connection retry `attempt` (1-based):
    /// `min(base * 2^(attempt-1), max)`.
    pub fn connection_backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self.base_backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }

    pub fn window_backoff(&self) -> Duration {
        Duration::from_millis(self.window_backoff_ms)
    }

    pub fn rejection_margin(&self) -> ChronoDuration {
        ChronoDuration::days(self.rejection_margin_days.clamp(1, MAX_REJECTION_MARGIN_DAYS))
    }
}

/// Optional per-period records-per-trading-day seeds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DensitySeeds {
    pub day: Option<f64>,
    pub min1: Option<f64>,
    pub min5: Option<f64>,
}

impl DensitySeeds {
    pub fn get(&self, period: Period) -> Option<f64> {
        match period {
            Period::Day => self.day,
            Period::Min1 => self.min1,
            Period::Min5 => self.min5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub exchange: Option<String>,
    pub day: Vec<String>,
    pub night: Vec<String>,
}

impl SessionConfig {
    pub fn definition(&self) -> Result<SessionDefinition, SyncError> {
        SessionDefinition::parse(&self.day, &self.night)
    }
}
