//! Upstream providers and the persisted bar store.

pub mod circuit_breaker;
pub mod csv_provider;
pub mod flatfile;
pub mod http;
pub mod memory;
pub mod provider;
pub mod store;

pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use csv_provider::CsvProvider;
pub use flatfile::{export_csv, read_csv};
pub use http::HttpProvider;
pub use memory::{Fault, MemoryProvider};
pub use provider::{select_window, BarProvider, ProviderSession, QueryOutcome, WindowQuery};
pub use store::{status, BarStore, ParquetStore, SeriesStatus, StoreMeta};

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::SyncError;

/// Build the provider named by the `[provider]` config section.
pub fn build_provider(config: &ProviderConfig) -> Result<Box<dyn BarProvider>, SyncError> {
    match config.kind {
        ProviderKind::Csv => {
            info!(dir = %config.csv_dir.display(), "using CSV provider");
            Ok(Box::new(CsvProvider::new(config.csv_dir.clone())))
        }
        ProviderKind::Http => {
            let token = std::env::var(&config.token_env).ok().filter(|t| !t.is_empty());
            if token.is_none() {
                warn!(env = %config.token_env, "no provider token set, sending unauthenticated requests");
            }
            let breaker = Arc::new(CircuitBreaker::new(
                Duration::from_secs(config.breaker_cooldown_secs),
                config.breaker_threshold,
            ));
            info!(base_url = %config.base_url, "using HTTP provider");
            Ok(Box::new(HttpProvider::new(
                config.base_url.clone(),
                token,
                Duration::from_secs(config.timeout_secs),
                breaker,
            )?))
        }
    }
}
