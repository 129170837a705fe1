//! barsync core: session-aware incremental synchronisation of bar data.
//!
//! - Domain types (instruments, periods, bar records)
//! - Session clock deciding whether a persisted series is stale
//! - Window planner with a self-calibrating density model
//! - Fetch-retry controller driving bounded provider queries
//! - Merge-dedup-persist into a per-series Parquet store
//! - Orchestrator running independent tasks on a worker pool

pub mod config;
pub mod data;
pub mod domain;
pub mod error;
pub mod session;
pub mod sync;

pub use config::SyncConfig;
pub use error::SyncError;
