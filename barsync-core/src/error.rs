//! Error taxonomy for the sync pipeline.
//!
//! Every failure is scoped to a single (instrument, period) task. The
//! orchestrator records these per task instead of aborting a batch run, so the
//! messages are written to be readable in a summary table.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Establishing or using a provider session failed (network, timeout, 5xx).
    #[error("provider connection failed: {0}")]
    ProviderConnection(String),

    /// The provider rejected a window (calendar/session mismatch, bad bounds).
    #[error("provider rejected window: {0}")]
    ProviderWindow(String),

    /// Credentials were refused. Fatal at startup, terminal for a task.
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("hard stop: provider is refusing requests (circuit breaker open, {remaining_secs}s cooldown left)")]
    CircuitBreakerTripped { remaining_secs: u64 },

    /// Missing or corrupt store file. Callers treat this as an empty baseline.
    #[error("store read failed for {location}: {reason}")]
    StoreRead { location: String, reason: String },

    /// Atomic rewrite of a store file failed. Fatal for that task only.
    #[error("store write failed for {location}: {reason}")]
    StoreWrite { location: String, reason: String },

    #[error("invalid instrument code '{code}': {reason}")]
    InvalidInstrument { code: String, reason: String },

    #[error("invalid session interval '{spec}': {reason}")]
    InvalidSession { spec: String, reason: String },

    #[error("config error: {0}")]
    Config(String),
}

impl SyncError {
    /// Errors the fetch controller may retry (after backoff or narrowing).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ProviderConnection(_) | SyncError::ProviderWindow(_)
        )
    }

    /// Short machine-friendly label used in reports and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::ProviderConnection(_) => "provider_connection",
            SyncError::ProviderWindow(_) => "provider_window",
            SyncError::Authentication(_) => "authentication",
            SyncError::CircuitBreakerTripped { .. } => "circuit_breaker",
            SyncError::StoreRead { .. } => "store_read",
            SyncError::StoreWrite { .. } => "store_write",
            SyncError::InvalidInstrument { .. } => "invalid_instrument",
            SyncError::InvalidSession { .. } => "invalid_session",
            SyncError::Config(_) => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_provider_errors_are_retryable() {
        assert!(SyncError::ProviderConnection("reset".into()).is_retryable());
        assert!(SyncError::ProviderWindow("no session".into()).is_retryable());
        assert!(!SyncError::Authentication("bad token".into()).is_retryable());
        assert!(!SyncError::StoreWrite {
            location: "x".into(),
            reason: "disk full".into()
        }
        .is_retryable());
    }

    #[test]
    fn display_carries_detail() {
        let err = SyncError::StoreRead {
            location: "his/min1/SHFE/rb_HOT.parquet".into(),
            reason: "bad magic".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("rb_HOT"));
        assert!(msg.contains("bad magic"));
        assert_eq!(err.kind(), "store_read");
    }
}
