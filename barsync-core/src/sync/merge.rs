//! Merge-dedup-persist.
//!
//! `existing ++ batch` is grouped by bar key, the later record winning on
//! collisions, then sorted ascending. The result is strictly key-ascending,
//! key-unique, and merging the same batch again changes nothing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::locks::StoreLocks;
use crate::data::BarStore;
use crate::domain::{BarKey, BarRecord, Instrument, Period};
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub existing: usize,
    pub received: usize,
    /// `existing + received`, before deduplication.
    pub combined: usize,
    pub duplicates_removed: usize,
    /// Keys present after the merge that were not present before.
    pub net_new: usize,
    pub final_count: usize,
}

impl MergeStats {
    /// Fold the stats of a later flush of the same task into this total.
    pub fn absorb(&mut self, next: &MergeStats) {
        if self.combined == 0 {
            self.existing = next.existing;
        }
        self.received += next.received;
        self.combined += next.combined;
        self.duplicates_removed += next.duplicates_removed;
        self.net_new += next.net_new;
        self.final_count = next.final_count;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub records: Vec<BarRecord>,
    pub stats: MergeStats,
}

/// Merge `batch` into `existing` under the key rules of `period`.
pub fn merge_records(existing: Vec<BarRecord>, batch: Vec<BarRecord>, period: Period) -> MergeOutcome {
    let existing_len = existing.len();
    let received = batch.len();
    let combined = existing_len + received;

    let mut by_key: BTreeMap<BarKey, BarRecord> = BTreeMap::new();
    for rec in existing {
        by_key.insert(rec.key(period), rec);
    }
    let baseline_keys = by_key.len();
    for rec in batch {
        by_key.insert(rec.key(period), rec);
    }

    let final_count = by_key.len();
    let records: Vec<BarRecord> = by_key
        .into_iter()
        .map(|(key, mut rec)| {
            // Day bars persist with time 0 whatever the source stamped.
            rec.time = key.time;
            rec
        })
        .collect();

    MergeOutcome {
        records,
        stats: MergeStats {
            existing: existing_len,
            received,
            combined,
            duplicates_removed: combined - final_count,
            net_new: final_count - baseline_keys,
            final_count,
        },
    }
}

/// Locked read-merge-write of one series.
///
/// An unreadable existing file is treated as an empty baseline. A failed
/// write is returned as `StoreWrite` and fails only the calling task.
pub fn merge_and_write(
    store: &dyn BarStore,
    locks: &StoreLocks,
    instrument: &Instrument,
    period: Period,
    batch: Vec<BarRecord>,
) -> Result<MergeStats, SyncError> {
    let location = store.location(instrument, period);
    locks.with_lock(&location, || {
        let existing = match store.read_all(instrument, period) {
            Ok(records) => records,
            Err(e) => {
                warn!(%instrument, %period, error = %e, "existing series unreadable, merging onto empty baseline");
                Vec::new()
            }
        };

        let MergeOutcome { records, stats } = merge_records(existing, batch, period);
        store.write_all(instrument, period, &records)?;

        info!(
            %instrument,
            %period,
            existing = stats.existing,
            received = stats.received,
            combined = stats.combined,
            duplicates_removed = stats.duplicates_removed,
            net_new = stats.net_new,
            final_count = stats.final_count,
            "merged batch"
        );
        Ok(stats)
    })
}
