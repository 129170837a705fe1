//! Run progress callbacks.

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, warn};

use super::orchestrator::{TaskReport, TaskStatus};

/// Progress reporting for a multi-task sync. Called from worker threads.
pub trait SyncProgress: Send + Sync {
    /// Called when a task is picked up by a worker.
    fn on_start(&self, task: &str, index: usize, total: usize);

    /// Called when a task finishes, whatever its status.
    fn on_complete(&self, report: &TaskReport, total: usize);

    /// Called once after every task has finished.
    fn on_batch_complete(&self, succeeded: usize, failed: usize, total: usize);
}

/// Emits progress as tracing events.
#[derive(Debug, Default)]
pub struct LogProgress {
    done: AtomicUsize,
}

impl LogProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SyncProgress for LogProgress {
    fn on_start(&self, task: &str, index: usize, total: usize) {
        info!(task, "[{}/{}] syncing", index + 1, total);
    }

    fn on_complete(&self, report: &TaskReport, total: usize) {
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        match &report.status {
            TaskStatus::Failed { error, .. } => {
                warn!(task = %report.label(), error = %error, "[{done}/{total}] failed")
            }
            status => info!(
                task = %report.label(),
                status = status.as_str(),
                stored = report.merge.final_count,
                net_new = report.merge.net_new,
                "[{done}/{total}] done"
            ),
        }
    }

    fn on_batch_complete(&self, succeeded: usize, failed: usize, total: usize) {
        info!(succeeded, failed, total, "sync complete");
    }
}

/// Discards all progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentProgress;

impl SyncProgress for SilentProgress {
    fn on_start(&self, _task: &str, _index: usize, _total: usize) {}
    fn on_complete(&self, _report: &TaskReport, _total: usize) {}
    fn on_batch_complete(&self, _succeeded: usize, _failed: usize, _total: usize) {}
}
