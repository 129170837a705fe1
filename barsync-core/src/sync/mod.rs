//! The sync pipeline: window planning, the fetch-retry controller,
//! merge-dedup-persist and the orchestrator that drives them.

pub mod controller;
pub mod density;
pub mod locks;
pub mod merge;
pub mod orchestrator;
pub mod planner;
pub mod progress;

pub use controller::{FetchController, FetchOutcome, FetchState, FetchStats, FetchTask};
pub use density::DensityModel;
pub use locks::StoreLocks;
pub use merge::{merge_and_write, merge_records, MergeOutcome, MergeStats};
pub use orchestrator::{
    InstrumentSet, SyncEngine, SyncMode, SyncReport, SyncRequest, TaskReport, TaskStatus,
};
pub use planner::{FetchWindow, Span, WindowPlanner};
pub use progress::{LogProgress, SilentProgress, SyncProgress};
