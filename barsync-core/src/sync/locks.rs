//! Per-location writer locks.
//!
//! Every merge is a full read-modify-write of one store file, so two merges
//! against the same location must never overlap. `StoreLocks` hands out one
//! mutex per location string; merges hold it for their whole read-merge-write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct StoreLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StoreLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mutex guarding `location`, created on first use.
    pub fn for_location(&self, location: &str) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(map.entry(location.to_string()).or_default())
    }

    /// Run `f` while holding the lock for `location`.
    pub fn with_lock<T>(&self, location: &str, f: impl FnOnce() -> T) -> T {
        let lock = self.for_location(location);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        f()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
