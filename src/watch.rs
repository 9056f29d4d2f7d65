//! Correlation table from cgroup ID to the session it belongs to.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::session::SessionContext;

/// Concurrency-safe map of watched cgroup IDs.
///
/// The lock is held only for the map operation itself, never across I/O or
/// sink calls, so session open/close cannot stall event dispatch.
#[derive(Debug, Default)]
pub struct WatchRegistry {
    watch: Mutex<HashMap<u64, Arc<SessionContext>>>,
}

impl WatchRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start correlating events from `cgroup_id` to `ctx`, replacing any
    /// previous entry.
    pub fn add_watch(&self, cgroup_id: u64, ctx: Arc<SessionContext>) {
        self.lock().insert(cgroup_id, ctx);
    }

    /// Stop correlating events from `cgroup_id`. No-op if absent.
    pub fn remove_watch(&self, cgroup_id: u64) {
        self.lock().remove(&cgroup_id);
    }

    /// Session currently registered for `cgroup_id`, if any.
    pub fn lookup(&self, cgroup_id: u64) -> Option<Arc<SessionContext>> {
        self.lock().get(&cgroup_id).cloned()
    }

    /// Number of watched cgroups.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no cgroup is watched.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // A panic while holding the lock cannot leave the map half-updated.
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<SessionContext>>> {
        self.watch.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
