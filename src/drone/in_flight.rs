use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Ids of the tasks currently executing in this process.
///
/// Shared by every execution context. An id is present from the moment its
/// lease succeeds until right before its release request is sent; whatever is
/// left when the contexts stop is released as failed by the shutdown protocol,
/// so every task gets at most one release attempt. The lock
/// is only held for single set operations, never across an await.
#[derive(Debug, Default)]
pub struct InFlight {
    tasks: Mutex<HashSet<i64>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<i64>> {
        // A panic elsewhere cannot leave the set half-updated
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns false if the id was already tracked.
    pub fn insert(&self, task_id: i64) -> bool {
        self.lock().insert(task_id)
    }

    pub fn remove(&self, task_id: i64) -> bool {
        self.lock().remove(&task_id)
    }

    pub fn contains(&self, task_id: i64) -> bool {
        self.lock().contains(&task_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Sorted copy of the tracked ids.
    pub fn snapshot(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.lock().iter().copied().collect();
        ids.sort_unstable();
        ids
    }
}
