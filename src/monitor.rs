//! Monitor contract — an external registry of live tasks.
//!
//! A running task registers itself with its monitor at the start of `run()`
//! and, if configured, removes itself at termination. `MonitorRegistry` is
//! the concrete registry a progress panel would poll: it holds the state of
//! every registered task and can summarize them into aggregate counts.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::state::{lock, TaskState, TaskStatus};

/// Contract for any registry that tracks live tasks.
pub trait TaskMonitor: Send + Sync {
    fn add(&self, task: &Arc<TaskState>);
    fn remove(&self, task: &TaskState);
}

// ---------------------------------------------------------------------------
// RegistryStats
// ---------------------------------------------------------------------------

/// Aggregate counts across all tasks in a registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryStats {
    pub total: usize,
    pub idle: usize,
    pub processing: usize,
    pub paused: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// MonitorRegistry
// ---------------------------------------------------------------------------

/// Thread-safe task registry. Tasks are deduplicated by id on add.
#[derive(Default)]
pub struct MonitorRegistry {
    tasks: Mutex<Vec<Arc<TaskState>>>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all registered tasks.
    pub fn tasks(&self) -> Vec<Arc<TaskState>> {
        lock(&self.tasks).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.tasks).is_empty()
    }

    pub fn contains(&self, task: &TaskState) -> bool {
        lock(&self.tasks).iter().any(|t| t.id() == task.id())
    }

    /// Aggregate counts by task status.
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for task in lock(&self.tasks).iter() {
            stats.total += 1;
            match task.status() {
                TaskStatus::Idle => stats.idle += 1,
                TaskStatus::Processing | TaskStatus::Cancelling => stats.processing += 1,
                TaskStatus::Paused => stats.paused += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

impl TaskMonitor for MonitorRegistry {
    fn add(&self, task: &Arc<TaskState>) {
        let mut tasks = lock(&self.tasks);
        if !tasks.iter().any(|t| t.id() == task.id()) {
            tasks.push(task.clone());
        }
    }

    fn remove(&self, task: &TaskState) {
        lock(&self.tasks).retain(|t| t.id() != task.id());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
