//! Task states and the shared task table

use chrono::{DateTime, Utc};
use dts_common::ReadPosition;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

/// Lifecycle of one reader task
///
/// ```text
/// PENDING -> RUNNING -> COMPLETED
///               |  \--> CANCELLED
///               v
///            FAILED -> PENDING (retry) | DEAD
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Dead,
}

impl TaskState {
    pub fn as_str(&self) -> &str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
            TaskState::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Cancelled | TaskState::Dead)
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Pending)
                | (Failed, Dead)
                | (Failed, Cancelled)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task ended DEAD
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Every attempt failed with a transient error
    RetriesExhausted,
    /// The reader found data it cannot decode
    Corrupt,
    /// The reader task panicked
    Crashed,
}

/// Observable status of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub sub_source: String,
    pub state: TaskState,
    /// Attempts started so far
    pub attempts: u32,
    /// Last persisted checkpoint
    pub checkpoint: ReadPosition,
    pub last_error: Option<String>,
    pub failure: Option<FailureKind>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct TableInner {
    tasks: BTreeMap<String, TaskStatus>,
    running: usize,
    peak_running: usize,
}

/// Task statuses of one job, shared between the supervisor, its attempts
/// and any observer
#[derive(Debug, Clone, Default)]
pub struct TaskTable {
    inner: Arc<Mutex<TableInner>>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn insert(&self, sub_source: &str, checkpoint: ReadPosition) {
        self.lock().tasks.insert(
            sub_source.to_string(),
            TaskStatus {
                sub_source: sub_source.to_string(),
                state: TaskState::Pending,
                attempts: 0,
                checkpoint,
                last_error: None,
                failure: None,
                updated_at: Utc::now(),
            },
        );
    }

    /// Move a task to `next`. Illegal transitions are refused and logged.
    pub(crate) fn transition(&self, sub_source: &str, next: TaskState) -> bool {
        let mut inner = self.lock();
        let Some(current) = inner.tasks.get(sub_source).map(|t| t.state) else {
            warn!(sub_source, "Transition for unknown task");
            return false;
        };

        if !current.can_transition_to(next) {
            warn!(sub_source, from = %current, to = %next, "Illegal task transition refused");
            return false;
        }

        if current == TaskState::Running {
            inner.running = inner.running.saturating_sub(1);
        }
        if next == TaskState::Running {
            inner.running += 1;
            inner.peak_running = inner.peak_running.max(inner.running);
        }

        if let Some(task) = inner.tasks.get_mut(sub_source) {
            task.state = next;
            if next == TaskState::Running {
                task.attempts += 1;
            }
            task.updated_at = Utc::now();
        }
        true
    }

    pub(crate) fn set_checkpoint(&self, sub_source: &str, checkpoint: ReadPosition) {
        if let Some(task) = self.lock().tasks.get_mut(sub_source) {
            task.checkpoint = checkpoint;
            task.updated_at = Utc::now();
        }
    }

    pub(crate) fn set_error(&self, sub_source: &str, error: String) {
        if let Some(task) = self.lock().tasks.get_mut(sub_source) {
            task.last_error = Some(error);
        }
    }

    pub(crate) fn set_failure(&self, sub_source: &str, failure: FailureKind) {
        if let Some(task) = self.lock().tasks.get_mut(sub_source) {
            task.failure = Some(failure);
        }
    }

    pub fn get(&self, sub_source: &str) -> Option<TaskStatus> {
        self.lock().tasks.get(sub_source).cloned()
    }

    pub fn state(&self, sub_source: &str) -> Option<TaskState> {
        self.lock().tasks.get(sub_source).map(|t| t.state)
    }

    /// All tasks ordered by sub-source id
    pub fn snapshot(&self) -> Vec<TaskStatus> {
        self.lock().tasks.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, state: TaskState) -> usize {
        self.lock().tasks.values().filter(|t| t.state == state).count()
    }

    pub fn running(&self) -> usize {
        self.lock().running
    }

    /// Highest number of tasks that were RUNNING at the same time
    pub fn peak_running(&self) -> usize {
        self.lock().peak_running
    }

    pub fn all_terminal(&self) -> bool {
        self.lock().tasks.values().all(|t| t.state.is_terminal())
    }
}
