use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::{TaskState, TaskStatus};
use crate::metrics::MetricsSnapshot;

/// Overall outcome of a supervised job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Every task completed
    Completed,
    /// Some tasks completed, others are dead
    PartiallyFailed,
    /// No task completed
    Failed,
    /// The job was cancelled before every task finished
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Completed => "completed",
            JobStatus::PartiallyFailed => "partially_failed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    fn from_tasks(tasks: &[TaskStatus]) -> Self {
        let count = |state: TaskState| tasks.iter().filter(|t| t.state == state).count();

        if count(TaskState::Cancelled) > 0 {
            JobStatus::Cancelled
        } else if count(TaskState::Completed) == tasks.len() {
            JobStatus::Completed
        } else if count(TaskState::Completed) == 0 {
            JobStatus::Failed
        } else {
            JobStatus::PartiallyFailed
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final report of one supervised job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub tasks: Vec<TaskStatus>,
    pub metrics: MetricsSnapshot,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobReport {
    pub(crate) fn new(
        job_id: Uuid,
        tasks: Vec<TaskStatus>,
        metrics: MetricsSnapshot,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            status: JobStatus::from_tasks(&tasks),
            tasks,
            metrics,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn task(&self, sub_source: &str) -> Option<&TaskStatus> {
        self.tasks.iter().find(|t| t.sub_source == sub_source)
    }

    pub fn count(&self, state: TaskState) -> usize {
        self.tasks.iter().filter(|t| t.state == state).count()
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }
}
