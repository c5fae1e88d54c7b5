//! Per-job counters
//!
//! Every counter is a plain atomic so readers running on different worker
//! threads can bump them without coordination. A [`MetricsSnapshot`] is a
//! point-in-time copy for reporting.

use dts_common::SourceType;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use crate::supervisor::FailureKind;

/// Counters shared by a source and every task it produced
#[derive(Debug)]
pub struct SourceMetrics {
    job_id: Uuid,
    source_type: SourceType,
    split_success: AtomicU64,
    split_failure: AtomicU64,
    task_success: AtomicU64,
    task_failure: AtomicU64,
    corrupt_failure: AtomicU64,
    cancelled: AtomicU64,
    retries: AtomicU64,
    records_skipped: AtomicU64,
    records_emitted: AtomicU64,
    bytes_emitted: AtomicU64,
}

impl SourceMetrics {
    pub fn new(job_id: Uuid, source_type: SourceType) -> Self {
        Self {
            job_id,
            source_type,
            split_success: AtomicU64::new(0),
            split_failure: AtomicU64::new(0),
            task_success: AtomicU64::new(0),
            task_failure: AtomicU64::new(0),
            corrupt_failure: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            records_skipped: AtomicU64::new(0),
            records_emitted: AtomicU64::new(0),
            bytes_emitted: AtomicU64::new(0),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    pub fn record_split_success(&self) {
        self.split_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_split_failure(&self) {
        self.split_failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_success(&self) {
        self.task_success.fetch_add(1, Ordering::Relaxed);
    }

    /// A task reached DEAD. Corrupt failures are also counted separately.
    pub fn record_task_failure(&self, kind: FailureKind) {
        self.task_failure.fetch_add(1, Ordering::Relaxed);
        if kind == FailureKind::Corrupt {
            self.corrupt_failure.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.records_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emitted(&self, records: u64, bytes: u64) {
        self.records_emitted.fetch_add(records, Ordering::Relaxed);
        self.bytes_emitted.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn split_success(&self) -> u64 {
        self.split_success.load(Ordering::Relaxed)
    }

    pub fn split_failure(&self) -> u64 {
        self.split_failure.load(Ordering::Relaxed)
    }

    pub fn task_success(&self) -> u64 {
        self.task_success.load(Ordering::Relaxed)
    }

    pub fn task_failure(&self) -> u64 {
        self.task_failure.load(Ordering::Relaxed)
    }

    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            job_id: self.job_id,
            source_type: self.source_type,
            split_success: self.split_success.load(Ordering::Relaxed),
            split_failure: self.split_failure.load(Ordering::Relaxed),
            task_success: self.task_success.load(Ordering::Relaxed),
            task_failure: self.task_failure.load(Ordering::Relaxed),
            corrupt_failure: self.corrupt_failure.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            records_skipped: self.records_skipped.load(Ordering::Relaxed),
            records_emitted: self.records_emitted.load(Ordering::Relaxed),
            bytes_emitted: self.bytes_emitted.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SourceMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub job_id: Uuid,
    pub source_type: SourceType,
    pub split_success: u64,
    pub split_failure: u64,
    pub task_success: u64,
    pub task_failure: u64,
    pub corrupt_failure: u64,
    pub cancelled: u64,
    pub retries: u64,
    pub records_skipped: u64,
    pub records_emitted: u64,
    pub bytes_emitted: u64,
}

impl MetricsSnapshot {
    /// Tasks that reached a terminal outcome
    pub fn tasks_finished(&self) -> u64 {
        self.task_success + self.task_failure + self.cancelled
    }
}
