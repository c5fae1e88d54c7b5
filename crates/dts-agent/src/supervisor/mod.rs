//! Task supervision
//!
//! The supervisor runs a job's readers as independent tasks with bounded
//! parallelism. Each task moves through the [`TaskState`] machine:
//!
//! - transient failures ([`ReaderError::Unavailable`], sink errors) are
//!   retried with exponential backoff until the attempt budget runs out
//! - corrupt data ends the task DEAD, or is skipped when the corrupt policy
//!   says so
//! - a panicking reader ends DEAD without affecting its siblings
//! - cancellation stops every task, waits for the grace period, then aborts
//!   whatever is left
//!
//! Checkpoints are persisted periodically and whenever a task leaves
//! RUNNING, and only when they advanced.

mod attempt;
mod report;
mod task;

pub use report::{JobReport, JobStatus};
pub use task::{FailureKind, TaskState, TaskStatus, TaskTable};

use chrono::Utc;
use dts_common::ReadPosition;
use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use attempt::{persist, run_attempt, AttemptContext, AttemptOutcome, AttemptResult, ProgressCell};

use crate::checkpoint::CheckpointStore;
use crate::config::{CorruptPolicy, SupervisorConfig};
use crate::error::ReaderError;
use crate::metrics::SourceMetrics;
use crate::reader::Reader;
use crate::sink::RecordSink;

/// Supervisor-side bookkeeping of one task
struct Slot {
    sub_source: String,
    /// None while an attempt owns the reader
    reader: Option<Reader>,
    progress: ProgressCell,
    /// Consecutive transient failures without progress
    failures: u32,
    retry_at: Option<Instant>,
    in_flight: bool,
    /// Acknowledged position when the current attempt started
    attempt_start: ReadPosition,
}

/// Runs the readers of one job to completion
pub struct TaskSupervisor {
    config: SupervisorConfig,
    store: Arc<dyn CheckpointStore>,
    sink: Arc<dyn RecordSink>,
    process_slots: Option<Arc<Semaphore>>,
    tasks: TaskTable,
}

impl TaskSupervisor {
    pub fn new(config: SupervisorConfig, store: Arc<dyn CheckpointStore>, sink: Arc<dyn RecordSink>) -> Self {
        Self {
            config,
            store,
            sink,
            process_slots: None,
            tasks: TaskTable::new(),
        }
    }

    /// Share a process-wide cap on running readers with other supervisors
    pub fn with_process_slots(mut self, slots: Arc<Semaphore>) -> Self {
        self.process_slots = Some(slots);
        self
    }

    /// Handle on the live task table, usable while the job runs
    pub fn tasks(&self) -> TaskTable {
        self.tasks.clone()
    }

    /// Supervise `readers` until every task is COMPLETED, DEAD or CANCELLED
    #[instrument(skip_all, fields(job_id = %job_id, readers = readers.len()))]
    pub async fn run(
        self,
        job_id: Uuid,
        readers: Vec<Reader>,
        metrics: Arc<SourceMetrics>,
        cancel: CancellationToken,
    ) -> JobReport {
        let started_at = Utc::now();
        let mut slots = self.register(readers);

        let ctx = Arc::new(AttemptContext {
            job_id,
            checkpoint_interval: self.config.checkpoint_interval(),
            store: self.store.clone(),
            sink: self.sink.clone(),
            metrics: metrics.clone(),
            tasks: self.tasks.clone(),
            cancel: cancel.clone(),
            process_slots: self.process_slots.clone(),
        });

        info!(
            tasks = slots.len(),
            max_concurrent = self.config.max_concurrent_readers,
            "Supervising job"
        );

        let mut join_set: JoinSet<(usize, AttemptResult)> = JoinSet::new();
        let mut shutdown_deadline: Option<Instant> = None;

        loop {
            if shutdown_deadline.is_none() && cancel.is_cancelled() {
                shutdown_deadline = Some(Instant::now() + self.config.shutdown_grace());
                self.cancel_pending(&mut slots, &metrics);
                info!(
                    in_flight = join_set.len(),
                    grace_ms = self.config.shutdown_grace_ms,
                    "Job cancelled, stopping readers"
                );
            }

            if shutdown_deadline.is_none() {
                self.admit(&mut slots, &mut join_set, &ctx);
            }

            if join_set.is_empty() && self.tasks.all_terminal() {
                break;
            }

            // With the pool full only a finishing attempt can free a slot,
            // and join_next wakes the loop for that
            let next_retry = if join_set.len() < self.config.max_concurrent_readers {
                slots
                    .iter()
                    .filter(|s| !s.in_flight && s.reader.is_some())
                    .filter_map(|s| s.retry_at)
                    .min()
            } else {
                None
            };

            if join_set.is_empty() && next_retry.is_none() && shutdown_deadline.is_none() {
                error!("No runnable tasks left but the job is not finished");
                break;
            }

            let far = Instant::now() + Duration::from_secs(3600);
            tokio::select! {
                joined = join_set.join_next(), if !join_set.is_empty() => {
                    match joined {
                        Some(Ok((index, result))) => {
                            self.settle(index, result, &mut slots, &metrics, &ctx).await;
                        }
                        Some(Err(e)) => error!(error = %e, "Reader task ended abnormally"),
                        None => {}
                    }
                }
                _ = tokio::time::sleep_until(next_retry.unwrap_or(far)),
                    if next_retry.is_some() && shutdown_deadline.is_none() => {}
                _ = cancel.cancelled(), if shutdown_deadline.is_none() => {}
                _ = tokio::time::sleep_until(shutdown_deadline.unwrap_or(far)),
                    if shutdown_deadline.is_some() => {
                    self.force_stop(&mut slots, &mut join_set, &metrics, &ctx).await;
                    break;
                }
            }
        }

        let report = JobReport::new(job_id, self.tasks.snapshot(), metrics.snapshot(), started_at);
        info!(
            status = %report.status,
            completed = report.count(TaskState::Completed),
            dead = report.count(TaskState::Dead),
            cancelled = report.count(TaskState::Cancelled),
            records = report.metrics.records_emitted,
            "Job finished"
        );
        report
    }

    fn register(&self, readers: Vec<Reader>) -> Vec<Slot> {
        let mut seen = HashSet::new();
        let mut slots = Vec::with_capacity(readers.len());

        for reader in readers {
            let sub_source = reader.sub_source().to_string();
            if !seen.insert(sub_source.clone()) {
                warn!(sub_source = %sub_source, "Duplicate sub-source dropped");
                continue;
            }

            let checkpoint = reader.checkpoint();
            self.tasks.insert(&sub_source, checkpoint);
            slots.push(Slot {
                sub_source,
                reader: Some(reader),
                progress: ProgressCell::new(checkpoint),
                failures: 0,
                retry_at: None,
                in_flight: false,
                attempt_start: checkpoint,
            });
        }
        slots
    }

    /// Start pending tasks whose backoff elapsed, up to the concurrency limit
    fn admit(&self, slots: &mut [Slot], join_set: &mut JoinSet<(usize, AttemptResult)>, ctx: &Arc<AttemptContext>) {
        let now = Instant::now();
        let mut in_flight = slots.iter().filter(|s| s.in_flight).count();

        for (index, slot) in slots.iter_mut().enumerate() {
            if in_flight >= self.config.max_concurrent_readers {
                break;
            }
            if slot.in_flight || self.tasks.state(&slot.sub_source) != Some(TaskState::Pending) {
                continue;
            }
            if slot.retry_at.is_some_and(|at| at > now) {
                continue;
            }
            let Some(reader) = slot.reader.take() else {
                continue;
            };

            slot.retry_at = None;
            slot.in_flight = true;
            slot.attempt_start = slot.progress.get().acknowledged;
            in_flight += 1;

            let ctx = ctx.clone();
            let progress = slot.progress.clone();
            join_set.spawn(async move {
                let result = match AssertUnwindSafe(run_attempt(ctx, reader, progress)).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => AttemptResult::crashed(&*panic),
                };
                (index, result)
            });
        }
    }

    fn cancel_pending(&self, slots: &mut [Slot], metrics: &SourceMetrics) {
        for slot in slots.iter_mut().filter(|s| !s.in_flight) {
            slot.retry_at = None;
            if self.tasks.state(&slot.sub_source) == Some(TaskState::Pending)
                && self.tasks.transition(&slot.sub_source, TaskState::Cancelled)
            {
                metrics.record_cancelled();
            }
        }
    }

    async fn settle(
        &self,
        index: usize,
        result: AttemptResult,
        slots: &mut [Slot],
        metrics: &SourceMetrics,
        ctx: &AttemptContext,
    ) {
        let Some(slot) = slots.get_mut(index) else {
            return;
        };
        slot.in_flight = false;
        slot.reader = result.reader;
        let sub_source = slot.sub_source.clone();

        match result.outcome {
            AttemptOutcome::Completed => {
                self.tasks.transition(&sub_source, TaskState::Completed);
                metrics.record_task_success();
                info!(sub_source = %sub_source, checkpoint = %slot.progress.get().persisted, "Reader completed");
            }
            AttemptOutcome::Cancelled => {
                self.tasks.transition(&sub_source, TaskState::Cancelled);
                metrics.record_cancelled();
                info!(
                    sub_source = %sub_source,
                    started = result.started,
                    checkpoint = %slot.progress.get().persisted,
                    "Reader cancelled"
                );
            }
            AttemptOutcome::Crashed(reason) => {
                error!(sub_source = %sub_source, reason = %reason, "Reader panicked");
                persist(ctx, &sub_source, &slot.progress).await;
                self.tasks.transition(&sub_source, TaskState::Failed);
                self.tasks.set_error(&sub_source, format!("panic: {}", reason));
                self.tasks.set_failure(&sub_source, FailureKind::Crashed);
                self.tasks.transition(&sub_source, TaskState::Dead);
                metrics.record_task_failure(FailureKind::Crashed);
            }
            AttemptOutcome::Failed(err) => {
                self.tasks.transition(&sub_source, TaskState::Failed);
                self.tasks.set_error(&sub_source, err.to_string());

                // Corrupt data is recorded as such even during shutdown
                let corrupt = matches!(err, ReaderError::Corrupt { .. });
                if ctx.cancel.is_cancelled() && !corrupt {
                    self.tasks.transition(&sub_source, TaskState::Cancelled);
                    metrics.record_cancelled();
                    return;
                }

                self.handle_failure(slot, err, metrics, ctx).await;
            }
        }
    }

    async fn handle_failure(&self, slot: &mut Slot, err: ReaderError, metrics: &SourceMetrics, ctx: &AttemptContext) {
        let sub_source = slot.sub_source.clone();

        if let ReaderError::Corrupt {
            position,
            skip_to,
            reason,
        } = &err
        {
            if self.config.corrupt_policy == CorruptPolicy::Skip {
                if let (Some(skip_to), Some(reader)) = (skip_to, slot.reader.as_mut()) {
                    if reader.skip_past(*skip_to) {
                        slot.progress.acknowledge(*skip_to);
                        persist(ctx, &sub_source, &slot.progress).await;
                        metrics.record_skipped();
                        warn!(
                            sub_source = %sub_source,
                            position = %position,
                            skip_to = %skip_to,
                            reason = %reason,
                            "Skipping corrupt data"
                        );
                        slot.retry_at = None;
                        if ctx.cancel.is_cancelled() {
                            self.tasks.transition(&sub_source, TaskState::Cancelled);
                            metrics.record_cancelled();
                        } else {
                            self.tasks.transition(&sub_source, TaskState::Pending);
                        }
                        return;
                    }
                }
            }

            error!(
                sub_source = %sub_source,
                position = %position,
                reason = %reason,
                "Corrupt data, reader needs operator action"
            );
            self.mark_dead(&sub_source, FailureKind::Corrupt, metrics);
            return;
        }

        if slot.reader.is_none() {
            self.mark_dead(&sub_source, FailureKind::Crashed, metrics);
            return;
        }

        // An attempt that moved the checkpoint earns a fresh budget
        if slot.progress.get().acknowledged.is_ahead_of(&slot.attempt_start) {
            slot.failures = 0;
        }
        slot.failures += 1;

        if slot.failures < self.config.max_attempts {
            let delay = self.config.backoff_for(slot.failures);
            slot.retry_at = Some(Instant::now() + delay);
            self.tasks.transition(&sub_source, TaskState::Pending);
            metrics.record_retry();
            warn!(
                sub_source = %sub_source,
                failures = slot.failures,
                max_attempts = self.config.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Reader failed, retrying"
            );
        } else {
            error!(
                sub_source = %sub_source,
                failures = slot.failures,
                error = %err,
                "Reader failed, attempts exhausted"
            );
            self.mark_dead(&sub_source, FailureKind::RetriesExhausted, metrics);
        }
    }

    fn mark_dead(&self, sub_source: &str, failure: FailureKind, metrics: &SourceMetrics) {
        self.tasks.set_failure(sub_source, failure);
        self.tasks.transition(sub_source, TaskState::Dead);
        metrics.record_task_failure(failure);
    }

    /// Abort attempts that outlived the grace period and persist the last
    /// position they acknowledged
    async fn force_stop(
        &self,
        slots: &mut [Slot],
        join_set: &mut JoinSet<(usize, AttemptResult)>,
        metrics: &SourceMetrics,
        ctx: &AttemptContext,
    ) {
        warn!(remaining = join_set.len(), "Shutdown grace period elapsed, aborting readers");
        join_set.abort_all();

        while let Some(joined) = join_set.join_next().await {
            if let Ok((index, result)) = joined {
                self.settle(index, result, slots, metrics, ctx).await;
            }
        }

        for slot in slots.iter_mut().filter(|s| s.in_flight) {
            slot.in_flight = false;
            persist(ctx, &slot.sub_source, &slot.progress).await;
            if self.tasks.transition(&slot.sub_source, TaskState::Cancelled) {
                metrics.record_cancelled();
            }
            warn!(
                sub_source = %slot.sub_source,
                checkpoint = %slot.progress.get().persisted,
                "Reader aborted"
            );
        }
    }
}
