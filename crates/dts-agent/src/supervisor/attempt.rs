//! One attempt of one reader task

use dts_common::{CheckpointRecord, ReadPosition};
use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::task::{TaskState, TaskTable};
use crate::checkpoint::CheckpointStore;
use crate::error::ReaderError;
use crate::metrics::SourceMetrics;
use crate::reader::Reader;
use crate::sink::RecordSink;

/// Everything an attempt shares with its supervisor
pub(crate) struct AttemptContext {
    pub job_id: Uuid,
    pub checkpoint_interval: Duration,
    pub store: Arc<dyn CheckpointStore>,
    pub sink: Arc<dyn RecordSink>,
    pub metrics: Arc<SourceMetrics>,
    pub tasks: TaskTable,
    pub cancel: CancellationToken,
    pub process_slots: Option<Arc<Semaphore>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CheckpointProgress {
    pub acknowledged: ReadPosition,
    pub persisted: ReadPosition,
}

/// Acknowledged and persisted positions of one task.
///
/// Outlives any single attempt so the supervisor can still persist the
/// last acknowledged position of an attempt it had to abort.
#[derive(Debug, Clone, Default)]
pub(crate) struct ProgressCell(Arc<Mutex<CheckpointProgress>>);

impl ProgressCell {
    pub fn new(position: ReadPosition) -> Self {
        Self(Arc::new(Mutex::new(CheckpointProgress {
            acknowledged: position,
            persisted: position,
        })))
    }

    fn lock(&self) -> MutexGuard<'_, CheckpointProgress> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self) -> CheckpointProgress {
        *self.lock()
    }

    pub fn acknowledge(&self, position: ReadPosition) {
        let mut progress = self.lock();
        if position.is_ahead_of(&progress.acknowledged) {
            progress.acknowledged = position;
        }
    }

    fn mark_persisted(&self, position: ReadPosition) {
        let mut progress = self.lock();
        if position.is_ahead_of(&progress.persisted) {
            progress.persisted = position;
        }
    }
}

pub(crate) enum AttemptOutcome {
    /// The sub-source is exhausted
    Completed,
    Cancelled,
    Failed(ReaderError),
    /// The attempt panicked; the reader is gone
    Crashed(String),
}

pub(crate) struct AttemptResult {
    /// Handed back so the next attempt resumes with the same reader
    pub reader: Option<Reader>,
    /// False when the attempt was cancelled before it reached RUNNING
    pub started: bool,
    pub outcome: AttemptOutcome,
}

impl AttemptResult {
    pub fn crashed(panic: &(dyn Any + Send)) -> Self {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "reader panicked".to_string());

        Self {
            reader: None,
            started: true,
            outcome: AttemptOutcome::Crashed(message),
        }
    }
}

/// Persist the acknowledged position if it moved past the persisted one.
/// Store failures are logged; the next call tries again.
pub(crate) async fn persist(ctx: &AttemptContext, sub_source: &str, progress: &ProgressCell) {
    let current = progress.get();
    if !current.acknowledged.is_ahead_of(&current.persisted) {
        return;
    }

    let record = CheckpointRecord::new(ctx.job_id, sub_source, current.acknowledged);
    match ctx.store.save(record).await {
        Ok(()) => {
            progress.mark_persisted(current.acknowledged);
            ctx.tasks.set_checkpoint(sub_source, current.acknowledged);
            debug!(sub_source, checkpoint = %current.acknowledged, "Checkpoint persisted");
        }
        Err(e) => {
            warn!(sub_source, checkpoint = %current.acknowledged, error = %e, "Checkpoint save failed");
        }
    }
}

/// Run one attempt: wait for a process slot, open, drain until the reader
/// ends or fails, close, and persist the final position.
pub(crate) async fn run_attempt(ctx: Arc<AttemptContext>, mut reader: Reader, progress: ProgressCell) -> AttemptResult {
    let sub_source = reader.sub_source().to_string();

    let _permit = match &ctx.process_slots {
        Some(slots) => tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return AttemptResult {
                    reader: Some(reader),
                    started: false,
                    outcome: AttemptOutcome::Cancelled,
                };
            }
            permit = slots.clone().acquire_owned() => permit.ok(),
        },
        None => None,
    };

    ctx.tasks.transition(&sub_source, TaskState::Running);

    let opened = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(ReaderError::Cancelled),
        opened = reader.open() => opened,
    };

    let outcome = match opened {
        Ok(()) => {
            // A `Latest` start is pinned on open and must survive a restart
            progress.acknowledge(reader.checkpoint());
            drain(&ctx, &mut reader, &progress).await
        }
        Err(ReaderError::Cancelled) => AttemptOutcome::Cancelled,
        Err(e) => AttemptOutcome::Failed(e),
    };

    reader.close().await;
    persist(&ctx, &sub_source, &progress).await;

    AttemptResult {
        reader: Some(reader),
        started: true,
        outcome,
    }
}

async fn drain(ctx: &AttemptContext, reader: &mut Reader, progress: &ProgressCell) -> AttemptOutcome {
    let mut last_persist = Instant::now();

    loop {
        if ctx.cancel.is_cancelled() {
            return AttemptOutcome::Cancelled;
        }

        match reader.poll(&ctx.cancel).await {
            Ok(Some(batch)) => {
                if let Some(last) = batch.last().map(|r| r.position) {
                    if let Err(e) = ctx.sink.deliver(reader.id(), &batch).await {
                        return AttemptOutcome::Failed(ReaderError::unavailable(format!("sink: {}", e)));
                    }

                    let bytes: u64 = batch.iter().map(|r| r.len() as u64).sum();
                    ctx.metrics.record_emitted(batch.len() as u64, bytes);

                    if reader.acknowledge(last) {
                        progress.acknowledge(last);
                    }
                }

                if last_persist.elapsed() >= ctx.checkpoint_interval {
                    persist(ctx, reader.sub_source(), progress).await;
                    last_persist = Instant::now();
                }
            }
            Ok(None) => return AttemptOutcome::Completed,
            Err(ReaderError::Cancelled) => return AttemptOutcome::Cancelled,
            Err(e) => return AttemptOutcome::Failed(e),
        }
    }
}
