//! End-to-end execution of one job: resume, split, supervise

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::AgentConfig;
use crate::connector::Connectors;
use crate::error::SplitError;
use crate::job::JobDescription;
use crate::sink::RecordSink;
use crate::source::Source;
use crate::supervisor::{JobReport, TaskSupervisor};

/// Runs jobs against a shared checkpoint store and sink
pub struct JobRunner {
    config: AgentConfig,
    connectors: Connectors,
    store: Arc<dyn CheckpointStore>,
    sink: Arc<dyn RecordSink>,
    process_slots: Option<Arc<Semaphore>>,
}

impl JobRunner {
    pub fn new(
        config: AgentConfig,
        connectors: Connectors,
        store: Arc<dyn CheckpointStore>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        let process_slots = config.process_max_readers.map(|n| Arc::new(Semaphore::new(n)));
        Self {
            config,
            connectors,
            store,
            sink,
            process_slots,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Resolve a job's sub-sources without running anything
    pub async fn plan(&self, job: &JobDescription) -> Result<Vec<String>, SplitError> {
        let source = Source::for_job(job, &self.connectors, self.config.reader.clone());
        let readers = source.split(job).await?;
        Ok(readers.iter().map(|r| r.sub_source().to_string()).collect())
    }

    /// Run a job until every reader finishes or `cancel` fires.
    ///
    /// Persisted checkpoints take precedence over the job's own resume map
    /// unless the job's position is further along.
    #[instrument(skip_all, fields(job_id = %job.job_id, source_type = %job.source_type))]
    pub async fn run(&self, mut job: JobDescription, cancel: CancellationToken) -> Result<JobReport, SplitError> {
        match self.store.load(job.job_id).await {
            Ok(stored) => {
                if !stored.is_empty() {
                    info!(checkpoints = stored.len(), "Resuming from persisted checkpoints");
                }
                job.merge_resume(stored);
            }
            Err(e) => warn!(error = %e, "Could not load checkpoints, using job resume positions"),
        }

        let source = Source::for_job(&job, &self.connectors, self.config.reader.clone());
        let readers = source.split(&job).await?;

        let mut supervisor = TaskSupervisor::new(self.config.supervisor.clone(), self.store.clone(), self.sink.clone());
        if let Some(slots) = &self.process_slots {
            supervisor = supervisor.with_process_slots(slots.clone());
        }

        Ok(supervisor.run(job.job_id, readers, source.metrics(), cancel).await)
    }
}
