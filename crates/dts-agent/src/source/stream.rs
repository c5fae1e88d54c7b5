use std::sync::Arc;

use crate::config::ReaderConfig;
use crate::connector::FeedConnector;
use crate::error::SplitError;
use crate::job::JobDescription;
use crate::reader::{Reader, StreamReader};
use crate::record::ReaderId;

/// Splits a topic into one reader per partition
pub struct StreamSource {
    connector: Option<Arc<dyn FeedConnector>>,
}

impl StreamSource {
    pub fn new(connector: Option<Arc<dyn FeedConnector>>) -> Self {
        Self { connector }
    }

    fn connector(&self, job: &JobDescription) -> Result<&Arc<dyn FeedConnector>, SplitError> {
        self.connector
            .as_ref()
            .ok_or_else(|| SplitError::invalid(job.job_id, "no stream connector registered"))
    }

    pub(crate) async fn sub_sources(&self, job: &JobDescription) -> Result<Vec<String>, SplitError> {
        let partitions = self
            .connector(job)?
            .topology(&job.instance_id)
            .await
            .map_err(|e| SplitError::invalid(job.job_id, e.to_string()))?;

        if job.hints.partitions.is_empty() {
            return Ok(partitions);
        }

        match job.hints.partitions.iter().find(|p| !partitions.contains(p)) {
            Some(missing) => Err(SplitError::invalid(
                job.job_id,
                format!("partition {} not found on {}", missing, job.instance_id),
            )),
            None => Ok(job.hints.partitions.clone()),
        }
    }

    pub(crate) fn reader(&self, job: &JobDescription, id: ReaderId, config: &ReaderConfig) -> Result<Reader, SplitError> {
        let connector = self.connector(job)?.clone();
        let resume = job.resume_position(&id.sub_source);
        Ok(Reader::Stream(StreamReader::new(
            id,
            job.instance_id.clone(),
            resume,
            job.start_position,
            config,
            connector,
        )))
    }
}

impl std::fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSource")
            .field("connector", &self.connector.as_ref().map(|c| c.name().to_string()))
            .finish()
    }
}
