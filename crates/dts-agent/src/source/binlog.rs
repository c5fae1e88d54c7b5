use std::sync::Arc;

use crate::config::ReaderConfig;
use crate::connector::FeedConnector;
use crate::error::SplitError;
use crate::job::JobDescription;
use crate::reader::{BinlogReader, Reader};
use crate::record::ReaderId;

/// Splits a database instance into one reader per shard.
///
/// An instance that reports no shards is read as a single sub-source named
/// after the instance itself.
pub struct BinlogSource {
    connector: Option<Arc<dyn FeedConnector>>,
}

impl BinlogSource {
    pub fn new(connector: Option<Arc<dyn FeedConnector>>) -> Self {
        Self { connector }
    }

    fn connector(&self, job: &JobDescription) -> Result<&Arc<dyn FeedConnector>, SplitError> {
        self.connector
            .as_ref()
            .ok_or_else(|| SplitError::invalid(job.job_id, "no binlog connector registered"))
    }

    pub(crate) async fn sub_sources(&self, job: &JobDescription) -> Result<Vec<String>, SplitError> {
        let connector = self.connector(job)?;
        let mut shards = connector
            .topology(&job.instance_id)
            .await
            .map_err(|e| SplitError::invalid(job.job_id, e.to_string()))?;
        shards.sort();
        shards.dedup();

        if shards.is_empty() {
            shards.push(job.instance_id.clone());
        }

        let hints = &job.hints;
        if !hints.shards.is_empty() {
            if let Some(missing) = hints.shards.iter().find(|s| !shards.contains(s)) {
                return Err(SplitError::invalid(
                    job.job_id,
                    format!("shard {} not found on instance {}", missing, job.instance_id),
                ));
            }
            return Ok(hints.shards.clone());
        }

        if let Some(count) = hints.shard_count {
            if count == 0 || count > shards.len() {
                return Err(SplitError::invalid(
                    job.job_id,
                    format!(
                        "shard_count {} out of range, instance {} has {} shards",
                        count,
                        job.instance_id,
                        shards.len()
                    ),
                ));
            }
            shards.truncate(count);
        }

        Ok(shards)
    }

    pub(crate) fn reader(&self, job: &JobDescription, id: ReaderId, config: &ReaderConfig) -> Result<Reader, SplitError> {
        let connector = self.connector(job)?.clone();
        let resume = job.resume_position(&id.sub_source);
        Ok(Reader::Binlog(BinlogReader::new(
            id,
            job.instance_id.clone(),
            job.hints.tables.clone(),
            resume,
            job.start_position,
            config,
            connector,
        )))
    }
}

impl std::fmt::Debug for BinlogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinlogSource")
            .field("connector", &self.connector.as_ref().map(|c| c.name().to_string()))
            .finish()
    }
}
