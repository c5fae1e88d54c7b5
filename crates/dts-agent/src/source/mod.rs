//! Sources: split a job into one reader per sub-source
//!
//! A [`Source`] is built for one job. It resolves the job's sub-sources
//! (binlog shards, files, stream partitions), deduplicates them and builds a
//! reader for each, seeded with the job's resume checkpoint when one exists.
//! Every split is counted as a success or a failure in the source metrics.

mod binlog;
mod file;
mod stream;

pub use binlog::BinlogSource;
pub use file::FileSource;
pub use stream::StreamSource;

use dts_common::SourceType;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, instrument};

use crate::config::ReaderConfig;
use crate::connector::Connectors;
use crate::error::SplitError;
use crate::job::JobDescription;
use crate::metrics::SourceMetrics;
use crate::reader::Reader;
use crate::record::ReaderId;

#[derive(Debug)]
enum SourceKind {
    Binlog(BinlogSource),
    File(FileSource),
    Stream(StreamSource),
}

/// Splitter for one job
#[derive(Debug)]
pub struct Source {
    kind: SourceKind,
    reader_config: ReaderConfig,
    metrics: Arc<SourceMetrics>,
}

impl Source {
    /// Build the source matching the job's source type. Missing connectors
    /// are reported when the job is split.
    pub fn for_job(job: &JobDescription, connectors: &Connectors, reader_config: ReaderConfig) -> Self {
        let kind = match job.source_type {
            SourceType::Binlog => SourceKind::Binlog(BinlogSource::new(connectors.binlog.clone())),
            SourceType::File => SourceKind::File(FileSource::new()),
            SourceType::Stream => SourceKind::Stream(StreamSource::new(connectors.stream.clone())),
        };

        Self {
            kind,
            reader_config,
            metrics: Arc::new(SourceMetrics::new(job.job_id, job.source_type)),
        }
    }

    pub fn source_type(&self) -> SourceType {
        match self.kind {
            SourceKind::Binlog(_) => SourceType::Binlog,
            SourceKind::File(_) => SourceType::File,
            SourceKind::Stream(_) => SourceType::Stream,
        }
    }

    /// Counters shared with every task of this job
    pub fn metrics(&self) -> Arc<SourceMetrics> {
        self.metrics.clone()
    }

    /// Expand the job into readers, one per distinct sub-source, ordered by
    /// sub-source id
    #[instrument(skip_all, fields(job_id = %job.job_id, source_type = %job.source_type))]
    pub async fn split(&self, job: &JobDescription) -> Result<Vec<Reader>, SplitError> {
        match self.resolve(job).await {
            Ok(readers) => {
                self.metrics.record_split_success();
                info!(readers = readers.len(), instance = %job.instance_id, "Job split");
                Ok(readers)
            }
            Err(e) => {
                self.metrics.record_split_failure();
                error!(error = %e, instance = %job.instance_id, "Job split failed");
                Err(e)
            }
        }
    }

    async fn resolve(&self, job: &JobDescription) -> Result<Vec<Reader>, SplitError> {
        if job.source_type != self.source_type() {
            return Err(SplitError::invalid(
                job.job_id,
                format!(
                    "job source type {} does not match {} source",
                    job.source_type,
                    self.source_type()
                ),
            ));
        }
        if job.instance_id.trim().is_empty() {
            return Err(SplitError::invalid(job.job_id, "instance id is empty"));
        }

        let sub_sources = match &self.kind {
            SourceKind::Binlog(source) => source.sub_sources(job).await?,
            SourceKind::File(source) => source.sub_sources(job).await?,
            SourceKind::Stream(source) => source.sub_sources(job).await?,
        };

        let sub_sources: BTreeSet<String> = sub_sources.into_iter().collect();
        if sub_sources.is_empty() {
            return Err(SplitError::invalid(job.job_id, "no sub-sources resolved"));
        }

        let mut readers = Vec::with_capacity(sub_sources.len());
        for sub_source in sub_sources {
            let id = ReaderId::new(job.job_id, sub_source);
            let reader = match &self.kind {
                SourceKind::Binlog(source) => source.reader(job, id, &self.reader_config)?,
                SourceKind::File(source) => source.reader(job, id, &self.reader_config),
                SourceKind::Stream(source) => source.reader(job, id, &self.reader_config)?,
            };
            readers.push(reader);
        }
        Ok(readers)
    }
}
