use dts_common::{ReadPosition, SourceType, StartPosition};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::feed::{FeedReader, FeedReaderParams};
use super::Progress;
use crate::config::ReaderConfig;
use crate::connector::FeedConnector;
use crate::error::ReaderError;
use crate::record::{ReaderId, Record};

/// Reads the replication log of one database shard
#[derive(Debug)]
pub struct BinlogReader {
    inner: FeedReader,
}

impl BinlogReader {
    pub fn new(
        id: ReaderId,
        instance_id: impl Into<String>,
        tables: Vec<String>,
        resume: Option<ReadPosition>,
        start: StartPosition,
        config: &ReaderConfig,
        connector: Arc<dyn FeedConnector>,
    ) -> Self {
        let params = FeedReaderParams {
            id,
            source_type: SourceType::Binlog,
            instance_id: instance_id.into(),
            tables,
            resume,
            start,
            batch_size: config.batch_size,
            idle_timeout: config.idle_timeout(),
        };
        Self {
            inner: FeedReader::new(params, connector),
        }
    }

    pub fn id(&self) -> &ReaderId {
        &self.inner.id
    }

    /// Instance the shard belongs to
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Table filter forwarded to the connector
    pub fn tables(&self) -> &[String] {
        &self.inner.tables
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    pub async fn open(&mut self) -> Result<(), ReaderError> {
        self.inner.open().await
    }

    pub async fn poll(&mut self, cancel: &CancellationToken) -> Result<Option<Vec<Record>>, ReaderError> {
        self.inner.poll(cancel).await
    }

    pub async fn close(&mut self) {
        self.inner.close().await
    }

    pub(crate) fn progress(&self) -> &Progress {
        &self.inner.progress
    }

    pub(crate) fn progress_mut(&mut self) -> &mut Progress {
        &mut self.inner.progress
    }
}
