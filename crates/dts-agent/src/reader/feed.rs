//! Shared driver for readers backed by a [`FeedConnector`]

use dts_common::{ReadPosition, SourceType, StartPosition};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Progress;
use crate::connector::{ChangeFeed, FeedConnector, SubscribeRequest};
use crate::error::ReaderError;
use crate::record::{ReaderId, Record};

pub(crate) struct FeedReader {
    pub(crate) id: ReaderId,
    pub(crate) instance_id: String,
    pub(crate) tables: Vec<String>,
    pub(crate) progress: Progress,
    connector: Arc<dyn FeedConnector>,
    batch_size: usize,
    idle_timeout: Duration,
    feed: Option<Box<dyn ChangeFeed>>,
}

pub(crate) struct FeedReaderParams {
    pub id: ReaderId,
    pub source_type: SourceType,
    pub instance_id: String,
    pub tables: Vec<String>,
    pub resume: Option<ReadPosition>,
    pub start: StartPosition,
    pub batch_size: usize,
    pub idle_timeout: Duration,
}

impl FeedReader {
    pub(crate) fn new(params: FeedReaderParams, connector: Arc<dyn FeedConnector>) -> Self {
        Self {
            progress: Progress::new(params.source_type, params.resume, params.start),
            id: params.id,
            instance_id: params.instance_id,
            tables: params.tables,
            connector,
            batch_size: params.batch_size,
            idle_timeout: params.idle_timeout,
            feed: None,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.feed.is_some()
    }

    pub(crate) async fn open(&mut self) -> Result<(), ReaderError> {
        if self.feed.is_some() {
            return Ok(());
        }

        let request = SubscribeRequest {
            instance_id: self.instance_id.clone(),
            sub_source: self.id.sub_source.clone(),
            start: self.progress.start_from(),
            tables: self.tables.clone(),
            batch_size: self.batch_size,
        };
        let mut feed = self.connector.subscribe(request).await?;

        if let Err(e) = self.progress.reopen(feed.position()) {
            if let Err(close_err) = feed.close().await {
                warn!(reader = %self.id, error = %close_err, "Failed to close rejected feed");
            }
            return Err(e);
        }

        debug!(
            reader = %self.id,
            connector = self.connector.name(),
            checkpoint = %self.progress.acknowledged(),
            "Feed opened"
        );
        self.feed = Some(feed);
        Ok(())
    }

    pub(crate) async fn poll(&mut self, cancel: &CancellationToken) -> Result<Option<Vec<Record>>, ReaderError> {
        let feed = self
            .feed
            .as_mut()
            .ok_or_else(|| ReaderError::unavailable(format!("reader {} is not open", self.id)))?;

        let polled = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReaderError::Cancelled),
            polled = tokio::time::timeout(self.idle_timeout, feed.next_batch()) => polled,
        };

        match polled {
            // Idle: nothing arrived in time
            Err(_) => Ok(Some(Vec::new())),
            Ok(Ok(Some(records))) => {
                self.progress.track(&records)?;
                Ok(Some(records))
            }
            Ok(Ok(None)) => Ok(None),
            Ok(Err(e)) => Err(e),
        }
    }

    pub(crate) async fn close(&mut self) {
        if let Some(mut feed) = self.feed.take() {
            if let Err(e) = feed.close().await {
                warn!(reader = %self.id, error = %e, "Failed to close feed");
            }
        }
    }
}

impl std::fmt::Debug for FeedReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedReader")
            .field("id", &self.id)
            .field("instance_id", &self.instance_id)
            .field("connector", &self.connector.name())
            .field("progress", &self.progress)
            .field("open", &self.feed.is_some())
            .finish()
    }
}
