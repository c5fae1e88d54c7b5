//! Seams to external change feeds
//!
//! Binlog and stream readers do not speak any wire protocol themselves. A
//! [`FeedConnector`] resolves an instance's topology (shards or partitions)
//! and opens a [`ChangeFeed`] on one sub-source; readers layer checkpointing,
//! cancellation and position validation on top.

pub mod memory;

use async_trait::async_trait;
use dts_common::ReadPosition;
use std::sync::Arc;
use thiserror::Error;

use crate::error::ReaderError;
use crate::record::Record;

pub use memory::MemoryConnector;

/// Failure to resolve an instance's topology
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("Unknown instance: {0}")]
    UnknownInstance(String),

    #[error("Topology lookup failed: {0}")]
    Topology(String),
}

/// Where a feed starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    /// Deliver everything strictly after this position
    After(ReadPosition),
    /// Deliver only what arrives after subscribing
    Latest,
}

/// Everything a connector needs to open one feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub instance_id: String,
    pub sub_source: String,
    pub start: StartFrom,
    /// Table filter; empty means every table
    pub tables: Vec<String>,
    pub batch_size: usize,
}

/// An open subscription on one sub-source
#[async_trait]
pub trait ChangeFeed: Send {
    /// Position of the last record handed out, or the head the feed was
    /// opened at when nothing has been handed out yet
    fn position(&self) -> ReadPosition;

    /// Wait for the next batch of records.
    ///
    /// Returns `Ok(None)` once a bounded feed is exhausted. Must be cancel
    /// safe: dropping the future before it resolves loses no records.
    async fn next_batch(&mut self) -> Result<Option<Vec<Record>>, ReaderError>;

    async fn close(&mut self) -> Result<(), ReaderError> {
        Ok(())
    }
}

/// Access to one family of external feeds
#[async_trait]
pub trait FeedConnector: Send + Sync {
    fn name(&self) -> &str;

    /// Sub-sources exposed by an instance
    async fn topology(&self, instance_id: &str) -> Result<Vec<String>, ConnectorError>;

    async fn subscribe(&self, request: SubscribeRequest) -> Result<Box<dyn ChangeFeed>, ReaderError>;
}

/// Connectors available to the agent, by source family
#[derive(Clone, Default)]
pub struct Connectors {
    pub binlog: Option<Arc<dyn FeedConnector>>,
    pub stream: Option<Arc<dyn FeedConnector>>,
}

impl Connectors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binlog(mut self, connector: Arc<dyn FeedConnector>) -> Self {
        self.binlog = Some(connector);
        self
    }

    pub fn with_stream(mut self, connector: Arc<dyn FeedConnector>) -> Self {
        self.stream = Some(connector);
        self
    }
}

impl std::fmt::Debug for Connectors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connectors")
            .field("binlog", &self.binlog.as_ref().map(|c| c.name().to_string()))
            .field("stream", &self.stream.as_ref().map(|c| c.name().to_string()))
            .finish()
    }
}
