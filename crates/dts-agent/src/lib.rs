//! DTS collection agent
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Turns a collection job into independent readers and keeps them running.
//!
//! # Overview
//!
//! - **Source**: splits a job into one [`Reader`] per sub-source (binlog
//!   shard, file, stream partition)
//! - **Reader**: walks one sub-source from its checkpoint, yielding batches of
//!   [`Record`]s and advancing the checkpoint only on acknowledgement
//! - **Supervisor**: runs readers with bounded parallelism, retries transient
//!   failures, isolates corrupt or crashing readers and persists checkpoints
//! - **Runner**: ties a checkpoint store, connectors and a sink together
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dts_agent::{
//!     AgentConfig, CollectingSink, Connectors, JobDescription, JobRunner, MemoryCheckpointStore,
//! };
//! use dts_common::SourceType;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let runner = JobRunner::new(
//!     AgentConfig::default(),
//!     Connectors::new(),
//!     Arc::new(MemoryCheckpointStore::new()),
//!     Arc::new(CollectingSink::new()),
//! );
//!
//! let job = JobDescription::new(SourceType::File, "host-a");
//! let report = runner.run(job, CancellationToken::new()).await?;
//! println!("{}", report.status);
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod config;
pub mod connector;
pub mod error;
pub mod job;
pub mod metrics;
pub mod reader;
pub mod record;
pub mod runner;
pub mod sink;
pub mod source;
pub mod supervisor;

pub use checkpoint::{CheckpointStore, JsonFileCheckpointStore, MemoryCheckpointStore};
pub use config::{AgentConfig, CorruptPolicy, ReaderConfig, SupervisorConfig};
pub use connector::{ChangeFeed, Connectors, FeedConnector, MemoryConnector};
pub use error::{CheckpointError, ReaderError, SinkError, SplitError};
pub use job::{JobDescription, SplitHints};
pub use metrics::{MetricsSnapshot, SourceMetrics};
pub use reader::Reader;
pub use record::{ReaderId, Record};
pub use runner::JobRunner;
pub use sink::{ChannelSink, CollectingSink, RecordSink, StdoutSink};
pub use source::Source;
pub use supervisor::{FailureKind, JobReport, JobStatus, TaskState, TaskStatus, TaskSupervisor, TaskTable};
