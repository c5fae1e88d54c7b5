//! Error taxonomy of the collection engine
//!
//! - [`SplitError`]: a job cannot be turned into readers; fatal for the job
//! - [`ReaderError`]: one reader attempt failed; the supervisor decides what
//!   happens next based on the variant
//! - [`SinkError`]: downstream delivery failed; retried like an unavailable source
//! - [`CheckpointError`]: the checkpoint store could not load or save state

use dts_common::ReadPosition;
use thiserror::Error;
use uuid::Uuid;

/// Failure to expand a job into readers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SplitError {
    #[error("Invalid source for job {job_id}: {reason}")]
    InvalidSource { job_id: Uuid, reason: String },
}

impl SplitError {
    pub fn invalid(job_id: Uuid, reason: impl Into<String>) -> Self {
        SplitError::InvalidSource {
            job_id,
            reason: reason.into(),
        }
    }
}

/// Failure of a single reader attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReaderError {
    /// The underlying resource cannot be reached right now; retryable
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    /// Data at `position` cannot be decoded. Never retried at the same
    /// position; `skip_to` is where reading may resume if an operator
    /// chooses to skip the bad data.
    #[error("Corrupt data at {position}: {reason}")]
    Corrupt {
        position: ReadPosition,
        skip_to: Option<ReadPosition>,
        reason: String,
    },

    /// Stopped on request of the supervisor
    #[error("Reader cancelled")]
    Cancelled,
}

impl ReaderError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        ReaderError::Unavailable(reason.into())
    }

    pub fn corrupt(position: ReadPosition, reason: impl Into<String>) -> Self {
        ReaderError::Corrupt {
            position,
            skip_to: None,
            reason: reason.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ReaderError::Unavailable(_))
    }
}

/// Failure to hand records to the downstream sink
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink rejected batch: {0}")]
    Rejected(String),

    #[error("Sink is closed")]
    Closed,

    #[error("Sink IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to load or persist checkpoints
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
