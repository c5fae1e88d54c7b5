//! Records handed downstream and reader identity

use dts_common::ReadPosition;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a reader: one sub-source of one job
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReaderId {
    pub job_id: Uuid,
    pub sub_source: String,
}

impl ReaderId {
    pub fn new(job_id: Uuid, sub_source: impl Into<String>) -> Self {
        Self {
            job_id,
            sub_source: sub_source.into(),
        }
    }
}

impl std::fmt::Display for ReaderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.job_id, self.sub_source)
    }
}

/// One collected record.
///
/// `position` is the checkpoint that resumes reading right after this
/// record, so a consumer that persists it never skips data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub sub_source: String,
    pub payload: Vec<u8>,
    pub position: ReadPosition,
}

impl Record {
    pub fn new(sub_source: impl Into<String>, payload: impl Into<Vec<u8>>, position: ReadPosition) -> Self {
        Self {
            sub_source: sub_source.into(),
            payload: payload.into(),
            position,
        }
    }

    /// Payload size in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Payload as text, when it is valid UTF-8
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}
