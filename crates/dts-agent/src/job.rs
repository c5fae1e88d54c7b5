//! Collection job descriptions

use dts_common::{ReadPosition, SourceType, StartPosition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Optional knobs that narrow how a job is split into sub-sources
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitHints {
    /// Binlog table filter forwarded to every reader (`db.table` patterns)
    pub tables: Vec<String>,
    /// File jobs: `<directory>/<file name regex>`
    pub file_pattern: Option<String>,
    /// Binlog jobs: exact shard ids to read
    pub shards: Vec<String>,
    /// Binlog jobs: read only the first N shards in sorted order
    pub shard_count: Option<usize>,
    /// Stream jobs: exact partition ids to read
    pub partitions: Vec<String>,
}

/// One collection job as submitted by the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescription {
    pub job_id: Uuid,
    pub source_type: SourceType,
    pub instance_id: String,
    #[serde(default)]
    pub hints: SplitHints,
    /// Checkpoints to resume from, keyed by sub-source id
    #[serde(default)]
    pub resume: BTreeMap<String, ReadPosition>,
    #[serde(default)]
    pub start_position: StartPosition,
}

impl JobDescription {
    pub fn new(source_type: SourceType, instance_id: impl Into<String>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            source_type,
            instance_id: instance_id.into(),
            hints: SplitHints::default(),
            resume: BTreeMap::new(),
            start_position: StartPosition::default(),
        }
    }

    pub fn with_job_id(mut self, job_id: Uuid) -> Self {
        self.job_id = job_id;
        self
    }

    pub fn with_hints(mut self, hints: SplitHints) -> Self {
        self.hints = hints;
        self
    }

    pub fn with_start_position(mut self, start: StartPosition) -> Self {
        self.start_position = start;
        self
    }

    pub fn with_resume(mut self, sub_source: impl Into<String>, position: ReadPosition) -> Self {
        self.resume.insert(sub_source.into(), position);
        self
    }

    pub fn resume_position(&self, sub_source: &str) -> Option<ReadPosition> {
        self.resume.get(sub_source).copied()
    }

    /// Fold persisted checkpoints into the resume map.
    ///
    /// A stored position replaces the submitted one unless the submitted one
    /// is strictly ahead of it.
    pub fn merge_resume(&mut self, stored: BTreeMap<String, ReadPosition>) {
        for (sub_source, position) in stored {
            match self.resume.get(&sub_source) {
                Some(existing) if existing.is_ahead_of(&position) => {}
                _ => {
                    self.resume.insert(sub_source, position);
                }
            }
        }
    }
}
