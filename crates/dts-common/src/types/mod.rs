//! Common types used across DTS

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

use crate::error::DtsError;

/// Kind of source a collection job reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// MySQL-style binlog replication stream
    Binlog,
    /// Newline-delimited files in a directory
    File,
    /// Partitioned message stream
    Stream,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Binlog => "binlog",
            SourceType::File => "file",
            SourceType::Stream => "stream",
        }
    }
}

impl std::str::FromStr for SourceType {
    type Err = DtsError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "binlog" => Ok(SourceType::Binlog),
            "file" => Ok(SourceType::File),
            "stream" | "mq" => Ok(SourceType::Stream),
            _ => Err(DtsError::InvalidSourceType(s.to_string())),
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a reader begins when no checkpoint exists for its sub-source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// Read everything the sub-source still holds
    #[default]
    Earliest,
    /// Skip existing data and read only what arrives after the first open
    Latest,
}

impl std::str::FromStr for StartPosition {
    type Err = DtsError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "earliest" | "start" => Ok(StartPosition::Earliest),
            "latest" | "now" => Ok(StartPosition::Latest),
            _ => Err(DtsError::InvalidStartPosition(s.to_string())),
        }
    }
}

/// Binlog coordinates: file sequence number, then offset inside the file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BinlogPosition {
    pub file: u64,
    pub offset: u64,
}

impl BinlogPosition {
    pub fn new(file: u64, offset: u64) -> Self {
        Self { file, offset }
    }
}

/// How far a reader has progressed through one sub-source.
///
/// Every record carries the position that resumes *after* it, so persisting
/// the position of the last delivered record never loses data.
///
/// Positions only compare within the same kind. `Start` sorts before every
/// other position; positions of different kinds are incomparable and never
/// count as progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadPosition {
    /// Nothing consumed yet
    #[default]
    Start,
    /// Byte offset just past the last consumed line
    FileOffset { offset: u64 },
    /// Binlog coordinates of the next event
    Binlog(BinlogPosition),
    /// Partition offset of the next message
    StreamOffset { offset: u64 },
}

impl ReadPosition {
    pub fn file(offset: u64) -> Self {
        ReadPosition::FileOffset { offset }
    }

    pub fn binlog(file: u64, offset: u64) -> Self {
        ReadPosition::Binlog(BinlogPosition::new(file, offset))
    }

    pub fn stream(offset: u64) -> Self {
        ReadPosition::StreamOffset { offset }
    }

    pub fn is_start(&self) -> bool {
        matches!(self, ReadPosition::Start)
    }

    /// True when `self` is strictly further along than `other`
    pub fn is_ahead_of(&self, other: &ReadPosition) -> bool {
        matches!(self.partial_cmp(other), Some(Ordering::Greater))
    }

    /// True when both positions can be compared for progress
    pub fn is_comparable_with(&self, other: &ReadPosition) -> bool {
        self.partial_cmp(other).is_some()
    }
}

impl PartialOrd for ReadPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        use ReadPosition::*;

        match (self, other) {
            (Start, Start) => Some(Ordering::Equal),
            (Start, _) => Some(Ordering::Less),
            (_, Start) => Some(Ordering::Greater),
            (FileOffset { offset: a }, FileOffset { offset: b }) => Some(a.cmp(b)),
            (Binlog(a), Binlog(b)) => Some(a.cmp(b)),
            (StreamOffset { offset: a }, StreamOffset { offset: b }) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReadPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadPosition::Start => write!(f, "start"),
            ReadPosition::FileOffset { offset } => write!(f, "file:{}", offset),
            ReadPosition::Binlog(pos) => write!(f, "binlog:{}/{}", pos.file, pos.offset),
            ReadPosition::StreamOffset { offset } => write!(f, "stream:{}", offset),
        }
    }
}

/// Persisted checkpoint for one (job, sub-source) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub job_id: Uuid,
    pub sub_source: String,
    pub position: ReadPosition,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn new(job_id: Uuid, sub_source: impl Into<String>, position: ReadPosition) -> Self {
        Self {
            job_id,
            sub_source: sub_source.into(),
            position,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_source_type_from_str() {
        assert_eq!("binlog".parse::<SourceType>().unwrap(), SourceType::Binlog);
        assert_eq!("FILE".parse::<SourceType>().unwrap(), SourceType::File);
        assert_eq!("mq".parse::<SourceType>().unwrap(), SourceType::Stream);
        assert!("kafka-ish".parse::<SourceType>().is_err());
    }

    #[test]
    fn test_start_sorts_before_everything() {
        assert!(ReadPosition::file(0).is_ahead_of(&ReadPosition::Start));
        assert!(ReadPosition::binlog(0, 0).is_ahead_of(&ReadPosition::Start));
        assert!(!ReadPosition::Start.is_ahead_of(&ReadPosition::Start));
    }

    #[test]
    fn test_mixed_kinds_are_incomparable() {
        let file = ReadPosition::file(10);
        let stream = ReadPosition::stream(5);
        assert_eq!(file.partial_cmp(&stream), None);
        assert!(!file.is_ahead_of(&stream));
        assert!(!stream.is_ahead_of(&file));
        assert!(!file.is_comparable_with(&stream));
    }

    #[test]
    fn test_binlog_orders_by_file_then_offset() {
        let a = ReadPosition::binlog(1, 900);
        let b = ReadPosition::binlog(2, 4);
        assert!(b.is_ahead_of(&a));
        assert!(!a.is_ahead_of(&b));
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(ReadPosition::binlog(3, 120)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "binlog", "file": 3, "offset": 120}));

        let json = serde_json::to_value(ReadPosition::file(42)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "file_offset", "offset": 42}));
    }

    #[test]
    fn test_display() {
        assert_eq!(ReadPosition::Start.to_string(), "start");
        assert_eq!(ReadPosition::binlog(3, 120).to_string(), "binlog:3/120");
        assert_eq!(ReadPosition::stream(7).to_string(), "stream:7");
    }

    fn any_position() -> impl Strategy<Value = ReadPosition> {
        prop_oneof![
            Just(ReadPosition::Start),
            any::<u64>().prop_map(ReadPosition::file),
            (any::<u64>(), any::<u64>()).prop_map(|(f, o)| ReadPosition::binlog(f, o)),
            any::<u64>().prop_map(ReadPosition::stream),
        ]
    }

    proptest! {
        #[test]
        fn prop_persisted_positions_round_trip(position in any_position()) {
            let encoded = serde_json::to_string(&position).unwrap();
            let decoded: ReadPosition = serde_json::from_str(&encoded).unwrap();
            prop_assert_eq!(decoded, position);
        }

        #[test]
        fn prop_progress_is_antisymmetric(a in any_position(), b in any_position()) {
            prop_assert!(!(a.is_ahead_of(&b) && b.is_ahead_of(&a)));
            if a == b {
                prop_assert!(!a.is_ahead_of(&b));
            }
        }
    }
}
