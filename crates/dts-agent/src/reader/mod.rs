//! Readers: one per sub-source
//!
//! A reader walks a single sub-source from its checkpoint, handing out
//! batches of records. The checkpoint only moves when the consumer
//! acknowledges a position it has durably handed downstream, so the
//! checkpoint never runs ahead of delivered data and never moves backwards.

mod binlog;
mod feed;
mod file;
mod stream;

pub use binlog::BinlogReader;
pub use file::FileReader;
pub use stream::StreamReader;

use dts_common::{ReadPosition, SourceType, StartPosition};
use tokio_util::sync::CancellationToken;

use crate::connector::StartFrom;
use crate::error::ReaderError;
use crate::record::{ReaderId, Record};

/// A reader over one sub-source
#[derive(Debug)]
pub enum Reader {
    Binlog(BinlogReader),
    File(FileReader),
    Stream(StreamReader),
}

impl Reader {
    pub fn id(&self) -> &ReaderId {
        match self {
            Reader::Binlog(r) => r.id(),
            Reader::File(r) => r.id(),
            Reader::Stream(r) => r.id(),
        }
    }

    pub fn sub_source(&self) -> &str {
        &self.id().sub_source
    }

    pub fn source_type(&self) -> SourceType {
        match self {
            Reader::Binlog(_) => SourceType::Binlog,
            Reader::File(_) => SourceType::File,
            Reader::Stream(_) => SourceType::Stream,
        }
    }

    /// Acquire the underlying resource and seek to the checkpoint.
    /// Opening an already open reader is a no-op.
    pub async fn open(&mut self) -> Result<(), ReaderError> {
        match self {
            Reader::Binlog(r) => r.open().await,
            Reader::File(r) => r.open().await,
            Reader::Stream(r) => r.open().await,
        }
    }

    pub fn is_open(&self) -> bool {
        match self {
            Reader::Binlog(r) => r.is_open(),
            Reader::File(r) => r.is_open(),
            Reader::Stream(r) => r.is_open(),
        }
    }

    /// Fetch the next batch.
    ///
    /// `Ok(Some(batch))` may be empty when no data arrived within the idle
    /// timeout; `Ok(None)` means a bounded sub-source is exhausted. Returns
    /// [`ReaderError::Cancelled`] promptly once `cancel` fires.
    pub async fn poll(&mut self, cancel: &CancellationToken) -> Result<Option<Vec<Record>>, ReaderError> {
        match self {
            Reader::Binlog(r) => r.poll(cancel).await,
            Reader::File(r) => r.poll(cancel).await,
            Reader::Stream(r) => r.poll(cancel).await,
        }
    }

    /// Last acknowledged position
    pub fn checkpoint(&self) -> ReadPosition {
        self.progress().acknowledged()
    }

    /// Record that everything up to `position` has been delivered.
    /// Returns false when the position is not an advance.
    pub fn acknowledge(&mut self, position: ReadPosition) -> bool {
        self.progress_mut().acknowledge(position)
    }

    /// Move the checkpoint past data that cannot be decoded. The reader
    /// must be reopened before it reads again.
    pub fn skip_past(&mut self, position: ReadPosition) -> bool {
        self.progress_mut().skip_past(position)
    }

    /// Release the underlying resource. Safe to call more than once.
    pub async fn close(&mut self) {
        match self {
            Reader::Binlog(r) => r.close().await,
            Reader::File(r) => r.close().await,
            Reader::Stream(r) => r.close().await,
        }
    }

    fn progress(&self) -> &Progress {
        match self {
            Reader::Binlog(r) => r.progress(),
            Reader::File(r) => r.progress(),
            Reader::Stream(r) => r.progress(),
        }
    }

    fn progress_mut(&mut self) -> &mut Progress {
        match self {
            Reader::Binlog(r) => r.progress_mut(),
            Reader::File(r) => r.progress_mut(),
            Reader::Stream(r) => r.progress_mut(),
        }
    }
}

/// True when `position` is a valid checkpoint for a reader of `source_type`
pub(crate) fn position_fits(source_type: SourceType, position: &ReadPosition) -> bool {
    matches!(
        (source_type, position),
        (_, ReadPosition::Start)
            | (SourceType::File, ReadPosition::FileOffset { .. })
            | (SourceType::Binlog, ReadPosition::Binlog(_))
            | (SourceType::Stream, ReadPosition::StreamOffset { .. })
    )
}

/// Checkpoint bookkeeping shared by every reader kind.
///
/// `emitted` is the position of the last record handed out; `acknowledged`
/// trails it and is what gets persisted.
#[derive(Debug, Clone)]
pub(crate) struct Progress {
    source_type: SourceType,
    acknowledged: ReadPosition,
    emitted: ReadPosition,
    /// False until a `Latest` start has been pinned to a concrete head
    resolved: bool,
}

impl Progress {
    pub(crate) fn new(source_type: SourceType, resume: Option<ReadPosition>, start: StartPosition) -> Self {
        let resolved = resume.is_some() || start == StartPosition::Earliest;
        let position = resume.unwrap_or_default();
        Self {
            source_type,
            acknowledged: position,
            emitted: position,
            resolved,
        }
    }

    pub(crate) fn acknowledged(&self) -> ReadPosition {
        self.acknowledged
    }

    pub(crate) fn emitted(&self) -> ReadPosition {
        self.emitted
    }

    /// Where a fresh open should start
    pub(crate) fn start_from(&self) -> StartFrom {
        if self.resolved {
            StartFrom::After(self.acknowledged)
        } else {
            StartFrom::Latest
        }
    }

    /// Called on every open. Unacknowledged records will be read again, and
    /// a pending `Latest` start is pinned to `head`.
    pub(crate) fn reopen(&mut self, head: ReadPosition) -> Result<(), ReaderError> {
        if !position_fits(self.source_type, &self.acknowledged) {
            return Err(ReaderError::corrupt(
                self.acknowledged,
                format!("checkpoint does not belong to a {} source", self.source_type),
            ));
        }
        if !self.resolved {
            if !position_fits(self.source_type, &head) {
                return Err(ReaderError::corrupt(head, "feed head has the wrong position kind"));
            }
            if head.is_ahead_of(&self.acknowledged) {
                self.acknowledged = head;
            }
            self.resolved = true;
        }
        self.emitted = self.acknowledged;
        Ok(())
    }

    /// Validate a batch before it is handed out. Positions must belong to
    /// this source kind and strictly advance.
    pub(crate) fn track(&mut self, records: &[Record]) -> Result<(), ReaderError> {
        let mut cursor = self.emitted;
        for record in records {
            if !position_fits(self.source_type, &record.position) || !record.position.is_ahead_of(&cursor) {
                return Err(ReaderError::Corrupt {
                    position: cursor,
                    skip_to: None,
                    reason: format!("position {} does not advance past {}", record.position, cursor),
                });
            }
            cursor = record.position;
        }
        self.emitted = cursor;
        Ok(())
    }

    pub(crate) fn acknowledge(&mut self, position: ReadPosition) -> bool {
        if position.is_ahead_of(&self.acknowledged) && !position.is_ahead_of(&self.emitted) {
            self.acknowledged = position;
            true
        } else {
            false
        }
    }

    pub(crate) fn skip_past(&mut self, position: ReadPosition) -> bool {
        if position_fits(self.source_type, &position) && position.is_ahead_of(&self.acknowledged) {
            self.acknowledged = position;
            self.emitted = position;
            true
        } else {
            false
        }
    }
}
