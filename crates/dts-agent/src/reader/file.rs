use dts_common::{ReadPosition, SourceType, StartPosition};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Progress;
use crate::config::ReaderConfig;
use crate::connector::StartFrom;
use crate::error::ReaderError;
use crate::record::{ReaderId, Record};

/// Reads newline-delimited records from one file.
///
/// The position of a record is the byte offset just past its newline. A
/// trailing line without a newline is returned as the final record.
#[derive(Debug)]
pub struct FileReader {
    id: ReaderId,
    path: PathBuf,
    progress: Progress,
    batch_size: usize,
    lines: Option<BufReader<File>>,
    offset: u64,
    /// Error found while filling the previous batch, reported on the next poll
    deferred: Option<ReaderError>,
}

impl FileReader {
    pub fn new(
        id: ReaderId,
        path: impl Into<PathBuf>,
        resume: Option<ReadPosition>,
        start: StartPosition,
        config: &ReaderConfig,
    ) -> Self {
        Self {
            id,
            path: path.into(),
            progress: Progress::new(SourceType::File, resume, start),
            batch_size: config.batch_size,
            lines: None,
            offset: 0,
            deferred: None,
        }
    }

    pub fn id(&self) -> &ReaderId {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.lines.is_some()
    }

    pub async fn open(&mut self) -> Result<(), ReaderError> {
        if self.lines.is_some() {
            return Ok(());
        }

        let mut file = File::open(&self.path)
            .await
            .map_err(|e| ReaderError::unavailable(format!("{}: {}", self.path.display(), e)))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| ReaderError::unavailable(format!("{}: {}", self.path.display(), e)))?
            .len();

        let head = match self.progress.start_from() {
            StartFrom::Latest => ReadPosition::file(len),
            StartFrom::After(_) => ReadPosition::Start,
        };
        self.progress.reopen(head)?;

        let offset = match self.progress.acknowledged() {
            ReadPosition::FileOffset { offset } => offset,
            _ => 0,
        };
        if offset > len {
            return Err(ReaderError::corrupt(
                self.progress.acknowledged(),
                format!("file is {} bytes, shorter than its checkpoint", len),
            ));
        }

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| ReaderError::unavailable(format!("{}: {}", self.path.display(), e)))?;

        debug!(reader = %self.id, path = %self.path.display(), offset, "File opened");
        self.offset = offset;
        self.deferred = None;
        self.lines = Some(BufReader::new(file));
        Ok(())
    }

    pub async fn poll(&mut self, cancel: &CancellationToken) -> Result<Option<Vec<Record>>, ReaderError> {
        if cancel.is_cancelled() {
            return Err(ReaderError::Cancelled);
        }
        if let Some(err) = self.deferred.take() {
            return Err(err);
        }

        let lines = self
            .lines
            .as_mut()
            .ok_or_else(|| ReaderError::unavailable(format!("reader {} is not open", self.id)))?;

        let mut batch = Vec::new();
        let mut buf = Vec::new();
        while batch.len() < self.batch_size {
            buf.clear();
            let read = lines
                .read_until(b'\n', &mut buf)
                .await
                .map_err(|e| ReaderError::unavailable(format!("{}: {}", self.path.display(), e)))?;
            if read == 0 {
                break;
            }

            let line_start = self.offset;
            self.offset += read as u64;
            let position = ReadPosition::file(self.offset);

            if buf.last() == Some(&b'\n') {
                buf.pop();
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
            }

            if std::str::from_utf8(&buf).is_err() {
                let err = ReaderError::Corrupt {
                    position: ReadPosition::file(line_start),
                    skip_to: Some(position),
                    reason: format!("line at byte {} is not valid UTF-8", line_start),
                };
                if batch.is_empty() {
                    return Err(err);
                }
                self.deferred = Some(err);
                break;
            }

            batch.push(Record::new(self.id.sub_source.clone(), buf.clone(), position));
        }

        if batch.is_empty() {
            return Ok(None);
        }
        self.progress.track(&batch)?;
        Ok(Some(batch))
    }

    pub async fn close(&mut self) {
        self.lines = None;
        self.deferred = None;
    }

    pub(crate) fn progress(&self) -> &Progress {
        &self.progress
    }

    pub(crate) fn progress_mut(&mut self) -> &mut Progress {
        &mut self.progress
    }
}
