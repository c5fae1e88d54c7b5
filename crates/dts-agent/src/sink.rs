//! Downstream delivery of collected records

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::error::SinkError;
use crate::record::{ReaderId, Record};

/// Receiver of record batches.
///
/// A successful `deliver` means the batch is durably handed off; the
/// supervisor acknowledges the batch's last position right after.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn deliver(&self, reader: &ReaderId, records: &[Record]) -> Result<(), SinkError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keeps every delivered record in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    records: Mutex<Vec<Record>>,
    reject_next: AtomicU32,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `batches` deliveries
    pub fn reject_next(&self, batches: u32) {
        self.reject_next.store(batches, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<Record> {
        lock(&self.records).clone()
    }

    pub fn records_for(&self, sub_source: &str) -> Vec<Record> {
        lock(&self.records)
            .iter()
            .filter(|r| r.sub_source == sub_source)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordSink for CollectingSink {
    async fn deliver(&self, reader: &ReaderId, records: &[Record]) -> Result<(), SinkError> {
        let rejected = self
            .reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(SinkError::Rejected(format!("batch from {} refused", reader)));
        }
        lock(&self.records).extend_from_slice(records);
        Ok(())
    }
}

/// Forwards records into a bounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Record>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Record>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl RecordSink for ChannelSink {
    async fn deliver(&self, _reader: &ReaderId, records: &[Record]) -> Result<(), SinkError> {
        for record in records {
            self.tx.send(record.clone()).await.map_err(|_| SinkError::Closed)?;
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonLine<'a> {
    job_id: String,
    sub_source: &'a str,
    position: &'a dts_common::ReadPosition,
    payload: std::borrow::Cow<'a, str>,
}

/// Writes one JSON object per record to stdout
#[derive(Debug)]
pub struct StdoutSink {
    out: tokio::sync::Mutex<tokio::io::Stdout>,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            out: tokio::sync::Mutex::new(tokio::io::stdout()),
        }
    }

    fn render(reader: &ReaderId, records: &[Record]) -> Result<Vec<u8>, SinkError> {
        let mut buf = Vec::new();
        for record in records {
            let line = JsonLine {
                job_id: reader.job_id.to_string(),
                sub_source: &record.sub_source,
                position: &record.position,
                payload: String::from_utf8_lossy(&record.payload),
            };
            serde_json::to_writer(&mut buf, &line).map_err(|e| SinkError::Rejected(e.to_string()))?;
            buf.push(b'\n');
        }
        Ok(buf)
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordSink for StdoutSink {
    async fn deliver(&self, reader: &ReaderId, records: &[Record]) -> Result<(), SinkError> {
        let buf = Self::render(reader, records)?;
        let mut out = self.out.lock().await;
        out.write_all(&buf).await?;
        out.flush().await?;
        Ok(())
    }
}
