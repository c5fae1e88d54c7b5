//! Shared helpers for agent integration tests
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use dts_agent::{
    CheckpointStore, Connectors, JobDescription, ReaderConfig, ReaderId, Record, RecordSink, SinkError, Source,
    SupervisorConfig,
};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Supervisor settings small enough for tests to run in milliseconds
pub fn fast_supervisor() -> SupervisorConfig {
    SupervisorConfig::default()
        .with_backoff(5, 20)
        .with_checkpoint_interval_ms(10)
        .with_shutdown_grace_ms(500)
}

pub fn small_batches() -> ReaderConfig {
    ReaderConfig {
        batch_size: 4,
        idle_timeout_ms: 20,
    }
}

/// Split a job the way the runner does
pub async fn split(job: &JobDescription, connectors: &Connectors) -> (Vec<dts_agent::Reader>, Arc<dts_agent::SourceMetrics>) {
    let source = Source::for_job(job, connectors, small_batches());
    let readers = source.split(job).await.expect("job should split");
    (readers, source.metrics())
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Same as [`wait_until`] for async conditions
pub async fn wait_until_async<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition().await
}

/// CPU time the calling thread has used, in clock ticks
#[cfg(target_os = "linux")]
pub fn thread_cpu_ticks() -> u64 {
    let stat = std::fs::read_to_string("/proc/thread-self/stat").unwrap();
    // Fields after the parenthesised command name start at field 3 (state)
    let fields: Vec<&str> = stat[stat.rfind(')').unwrap() + 1..].split_whitespace().collect();
    let utime: u64 = fields[11].parse().unwrap();
    let stime: u64 = fields[12].parse().unwrap();
    utime + stime
}

/// Payloads of `records` as strings
pub fn payloads(records: &[Record]) -> Vec<String> {
    records
        .iter()
        .map(|r| r.payload_str().unwrap().to_string())
        .collect()
}

/// How a [`ScriptedSink`] treats batches of one sub-source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkBehaviour {
    Accept,
    /// Sleep before accepting
    Slow(Duration),
    /// Accept this many batches, then never return
    HangAfter(usize),
    /// Panic on the first batch
    Panic,
}

/// Sink with per-sub-source behaviour
pub struct ScriptedSink {
    default: SinkBehaviour,
    overrides: Mutex<Vec<(String, SinkBehaviour)>>,
    batches: Mutex<Vec<(String, usize)>>,
    records: Mutex<Vec<Record>>,
}

impl ScriptedSink {
    pub fn new(default: SinkBehaviour) -> Self {
        Self {
            default,
            overrides: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn with(self, sub_source: &str, behaviour: SinkBehaviour) -> Self {
        self.overrides.lock().unwrap().push((sub_source.to_string(), behaviour));
        self
    }

    fn behaviour(&self, sub_source: &str) -> SinkBehaviour {
        self.overrides
            .lock()
            .unwrap()
            .iter()
            .find(|(s, _)| s == sub_source)
            .map(|(_, b)| *b)
            .unwrap_or(self.default)
    }

    fn delivered_batches(&self, sub_source: &str) -> usize {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .find(|(s, _)| s == sub_source)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }

    fn accept(&self, sub_source: &str, records: &[Record]) {
        let mut batches = self.batches.lock().unwrap();
        match batches.iter_mut().find(|(s, _)| s == sub_source) {
            Some((_, n)) => *n += 1,
            None => batches.push((sub_source.to_string(), 1)),
        }
        self.records.lock().unwrap().extend_from_slice(records);
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().unwrap().clone()
    }

    pub fn records_for(&self, sub_source: &str) -> Vec<Record> {
        self.records()
            .into_iter()
            .filter(|r| r.sub_source == sub_source)
            .collect()
    }
}

#[async_trait]
impl RecordSink for ScriptedSink {
    async fn deliver(&self, reader: &ReaderId, records: &[Record]) -> Result<(), SinkError> {
        match self.behaviour(&reader.sub_source) {
            SinkBehaviour::Accept => {}
            SinkBehaviour::Slow(delay) => tokio::time::sleep(delay).await,
            SinkBehaviour::HangAfter(limit) => {
                if self.delivered_batches(&reader.sub_source) >= limit {
                    std::future::pending::<()>().await;
                }
            }
            SinkBehaviour::Panic => panic!("sink exploded on {}", reader.sub_source),
        }
        self.accept(&reader.sub_source, records);
        Ok(())
    }
}

/// Persisted checkpoint of one sub-source, via the store's public interface
pub async fn stored(store: &dyn CheckpointStore, job: &JobDescription, sub_source: &str) -> Option<dts_common::ReadPosition> {
    store.load(job.job_id).await.unwrap().get(sub_source).copied()
}
