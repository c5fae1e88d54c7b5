//! In-process connector backed by scripted feeds
//!
//! Used by tests and local dry runs. Each sub-source is an append-only log
//! of entries; positions are generated in order, so a feed can be resumed
//! from any position it handed out. Faults (refused subscriptions, feeds
//! that drop mid-way, undecodable entries) can be injected per sub-source.

use async_trait::async_trait;
use dts_common::{ReadPosition, SourceType};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

use super::{ChangeFeed, ConnectorError, FeedConnector, StartFrom, SubscribeRequest};
use crate::error::ReaderError;
use crate::record::Record;

#[derive(Debug, Clone)]
enum Entry {
    Record { payload: Vec<u8>, position: ReadPosition },
    Corrupt { position: ReadPosition },
}

impl Entry {
    fn position(&self) -> ReadPosition {
        match self {
            Entry::Record { position, .. } | Entry::Corrupt { position } => *position,
        }
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    entries: Vec<Entry>,
    finished: bool,
    /// Subscriptions still to be refused
    refuse_subscribes: u32,
    /// The next feed fails after handing out this many records
    drop_after: Option<usize>,
}

#[derive(Debug, Default)]
struct Channel {
    state: Mutex<ChannelState>,
    notify: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Scripted binlog or stream connector
pub struct MemoryConnector {
    name: String,
    kind: SourceType,
    instances: Mutex<BTreeMap<String, BTreeMap<String, Arc<Channel>>>>,
    subscriptions: Mutex<Vec<SubscribeRequest>>,
    open_feeds: Arc<AtomicUsize>,
    peak_open_feeds: Arc<AtomicUsize>,
}

impl MemoryConnector {
    /// Connector handing out binlog positions
    pub fn binlog(name: impl Into<String>) -> Self {
        Self::new(name, SourceType::Binlog)
    }

    /// Connector handing out stream offsets
    pub fn stream(name: impl Into<String>) -> Self {
        Self::new(name, SourceType::Stream)
    }

    fn new(name: impl Into<String>, kind: SourceType) -> Self {
        Self {
            name: name.into(),
            kind,
            instances: Mutex::new(BTreeMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            open_feeds: Arc::new(AtomicUsize::new(0)),
            peak_open_feeds: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register an instance and its sub-sources. An instance with no
    /// sub-sources reports an empty topology.
    pub fn add_instance(&self, instance_id: &str, sub_sources: &[&str]) {
        let mut instances = lock(&self.instances);
        let subs = instances.entry(instance_id.to_string()).or_default();
        for sub in sub_sources {
            subs.entry(sub.to_string()).or_default();
        }
    }

    fn channel(&self, instance_id: &str, sub_source: &str) -> Arc<Channel> {
        let mut instances = lock(&self.instances);
        instances
            .entry(instance_id.to_string())
            .or_default()
            .entry(sub_source.to_string())
            .or_default()
            .clone()
    }

    fn position_for(&self, seq: u64) -> ReadPosition {
        match self.kind {
            SourceType::Binlog => ReadPosition::binlog(1 + seq / 10_000, (seq % 10_000) * 100),
            _ => ReadPosition::stream(seq),
        }
    }

    fn append(&self, instance_id: &str, sub_source: &str, make: impl FnOnce(ReadPosition) -> Entry) -> ReadPosition {
        let channel = self.channel(instance_id, sub_source);
        let position = {
            let mut state = lock(&channel.state);
            let position = self.position_for(state.entries.len() as u64 + 1);
            state.entries.push(make(position));
            position
        };
        channel.notify.notify_waiters();
        position
    }

    /// Append a record; returns the position that resumes after it
    pub fn push(&self, instance_id: &str, sub_source: &str, payload: impl Into<Vec<u8>>) -> ReadPosition {
        let payload = payload.into();
        self.append(instance_id, sub_source, |position| Entry::Record { payload, position })
    }

    /// Append an entry no reader can decode
    pub fn push_corrupt(&self, instance_id: &str, sub_source: &str) -> ReadPosition {
        self.append(instance_id, sub_source, |position| Entry::Corrupt { position })
    }

    /// Mark a sub-source as finished; feeds end once they drain it
    pub fn finish(&self, instance_id: &str, sub_source: &str) {
        let channel = self.channel(instance_id, sub_source);
        lock(&channel.state).finished = true;
        channel.notify.notify_waiters();
    }

    /// Refuse the next `times` subscriptions to a sub-source
    pub fn refuse_subscribes(&self, instance_id: &str, sub_source: &str, times: u32) {
        let channel = self.channel(instance_id, sub_source);
        lock(&channel.state).refuse_subscribes = times;
    }

    /// Make the next feed on a sub-source fail after `records` records
    pub fn drop_feed_after(&self, instance_id: &str, sub_source: &str, records: usize) {
        let channel = self.channel(instance_id, sub_source);
        lock(&channel.state).drop_after = Some(records);
    }

    /// Every subscription request received so far, in order
    pub fn subscriptions(&self) -> Vec<SubscribeRequest> {
        lock(&self.subscriptions).clone()
    }

    pub fn open_feeds(&self) -> usize {
        self.open_feeds.load(Ordering::SeqCst)
    }

    /// Highest number of feeds that were open at the same time
    pub fn peak_open_feeds(&self) -> usize {
        self.peak_open_feeds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedConnector for MemoryConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn topology(&self, instance_id: &str) -> Result<Vec<String>, ConnectorError> {
        let instances = lock(&self.instances);
        instances
            .get(instance_id)
            .map(|subs| subs.keys().cloned().collect())
            .ok_or_else(|| ConnectorError::UnknownInstance(instance_id.to_string()))
    }

    async fn subscribe(&self, request: SubscribeRequest) -> Result<Box<dyn ChangeFeed>, ReaderError> {
        lock(&self.subscriptions).push(request.clone());

        let channel = {
            let instances = lock(&self.instances);
            instances
                .get(&request.instance_id)
                .and_then(|subs| subs.get(&request.sub_source))
                .cloned()
        }
        .ok_or_else(|| {
            ReaderError::unavailable(format!(
                "{} has no sub-source {} on instance {}",
                self.name, request.sub_source, request.instance_id
            ))
        })?;

        let (cursor, position, drop_after) = {
            let mut state = lock(&channel.state);
            if state.refuse_subscribes > 0 {
                state.refuse_subscribes -= 1;
                return Err(ReaderError::unavailable(format!(
                    "{} refused subscription to {}",
                    self.name, request.sub_source
                )));
            }

            let (cursor, position) = match request.start {
                StartFrom::Latest => (
                    state.entries.len(),
                    state.entries.last().map(Entry::position).unwrap_or_default(),
                ),
                StartFrom::After(after) => (
                    state
                        .entries
                        .iter()
                        .position(|entry| entry.position().is_ahead_of(&after))
                        .unwrap_or(state.entries.len()),
                    after,
                ),
            };
            (cursor, position, state.drop_after.take())
        };

        let open = self.open_feeds.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_open_feeds.fetch_max(open, Ordering::SeqCst);

        Ok(Box::new(MemoryFeed {
            sub_source: request.sub_source,
            channel,
            cursor,
            position,
            batch_size: request.batch_size.max(1),
            delivered: 0,
            drop_after,
            _open: OpenFeedGuard(self.open_feeds.clone()),
        }))
    }
}

struct OpenFeedGuard(Arc<AtomicUsize>);

impl Drop for OpenFeedGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MemoryFeed {
    sub_source: String,
    channel: Arc<Channel>,
    cursor: usize,
    position: ReadPosition,
    batch_size: usize,
    delivered: usize,
    drop_after: Option<usize>,
    _open: OpenFeedGuard,
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    fn position(&self) -> ReadPosition {
        self.position
    }

    async fn next_batch(&mut self) -> Result<Option<Vec<Record>>, ReaderError> {
        loop {
            let notified = self.channel.notify.notified();
            {
                let state = lock(&self.channel.state);

                if self.cursor < state.entries.len() {
                    if let Some(limit) = self.drop_after {
                        if self.delivered >= limit {
                            self.drop_after = None;
                            return Err(ReaderError::unavailable(format!(
                                "feed for {} dropped",
                                self.sub_source
                            )));
                        }
                    }

                    let room = match self.drop_after {
                        Some(limit) => self.batch_size.min(limit - self.delivered),
                        None => self.batch_size,
                    };

                    let mut batch = Vec::new();
                    while self.cursor < state.entries.len() && batch.len() < room {
                        match &state.entries[self.cursor] {
                            Entry::Record { payload, position } => {
                                batch.push(Record::new(self.sub_source.clone(), payload.clone(), *position));
                                self.cursor += 1;
                            }
                            Entry::Corrupt { position } => {
                                if batch.is_empty() {
                                    return Err(ReaderError::Corrupt {
                                        position: self.position,
                                        skip_to: Some(*position),
                                        reason: "undecodable event".to_string(),
                                    });
                                }
                                break;
                            }
                        }
                    }

                    if let Some(last) = batch.last() {
                        self.position = last.position;
                        self.delivered += batch.len();
                        return Ok(Some(batch));
                    }
                } else if state.finished {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn request(sub: &str, start: StartFrom) -> SubscribeRequest {
        SubscribeRequest {
            instance_id: "db-1".to_string(),
            sub_source: sub.to_string(),
            start,
            tables: Vec::new(),
            batch_size: 2,
        }
    }

    #[tokio::test]
    async fn test_topology_lists_sorted_sub_sources() {
        let connector = MemoryConnector::binlog("mysql");
        connector.add_instance("db-1", &["shard-b", "shard-a"]);

        assert_eq!(connector.topology("db-1").await.unwrap(), vec!["shard-a", "shard-b"]);
        assert!(matches!(
            connector.topology("db-2").await,
            Err(ConnectorError::UnknownInstance(_))
        ));
    }

    #[tokio::test]
    async fn test_feed_resumes_after_position() {
        let connector = MemoryConnector::stream("mq");
        let first = connector.push("db-1", "p-0", "a");
        connector.push("db-1", "p-0", "b");
        connector.push("db-1", "p-0", "c");
        connector.finish("db-1", "p-0");

        let mut feed = connector.subscribe(request("p-0", StartFrom::After(first))).await.unwrap();
        let batch = feed.next_batch().await.unwrap().unwrap();
        let payloads: Vec<_> = batch.iter().map(|r| r.payload_str().unwrap().to_string()).collect();
        assert_eq!(payloads, vec!["b", "c"]);
        assert!(feed.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_entry_reports_skip_position() {
        let connector = MemoryConnector::binlog("mysql");
        let good = connector.push("db-1", "s", "ok");
        let bad = connector.push_corrupt("db-1", "s");

        let mut feed = connector.subscribe(request("s", StartFrom::After(ReadPosition::Start))).await.unwrap();
        assert_eq!(feed.next_batch().await.unwrap().unwrap().len(), 1);

        match feed.next_batch().await {
            Err(ReaderError::Corrupt { position, skip_to, .. }) => {
                assert_eq!(position, good);
                assert_eq!(skip_to, Some(bad));
            }
            other => panic!("expected corrupt error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_injected_faults_are_one_shot() {
        let connector = MemoryConnector::stream("mq");
        for i in 0..4 {
            connector.push("db-1", "p-0", format!("m{}", i));
        }
        connector.refuse_subscribes("db-1", "p-0", 1);
        connector.drop_feed_after("db-1", "p-0", 3);

        assert!(connector.subscribe(request("p-0", StartFrom::After(ReadPosition::Start))).await.is_err());

        let mut feed = connector.subscribe(request("p-0", StartFrom::After(ReadPosition::Start))).await.unwrap();
        assert_eq!(feed.next_batch().await.unwrap().unwrap().len(), 2);
        assert_eq!(feed.next_batch().await.unwrap().unwrap().len(), 1);
        assert!(matches!(feed.next_batch().await, Err(ReaderError::Unavailable(_))));
        assert_eq!(connector.open_feeds(), 1);
        drop(feed);
        assert_eq!(connector.open_feeds(), 0);
        assert_eq!(connector.subscriptions().len(), 2);
    }
}
