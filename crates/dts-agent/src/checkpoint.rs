//! Checkpoint persistence
//!
//! The supervisor saves a [`CheckpointRecord`] whenever a reader's
//! acknowledged position advances; the runner loads them again when a job
//! is resubmitted. Two stores ship with the agent: an in-memory one and a
//! JSON file that is replaced atomically on every save.

use async_trait::async_trait;
use dts_common::{CheckpointRecord, ReadPosition};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::error::CheckpointError;

/// Durable storage for reader checkpoints
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Latest saved position of every sub-source of a job
    async fn load(&self, job_id: Uuid) -> Result<BTreeMap<String, ReadPosition>, CheckpointError>;

    async fn save(&self, record: CheckpointRecord) -> Result<(), CheckpointError>;
}

/// Process-local store; every save is also kept in an ordered history
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    latest: RwLock<HashMap<(Uuid, String), CheckpointRecord>>,
    history: Mutex<Vec<CheckpointRecord>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, job_id: Uuid, sub_source: &str) -> Option<ReadPosition> {
        self.latest
            .read()
            .await
            .get(&(job_id, sub_source.to_string()))
            .map(|record| record.position)
    }

    /// Every save in the order it happened
    pub async fn history(&self) -> Vec<CheckpointRecord> {
        self.history.lock().await.clone()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, job_id: Uuid) -> Result<BTreeMap<String, ReadPosition>, CheckpointError> {
        Ok(self
            .latest
            .read()
            .await
            .values()
            .filter(|record| record.job_id == job_id)
            .map(|record| (record.sub_source.clone(), record.position))
            .collect())
    }

    async fn save(&self, record: CheckpointRecord) -> Result<(), CheckpointError> {
        self.history.lock().await.push(record.clone());
        self.latest
            .write()
            .await
            .insert((record.job_id, record.sub_source.clone()), record);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointFile {
    checkpoints: Vec<CheckpointRecord>,
}

/// Checkpoints in a single JSON file
#[derive(Debug)]
pub struct JsonFileCheckpointStore {
    path: PathBuf,
    state: Mutex<BTreeMap<(Uuid, String), CheckpointRecord>>,
}

impl JsonFileCheckpointStore {
    /// Open the store, reading existing checkpoints if the file exists
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let path = path.into();
        let mut state = BTreeMap::new();

        match tokio::fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => {
                let file: CheckpointFile = serde_json::from_slice(&bytes)?;
                for record in file.checkpoints {
                    state.insert((record.job_id, record.sub_source.clone()), record);
                }
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        debug!(path = %path.display(), checkpoints = state.len(), "Checkpoint store opened");
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&self, state: &BTreeMap<(Uuid, String), CheckpointRecord>) -> Result<(), CheckpointError> {
        let file = CheckpointFile {
            checkpoints: state.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for JsonFileCheckpointStore {
    async fn load(&self, job_id: Uuid) -> Result<BTreeMap<String, ReadPosition>, CheckpointError> {
        Ok(self
            .state
            .lock()
            .await
            .values()
            .filter(|record| record.job_id == job_id)
            .map(|record| (record.sub_source.clone(), record.position))
            .collect())
    }

    async fn save(&self, record: CheckpointRecord) -> Result<(), CheckpointError> {
        // Held across the write so concurrent saves land in order
        let mut state = self.state.lock().await;
        state.insert((record.job_id, record.sub_source.clone()), record);
        self.write(&state).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_keeps_latest_per_sub_source() {
        let store = MemoryCheckpointStore::new();
        let job_id = Uuid::new_v4();
        let other_job = Uuid::new_v4();

        store.save(CheckpointRecord::new(job_id, "s1", ReadPosition::binlog(1, 10))).await.unwrap();
        store.save(CheckpointRecord::new(job_id, "s1", ReadPosition::binlog(1, 20))).await.unwrap();
        store.save(CheckpointRecord::new(other_job, "s1", ReadPosition::binlog(9, 9))).await.unwrap();

        let loaded = store.load(job_id).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["s1"], ReadPosition::binlog(1, 20));
        assert_eq!(store.history().await.len(), 3);
        assert_eq!(store.get(other_job, "s1").await, Some(ReadPosition::binlog(9, 9)));
    }

    #[tokio::test]
    async fn test_json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("checkpoints.json");
        let job_id = Uuid::new_v4();

        {
            let store = JsonFileCheckpointStore::open(&path).await.unwrap();
            assert!(store.load(job_id).await.unwrap().is_empty());
            store.save(CheckpointRecord::new(job_id, "/var/log/a.log", ReadPosition::file(128))).await.unwrap();
            store.save(CheckpointRecord::new(job_id, "/var/log/b.log", ReadPosition::file(7))).await.unwrap();
        }

        let reopened = JsonFileCheckpointStore::open(&path).await.unwrap();
        let loaded = reopened.load(job_id).await.unwrap();
        assert_eq!(loaded["/var/log/a.log"], ReadPosition::file(128));
        assert_eq!(loaded["/var/log/b.log"], ReadPosition::file(7));
        assert!(!dir.path().join("state").join("checkpoints.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_json_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        assert!(matches!(
            JsonFileCheckpointStore::open(&path).await,
            Err(CheckpointError::Serialization(_))
        ));
    }
}
