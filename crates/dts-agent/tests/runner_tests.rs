//! Job runner end-to-end tests
//!
//! These tests run whole jobs through [`JobRunner`] with a checkpoint file
//! on disk and validate:
//! - file jobs read every line once and record where they stopped
//! - a rerun resumes from the checkpoint file and only reads new data
//! - persisted checkpoints win over stale job resume positions
//! - bad jobs fail at split time without starting any reader

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{fast_supervisor, payloads, small_batches, wait_until};
use dts_agent::{
    AgentConfig, CheckpointStore, CollectingSink, Connectors, JobDescription, JobRunner, JobStatus,
    JsonFileCheckpointStore, MemoryCheckpointStore, MemoryConnector, SplitHints, TaskState,
};
use dts_common::{CheckpointRecord, ReadPosition, SourceType, StartPosition};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn agent_config(checkpoint_path: &Path) -> AgentConfig {
    AgentConfig {
        supervisor: fast_supervisor(),
        reader: small_batches(),
        checkpoint_path: checkpoint_path.to_path_buf(),
        ..AgentConfig::default()
    }
}

fn file_job(job_id: Uuid, dir: &Path) -> JobDescription {
    JobDescription::new(SourceType::File, "host-a")
        .with_job_id(job_id)
        .with_hints(SplitHints {
            file_pattern: Some(format!("{}/.*\\.log", dir.display())),
            ..Default::default()
        })
}

/// Run `job` once with a fresh store opened from `config.checkpoint_path`
async fn run_once(config: &AgentConfig, job: JobDescription) -> (dts_agent::JobReport, Arc<CollectingSink>) {
    let store = JsonFileCheckpointStore::open(&config.checkpoint_path).await.unwrap();
    let sink = Arc::new(CollectingSink::new());
    let runner = JobRunner::new(config.clone(), Connectors::new(), Arc::new(store), sink.clone());
    let report = runner.run(job, CancellationToken::new()).await.unwrap();
    (report, sink)
}

// ============================================================================
// File jobs
// ============================================================================

#[tokio::test]
async fn test_file_job_reads_everything_and_resumes() {
    let logs = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    fs::write(logs.path().join("a.log"), "a1\na2\na3\n").unwrap();
    fs::write(logs.path().join("b.log"), "b1\r\nb2\n").unwrap();

    let config = agent_config(&state.path().join("nested").join("checkpoints.json"));
    let job_id = Uuid::new_v4();
    let a_log = logs.path().join("a.log").display().to_string();
    let b_log = logs.path().join("b.log").display().to_string();

    let (report, sink) = run_once(&config, file_job(job_id, logs.path())).await;
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.tasks.len(), 2);
    assert_eq!(payloads(&sink.records_for(&a_log)), vec!["a1", "a2", "a3"]);
    assert_eq!(payloads(&sink.records_for(&b_log)), vec!["b1", "b2"]);
    assert_eq!(report.metrics.records_emitted, 5);

    let store = JsonFileCheckpointStore::open(&config.checkpoint_path).await.unwrap();
    let checkpoints = store.load(job_id).await.unwrap();
    assert_eq!(checkpoints.get(&a_log), Some(&ReadPosition::file(9)));
    assert_eq!(checkpoints.get(&b_log), Some(&ReadPosition::file(7)));

    // nothing new, nothing read
    let (report, sink) = run_once(&config, file_job(job_id, logs.path())).await;
    assert_eq!(report.status, JobStatus::Completed);
    assert!(sink.is_empty());

    let mut file = OpenOptions::new().append(true).open(logs.path().join("a.log")).unwrap();
    file.write_all(b"a4\n").unwrap();
    drop(file);

    let (report, sink) = run_once(&config, file_job(job_id, logs.path())).await;
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(payloads(&sink.records()), vec!["a4"]);
    assert_eq!(report.task(&a_log).unwrap().checkpoint, ReadPosition::file(12));
}

#[tokio::test]
async fn test_corrupt_file_fails_only_its_reader() {
    let logs = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    fs::write(logs.path().join("good.log"), "g1\ng2\n").unwrap();
    fs::write(logs.path().join("bad.log"), b"ok\n\xff\xfe\nafter\n").unwrap();

    let config = agent_config(&state.path().join("checkpoints.json"));
    let job_id = Uuid::new_v4();
    let bad_log = logs.path().join("bad.log").display().to_string();

    let (report, sink) = run_once(&config, file_job(job_id, logs.path())).await;

    assert_eq!(report.status, JobStatus::PartiallyFailed);
    assert_eq!(report.task(&bad_log).unwrap().state, TaskState::Dead);
    assert_eq!(report.count(TaskState::Completed), 1);
    assert_eq!(payloads(&sink.records_for(&bad_log)), vec!["ok"]);
    assert_eq!(report.metrics.corrupt_failure, 1);

    let store = JsonFileCheckpointStore::open(&config.checkpoint_path).await.unwrap();
    assert_eq!(store.load(job_id).await.unwrap().get(&bad_log), Some(&ReadPosition::file(3)));
}

#[tokio::test]
async fn test_job_with_no_matching_files_fails_to_split() {
    let logs = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let config = agent_config(&state.path().join("checkpoints.json"));

    let store = JsonFileCheckpointStore::open(&config.checkpoint_path).await.unwrap();
    let runner = JobRunner::new(config, Connectors::new(), Arc::new(store), Arc::new(CollectingSink::new()));

    let result = runner.run(file_job(Uuid::new_v4(), logs.path()), CancellationToken::new()).await;
    assert!(result.is_err());
}

// ============================================================================
// Feed jobs
// ============================================================================

#[tokio::test]
async fn test_persisted_checkpoints_override_stale_resume_positions() {
    let connector = Arc::new(MemoryConnector::binlog("mysql"));
    connector.add_instance("db-1", &["s1"]);
    let positions: Vec<ReadPosition> = (0..5).map(|i| connector.push("db-1", "s1", format!("e{}", i))).collect();
    connector.finish("db-1", "s1");

    let job_id = Uuid::new_v4();
    let store = Arc::new(MemoryCheckpointStore::new());
    store.save(CheckpointRecord::new(job_id, "s1", positions[2])).await.unwrap();

    let sink = Arc::new(CollectingSink::new());
    let config = AgentConfig {
        supervisor: fast_supervisor(),
        reader: small_batches(),
        ..AgentConfig::default()
    };
    let runner = JobRunner::new(config, Connectors::new().with_binlog(connector), store.clone(), sink.clone());

    let job = JobDescription::new(SourceType::Binlog, "db-1")
        .with_job_id(job_id)
        .with_resume("s1", positions[0]);
    let report = runner.run(job, CancellationToken::new()).await.unwrap();

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(payloads(&sink.records()), vec!["e3", "e4"]);
    assert_eq!(store.get(job_id, "s1").await, Some(positions[4]));
}

#[tokio::test]
async fn test_latest_start_survives_restart_without_gaps() {
    let connector = Arc::new(MemoryConnector::stream("kafka"));
    connector.add_instance("orders", &["p-0"]);
    let head = connector.push("orders", "p-0", "old");

    let job_id = Uuid::new_v4();
    let job = || {
        JobDescription::new(SourceType::Stream, "orders")
            .with_job_id(job_id)
            .with_start_position(StartPosition::Latest)
    };

    let store = Arc::new(MemoryCheckpointStore::new());
    let sink = Arc::new(CollectingSink::new());
    let config = AgentConfig {
        supervisor: fast_supervisor(),
        reader: small_batches(),
        ..AgentConfig::default()
    };
    let runner = Arc::new(JobRunner::new(
        config,
        Connectors::new().with_stream(connector.clone()),
        store.clone(),
        sink.clone(),
    ));

    // stopped before anything new arrived
    let cancel = CancellationToken::new();
    let first = tokio::spawn({
        let runner = runner.clone();
        let cancel = cancel.clone();
        let job = job();
        async move { runner.run(job, cancel).await }
    });
    assert!(wait_until(Duration::from_secs(5), || connector.open_feeds() == 1).await);
    cancel.cancel();

    let report = first.await.unwrap().unwrap();
    assert_eq!(report.status, JobStatus::Cancelled);
    assert!(sink.is_empty());
    assert_eq!(store.get(job_id, "p-0").await, Some(head));

    connector.push("orders", "p-0", "arrived-while-down");
    connector.finish("orders", "p-0");

    let report = runner.run(job(), CancellationToken::new()).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(payloads(&sink.records()), vec!["arrived-while-down"]);
}

#[tokio::test]
async fn test_plan_lists_sub_sources_without_reading() {
    let connector = Arc::new(MemoryConnector::stream("kafka"));
    connector.add_instance("orders", &["p-1", "p-0"]);
    connector.push("orders", "p-0", "m0");

    let runner = JobRunner::new(
        AgentConfig::default(),
        Connectors::new().with_stream(connector.clone()),
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(CollectingSink::new()),
    );

    let plan = runner.plan(&JobDescription::new(SourceType::Stream, "orders")).await.unwrap();
    assert_eq!(plan, vec!["p-0", "p-1"]);
    assert!(connector.subscriptions().is_empty());
}

#[tokio::test]
async fn test_process_reader_cap_applies_across_jobs() {
    let connector = Arc::new(MemoryConnector::stream("kafka"));
    connector.add_instance("orders", &["p-0", "p-1", "p-2"]);
    for partition in ["p-0", "p-1", "p-2"] {
        for i in 0..3 {
            connector.push("orders", partition, format!("{}-m{}", partition, i));
        }
        connector.finish("orders", partition);
    }

    let config = AgentConfig {
        supervisor: fast_supervisor(),
        reader: small_batches(),
        process_max_readers: Some(1),
        ..AgentConfig::default()
    };
    let runner = Arc::new(JobRunner::new(
        config,
        Connectors::new().with_stream(connector.clone()),
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(CollectingSink::new()),
    ));

    let first = tokio::spawn({
        let runner = runner.clone();
        async move {
            runner
                .run(JobDescription::new(SourceType::Stream, "orders"), CancellationToken::new())
                .await
        }
    });
    let second = runner
        .run(JobDescription::new(SourceType::Stream, "orders"), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(first.await.unwrap().unwrap().status, JobStatus::Completed);
    assert_eq!(connector.peak_open_feeds(), 1);
}
