//! DTS Agent - run collection jobs from the command line

use anyhow::{Context, Result};
use clap::Parser;
use dts_agent::{AgentConfig, Connectors, JobDescription, JobRunner, JsonFileCheckpointStore, StdoutSink};
use dts_common::logging::{init_logging, LogConfig, LogLevel};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "dts-agent")]
#[command(author, version, about = "DTS collection agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Run a job until its readers finish or Ctrl-C is pressed
    Run {
        /// Job description (JSON)
        #[arg(short, long)]
        job: PathBuf,

        /// Checkpoint file, overrides DTS_CHECKPOINT_PATH
        #[arg(long)]
        checkpoints: Option<PathBuf>,

        /// Readers allowed to run at once, overrides DTS_MAX_CONCURRENT_READERS
        #[arg(long)]
        max_concurrent: Option<usize>,
    },

    /// Show the sub-sources a job would be split into
    Plan {
        /// Job description (JSON)
        #[arg(short, long)]
        job: PathBuf,
    },
}

async fn load_job(path: &Path) -> Result<JobDescription> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read job file {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("Invalid job description in {}", path.display()))
}

/// Logging settings from the environment; `--verbose` wins over `LOG_LEVEL`
fn log_config(verbose: bool) -> Result<LogConfig> {
    let mut config = LogConfig::builder().log_file_prefix("dts-agent").build().merge_env()?;
    if verbose {
        config.level = LogLevel::Debug;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = init_logging(&log_config(cli.verbose)?)?;

    let mut config = AgentConfig::from_env().context("Invalid agent configuration")?;

    match cli.command {
        Command::Plan { job } => {
            let job = load_job(&job).await?;
            let runner = JobRunner::new(
                config,
                Connectors::new(),
                Arc::new(dts_agent::MemoryCheckpointStore::new()),
                Arc::new(StdoutSink::new()),
            );
            for sub_source in runner.plan(&job).await? {
                println!("{}", sub_source);
            }
        }
        Command::Run {
            job,
            checkpoints,
            max_concurrent,
        } => {
            if let Some(path) = checkpoints {
                config.checkpoint_path = path;
            }
            if let Some(n) = max_concurrent {
                config.supervisor.max_concurrent_readers = n;
            }
            config.validate()?;

            let job = load_job(&job).await?;
            let store = JsonFileCheckpointStore::open(&config.checkpoint_path)
                .await
                .with_context(|| format!("Failed to open checkpoint store {}", config.checkpoint_path.display()))?;

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, cancelling job");
                    on_signal.cancel();
                }
            });

            info!(job_id = %job.job_id, source_type = %job.source_type, "Starting job");
            let runner = JobRunner::new(config, Connectors::new(), Arc::new(store), Arc::new(StdoutSink::new()));
            let report = runner.run(job, cancel).await?;

            eprintln!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_success() {
                anyhow::bail!("Job finished with status {}", report.status);
            }
        }
    }

    Ok(())
}
