//! Agent configuration
//!
//! Everything is read from `DTS_*` environment variables (a `.env` file is
//! honoured) with defaults for anything unset, then validated.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MAX_CONCURRENT_READERS: usize = 4;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_CHECKPOINT_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 10_000;
pub const DEFAULT_BATCH_SIZE: usize = 256;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_CHECKPOINT_PATH: &str = "dts-checkpoints.json";

/// What the supervisor does when a reader hits undecodable data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptPolicy {
    /// Mark the task dead and leave the checkpoint before the bad data
    #[default]
    Fail,
    /// Move the checkpoint past the bad data and keep reading
    Skip,
}

impl FromStr for CorruptPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fail" => Ok(CorruptPolicy::Fail),
            "skip" => Ok(CorruptPolicy::Skip),
            _ => anyhow::bail!("Invalid corrupt policy: {}. Must be 'fail' or 'skip'", s),
        }
    }
}

/// Task supervision knobs for one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Readers of one job allowed in RUNNING at the same time
    pub max_concurrent_readers: usize,
    /// Attempts per task before it is declared dead
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// How often a running reader persists an advanced checkpoint
    pub checkpoint_interval_ms: u64,
    /// How long readers get to stop on their own after cancellation
    pub shutdown_grace_ms: u64,
    pub corrupt_policy: CorruptPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_readers: DEFAULT_MAX_CONCURRENT_READERS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            checkpoint_interval_ms: DEFAULT_CHECKPOINT_INTERVAL_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            corrupt_policy: CorruptPolicy::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn with_max_concurrent_readers(mut self, n: usize) -> Self {
        self.max_concurrent_readers = n;
        self
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn with_backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.max_backoff_ms = max_ms;
        self
    }

    pub fn with_checkpoint_interval_ms(mut self, ms: u64) -> Self {
        self.checkpoint_interval_ms = ms;
        self
    }

    pub fn with_shutdown_grace_ms(mut self, ms: u64) -> Self {
        self.shutdown_grace_ms = ms;
        self
    }

    pub fn with_corrupt_policy(mut self, policy: CorruptPolicy) -> Self {
        self.corrupt_policy = policy;
        self
    }

    /// Delay before the retry that follows failure number `failures` (1-based)
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(63) as i32;
        let delay_ms = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = delay_ms.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrent_readers == 0 {
            anyhow::bail!("DTS_MAX_CONCURRENT_READERS must be greater than 0");
        }
        if self.max_attempts == 0 {
            anyhow::bail!("DTS_MAX_ATTEMPTS must be greater than 0");
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            anyhow::bail!(
                "DTS_BACKOFF_MULTIPLIER must be at least 1.0, got: {}",
                self.backoff_multiplier
            );
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            anyhow::bail!(
                "DTS_INITIAL_BACKOFF_MS ({}) must not exceed DTS_MAX_BACKOFF_MS ({})",
                self.initial_backoff_ms,
                self.max_backoff_ms
            );
        }
        if self.checkpoint_interval_ms == 0 {
            anyhow::bail!("DTS_CHECKPOINT_INTERVAL_MS must be greater than 0");
        }
        Ok(())
    }
}

/// Reader knobs shared by every reader of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Upper bound on records returned by one poll
    pub batch_size: usize,
    /// How long a poll waits for new data before returning an empty batch
    pub idle_timeout_ms: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
        }
    }
}

impl ReaderConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("DTS_READER_BATCH_SIZE must be greater than 0");
        }
        if self.idle_timeout_ms == 0 {
            anyhow::bail!("DTS_READER_IDLE_TIMEOUT_MS must be greater than 0");
        }
        Ok(())
    }
}

/// Full agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub supervisor: SupervisorConfig,
    pub reader: ReaderConfig,
    /// JSON file holding persisted checkpoints
    pub checkpoint_path: PathBuf,
    /// Cap on running readers across every job in this process
    pub process_max_readers: Option<usize>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            reader: ReaderConfig::default(),
            checkpoint_path: PathBuf::from(DEFAULT_CHECKPOINT_PATH),
            process_max_readers: None,
        }
    }
}

impl AgentConfig {
    /// Load configuration from the environment (and `.env` if present)
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from any key lookup, then validate it
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let corrupt_policy = match parse("DTS_CORRUPT_POLICY") {
            Some(value) => value.parse()?,
            None => CorruptPolicy::default(),
        };

        let config = Self {
            supervisor: SupervisorConfig {
                max_concurrent_readers: parse("DTS_MAX_CONCURRENT_READERS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_MAX_CONCURRENT_READERS),
                max_attempts: parse("DTS_MAX_ATTEMPTS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_MAX_ATTEMPTS),
                initial_backoff_ms: parse("DTS_INITIAL_BACKOFF_MS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_INITIAL_BACKOFF_MS),
                max_backoff_ms: parse("DTS_MAX_BACKOFF_MS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_MAX_BACKOFF_MS),
                backoff_multiplier: parse("DTS_BACKOFF_MULTIPLIER")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_BACKOFF_MULTIPLIER),
                checkpoint_interval_ms: parse("DTS_CHECKPOINT_INTERVAL_MS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_CHECKPOINT_INTERVAL_MS),
                shutdown_grace_ms: parse("DTS_SHUTDOWN_GRACE_MS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS),
                corrupt_policy,
            },
            reader: ReaderConfig {
                batch_size: parse("DTS_READER_BATCH_SIZE")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_BATCH_SIZE),
                idle_timeout_ms: parse("DTS_READER_IDLE_TIMEOUT_MS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_IDLE_TIMEOUT_MS),
            },
            checkpoint_path: parse("DTS_CHECKPOINT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CHECKPOINT_PATH)),
            process_max_readers: parse("DTS_PROCESS_MAX_READERS").and_then(|s| s.parse().ok()),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.supervisor.validate()?;
        self.reader.validate()?;
        if self.process_max_readers == Some(0) {
            anyhow::bail!("DTS_PROCESS_MAX_READERS must be greater than 0 when set");
        }
        Ok(())
    }
}
