//! DTS Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging and error handling for the DTS collection agent.
//!
//! # Overview
//!
//! - **Types**: read positions and persisted checkpoint records shared between
//!   the agent and whatever storage collaborator keeps its state
//! - **Error Handling**: parse errors for the shared types
//! - **Logging**: `tracing` subscriber setup driven by environment variables
//!
//! # Example
//!
//! ```no_run
//! use dts_common::types::{BinlogPosition, ReadPosition};
//!
//! let before = ReadPosition::Binlog(BinlogPosition::new(3, 120));
//! let after = ReadPosition::Binlog(BinlogPosition::new(3, 480));
//! assert!(after.is_ahead_of(&before));
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::DtsError;
pub use types::{CheckpointRecord, ReadPosition, SourceType, StartPosition};
