//! Error types for DTS

use thiserror::Error;

/// Errors raised while parsing shared DTS values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DtsError {
    #[error("Invalid source type: {0}")]
    InvalidSourceType(String),

    #[error("Invalid start position: {0}")]
    InvalidStartPosition(String),
}
