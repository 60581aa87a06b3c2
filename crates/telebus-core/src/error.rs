//! Error types for the telebus core.

use std::time::Duration;

use thiserror::Error;

use crate::ack::AckError;

/// Result type for telebus operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the telebus core.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid configuration (environment, metadata, index).
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A lifecycle rule was broken (double start, late topic registration, ...).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Pull and push consumption were mixed on one topic.
    #[error("Invalid mode: {0}")]
    InvalidMode(String),

    /// No data arrived in time.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// An anticipated rejection; reported to the caller without a backtrace.
    #[error("{0}")]
    Expected(String),

    /// A command ended with a bad acknowledgment.
    #[error(transparent)]
    Ack(#[from] AckError),

    /// The transport collaborator failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A value was out of range or malformed.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Unknown topic or command.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The session or topic is closed.
    #[error("Closed: {0}")]
    Closed(String),

    /// Field conversion failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create an expected error.
    pub fn expected(message: impl Into<String>) -> Self {
        Self::Expected(message.into())
    }

    /// True for errors that are reported without being logged as failures.
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::Expected(_))
    }
}
