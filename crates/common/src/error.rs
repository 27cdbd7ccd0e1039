//! Error types for ITF

use std::time::Duration;
use thiserror::Error;

use crate::capability::Capability;

/// Result type alias using ITF Error
pub type Result<T> = std::result::Result<T, Error>;

/// ITF error types
///
/// A capability mismatch is deliberately absent: it is an environment
/// property reported as a skip, not an error.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Target construction or teardown failed
    #[error("Environment error on target {target}: {reason}")]
    Environment { target: String, reason: String },

    /// The capture transport could not be bound, connected or spawned
    #[error("Capture start error: {0}")]
    CaptureStart(String),

    #[error("Target does not support capability '{capability}'")]
    Unsupported { capability: Capability },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("{what} not reachable after {elapsed:?} (timeout {timeout:?})")]
    ReachabilityTimeout {
        what: String,
        elapsed: Duration,
        timeout: Duration,
    },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Command '{command}' failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Operation timeout after {0:?}")]
    Timeout(Duration),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build an environment error for the named target.
    pub fn environment(target: impl Into<String>, reason: impl ToString) -> Self {
        Error::Environment {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// True for failures caused by the environment rather than by a test.
    pub fn is_environment(&self) -> bool {
        matches!(
            self,
            Error::Environment { .. } | Error::CaptureStart(_) | Error::ReachabilityTimeout { .. }
        )
    }
}
