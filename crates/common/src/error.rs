//! Error types for edharness

use crate::retry::TransientFault;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using the harness Error
pub type Result<T> = std::result::Result<T, Error>;

/// Harness error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed or out-of-sequence RPC traffic. Always fatal.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Error object returned by the server for a request.
    #[error("RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("{method}: {fault} persisted after {attempts} attempts")]
    RetriesExhausted {
        method: String,
        attempts: u32,
        fault: TransientFault,
    },

    #[error(
        "Timed out after {:.1}s waiting for {operation}{}",
        .elapsed.as_secs_f64(),
        log_hint(.log)
    )]
    Timeout {
        operation: String,
        elapsed: Duration,
        log: Option<PathBuf>,
    },

    #[error("{what} not found: {detail}. {hint}")]
    NotFound {
        what: String,
        detail: String,
        hint: String,
    },

    #[error("Failed to lock {}: {errno}", .path.display())]
    Lock { path: PathBuf, errno: nix::errno::Errno },

    #[error("Process {pid} exited unexpectedly ({status}){}", log_hint(.log))]
    ProcessExited {
        pid: u32,
        status: String,
        log: Option<PathBuf>,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn log_hint(log: &Option<PathBuf>) -> String {
    match log {
        Some(path) => format!(". Check log: {}", path.display()),
        None => String::new(),
    }
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            elapsed,
            log: None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_carries_elapsed_and_log() {
        let err = Error::Timeout {
            operation: "editor readiness".to_string(),
            elapsed: Duration::from_millis(2500),
            log: Some(PathBuf::from("/tmp/editor.log")),
        };
        let msg = err.to_string();
        assert!(msg.contains("2.5s"));
        assert!(msg.contains("/tmp/editor.log"));
        assert!(err.is_timeout());
    }

    #[test]
    fn test_retries_exhausted_is_not_timeout() {
        let err = Error::RetriesExhausted {
            method: "tools/call".to_string(),
            attempts: 5,
            fault: TransientFault::HttpRequestFailed,
        };
        assert!(!err.is_timeout());
        assert!(err.to_string().contains("5 attempts"));
    }
}
