//! Retry policy for transient editor faults
//!
//! The editor's embedded HTTP server restarts while it recompiles scripts or
//! refreshes assets. Requests that land in that window come back as JSON-RPC
//! internal errors whose message names the failing stage. Only the messages
//! listed in [`TransientFault`] are retried; anything mentioning a timeout is
//! surfaced immediately.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// JSON-RPC "internal error" code used by the bridge for editor-side faults.
pub const INTERNAL_ERROR_CODE: i64 = -32603;

/// Substring that disqualifies an error from retry, matched case-insensitively.
pub const TIMEOUT_SIGNATURE: &str = "timeout";

/// Known transient fault signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientFault {
    /// HTTP server restart during compilation or refresh
    HttpRequestFailed,
    /// Test runner still initialising
    TestExecutionFailedToStart,
    /// Generic tool failure while the editor is busy
    ToolExecutionFailed,
}

impl TransientFault {
    pub const ALL: [TransientFault; 3] = [
        TransientFault::HttpRequestFailed,
        TransientFault::TestExecutionFailedToStart,
        TransientFault::ToolExecutionFailed,
    ];

    /// Exact substring the bridge emits for this fault.
    pub fn signature(self) -> &'static str {
        match self {
            TransientFault::HttpRequestFailed => "HTTP request failed",
            TransientFault::TestExecutionFailedToStart => "Test execution failed to start",
            TransientFault::ToolExecutionFailed => "Tool execution failed",
        }
    }

    /// Classify a server error. Returns `None` for anything that must not be
    /// retried: other codes, unknown messages, and any timeout.
    pub fn classify(code: i64, text: &str) -> Option<TransientFault> {
        if code != INTERNAL_ERROR_CODE {
            return None;
        }
        if text.to_lowercase().contains(TIMEOUT_SIGNATURE) {
            return None;
        }
        Self::ALL
            .into_iter()
            .find(|fault| text.contains(fault.signature()))
    }
}

impl fmt::Display for TransientFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransientFault::HttpRequestFailed => {
                write!(f, "editor HTTP server unavailable (may be stuck in processing)")
            }
            TransientFault::TestExecutionFailedToStart => {
                write!(f, "test runner failed to initialize (check test runner setup)")
            }
            TransientFault::ToolExecutionFailed => write!(f, "editor tool execution failing"),
        }
    }
}

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Pause between attempts
    #[serde(with = "duration_ms")]
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(3))
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
