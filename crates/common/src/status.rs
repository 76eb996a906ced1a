//! HTTP status endpoints served by the editor
//!
//! The editor exposes a small polling API next to the MCP bridge. The harness
//! only reads it: `/scripts-compile-status` doubles as the readiness check and
//! `/tests-run-status` reports the state of the test runner.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::trace;

/// Path polled to decide whether an editor instance is ready.
pub const HEALTH_PATH: &str = "/scripts-compile-status";

/// Path reporting the test runner state.
pub const TEST_RUN_STATUS_PATH: &str = "/tests-run-status";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub is_compiling: bool,
    #[serde(default)]
    pub last_compile_time: Option<String>,
    #[serde(default)]
    pub errors: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub is_running: bool,
    #[serde(default)]
    pub last_test_time: Option<String>,
    #[serde(default)]
    pub test_run_id: Option<String>,
    #[serde(default)]
    pub test_results: Option<TestResultTotals>,
}

impl TestRunStatus {
    pub fn is_idle(&self) -> bool {
        !self.is_running && self.status != "running"
    }
}

/// Totals of the last completed test run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResultTotals {
    #[serde(default)]
    pub total_tests: u32,
    #[serde(default)]
    pub passed_tests: u32,
    #[serde(default)]
    pub failed_tests: u32,
    #[serde(default)]
    pub skipped_tests: u32,
    #[serde(default)]
    pub duration: f64,
}

/// Client for one editor instance's status port
#[derive(Debug, Clone)]
pub struct StatusClient {
    http: reqwest::Client,
    base_url: String,
}

impl StatusClient {
    /// Client for `http://127.0.0.1:<port>` with a per-request timeout.
    pub fn new(port: u16, request_timeout: Duration) -> Result<Self> {
        Self::with_base_url(format!("http://127.0.0.1:{}", port), request_timeout)
    }

    pub fn with_base_url(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn health_url(&self) -> String {
        format!("{}{}", self.base_url, HEALTH_PATH)
    }

    /// One readiness check. Connection failures and non-2xx answers are
    /// both "not ready"; only a 2xx counts.
    pub async fn is_ready(&self) -> bool {
        match self.http.get(self.health_url()).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                trace!("Health check failed: {}", e);
                false
            }
        }
    }

    pub async fn compile_status(&self) -> Result<CompileStatus> {
        let status = self
            .http
            .get(self.health_url())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(status)
    }

    pub async fn test_run_status(&self) -> Result<TestRunStatus> {
        let status = self
            .http
            .get(format!("{}{}", self.base_url, TEST_RUN_STATUS_PATH))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(status)
    }
}
