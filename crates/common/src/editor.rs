//! Editor MCP tools
//!
//! Typed wrappers over `tools/call` plus the two text predicates the harness
//! relies on. Tool results are free text inside `result.content[0].text`; the
//! predicates below are the only places that inspect that text.

use crate::retry::RetryPolicy;
use crate::rpc::RpcClient;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Marker the editor prints when a script compile finished without errors.
pub const COMPILE_SUCCESS_SIGNATURE: &str = "Compilation completed successfully";

/// Marker the editor prints when a refresh request overlaps a running one.
pub const REFRESH_IN_PROGRESS_SIGNATURE: &str = "refresh already in progress";

/// Compiler diagnostic for a source file that no longer exists.
pub const STALE_FILE_CODE: &str = "cs2001";

/// Extra time granted to the RPC exchange on top of a tool's own timeout.
const TOOL_TIMEOUT_MARGIN: Duration = Duration::from_secs(15);

/// True when compile output references a deleted source file, which means
/// the asset database is stale and needs a forced refresh.
pub fn has_stale_file_reference(status_text: &str) -> bool {
    let text = status_text.to_lowercase();
    text.contains(STALE_FILE_CODE)
        || (text.contains("source file") && text.contains("could not be found"))
}

/// True when compile output reports a clean build.
pub fn is_compilation_clean(compile_text: &str) -> bool {
    compile_text.contains(COMPILE_SUCCESS_SIGNATURE)
}

/// True when a refresh was rejected because another one is running.
pub fn is_refresh_in_progress(refresh_text: &str) -> bool {
    refresh_text.to_lowercase().contains(REFRESH_IN_PROGRESS_SIGNATURE)
}

/// Busy flags reported by the `editor_status` tool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorStatus {
    #[serde(default)]
    pub is_compiling: bool,
    #[serde(default)]
    pub is_running_tests: bool,
    #[serde(default)]
    pub is_playing: bool,
}

impl EditorStatus {
    pub fn is_busy(&self) -> bool {
        self.is_compiling || self.is_running_tests
    }
}

/// Extract `result.content[0].text` from a tool call result.
pub fn tool_text(result: &Value) -> Result<&str> {
    result
        .get("content")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("text"))
        .and_then(Value::as_str)
        .ok_or_else(|| Error::protocol(format!("tool result without text content: {}", result)))
}

/// The editor operations the state resync machine drives.
#[async_trait]
pub trait EditorControl: Send + Sync {
    async fn editor_status(&self) -> Result<EditorStatus>;

    /// Text of the last compile, without triggering a new one
    async fn compile_status_text(&self) -> Result<String>;

    /// Refresh the asset database; `force` re-imports everything
    async fn assets_refresh(&self, force: bool) -> Result<String>;

    /// Compile scripts and return the compiler's summary text
    async fn scripts_compile(&self, timeout: Duration) -> Result<String>;
}

/// Poll `editor_status` until the editor is neither compiling nor running
/// tests. Status errors are logged and polling continues.
pub async fn wait_for_idle<E: EditorControl + ?Sized>(
    editor: &E,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let start = Instant::now();

    while start.elapsed() < timeout {
        match editor.editor_status().await {
            Ok(status) if !status.is_busy() => return Ok(()),
            Ok(status) => trace!("Editor busy: {:?}", status),
            Err(e) => debug!("Editor status check failed: {}", e),
        }
        tokio::time::sleep(poll_interval).await;
    }

    Err(Error::timeout("editor to become idle", start.elapsed()))
}

/// MCP tool calls against one editor instance
#[derive(Clone)]
pub struct EditorTools {
    client: Arc<RpcClient>,
    retry: RetryPolicy,
}

impl EditorTools {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self {
            client,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn client(&self) -> &Arc<RpcClient> {
        &self.client
    }

    /// Call a tool once.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        self.client
            .call("tools/call", Some(json!({ "name": name, "arguments": arguments })))
            .await
    }

    /// Call a tool with retries on transient editor faults. The exchange is
    /// allowed `timeout` plus a margin, since the tool enforces `timeout`
    /// itself.
    pub async fn call_tool_with_retry(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.client
            .call_with_retry_timeout(
                "tools/call",
                Some(json!({ "name": name, "arguments": arguments })),
                &self.retry,
                timeout + TOOL_TIMEOUT_MARGIN,
            )
            .await
    }

    async fn tool_text_of(&self, name: &str, arguments: Value) -> Result<String> {
        let result = self.call_tool(name, arguments).await?;
        Ok(tool_text(&result)?.to_string())
    }

    pub async fn list_tools(&self) -> Result<Value> {
        self.client.call("tools/list", None).await
    }

    /// Compile and wait for completion, retrying across server restarts.
    pub async fn compilation_trigger(&self, timeout: Duration) -> Result<Value> {
        self.call_tool_with_retry(
            "compilation_trigger",
            json!({ "timeout": timeout.as_secs() }),
            timeout,
        )
        .await
    }

    pub async fn scripts_compile_status(&self) -> Result<String> {
        self.tool_text_of("scripts_compile_status", json!({})).await
    }

    pub async fn compilation_status(&self) -> Result<Value> {
        self.call_tool("compilation_status", json!({})).await
    }

    pub async fn tests_run_single(
        &self,
        test_name: &str,
        test_mode: &str,
        timeout: Duration,
    ) -> Result<Value> {
        self.call_tool_with_retry(
            "tests_run_single",
            json!({ "test_name": test_name, "test_mode": test_mode, "timeout": timeout.as_secs() }),
            timeout,
        )
        .await
    }

    pub async fn tests_run_all(&self, test_mode: &str, timeout: Duration) -> Result<Value> {
        self.call_tool_with_retry(
            "tests_run_all",
            json!({ "test_mode": test_mode, "timeout": timeout.as_secs() }),
            timeout,
        )
        .await
    }

    pub async fn tests_run_regex(
        &self,
        test_filter_regex: &str,
        test_mode: &str,
        timeout: Duration,
    ) -> Result<Value> {
        self.call_tool_with_retry(
            "tests_run_regex",
            json!({
                "test_filter_regex": test_filter_regex,
                "test_mode": test_mode,
                "timeout": timeout.as_secs(),
            }),
            timeout,
        )
        .await
    }

    pub async fn tests_status(&self) -> Result<Value> {
        self.call_tool("tests_status", json!({})).await
    }

    /// Cancel a test run; an empty guid cancels the current one.
    pub async fn tests_cancel(&self, test_run_guid: &str) -> Result<Value> {
        self.call_tool("tests_cancel", json!({ "test_run_guid": test_run_guid }))
            .await
    }

    pub async fn editor_exit_play_mode(&self) -> Result<Value> {
        self.call_tool("editor_exit_play_mode", json!({})).await
    }

    pub async fn compile_shader(&self, shader_name: &str, timeout: Duration) -> Result<Value> {
        self.call_tool(
            "compile_shader",
            json!({ "shader_name": shader_name, "timeout": timeout.as_secs() }),
        )
        .await
    }

    pub async fn compile_all_shaders(&self, timeout: Duration) -> Result<Value> {
        self.call_tool("compile_all_shaders", json!({ "timeout": timeout.as_secs() }))
            .await
    }

    pub async fn compile_shaders_regex(&self, pattern: &str, timeout: Duration) -> Result<Value> {
        self.call_tool(
            "compile_shaders_regex",
            json!({ "pattern": pattern, "timeout": timeout.as_secs() }),
        )
        .await
    }

    pub async fn shader_compilation_status(&self) -> Result<Value> {
        self.call_tool("shader_compilation_status", json!({})).await
    }
}

#[async_trait]
impl EditorControl for EditorTools {
    async fn editor_status(&self) -> Result<EditorStatus> {
        let text = self.tool_text_of("editor_status", json!({})).await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn compile_status_text(&self) -> Result<String> {
        self.scripts_compile_status().await
    }

    async fn assets_refresh(&self, force: bool) -> Result<String> {
        self.tool_text_of("assets_refresh", json!({ "force": force }))
            .await
    }

    async fn scripts_compile(&self, timeout: Duration) -> Result<String> {
        let result = self
            .client
            .call_with_timeout(
                "tools/call",
                Some(json!({
                    "name": "scripts_compile",
                    "arguments": { "timeout": timeout.as_secs() },
                })),
                timeout + TOOL_TIMEOUT_MARGIN,
            )
            .await?;
        Ok(tool_text(&result)?.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_reference_signatures_are_pinned() {
        assert!(has_stale_file_reference(
            "error CS2001: Source file 'Assets/Temp.cs' could not be found."
        ));
        assert!(has_stale_file_reference("cs2001"));
        assert!(has_stale_file_reference(
            "Source file 'Assets/Gone.cs' could not be found"
        ));
        assert!(!has_stale_file_reference("Source file compiled"));
        assert!(!has_stale_file_reference("Compilation completed successfully"));
    }

    #[test]
    fn test_compile_signature_is_pinned() {
        assert!(is_compilation_clean("Compilation completed successfully in 3.2s"));
        assert!(!is_compilation_clean("Compilation completed with errors"));
    }

    #[test]
    fn test_refresh_in_progress() {
        assert!(is_refresh_in_progress("Asset Refresh already in progress"));
        assert!(!is_refresh_in_progress("Asset refresh completed"));
    }

    #[test]
    fn test_editor_status_parsing() {
        let status: EditorStatus =
            serde_json::from_str(r#"{"isCompiling": false, "isRunningTests": true}"#).unwrap();
        assert!(status.is_busy());
        assert!(!status.is_playing);

        let idle: EditorStatus = serde_json::from_str("{}").unwrap();
        assert!(!idle.is_busy());
    }

    #[test]
    fn test_tool_text() {
        let result = json!({"content": [{"type": "text", "text": "hello"}]});
        assert_eq!(tool_text(&result).unwrap(), "hello");
        assert!(matches!(tool_text(&json!({"content": []})), Err(Error::Protocol(_))));
    }
}
