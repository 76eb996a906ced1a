//! JSON-RPC 2.0 client over a line-delimited stream
//!
//! Talks to the editor's MCP bridge over its stdin/stdout (or any other
//! byte stream). One JSON object per line. A single reader task routes each
//! response to the pending call with the same id, so calls may be issued
//! concurrently on one connection. Messages with a `method` but no `id` are
//! notifications and are dropped.

use crate::retry::{RetryPolicy, TransientFault};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// MCP protocol revision sent during the handshake.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

/// How long `stop` waits for the bridge to exit before killing it.
const STOP_GRACE: Duration = Duration::from_secs(2);

const END_OF_STREAM: &str = "unexpected end of stream";

type Reply = oneshot::Sender<Result<Value>>;

#[derive(Default)]
struct PendingTable {
    calls: HashMap<u64, Reply>,
    closed: Option<String>,
}

/// Settings for spawning the bridge process.
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    /// Program to run (the launcher script written by the provisioner)
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Extra environment for the bridge process
    pub envs: Vec<(String, String)>,
    /// Where the bridge's stderr goes; discarded when unset
    pub stderr_log: Option<PathBuf>,
    /// Default bound on a single request/response exchange
    pub request_timeout: Duration,
    pub protocol_version: String,
}

impl RpcClientConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            envs: Vec::new(),
            stderr_log: None,
            request_timeout: Duration::from_secs(60),
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
        }
    }
}

/// Client for the editor's JSON-RPC bridge
pub struct RpcClient {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Arc<Mutex<PendingTable>>,
    next_id: AtomicU64,
    request_timeout: Duration,
    protocol_version: String,
    reader: Mutex<Option<JoinHandle<()>>>,
    process: tokio::sync::Mutex<Option<Child>>,
}

impl RpcClient {
    /// Spawn the bridge with piped stdio and perform the `initialize` handshake.
    pub async fn start(config: RpcClientConfig) -> Result<Self> {
        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .envs(config.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);

        match &config.stderr_log {
            Some(path) => {
                let log = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                cmd.stderr(Stdio::from(log));
            }
            None => {
                cmd.stderr(Stdio::null());
            }
        }

        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        // Own process group so stop() reaches the bridge's children too.
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        debug!("Spawning RPC bridge: {} {}", config.program.display(), config.args.join(" "));
        let mut child = cmd.spawn().map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("failed to spawn {}: {}", config.program.display(), e),
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Internal("bridge stdin not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("bridge stdout not piped".to_string()))?;

        let client = Self::connect(stdout, stdin, config.request_timeout)
            .with_protocol_version(config.protocol_version);
        *client.process.lock().await = Some(child);

        if let Err(e) = client.initialize().await {
            warn!("RPC handshake failed: {}", e);
            let _ = client.stop().await;
            return Err(e);
        }

        info!("RPC bridge ready ({})", config.program.display());
        Ok(client)
    }

    /// Connect to a bridge exposed as a TCP control socket and handshake.
    pub async fn connect_tcp(addr: &str, request_timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("failed to connect to {}: {}", addr, e),
            ))
        })?;
        let (read, write) = stream.into_split();
        let client = Self::connect(read, write, request_timeout);
        client.initialize().await?;
        Ok(client)
    }

    /// Wrap an already-open stream pair. No handshake is performed.
    pub fn connect<R, W>(reader: R, writer: W, request_timeout: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending = Arc::new(Mutex::new(PendingTable::default()));
        let task = tokio::spawn(read_loop(BufReader::new(reader), pending.clone()));

        Self {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            next_id: AtomicU64::new(0),
            request_timeout,
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
            reader: Mutex::new(Some(task)),
            process: tokio::sync::Mutex::new(None),
        }
    }

    fn with_protocol_version(mut self, version: String) -> Self {
        self.protocol_version = version;
        self
    }

    /// MCP `initialize` handshake. The result must be a JSON object.
    pub async fn initialize(&self) -> Result<Value> {
        let result = self
            .call(
                "initialize",
                Some(json!({ "protocolVersion": self.protocol_version })),
            )
            .await?;

        if !result.is_object() {
            return Err(Error::protocol(format!(
                "malformed initialize response: {}",
                result
            )));
        }

        self.notify("notifications/initialized", None).await?;
        trace!("RPC initialize result: {}", result);
        Ok(result)
    }

    /// Check if the connection is still usable
    pub fn is_open(&self) -> bool {
        self.pending.lock().closed.is_none()
    }

    /// Send a request and wait for its response, bounded by the default
    /// request timeout.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.call_with_timeout(method, params, self.request_timeout).await
    }

    /// Send a request and wait at most `timeout` for its response.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let line = serde_json::to_string(&RpcRequest {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params: params.as_ref(),
        })?;

        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.pending.lock();
            if let Some(reason) = &table.closed {
                return Err(Error::protocol(reason.clone()));
            }
            table.calls.insert(id, tx);
        }

        trace!("RPC -> {}", line);
        if let Err(e) = self.write_line(&line).await {
            self.pending.lock().calls.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::protocol("connection closed before response")),
            Err(_) => {
                self.pending.lock().calls.remove(&id);
                Err(Error::timeout(
                    format!("response to {} (id {})", method, id),
                    timeout,
                ))
            }
        }
    }

    /// Like [`call`](RpcClient::call), retrying known transient server
    /// faults per `policy`. Timeouts and every other error surface at once.
    pub async fn call_with_retry(
        &self,
        method: &str,
        params: Option<Value>,
        policy: &RetryPolicy,
    ) -> Result<Value> {
        self.call_with_retry_timeout(method, params, policy, self.request_timeout)
            .await
    }

    pub async fn call_with_retry_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        policy: &RetryPolicy,
        timeout: Duration,
    ) -> Result<Value> {
        let attempts = policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let err = match self.call_with_timeout(method, params.clone(), timeout).await {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };

            let fault = match &err {
                Error::Rpc { code, message, data } => {
                    TransientFault::classify(*code, &error_text(message, data.as_ref()))
                }
                _ => None,
            };

            let Some(fault) = fault else {
                return Err(err);
            };

            if attempt >= attempts {
                return Err(Error::RetriesExhausted {
                    method: method.to_string(),
                    attempts,
                    fault,
                });
            }

            warn!(
                "{} (attempt {}/{}), retrying in {:?}",
                fault, attempt, attempts, policy.delay
            );
            tokio::time::sleep(policy.delay).await;
            attempt += 1;
        }
    }

    /// Send a notification (no id, no response).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let line = serde_json::to_string(&RpcRequest {
            jsonrpc: "2.0",
            id: None,
            method,
            params: params.as_ref(),
        })?;
        trace!("RPC -> {}", line);
        self.write_line(&line).await
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    /// Terminate the bridge: SIGTERM to its process group, then SIGKILL if it
    /// is still alive after a short grace period. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let _ = self.writer.lock().await.shutdown().await;

        let child = self.process.lock().await.take();
        if let Some(mut child) = child {
            let pid = child.id();
            debug!("Stopping RPC bridge (pid: {:?})", pid);

            #[cfg(unix)]
            {
                if let Some(pid) = pid {
                    signal_group(pid, nix::sys::signal::Signal::SIGTERM);
                }
            }

            if tokio::time::timeout(STOP_GRACE, child.wait()).await.is_err() {
                warn!("RPC bridge did not exit within {:?}, killing", STOP_GRACE);
                #[cfg(unix)]
                {
                    if let Some(pid) = pid {
                        signal_group(pid, nix::sys::signal::Signal::SIGKILL);
                    }
                }
                let _ = child.kill().await;
            }
        }

        close_pending(&self.pending, "client stopped");
        if let Some(task) = self.reader.lock().take() {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        if let Some(task) = self.reader.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        trace!("killpg({}, {:?}) failed: {}", pid, signal, e);
    }
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
}

/// Text the retry classifier sees: the message plus any `data` payload.
fn error_text(message: &str, data: Option<&Value>) -> String {
    match data {
        Some(Value::String(s)) => format!("{} {}", message, s),
        Some(other) => format!("{} {}", message, other),
        None => message.to_string(),
    }
}

fn close_pending(pending: &Mutex<PendingTable>, reason: &str) {
    let mut table = pending.lock();
    if table.closed.is_none() {
        table.closed = Some(reason.to_string());
    }
    for (_, reply) in table.calls.drain() {
        let _ = reply.send(Err(Error::protocol(reason)));
    }
}

async fn read_loop<R: AsyncBufRead + Unpin>(mut reader: R, pending: Arc<Mutex<PendingTable>>) {
    let mut line = String::new();

    let reason = loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break END_OF_STREAM.to_string(),
            Ok(_) => {}
            Err(e) => break format!("read failed: {}", e),
        }

        let text = line.trim();
        if text.is_empty() {
            break END_OF_STREAM.to_string();
        }
        trace!("RPC <- {}", text);

        let message: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => break format!("malformed message: {}", e),
        };

        match route(message, &pending) {
            Ok(()) => {}
            Err(reason) => break reason,
        }
    };

    warn!("RPC connection closed: {}", reason);
    close_pending(&pending, &reason);
}

/// Deliver one inbound message. `Err` carries a fatal protocol violation.
fn route(message: Value, pending: &Mutex<PendingTable>) -> std::result::Result<(), String> {
    let Value::Object(mut fields) = message else {
        return Err(format!("expected a JSON object, got {}", message));
    };

    let id = fields.remove("id").filter(|id| !id.is_null());
    let method = fields
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_string);

    let id = match (id, method) {
        (None, Some(method)) => {
            trace!("Skipping notification {}", method);
            return Ok(());
        }
        (None, None) => {
            return Err(format!(
                "message without id or method: {}",
                Value::Object(fields)
            ));
        }
        (Some(_), Some(method)) => {
            debug!("Ignoring server-initiated request {}", method);
            return Ok(());
        }
        (Some(id), None) => id,
    };

    let Some(id) = id.as_u64() else {
        warn!("Dropping response with non-integer id {}", id);
        return Ok(());
    };

    let outcome = if let Some(error) = fields.remove("error") {
        Err(Error::Rpc {
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            data: error.get("data").cloned(),
        })
    } else if let Some(result) = fields.remove("result") {
        Ok(result)
    } else {
        Err(Error::protocol(format!(
            "response {} has neither result nor error",
            id
        )))
    };

    match pending.lock().calls.remove(&id) {
        Some(reply) => {
            let _ = reply.send(outcome);
        }
        None => warn!("Dropping response for unknown request id {}", id),
    }
    Ok(())
}
