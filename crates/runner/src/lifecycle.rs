//! Editor instance lifecycle
//!
//! Launches the long-running batch-mode editor for one project, polls its
//! status endpoint until it answers, and terminates it on teardown.

use crate::provisioner::ProjectLayout;
use chrono::{DateTime, Utc};
use edharness_common::{Error, InstanceState, Result, StatusClient};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Launch settings for one editor instance
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub exe: PathBuf,
    pub project: PathBuf,
    pub port: u16,
    pub poll_interval: Duration,
    pub health_timeout: Duration,
    pub stop_grace: Duration,
    /// Extra environment for the editor process
    pub envs: Vec<(String, String)>,
}

impl InstanceConfig {
    pub fn new(exe: impl Into<PathBuf>, project: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            exe: exe.into(),
            project: project.into(),
            port,
            poll_interval: Duration::from_secs(2),
            health_timeout: Duration::from_secs(2),
            stop_grace: Duration::from_secs(10),
            envs: Vec::new(),
        }
    }

    pub fn args(&self) -> Vec<String> {
        vec![
            "-batchmode".to_string(),
            "-nographics".to_string(),
            "-projectPath".to_string(),
            self.project.display().to_string(),
        ]
    }
}

/// Snapshot of a running (or attached) instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceHandle {
    /// `None` when attached to an instance this process did not launch
    pub pid: Option<u32>,
    pub log_path: PathBuf,
    pub port: u16,
    pub state: InstanceState,
    pub started_at: DateTime<Utc>,
}

/// Owns at most one editor process
pub struct InstanceManager {
    config: InstanceConfig,
    status: StatusClient,
    child: Option<Child>,
    handle: Option<InstanceHandle>,
}

impl InstanceManager {
    pub fn new(config: InstanceConfig) -> Result<Self> {
        let status = StatusClient::new(config.port, config.health_timeout)?;
        Ok(Self {
            config,
            status,
            child: None,
            handle: None,
        })
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn handle(&self) -> Option<&InstanceHandle> {
        self.handle.as_ref()
    }

    pub fn state(&self) -> InstanceState {
        self.handle
            .as_ref()
            .map(|h| h.state)
            .unwrap_or(InstanceState::Stopped)
    }

    pub fn status_client(&self) -> &StatusClient {
        &self.status
    }

    pub fn log_path(&self) -> PathBuf {
        ProjectLayout::new(&self.config.project).editor_log()
    }

    /// One readiness check against the instance's status port.
    pub async fn is_healthy(&self) -> bool {
        self.status.is_ready().await
    }

    /// Adopt an editor that is already serving this port. Returns false when
    /// nothing answers.
    pub async fn attach(&mut self) -> bool {
        if !self.is_healthy().await {
            return false;
        }
        info!("Attached to running editor on port {}", self.config.port);
        self.handle = Some(InstanceHandle {
            pid: None,
            log_path: self.log_path(),
            port: self.config.port,
            state: InstanceState::Ready,
            started_at: Utc::now(),
        });
        true
    }

    /// Launch the editor and wait until its status endpoint answers.
    pub async fn start(&mut self, timeout: Duration) -> Result<InstanceHandle> {
        if self.child.is_some() {
            return Err(Error::Internal("editor instance already started".to_string()));
        }
        if !self.config.exe.is_file() {
            return Err(Error::NotFound {
                what: "Editor executable".to_string(),
                detail: self.config.exe.display().to_string(),
                hint: format!(
                    "Set {} or install the required version",
                    crate::config::ENV_EDITOR_EXE
                ),
            });
        }
        if !self.config.project.is_dir() {
            return Err(Error::NotFound {
                what: "Project".to_string(),
                detail: self.config.project.display().to_string(),
                hint: "Provision the worker project first".to_string(),
            });
        }

        let log_path = self.log_path();
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let log = fs::File::create(&log_path)?;

        info!(
            "Starting editor: {} {}",
            self.config.exe.display(),
            self.config.args().join(" ")
        );
        let child = Command::new(&self.config.exe)
            .args(self.config.args())
            .envs(self.config.envs.iter().map(|(k, v)| (k, v)))
            .current_dir(&self.config.project)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        info!("Editor started (pid: {:?}), log: {}", pid, log_path.display());
        self.child = Some(child);
        self.handle = Some(InstanceHandle {
            pid,
            log_path: log_path.clone(),
            port: self.config.port,
            state: InstanceState::Starting,
            started_at: Utc::now(),
        });

        match self.wait_until_ready(timeout).await {
            Ok(()) => {
                self.set_state(InstanceState::Ready);
                info!("Editor ready on port {}", self.config.port);
                self.handle
                    .clone()
                    .ok_or_else(|| Error::Internal("instance handle missing".to_string()))
            }
            Err(e) => {
                if let Err(stop_err) = self.stop().await {
                    warn!("Failed to stop editor after failed start: {}", stop_err);
                }
                Err(e)
            }
        }
    }

    async fn wait_until_ready(&mut self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        let log = self.log_path();
        let pid = self.handle.as_ref().and_then(|h| h.pid).unwrap_or(0);
        debug!("Waiting for editor HTTP server at {}", self.status.health_url());

        while start.elapsed() < timeout {
            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    self.child = None;
                    return Err(Error::ProcessExited {
                        pid,
                        status: status.to_string(),
                        log: Some(log),
                    });
                }
            }

            if self.is_healthy().await {
                return Ok(());
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }

        Err(Error::Timeout {
            operation: "editor HTTP server".to_string(),
            elapsed: start.elapsed(),
            log: Some(log),
        })
    }

    fn set_state(&mut self, state: InstanceState) {
        if let Some(handle) = self.handle.as_mut() {
            handle.state = state;
        }
    }

    /// Terminate the editor: SIGTERM, wait the grace period, then SIGKILL.
    /// Idempotent; an attached instance is only forgotten.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            self.set_state(InstanceState::Stopped);
            return Ok(());
        };

        self.set_state(InstanceState::Stopping);
        let pid = child.id();
        info!("Stopping editor (pid: {:?})", pid);

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = pid {
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    debug!("SIGTERM to {} failed: {}", pid, e);
                }
            }
        }

        match tokio::time::timeout(self.config.stop_grace, child.wait()).await {
            Ok(status) => {
                debug!("Editor exited: {:?}", status);
            }
            Err(_) => {
                warn!(
                    "Editor did not stop within {:?}, force killing",
                    self.config.stop_grace
                );
                child.kill().await?;
            }
        }

        self.set_state(InstanceState::Stopped);
        info!("Editor stopped");
        Ok(())
    }
}

impl Drop for InstanceManager {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_requires_executable_and_project() {
        let dir = tempfile::tempdir().unwrap();

        let config = InstanceConfig::new(dir.path().join("editor"), dir.path(), 1);
        let mut missing_exe = InstanceManager::new(config).unwrap();
        assert!(matches!(
            missing_exe.start(Duration::from_secs(1)).await,
            Err(Error::NotFound { .. })
        ));

        let exe = dir.path().join("editor");
        fs::write(&exe, "").unwrap();
        let mut missing_project =
            InstanceManager::new(InstanceConfig::new(&exe, dir.path().join("Nope"), 1)).unwrap();
        assert!(matches!(
            missing_project.start(Duration::from_secs(1)).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let mut manager =
            InstanceManager::new(InstanceConfig::new("/bin/true", "/tmp", 1)).unwrap();
        manager.stop().await.unwrap();
        manager.stop().await.unwrap();
        assert_eq!(manager.state(), InstanceState::Stopped);
    }

    #[test]
    fn test_launch_args() {
        let config = InstanceConfig::new("/opt/editor", "/work/P.worker_gw1", 17543);
        assert_eq!(
            config.args(),
            vec!["-batchmode", "-nographics", "-projectPath", "/work/P.worker_gw1"]
        );
    }
}
