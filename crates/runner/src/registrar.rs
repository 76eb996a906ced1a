//! Port pre-registration
//!
//! Before a worker's long-running editor starts, a short headless launch lets
//! the editor record the worker's port in its machine-wide registry. Two
//! editors writing that registry at once can lose an entry, so registrations
//! are serialized by a machine-wide lock.

use crate::provisioner::ProjectLayout;
use edharness_common::{ExclusiveStateLock, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "detail")]
pub enum RegistrationOutcome {
    /// Caller reported the worker config unchanged
    SkippedUnchanged,
    /// The stamp already records this exact configuration
    SkippedAlreadyRegistered,
    Registered,
    /// Registration did not complete; startup continues
    Failed(String),
}

impl RegistrationOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(
            self,
            RegistrationOutcome::SkippedUnchanged | RegistrationOutcome::SkippedAlreadyRegistered
        )
    }
}

/// One-shot headless editor launch for a worker project
#[derive(Debug, Clone)]
pub struct PortRegistrar {
    exe: PathBuf,
    project: PathBuf,
    locks_dir: PathBuf,
    timeout: Duration,
    execute_method: Option<String>,
}

impl PortRegistrar {
    pub fn new(
        exe: impl Into<PathBuf>,
        project: impl Into<PathBuf>,
        locks_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            exe: exe.into(),
            project: project.into(),
            locks_dir: locks_dir.into(),
            timeout,
            execute_method: None,
        }
    }

    pub fn with_execute_method(mut self, method: Option<String>) -> Self {
        self.execute_method = method;
        self
    }

    /// Arguments of the registration launch
    pub fn command_args(&self) -> Vec<String> {
        let layout = ProjectLayout::new(&self.project);
        let mut args = vec![
            "-batchmode".to_string(),
            "-nographics".to_string(),
            "-quit".to_string(),
            "-projectPath".to_string(),
            self.project.display().to_string(),
            "-logFile".to_string(),
            layout.registration_log().display().to_string(),
        ];
        if let Some(method) = &self.execute_method {
            args.push("-executeMethod".to_string());
            args.push(method.clone());
        }
        args
    }

    /// Fingerprint of everything that makes a registration current.
    pub fn fingerprint(&self, port: u16) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.exe.to_string_lossy().as_bytes());
        hasher.update(b"\n");
        hasher.update(self.project.to_string_lossy().as_bytes());
        hasher.update(b"\n");
        hasher.update(port.to_string().as_bytes());
        hasher.update(b"\n");
        hasher.update(self.execute_method.as_deref().unwrap_or("").as_bytes());
        hex::encode(hasher.finalize())
    }

    fn stamp_matches(&self, fingerprint: &str) -> bool {
        let stamp = ProjectLayout::new(&self.project).registration_stamp();
        fs::read_to_string(stamp)
            .map(|s| s.trim() == fingerprint)
            .unwrap_or(false)
    }

    fn write_stamp(&self, fingerprint: &str) -> Result<()> {
        let layout = ProjectLayout::new(&self.project);
        fs::create_dir_all(layout.harness_dir())?;
        fs::write(layout.registration_stamp(), format!("{}\n", fingerprint))?;
        Ok(())
    }

    /// Register `port` unless nothing changed. Never fails: problems are
    /// logged and reported as [`RegistrationOutcome::Failed`].
    pub async fn register(&self, port: u16, config_changed: bool) -> RegistrationOutcome {
        if !config_changed {
            debug!("Worker config unchanged, skipping port registration");
            return RegistrationOutcome::SkippedUnchanged;
        }

        let fingerprint = self.fingerprint(port);
        if self.stamp_matches(&fingerprint) {
            debug!("Port {} already registered for {}", port, self.project.display());
            return RegistrationOutcome::SkippedAlreadyRegistered;
        }

        match self.register_locked(port, &fingerprint).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Port registration failed: {}", e);
                RegistrationOutcome::Failed(e.to_string())
            }
        }
    }

    async fn register_locked(&self, port: u16, fingerprint: &str) -> Result<RegistrationOutcome> {
        let lock = ExclusiveStateLock::port_registration(&self.locks_dir)?;
        let _guard = lock.acquire_async().await?;

        if self.stamp_matches(fingerprint) {
            return Ok(RegistrationOutcome::SkippedAlreadyRegistered);
        }

        fs::create_dir_all(ProjectLayout::new(&self.project).harness_dir())?;
        info!("Registering port {} for {}", port, self.project.display());
        let start = Instant::now();

        let mut child = match Command::new(&self.exe)
            .args(self.command_args())
            .current_dir(&self.project)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return Ok(RegistrationOutcome::Failed(format!(
                    "failed to spawn {}: {}",
                    self.exe.display(),
                    e
                )))
            }
        };

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                let _ = child.kill().await;
                return Ok(RegistrationOutcome::Failed(format!(
                    "timed out after {:.1}s, see {}",
                    start.elapsed().as_secs_f64(),
                    ProjectLayout::new(&self.project).registration_log().display()
                )));
            }
        };

        if !status.success() {
            return Ok(RegistrationOutcome::Failed(format!(
                "registration launch exited with {}, see {}",
                status,
                ProjectLayout::new(&self.project).registration_log().display()
            )));
        }

        self.write_stamp(fingerprint)?;
        info!("Port {} registered in {:.1}s", port, start.elapsed().as_secs_f64());
        Ok(RegistrationOutcome::Registered)
    }

    pub fn project(&self) -> &Path {
        &self.project
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_args() {
        let r = PortRegistrar::new("/opt/editor", "/work/P", "/tmp/locks", Duration::from_secs(1))
            .with_execute_method(Some("Bridge.Register".to_string()));
        let args = r.command_args();
        assert_eq!(&args[..3], &["-batchmode", "-nographics", "-quit"]);
        assert_eq!(args[3], "-projectPath");
        assert_eq!(args[4], "/work/P");
        assert_eq!(args[5], "-logFile");
        assert!(args[6].ends_with("port_registration.log"));
        assert_eq!(&args[7..], &["-executeMethod", "Bridge.Register"]);
    }

    #[test]
    fn test_fingerprint_tracks_port_and_method() {
        let r = PortRegistrar::new("/opt/editor", "/work/P", "/tmp/locks", Duration::from_secs(1));
        assert_eq!(r.fingerprint(17545), r.fingerprint(17545));
        assert_ne!(r.fingerprint(17545), r.fingerprint(17546));
        let with_method = r.clone().with_execute_method(Some("M".to_string()));
        assert_ne!(r.fingerprint(17545), with_method.fingerprint(17545));
    }

    #[tokio::test]
    async fn test_unchanged_config_skips_without_launch() {
        let dir = tempfile::tempdir().unwrap();
        let r = PortRegistrar::new(
            dir.path().join("missing-editor"),
            dir.path(),
            dir.path().join("locks"),
            Duration::from_secs(1),
        );
        assert_eq!(r.register(17545, false).await, RegistrationOutcome::SkippedUnchanged);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let r = PortRegistrar::new(
            dir.path().join("missing-editor"),
            dir.path(),
            dir.path().join("locks"),
            Duration::from_secs(1),
        );
        assert!(matches!(r.register(17545, true).await, RegistrationOutcome::Failed(_)));
        assert!(!ProjectLayout::new(dir.path()).registration_stamp().exists());
    }
}
