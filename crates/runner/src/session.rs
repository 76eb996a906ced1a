//! Worker session: one worker's project, editor and RPC connection
//!
//! A session wires the components together for one test worker. `setup`
//! provisions the project copy, writes its config, resolves the editor,
//! registers the port and launches (or, in serial mode, attaches to) the
//! editor. `run_case` brackets a test body with preparation and resync.

use crate::config::{HarnessConfig, ENV_WORKER, ENV_WORKER_PROJECT_PATH};
use crate::lifecycle::{InstanceConfig, InstanceHandle, InstanceManager};
use crate::provisioner::{ProjectLayout, ProjectProvisioner, ProvisionReport};
use crate::registrar::{PortRegistrar, RegistrationOutcome};
use crate::resolver::ExecutableResolver;
use crate::resync::{ResyncOutcome, StateResyncManager};
use chrono::{DateTime, Utc};
use edharness_common::{
    CleanupLevel, EditorTools, Error, ExclusiveStateLock, Result, RpcClient, RpcClientConfig,
    TestMetadata, TestOutcome, WorkerId,
};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// How workers share editor instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// One shared instance; an already running editor is reused
    Serial,
    /// Each worker owns its instance and project copy
    Parallel,
}

/// Result of one test case
#[derive(Debug, Clone, Serialize)]
pub struct CaseReport {
    pub name: String,
    pub outcome: TestOutcome,
    pub error: Option<String>,
    pub declared_level: CleanupLevel,
    pub applied_level: CleanupLevel,
    pub resync: ResyncOutcome,
    pub duration_ms: u64,
}

/// Result of all cases a worker ran
#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub worker: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cases: Vec<CaseReport>,
}

impl SuiteReport {
    pub fn new(worker: &WorkerId) -> Self {
        Self {
            worker: worker.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            total: 0,
            passed: 0,
            failed: 0,
            skipped: 0,
            cases: Vec::new(),
        }
    }

    pub fn record(&mut self, case: CaseReport) {
        self.total += 1;
        match case.outcome {
            TestOutcome::Passed => self.passed += 1,
            TestOutcome::Failed => self.failed += 1,
            TestOutcome::Skipped => self.skipped += 1,
        }
        self.cases.push(case);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
        info!(
            "Results for {}: {} passed, {} failed, {} skipped",
            self.worker, self.passed, self.failed, self.skipped
        );
    }

    pub fn write_json(&self, path: &Path) -> Result<PathBuf> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("Results written to {}", path.display());
        Ok(path.to_path_buf())
    }
}

/// RPC client config that runs the bridge through the project's launcher.
pub fn bridge_rpc_config(config: &HarnessConfig, project: &Path) -> RpcClientConfig {
    let launcher = ProjectLayout::new(project).launcher();
    let mut rpc = if cfg!(windows) {
        let mut rpc = RpcClientConfig::new("cmd");
        rpc.args = vec!["/C".to_string(), launcher.display().to_string()];
        rpc
    } else {
        let mut rpc = RpcClientConfig::new("/bin/sh");
        rpc.args = vec![launcher.display().to_string()];
        rpc
    };
    rpc.working_dir = Some(project.to_path_buf());
    rpc.envs = vec![(
        ENV_WORKER_PROJECT_PATH.to_string(),
        project.display().to_string(),
    )];
    rpc.request_timeout = config.request_timeout();
    rpc.protocol_version = config.rpc.protocol_version.clone();
    rpc
}

fn worker_env(worker: &WorkerId, project: &Path) -> Vec<(String, String)> {
    vec![
        (ENV_WORKER.to_string(), worker.to_string()),
        (
            ENV_WORKER_PROJECT_PATH.to_string(),
            project.display().to_string(),
        ),
    ]
}

/// One worker's provisioned project, running editor and RPC connection
pub struct WorkerSession {
    config: HarnessConfig,
    worker: WorkerId,
    mode: SessionMode,
    provisioner: ProjectProvisioner,
    provision: ProvisionReport,
    port: u16,
    exe: PathBuf,
    registration: Option<RegistrationOutcome>,
    instance: InstanceManager,
    tools: Option<EditorTools>,
}

impl WorkerSession {
    pub async fn setup(config: HarnessConfig, worker: WorkerId, mode: SessionMode) -> Result<Self> {
        info!("Setting up worker {} ({:?})", worker, mode);

        let provisioner = ProjectProvisioner::new(
            config.project_path.clone(),
            worker.clone(),
            config.workers.clone(),
        );
        let provision = {
            let provisioner = provisioner.clone();
            tokio::task::spawn_blocking(move || provisioner.provision())
                .await
                .map_err(|e| Error::Internal(format!("provisioning task failed: {}", e)))??
        };

        let port = provisioner.port()?;
        let config_changed = provisioner.write_worker_config(port)?;
        let project = provisioner.project_path().to_path_buf();

        let exe = ExecutableResolver::from_config(&config.editor).resolve(&project)?;

        let registration = if mode == SessionMode::Parallel && !worker.is_primary() {
            let registrar = PortRegistrar::new(
                &exe,
                &project,
                &config.locks_dir,
                config.registration_timeout(),
            )
            .with_execute_method(config.editor.registration_method.clone());
            Some(registrar.register(port, config_changed).await)
        } else {
            None
        };

        let mut instance = InstanceManager::new(InstanceConfig {
            exe: exe.clone(),
            project: project.clone(),
            port,
            poll_interval: config.health_poll_interval(),
            health_timeout: config.health_request_timeout(),
            stop_grace: config.stop_grace(),
            envs: worker_env(&worker, &project),
        })?;

        let attached = mode == SessionMode::Serial && instance.attach().await;
        if !attached {
            instance.start(config.startup_timeout()).await?;
        }

        Ok(Self {
            config,
            worker,
            mode,
            provisioner,
            provision,
            port,
            exe,
            registration,
            instance,
            tools: None,
        })
    }

    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn project_path(&self) -> &Path {
        self.provisioner.project_path()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn executable(&self) -> &Path {
        &self.exe
    }

    pub fn provision_report(&self) -> &ProvisionReport {
        &self.provision
    }

    pub fn registration(&self) -> Option<&RegistrationOutcome> {
        self.registration.as_ref()
    }

    pub fn instance(&self) -> Option<&InstanceHandle> {
        self.instance.handle()
    }

    /// Variables every process started for this worker receives.
    pub fn env(&self) -> Vec<(String, String)> {
        worker_env(&self.worker, self.project_path())
    }

    pub fn state_lock(&self) -> Result<ExclusiveStateLock> {
        ExclusiveStateLock::for_project(&self.config.locks_dir, self.project_path())
    }

    /// Start the RPC bridge through the worker's launcher. Reuses an open
    /// connection.
    pub async fn connect(&mut self) -> Result<EditorTools> {
        if let Some(tools) = &self.tools {
            if tools.client().is_open() {
                return Ok(tools.clone());
            }
        }

        let mut rpc = bridge_rpc_config(&self.config, self.project_path());
        rpc.envs = self.env();
        let client = Arc::new(RpcClient::start(rpc).await?);
        let tools = EditorTools::new(client).with_retry(self.config.retry_policy());
        self.tools = Some(tools.clone());
        Ok(tools)
    }

    pub fn resync_manager(&self, tools: EditorTools) -> Result<StateResyncManager<EditorTools>> {
        Ok(StateResyncManager::new(
            tools,
            self.state_lock()?,
            self.config.resync.clone(),
        ))
    }

    /// Run one test case: pre-test preparation, the body, then the resync
    /// its metadata declares (Full after a failure). Cleanup problems never
    /// change the case outcome.
    pub async fn run_case<F, Fut>(&mut self, meta: &TestMetadata, body: F) -> Result<CaseReport>
    where
        F: FnOnce(EditorTools) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let tools = self.connect().await?;
        let resync = self.resync_manager(tools.clone())?;
        let declared_level = meta.cleanup_level();

        resync.prepare(declared_level).await;

        let start = Instant::now();
        let (outcome, error_text) = match AssertUnwindSafe(body(tools)).catch_unwind().await {
            Ok(Ok(())) => (TestOutcome::Passed, None),
            Ok(Err(e)) => (TestOutcome::Failed, Some(format!("{:#}", e))),
            Err(_) => (TestOutcome::Failed, Some("test body panicked".to_string())),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        match &error_text {
            None => info!("✓ {} ({} ms)", meta.name, duration_ms),
            Some(e) => error!("✗ {} - {}", meta.name, e),
        }

        let applied_level = declared_level.after_outcome(outcome);
        if applied_level != declared_level {
            info!("{} failed, escalating cleanup to {}", meta.name, applied_level);
        }
        let resync_outcome = resync.resync(applied_level).await;

        Ok(CaseReport {
            name: meta.name.clone(),
            outcome,
            error: error_text,
            declared_level,
            applied_level,
            resync: resync_outcome,
            duration_ms,
        })
    }

    /// Close the bridge, stop the editor we launched and optionally remove
    /// the worker's project copy.
    pub async fn teardown(mut self, remove_copy: bool) -> Result<()> {
        info!("Tearing down worker {}", self.worker);

        if let Some(tools) = self.tools.take() {
            if let Err(e) = tools.client().stop().await {
                warn!("Failed to stop RPC bridge: {}", e);
            }
        }

        self.instance.stop().await?;

        if remove_copy {
            let provisioner = self.provisioner.clone();
            tokio::task::spawn_blocking(move || provisioner.cleanup())
                .await
                .map_err(|e| Error::Internal(format!("cleanup task failed: {}", e)))??;
        }
        Ok(())
    }
}
