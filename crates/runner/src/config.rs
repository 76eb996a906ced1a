//! Harness configuration

use edharness_common::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the editor executable.
pub const ENV_EDITOR_EXE: &str = "EDHARNESS_EDITOR_EXE";
/// Environment variable naming the current worker (`master`, `gw0`, ...).
pub const ENV_WORKER: &str = "EDHARNESS_WORKER";
/// Exported by session setup so test bodies can find their project copy.
pub const ENV_WORKER_PROJECT_PATH: &str = "EDHARNESS_WORKER_PROJECT_PATH";
/// `true` keeps an existing worker copy as is.
pub const ENV_SKIP_SYNC: &str = "EDHARNESS_SKIP_SYNC";
/// Directory holding the state and registration lock files.
pub const ENV_LOCKS_DIR: &str = "EDHARNESS_LOCKS_DIR";

/// Harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Canonical project every worker copy derives from
    pub project_path: PathBuf,

    /// Lock file directory shared by all workers on the machine
    pub locks_dir: PathBuf,

    /// Editor executable and process settings
    pub editor: EditorConfig,

    /// RPC bridge settings
    pub rpc: RpcConfig,

    /// Worker project and port settings
    pub workers: WorkersConfig,

    /// Between-test resync settings
    pub resync: ResyncConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            project_path: PathBuf::from("."),
            locks_dir: edharness_common::default_locks_dir(),
            editor: EditorConfig::default(),
            rpc: RpcConfig::default(),
            workers: WorkersConfig::default(),
            resync: ResyncConfig::default(),
        }
    }
}

/// Editor-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    /// Explicit executable; ignored with a warning when it does not exist
    pub executable: Option<PathBuf>,

    /// JSON file holding a custom install root as a bare string
    pub install_registry_file: Option<PathBuf>,

    /// Standard and alternate install roots, searched in order
    pub install_roots: Vec<PathBuf>,

    /// Fixed per-volume roots searched last
    pub drive_roots: Vec<PathBuf>,

    /// Executable path below `<root>/<version>/`
    pub exe_relative_path: PathBuf,

    pub startup_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL on stop
    pub stop_grace_secs: u64,

    pub health_poll_interval_ms: u64,

    pub health_request_timeout_ms: u64,

    pub registration_timeout_secs: u64,

    /// Optional `-executeMethod` for the registration launch
    pub registration_method: Option<String>,
}

impl Default for EditorConfig {
    fn default() -> Self {
        let (install_roots, drive_roots, exe_relative_path) = platform_install_layout();
        Self {
            executable: None,
            install_registry_file: default_install_registry_file(),
            install_roots,
            drive_roots,
            exe_relative_path,
            startup_timeout_secs: 120,
            stop_grace_secs: 10,
            health_poll_interval_ms: 2000,
            health_request_timeout_ms: 2000,
            registration_timeout_secs: 180,
            registration_method: None,
        }
    }
}

#[cfg(windows)]
fn platform_install_layout() -> (Vec<PathBuf>, Vec<PathBuf>, PathBuf) {
    (
        vec![
            PathBuf::from("C:/Program Files/Unity/Hub/Editor"),
            PathBuf::from("C:/Program Files/Unity/Editor"),
        ],
        vec![
            PathBuf::from("D:/Program Files/Unity/Hub/Editor"),
            PathBuf::from("D:/Unity/Hub/Editor"),
            PathBuf::from("E:/Unity/Hub/Editor"),
        ],
        PathBuf::from("Editor/Unity.exe"),
    )
}

#[cfg(target_os = "macos")]
fn platform_install_layout() -> (Vec<PathBuf>, Vec<PathBuf>, PathBuf) {
    (
        vec![
            PathBuf::from("/Applications/Unity/Hub/Editor"),
            PathBuf::from("/Applications/Unity"),
        ],
        Vec::new(),
        PathBuf::from("Unity.app/Contents/MacOS/Unity"),
    )
}

#[cfg(not(any(windows, target_os = "macos")))]
fn platform_install_layout() -> (Vec<PathBuf>, Vec<PathBuf>, PathBuf) {
    let home = home_dir().unwrap_or_else(|| PathBuf::from("/root"));
    (
        vec![home.join("Unity/Hub/Editor"), PathBuf::from("/opt/unity/Hub/Editor")],
        Vec::new(),
        PathBuf::from("Editor/Unity"),
    )
}

fn default_install_registry_file() -> Option<PathBuf> {
    if cfg!(windows) {
        std::env::var_os("APPDATA")
            .map(|dir| PathBuf::from(dir).join("UnityHub/secondaryInstallPath.json"))
    } else if cfg!(target_os = "macos") {
        home_dir().map(|home| {
            home.join("Library/Application Support/UnityHub/secondaryInstallPath.json")
        })
    } else {
        home_dir().map(|home| home.join(".config/UnityHub/secondaryInstallPath.json"))
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// RPC bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub request_timeout_secs: u64,

    /// Attempts for calls that retry transient editor faults
    pub retry_attempts: u32,

    pub retry_delay_ms: u64,

    pub protocol_version: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 120,
            retry_attempts: 5,
            retry_delay_ms: 3000,
            protocol_version: edharness_common::rpc::DEFAULT_PROTOCOL_VERSION.to_string(),
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Worker `gwN` listens on `base_port + N`
    pub base_port: u16,

    /// Primary port when the canonical settings file has none
    pub primary_fallback_port: u16,

    /// Keep existing worker copies without syncing
    pub skip_sync: bool,

    /// Package that ships the bridge's server script
    pub bridge_package: String,

    /// Program that runs the bridge's server script
    pub node_program: String,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            base_port: 17542,
            primary_fallback_port: 17932,
            skip_sync: false,
            bridge_package: "dev.polyblank.nyamu".to_string(),
            node_program: "node".to_string(),
        }
    }
}

/// State resync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResyncConfig {
    pub idle_timeout_secs: u64,

    pub idle_poll_interval_ms: u64,

    /// Pause after a clean minimal check
    pub settle_delay_ms: u64,

    pub compile_timeout_secs: u64,

    pub refresh_attempts: u32,

    pub refresh_retry_delay_ms: u64,
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30,
            idle_poll_interval_ms: 200,
            settle_delay_ms: 100,
            compile_timeout_secs: 30,
            refresh_attempts: 3,
            refresh_retry_delay_ms: 1000,
        }
    }
}

impl ResyncConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_secs)
    }

    pub fn refresh_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.refresh_attempts,
            Duration::from_millis(self.refresh_retry_delay_ms),
        )
    }
}

impl HarnessConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Layer the process environment on top of the file values.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Layer variables from `lookup` on top of the file values.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(exe) = lookup(ENV_EDITOR_EXE).filter(|v| !v.is_empty()) {
            self.editor.executable = Some(PathBuf::from(exe));
        }
        if let Some(skip) = lookup(ENV_SKIP_SYNC) {
            self.workers.skip_sync = skip.eq_ignore_ascii_case("true");
        }
        if let Some(dir) = lookup(ENV_LOCKS_DIR).filter(|v| !v.is_empty()) {
            self.locks_dir = PathBuf::from(dir);
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.editor.startup_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.editor.stop_grace_secs)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.editor.health_poll_interval_ms)
    }

    pub fn health_request_timeout(&self) -> Duration {
        Duration::from_millis(self.editor.health_request_timeout_ms)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.editor.registration_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.rpc.retry_attempts,
            Duration::from_millis(self.rpc.retry_delay_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.workers.base_port, 17542);
        assert_eq!(config.workers.primary_fallback_port, 17932);
        assert_eq!(config.stop_grace(), Duration::from_secs(10));
        assert_eq!(config.health_poll_interval(), Duration::from_secs(2));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.resync.refresh_retry().max_attempts, 3);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = HarnessConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.workers.base_port, 17542);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/edharness.toml");

        let mut config = HarnessConfig::default();
        config.project_path = PathBuf::from("/work/Project");
        config.workers.base_port = 20000;
        config.editor.registration_method = Some("Bridge.Register".to_string());
        config.save(&path).unwrap();

        let loaded = HarnessConfig::load(&path).unwrap();
        assert_eq!(loaded.project_path, PathBuf::from("/work/Project"));
        assert_eq!(loaded.workers.base_port, 20000);
        assert_eq!(loaded.editor.registration_method.as_deref(), Some("Bridge.Register"));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edharness.toml");
        std::fs::write(&path, "[workers]\nbase_port = 18000\n").unwrap();

        let config = HarnessConfig::load(&path).unwrap();
        assert_eq!(config.workers.base_port, 18000);
        assert_eq!(config.workers.primary_fallback_port, 17932);
        assert_eq!(config.resync.idle_timeout_secs, 30);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_EDITOR_EXE, "/opt/editor/bin/editor"),
            (ENV_SKIP_SYNC, "TRUE"),
            (ENV_LOCKS_DIR, "/tmp/locks"),
        ]
        .into_iter()
        .collect();

        let mut config = HarnessConfig::default();
        config.apply_env_from(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.editor.executable, Some(PathBuf::from("/opt/editor/bin/editor")));
        assert!(config.workers.skip_sync);
        assert_eq!(config.locks_dir, PathBuf::from("/tmp/locks"));

        config.apply_env_from(|key| (key == ENV_SKIP_SYNC).then(|| "false".to_string()));
        assert!(!config.workers.skip_sync);
    }
}
