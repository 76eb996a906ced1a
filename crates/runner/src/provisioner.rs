//! Per-worker project copies
//!
//! Every worker except the primary drives its own copy of the canonical
//! project, placed next to it as `<name>.worker_<label>`. The first
//! provisioning copies the directories the editor needs to open the project;
//! later runs only mirror `Assets` and `Packages`.

use crate::config::WorkersConfig;
use edharness_common::{Error, Result, SyncState, WorkerId};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Directories copied when a worker project is first created.
pub const FULL_COPY_DIRS: &[&str] = &[
    "Assets",
    "Packages",
    "ProjectSettings",
    "Library/PackageCache",
];

/// Directories mirrored on every later provisioning.
pub const SYNC_DIRS: &[&str] = &["Assets", "Packages"];

/// Harness-owned files inside a project
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    root: PathBuf,
}

impl ProjectLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn harness_dir(&self) -> PathBuf {
        self.root.join(".harness")
    }

    pub fn settings(&self) -> PathBuf {
        self.harness_dir().join("settings.json")
    }

    pub fn launcher(&self) -> PathBuf {
        if cfg!(windows) {
            self.harness_dir().join("launch.bat")
        } else {
            self.harness_dir().join("launch.sh")
        }
    }

    pub fn editor_log(&self) -> PathBuf {
        self.harness_dir().join("editor.log")
    }

    pub fn bridge_log(&self) -> PathBuf {
        self.harness_dir().join("mcp-server.log")
    }

    pub fn registration_log(&self) -> PathBuf {
        self.harness_dir().join("port_registration.log")
    }

    pub fn registration_stamp(&self) -> PathBuf {
        self.harness_dir().join("port_registration.stamp")
    }

    pub fn version_file(&self) -> PathBuf {
        self.root.join("ProjectSettings").join("ProjectVersion.txt")
    }
}

/// Result of one provisioning pass
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionReport {
    pub path: PathBuf,
    pub state_before: SyncState,
    pub files_copied: usize,
    pub files_removed: usize,
}

/// Creates, syncs and removes one worker's project copy
#[derive(Debug, Clone)]
pub struct ProjectProvisioner {
    canonical: PathBuf,
    worker: WorkerId,
    worker_path: PathBuf,
    config: WorkersConfig,
}

impl ProjectProvisioner {
    pub fn new(canonical: impl Into<PathBuf>, worker: WorkerId, config: WorkersConfig) -> Self {
        let canonical = canonical.into();
        let worker_path = Self::worker_project_path(&canonical, &worker);
        Self {
            canonical,
            worker,
            worker_path,
            config,
        }
    }

    /// Project path a worker drives: the canonical one for the primary,
    /// a `.worker_<label>` sibling otherwise.
    pub fn worker_project_path(canonical: &Path, worker: &WorkerId) -> PathBuf {
        match worker {
            WorkerId::Primary => canonical.to_path_buf(),
            WorkerId::Worker { label, .. } => {
                let name = canonical
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "project".to_string());
                let parent = canonical.parent().unwrap_or_else(|| Path::new("."));
                parent.join(format!("{}.worker_{}", name, label))
            }
        }
    }

    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    pub fn canonical_path(&self) -> &Path {
        &self.canonical
    }

    pub fn project_path(&self) -> &Path {
        &self.worker_path
    }

    pub fn layout(&self) -> ProjectLayout {
        ProjectLayout::new(&self.worker_path)
    }

    /// Port this worker's editor listens on.
    pub fn port(&self) -> Result<u16> {
        match &self.worker {
            WorkerId::Primary => {
                let settings = ProjectLayout::new(&self.canonical).settings();
                Ok(read_configured_port(&settings).unwrap_or(self.config.primary_fallback_port))
            }
            WorkerId::Worker { label, ordinal } => self
                .config
                .base_port
                .checked_add(*ordinal)
                .ok_or_else(|| {
                    Error::InvalidConfig(format!(
                        "port for worker {} overflows (base {})",
                        label, self.config.base_port
                    ))
                }),
        }
    }

    pub fn sync_state(&self) -> Result<SyncState> {
        if self.worker.is_primary() {
            return Ok(SyncState::UpToDate);
        }
        if !self.worker_path.exists() {
            return Ok(SyncState::Absent);
        }
        let incomplete = FULL_COPY_DIRS
            .iter()
            .any(|dir| self.canonical.join(dir).is_dir() && !self.worker_path.join(dir).is_dir());
        if incomplete {
            return Ok(SyncState::FullCopyNeeded);
        }
        if self.config.skip_sync {
            return Ok(SyncState::UpToDate);
        }
        if self.plan_sync()?.is_empty() {
            Ok(SyncState::UpToDate)
        } else {
            Ok(SyncState::IncrementalSyncNeeded)
        }
    }

    /// Create or sync the worker copy. The primary is never touched.
    pub fn provision(&self) -> Result<ProvisionReport> {
        let state_before = self.sync_state()?;
        let mut report = ProvisionReport {
            path: self.worker_path.clone(),
            state_before,
            files_copied: 0,
            files_removed: 0,
        };

        if !self.canonical.is_dir() {
            return Err(Error::NotFound {
                what: "Project".to_string(),
                detail: self.canonical.display().to_string(),
                hint: "Set project_path in the config or pass --project".to_string(),
            });
        }

        match state_before {
            SyncState::UpToDate => {
                if self.config.skip_sync && !self.worker.is_primary() {
                    info!("Skipping project sync for {} (skip_sync)", self.worker);
                }
            }
            SyncState::Absent | SyncState::FullCopyNeeded => {
                info!(
                    "Creating project copy for {} at {}",
                    self.worker,
                    self.worker_path.display()
                );
                report.files_copied = self.full_copy()?;
            }
            SyncState::IncrementalSyncNeeded => {
                info!("Syncing project for {}", self.worker);
                let plan = self.plan_sync()?;
                report.files_copied = plan.copies.len();
                report.files_removed = plan.removals.len();
                plan.apply()?;
            }
        }

        debug!(
            "Provisioned {} ({} copied, {} removed)",
            self.worker_path.display(),
            report.files_copied,
            report.files_removed
        );
        Ok(report)
    }

    fn full_copy(&self) -> Result<usize> {
        fs::create_dir_all(&self.worker_path)?;
        let mut copied = 0;

        for dir in FULL_COPY_DIRS {
            let src = self.canonical.join(dir);
            if !src.is_dir() {
                continue;
            }
            let dst = self.worker_path.join(dir);
            if dst.exists() {
                fs::remove_dir_all(&dst)?;
            }
            debug!("Copying {}/", dir);
            copied += copy_tree(&src, &dst)?;
        }

        Ok(copied)
    }

    /// Files to copy and delete so the synced directories match the
    /// canonical project.
    pub fn plan_sync(&self) -> Result<SyncPlan> {
        let mut plan = SyncPlan::default();

        for dir in SYNC_DIRS {
            let src_root = self.canonical.join(dir);
            let dst_root = self.worker_path.join(dir);

            if src_root.is_dir() {
                for entry in WalkDir::new(&src_root) {
                    let entry = entry.map_err(walk_error)?;
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let rel = relative(entry.path(), &src_root)?;
                    let dst = dst_root.join(&rel);
                    if needs_copy(entry.path(), &dst)? {
                        plan.copies.push((entry.path().to_path_buf(), dst));
                    }
                }
            }

            if dst_root.is_dir() {
                for entry in WalkDir::new(&dst_root).contents_first(true) {
                    let entry = entry.map_err(walk_error)?;
                    let rel = relative(entry.path(), &dst_root)?;
                    if !src_root.join(&rel).exists() {
                        plan.removals.push(entry.path().to_path_buf());
                    }
                }
            }
        }

        Ok(plan)
    }

    /// Write the worker's settings file and launcher. Returns whether either
    /// changed on disk. The primary's existing settings file is left alone.
    pub fn write_worker_config(&self, port: u16) -> Result<bool> {
        let layout = self.layout();
        fs::create_dir_all(layout.harness_dir())?;

        let mut changed = false;

        if !(self.worker.is_primary() && layout.settings().exists()) {
            let settings = json!({
                "MonoBehaviour": {
                    "serverPort": port,
                    "manualPortMode": true,
                    "responseCharacterLimit": 25000,
                    "enableTruncation": true,
                    "minLogLevel": 0
                }
            });
            let json = serde_json::to_string_pretty(&settings)?;
            changed |= write_if_changed(&layout.settings(), &json)?;
        }

        let script = self
            .canonical
            .join("Packages")
            .join(&self.config.bridge_package)
            .join("Node")
            .join("mcp-server.js");
        let launcher =
            launcher_script(&self.config.node_program, &script, port, &layout.bridge_log());
        let launcher_changed = write_if_changed(&layout.launcher(), &launcher)?;
        #[cfg(unix)]
        {
            if launcher_changed {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(layout.launcher(), fs::Permissions::from_mode(0o755))?;
            }
        }
        changed |= launcher_changed;

        if changed {
            info!("Wrote harness config for {} on port {}", self.worker, port);
        }
        Ok(changed)
    }

    /// Remove the worker copy. Never touches the canonical project.
    pub fn cleanup(&self) -> Result<bool> {
        if self.worker.is_primary() || self.worker_path == self.canonical {
            return Ok(false);
        }
        if !self.worker_path.exists() {
            return Ok(false);
        }
        info!("Removing worker project {}", self.worker_path.display());
        fs::remove_dir_all(&self.worker_path)?;
        Ok(true)
    }
}

/// Pending incremental sync operations
#[derive(Debug, Default)]
pub struct SyncPlan {
    pub copies: Vec<(PathBuf, PathBuf)>,
    /// Files and directories, deepest first
    pub removals: Vec<PathBuf>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.copies.is_empty() && self.removals.is_empty()
    }

    pub fn apply(&self) -> Result<()> {
        for path in &self.removals {
            let result = if path.is_dir() {
                fs::remove_dir_all(path)
            } else {
                fs::remove_file(path)
            };
            match result {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        for (src, dst) in &self.copies {
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(src, dst)?;
        }

        Ok(())
    }
}

/// Port stored in a project's settings file, if valid.
pub fn read_configured_port(settings: &Path) -> Option<u16> {
    let content = fs::read_to_string(settings).ok()?;
    let value: serde_json::Value = match serde_json::from_str(&content) {
        Ok(value) => value,
        Err(e) => {
            warn!("Ignoring malformed {}: {}", settings.display(), e);
            return None;
        }
    };
    value
        .get("MonoBehaviour")?
        .get("serverPort")?
        .as_u64()
        .and_then(|port| u16::try_from(port).ok())
        .filter(|port| *port != 0)
}

fn launcher_script(node: &str, script: &Path, port: u16, log: &Path) -> String {
    if cfg!(windows) {
        format!(
            "@echo off\r\n{} \"{}\" --port {} --log-file \"{}\" %*\r\n",
            node,
            script.display(),
            port,
            log.display()
        )
    } else {
        format!(
            "#!/bin/sh\nexec {} \"{}\" --port {} --log-file \"{}\" \"$@\"\n",
            node,
            script.display(),
            port,
            log.display()
        )
    }
}

fn write_if_changed(path: &Path, content: &str) -> Result<bool> {
    if fs::read_to_string(path).ok().as_deref() == Some(content) {
        return Ok(false);
    }
    fs::write(path, content)?;
    Ok(true)
}

fn copy_tree(src: &Path, dst: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(walk_error)?;
        let target = dst.join(relative(entry.path(), src)?);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

fn needs_copy(src: &Path, dst: &Path) -> Result<bool> {
    let dst_meta = match fs::metadata(dst) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    };
    if !dst_meta.is_file() {
        return Ok(true);
    }
    let src_meta = fs::metadata(src)?;
    if src_meta.len() != dst_meta.len() {
        return Ok(true);
    }
    // Same size: compare content, mtimes say nothing about edits in the copy
    Ok(file_digest(src)? != file_digest(dst)?)
}

fn file_digest(path: &Path) -> Result<Vec<u8>> {
    let mut hasher = Sha256::new();
    let mut file = fs::File::open(path)?;
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_vec())
}

fn relative(path: &Path, root: &Path) -> Result<PathBuf> {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .map_err(|e| {
            Error::Internal(format!(
                "{} outside {}: {}",
                path.display(),
                root.display(),
                e
            ))
        })
}

fn walk_error(e: walkdir::Error) -> Error {
    match e.into_io_error() {
        Some(io) => Error::Io(io),
        None => Error::Internal("filesystem loop while walking project".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canonical_project(root: &Path) -> PathBuf {
        let project = root.join("Project");
        fs::create_dir_all(project.join("Assets/Scripts")).unwrap();
        fs::create_dir_all(project.join("Packages")).unwrap();
        fs::create_dir_all(project.join("ProjectSettings")).unwrap();
        fs::create_dir_all(project.join("Library/PackageCache/com.example")).unwrap();
        fs::create_dir_all(project.join("Library/ScriptAssemblies")).unwrap();
        fs::write(project.join("Assets/Scripts/Player.cs"), "class Player {}").unwrap();
        fs::write(project.join("Packages/manifest.json"), "{}").unwrap();
        fs::write(
            project.join("ProjectSettings/ProjectVersion.txt"),
            "m_EditorVersion: 2022.3.50f1\n",
        )
        .unwrap();
        fs::write(project.join("Library/PackageCache/com.example/package.json"), "{}").unwrap();
        fs::write(project.join("Library/ScriptAssemblies/Game.dll"), "bin").unwrap();
        project
    }

    fn worker(label: &str) -> WorkerId {
        label.parse().unwrap()
    }

    #[test]
    fn test_worker_paths() {
        let canonical = Path::new("/work/Game");
        assert_eq!(
            ProjectProvisioner::worker_project_path(canonical, &WorkerId::Primary),
            PathBuf::from("/work/Game")
        );
        assert_eq!(
            ProjectProvisioner::worker_project_path(canonical, &worker("gw3")),
            PathBuf::from("/work/Game.worker_gw3")
        );
    }

    #[test]
    fn test_worker_port_is_base_plus_ordinal() {
        let p = ProjectProvisioner::new("/work/Game", worker("gw3"), WorkersConfig::default());
        assert_eq!(p.port().unwrap(), 17545);

        let p = ProjectProvisioner::new("/work/Game", worker("gw0"), WorkersConfig::default());
        assert_eq!(p.port().unwrap(), 17542);
    }

    #[test]
    fn test_primary_port_from_settings_or_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let project = canonical_project(dir.path());

        let p = ProjectProvisioner::new(&project, WorkerId::Primary, WorkersConfig::default());
        assert_eq!(p.port().unwrap(), 17932);

        let layout = ProjectLayout::new(&project);
        fs::create_dir_all(layout.harness_dir()).unwrap();
        fs::write(layout.settings(), r#"{"MonoBehaviour": {"serverPort": 17001}}"#).unwrap();
        assert_eq!(p.port().unwrap(), 17001);

        fs::write(layout.settings(), "not json").unwrap();
        assert_eq!(p.port().unwrap(), 17932);
    }

    #[test]
    fn test_first_provision_copies_required_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let project = canonical_project(dir.path());
        let p = ProjectProvisioner::new(&project, worker("gw1"), WorkersConfig::default());

        assert_eq!(p.sync_state().unwrap(), SyncState::Absent);
        let report = p.provision().unwrap();
        assert_eq!(report.state_before, SyncState::Absent);
        assert_eq!(report.files_copied, 4);

        let copy = p.project_path();
        assert!(copy.join("Assets/Scripts/Player.cs").is_file());
        assert!(copy.join("ProjectSettings/ProjectVersion.txt").is_file());
        assert!(copy.join("Library/PackageCache/com.example/package.json").is_file());
        assert!(!copy.join("Library/ScriptAssemblies").exists());
        assert_eq!(p.sync_state().unwrap(), SyncState::UpToDate);
    }

    #[test]
    fn test_incremental_sync_copies_changes_and_removes_extras() {
        let dir = tempfile::tempdir().unwrap();
        let project = canonical_project(dir.path());
        let p = ProjectProvisioner::new(&project, worker("gw2"), WorkersConfig::default());
        p.provision().unwrap();

        fs::write(project.join("Assets/Scripts/Enemy.cs"), "class Enemy {}").unwrap();
        fs::write(project.join("Assets/Scripts/Player.cs"), "class Player { int hp; }").unwrap();
        fs::write(p.project_path().join("Assets/Scripts/Stale.cs"), "class Stale {}").unwrap();
        fs::create_dir_all(p.project_path().join("Assets/Orphan")).unwrap();
        fs::write(p.project_path().join("Assets/Orphan/a.txt"), "a").unwrap();

        assert_eq!(p.sync_state().unwrap(), SyncState::IncrementalSyncNeeded);
        let report = p.provision().unwrap();
        assert_eq!(report.state_before, SyncState::IncrementalSyncNeeded);
        assert_eq!(report.files_copied, 2);

        let copy = p.project_path();
        assert_eq!(
            fs::read_to_string(copy.join("Assets/Scripts/Player.cs")).unwrap(),
            "class Player { int hp; }"
        );
        assert!(copy.join("Assets/Scripts/Enemy.cs").is_file());
        assert!(!copy.join("Assets/Scripts/Stale.cs").exists());
        assert!(!copy.join("Assets/Orphan").exists());
        assert_eq!(p.sync_state().unwrap(), SyncState::UpToDate);
    }

    #[test]
    fn test_sync_restores_same_size_edit_in_copy() {
        let dir = tempfile::tempdir().unwrap();
        let project = canonical_project(dir.path());
        let p = ProjectProvisioner::new(&project, worker("gw1"), WorkersConfig::default());
        p.provision().unwrap();

        let edited = p.project_path().join("Assets/Scripts/Player.cs");
        fs::write(&edited, "class Broken {}").unwrap();

        assert_eq!(p.sync_state().unwrap(), SyncState::IncrementalSyncNeeded);
        let report = p.provision().unwrap();
        assert_eq!(report.files_copied, 1);
        assert_eq!(fs::read_to_string(&edited).unwrap(), "class Player {}");
        assert_eq!(p.sync_state().unwrap(), SyncState::UpToDate);
    }

    #[test]
    fn test_skip_sync_keeps_existing_copy() {
        let dir = tempfile::tempdir().unwrap();
        let project = canonical_project(dir.path());
        let config = WorkersConfig {
            skip_sync: true,
            ..WorkersConfig::default()
        };
        let p = ProjectProvisioner::new(&project, worker("gw1"), config);
        p.provision().unwrap();

        fs::write(project.join("Assets/Scripts/New.cs"), "class New {}").unwrap();
        let report = p.provision().unwrap();
        assert_eq!(report.state_before, SyncState::UpToDate);
        assert!(!p.project_path().join("Assets/Scripts/New.cs").exists());
    }

    #[test]
    fn test_worker_config_reports_changes() {
        let dir = tempfile::tempdir().unwrap();
        let project = canonical_project(dir.path());
        let p = ProjectProvisioner::new(&project, worker("gw3"), WorkersConfig::default());
        p.provision().unwrap();

        assert!(p.write_worker_config(17545).unwrap());
        assert!(!p.write_worker_config(17545).unwrap());

        let layout = p.layout();
        assert_eq!(read_configured_port(&layout.settings()), Some(17545));
        let settings: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(layout.settings()).unwrap()).unwrap();
        assert_eq!(settings["MonoBehaviour"]["manualPortMode"], true);
        assert_eq!(settings["MonoBehaviour"]["responseCharacterLimit"], 25000);

        let launcher = fs::read_to_string(layout.launcher()).unwrap();
        assert!(launcher.contains("--port 17545"));
        assert!(launcher.contains("Packages/dev.polyblank.nyamu/Node/mcp-server.js"));
        assert!(launcher.contains(&layout.bridge_log().display().to_string()));
        assert!(launcher.contains(&project.display().to_string()));

        assert!(p.write_worker_config(17546).unwrap());
    }

    #[test]
    fn test_primary_settings_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let project = canonical_project(dir.path());
        let layout = ProjectLayout::new(&project);
        fs::create_dir_all(layout.harness_dir()).unwrap();
        fs::write(layout.settings(), r#"{"MonoBehaviour": {"serverPort": 17001}}"#).unwrap();

        let p = ProjectProvisioner::new(&project, WorkerId::Primary, WorkersConfig::default());
        p.write_worker_config(17001).unwrap();
        assert_eq!(
            fs::read_to_string(layout.settings()).unwrap(),
            r#"{"MonoBehaviour": {"serverPort": 17001}}"#
        );
        assert!(layout.launcher().is_file());
    }

    #[test]
    fn test_cleanup_never_touches_canonical() {
        let dir = tempfile::tempdir().unwrap();
        let project = canonical_project(dir.path());

        let primary =
            ProjectProvisioner::new(&project, WorkerId::Primary, WorkersConfig::default());
        assert!(!primary.cleanup().unwrap());
        assert!(project.join("Assets").is_dir());

        let p = ProjectProvisioner::new(&project, worker("gw1"), WorkersConfig::default());
        p.provision().unwrap();
        assert!(p.cleanup().unwrap());
        assert!(!p.project_path().exists());
        assert!(!p.cleanup().unwrap());
        assert!(project.join("Assets/Scripts/Player.cs").is_file());
    }

    #[test]
    fn test_missing_canonical_project() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("Nope");
        let p = ProjectProvisioner::new(missing, worker("gw1"), WorkersConfig::default());
        assert!(matches!(p.provision(), Err(Error::NotFound { .. })));
    }
}
