//! Editor executable resolution

use crate::config::EditorConfig;
use crate::provisioner::ProjectLayout;
use edharness_common::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const VERSION_KEY: &str = "m_EditorVersion:";

/// Finds the editor build a project requires
#[derive(Debug, Clone)]
pub struct ExecutableResolver {
    override_exe: Option<PathBuf>,
    registry_file: Option<PathBuf>,
    install_roots: Vec<PathBuf>,
    drive_roots: Vec<PathBuf>,
    exe_relative_path: PathBuf,
}

impl ExecutableResolver {
    pub fn from_config(config: &EditorConfig) -> Self {
        Self {
            override_exe: config.executable.clone(),
            registry_file: config.install_registry_file.clone(),
            install_roots: config.install_roots.clone(),
            drive_roots: config.drive_roots.clone(),
            exe_relative_path: config.exe_relative_path.clone(),
        }
    }

    /// Editor version recorded in the project's version file.
    pub fn required_version(project: &Path) -> Result<String> {
        let path = ProjectLayout::new(project).version_file();
        let content = fs::read_to_string(&path).map_err(|e| Error::NotFound {
            what: "Project version file".to_string(),
            detail: format!("{}: {}", path.display(), e),
            hint: "Open the project in the editor once to create it".to_string(),
        })?;

        content
            .lines()
            .find_map(|line| line.trim().strip_prefix(VERSION_KEY))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::NotFound {
                what: "Editor version".to_string(),
                detail: format!("no {} line in {}", VERSION_KEY, path.display()),
                hint: "Check the project's version file".to_string(),
            })
    }

    /// Install roots in search order.
    pub fn search_roots(&self) -> Vec<PathBuf> {
        let mut roots = Vec::new();
        if let Some(custom) = self.registry_file.as_deref().and_then(read_registry_root) {
            roots.push(custom);
        }
        roots.extend(self.install_roots.iter().cloned());
        roots.extend(self.drive_roots.iter().cloned());
        roots
    }

    /// Resolve the executable for `project`. An existing override wins;
    /// otherwise only an install of the exact required version matches.
    pub fn resolve(&self, project: &Path) -> Result<PathBuf> {
        if let Some(exe) = &self.override_exe {
            if exe.is_file() {
                info!("Using editor override {}", exe.display());
                return Ok(exe.clone());
            }
            warn!("Editor override {} does not exist, ignoring", exe.display());
        }

        let version = Self::required_version(project)?;
        let mut searched = Vec::new();

        for root in self.search_roots() {
            let candidate = root.join(&version).join(&self.exe_relative_path);
            debug!("Checking {}", candidate.display());
            if candidate.is_file() {
                info!("Found editor {} at {}", version, candidate.display());
                return Ok(candidate);
            }
            searched.push(candidate.display().to_string());
        }

        Err(Error::NotFound {
            what: format!("Editor {}", version),
            detail: format!("searched: {}", searched.join(", ")),
            hint: format!(
                "Install editor {} or set {} to its executable",
                version,
                crate::config::ENV_EDITOR_EXE
            ),
        })
    }
}

/// Custom install root stored as a JSON string. Missing or malformed files
/// are skipped.
fn read_registry_root(path: &Path) -> Option<PathBuf> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str::<String>(&content) {
        Ok(root) if !root.trim().is_empty() => Some(PathBuf::from(root.trim())),
        Ok(_) => None,
        Err(e) => {
            debug!("Ignoring install registry {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project_with_version(root: &Path, version: &str) -> PathBuf {
        let project = root.join("Project");
        fs::create_dir_all(project.join("ProjectSettings")).unwrap();
        fs::write(
            project.join("ProjectSettings/ProjectVersion.txt"),
            format!(
                "m_EditorVersion: {}\nm_EditorVersionWithRevision: {} (abc)\n",
                version, version
            ),
        )
        .unwrap();
        project
    }

    fn install(root: &Path, version: &str) -> PathBuf {
        let exe = root.join(version).join("Editor/editor");
        fs::create_dir_all(exe.parent().unwrap()).unwrap();
        fs::write(&exe, "").unwrap();
        exe
    }

    fn resolver(dir: &Path) -> ExecutableResolver {
        ExecutableResolver {
            override_exe: None,
            registry_file: Some(dir.join("secondaryInstallPath.json")),
            install_roots: vec![dir.join("standard"), dir.join("alternate")],
            drive_roots: vec![dir.join("drive")],
            exe_relative_path: PathBuf::from("Editor/editor"),
        }
    }

    #[test]
    fn test_required_version() {
        let dir = tempfile::tempdir().unwrap();
        let project = project_with_version(dir.path(), "2022.3.50f1");
        assert_eq!(ExecutableResolver::required_version(&project).unwrap(), "2022.3.50f1");

        let empty = dir.path().join("Empty");
        assert!(matches!(
            ExecutableResolver::required_version(&empty),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_search_order() {
        let dir = tempfile::tempdir().unwrap();
        let project = project_with_version(dir.path(), "2022.3.50f1");
        let r = resolver(dir.path());

        let drive = install(&dir.path().join("drive"), "2022.3.50f1");
        assert_eq!(r.resolve(&project).unwrap(), drive);

        let alternate = install(&dir.path().join("alternate"), "2022.3.50f1");
        assert_eq!(r.resolve(&project).unwrap(), alternate);

        let custom_root = dir.path().join("custom");
        let custom = install(&custom_root, "2022.3.50f1");
        fs::write(
            dir.path().join("secondaryInstallPath.json"),
            serde_json::to_string(&custom_root.display().to_string()).unwrap(),
        )
        .unwrap();
        assert_eq!(r.resolve(&project).unwrap(), custom);
    }

    #[test]
    fn test_existing_override_wins() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("NoVersion");
        let exe = dir.path().join("editor-bin");
        fs::write(&exe, "").unwrap();

        let mut r = resolver(dir.path());
        r.override_exe = Some(exe.clone());
        assert_eq!(r.resolve(&project).unwrap(), exe);
    }

    #[test]
    fn test_missing_override_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let project = project_with_version(dir.path(), "2022.3.50f1");
        let installed = install(&dir.path().join("standard"), "2022.3.50f1");

        let mut r = resolver(dir.path());
        r.override_exe = Some(dir.path().join("does-not-exist"));
        assert_eq!(r.resolve(&project).unwrap(), installed);
    }

    #[test]
    fn test_not_found_names_version_and_locations() {
        let dir = tempfile::tempdir().unwrap();
        let project = project_with_version(dir.path(), "2022.3.50f1");
        install(&dir.path().join("standard"), "2021.3.1f1");

        let err = resolver(dir.path()).resolve(&project).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("2022.3.50f1"));
        assert!(msg.contains("standard"));
        assert!(msg.contains("alternate"));
        assert!(msg.contains("drive"));
        assert!(msg.contains(crate::config::ENV_EDITOR_EXE));
    }
}
