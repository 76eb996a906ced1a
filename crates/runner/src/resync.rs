//! Between-test editor state resync
//!
//! After each test the editor is brought back to a known state at the
//! intensity the test declared:
//!
//! - `noop`: nothing, not even a status call
//! - `minimal`: wait for idle, then force a refresh only if the compiler
//!   still references a deleted source file
//! - `full`: forced refresh plus compile check, retried once
//!
//! Every non-noop pass holds the project's [`ExclusiveStateLock`]. Resync is
//! best effort: errors are logged and reported, never raised, so cleanup
//! cannot mask the outcome of the test that ran before it.

use crate::config::ResyncConfig;
use edharness_common::editor::{
    has_stale_file_reference, is_compilation_clean, is_refresh_in_progress,
};
use edharness_common::{wait_for_idle, CleanupLevel, EditorControl, ExclusiveStateLock, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Forced refresh cycles a full resync may run.
pub const MAX_FULL_REFRESHES: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum ResyncOutcome {
    /// Noop level, no editor traffic
    Skipped,
    /// State was already clean
    Clean,
    /// Clean after this many forced refreshes
    Refreshed { refreshes: u32 },
    /// Could not confirm a clean state; logged, not fatal
    BestEffort { reason: String },
}

impl ResyncOutcome {
    pub fn is_best_effort(&self) -> bool {
        matches!(self, ResyncOutcome::BestEffort { .. })
    }
}

/// Drives one editor back to a clean state between tests
pub struct StateResyncManager<E> {
    editor: E,
    lock: ExclusiveStateLock,
    config: ResyncConfig,
}

impl<E: EditorControl> StateResyncManager<E> {
    pub fn new(editor: E, lock: ExclusiveStateLock, config: ResyncConfig) -> Self {
        Self {
            editor,
            lock,
            config,
        }
    }

    pub fn editor(&self) -> &E {
        &self.editor
    }

    pub fn lock(&self) -> &ExclusiveStateLock {
        &self.lock
    }

    /// Pre-test preparation: one non-forced refresh for tests that touch
    /// editor state. Failures are ignored.
    pub async fn prepare(&self, level: CleanupLevel) {
        if level == CleanupLevel::Noop {
            return;
        }
        let result = async {
            let _guard = self.lock.acquire_async().await?;
            self.refresh(false).await
        }
        .await;
        if let Err(e) = result {
            debug!("Pre-test refresh failed: {}", e);
        }
    }

    /// Run the resync for `level`.
    pub async fn resync(&self, level: CleanupLevel) -> ResyncOutcome {
        if level == CleanupLevel::Noop {
            debug!("Skipping editor state resync (noop)");
            return ResyncOutcome::Skipped;
        }

        let result = async {
            let _guard = self.lock.acquire_async().await?;
            self.wait_idle().await?;
            match level {
                CleanupLevel::Noop => Ok(ResyncOutcome::Skipped),
                CleanupLevel::Minimal => self.minimal().await,
                CleanupLevel::Full => self.full().await,
            }
        }
        .await;

        match result {
            Ok(outcome) => {
                debug!("Resync ({}) finished: {:?}", level, outcome);
                outcome
            }
            Err(e) => {
                warn!("Could not ensure clean editor state: {}", e);
                ResyncOutcome::BestEffort {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn minimal(&self) -> Result<ResyncOutcome> {
        let status = match self.editor.compile_status_text().await {
            Ok(text) => text,
            Err(e) => {
                warn!("Minimal resync status check failed: {}", e);
                tokio::time::sleep(self.config.settle_delay()).await;
                return Ok(ResyncOutcome::BestEffort {
                    reason: e.to_string(),
                });
            }
        };

        if has_stale_file_reference(&status) {
            info!("Stale file references detected, forcing refresh");
            self.refresh(true).await?;
            self.wait_idle().await?;
            return Ok(ResyncOutcome::Refreshed { refreshes: 1 });
        }

        tokio::time::sleep(self.config.settle_delay()).await;
        Ok(ResyncOutcome::Clean)
    }

    async fn full(&self) -> Result<ResyncOutcome> {
        for refreshes in 1..=MAX_FULL_REFRESHES {
            self.refresh(true).await?;
            self.wait_idle().await?;
            let clean = self.compilation_clean().await;
            self.wait_idle().await?;

            if clean {
                return Ok(ResyncOutcome::Refreshed { refreshes });
            }
            warn!("Editor has compilation errors after forced refresh {}", refreshes);
        }

        Ok(ResyncOutcome::BestEffort {
            reason: format!(
                "compilation still unclean after {} forced refreshes",
                MAX_FULL_REFRESHES
            ),
        })
    }

    async fn compilation_clean(&self) -> bool {
        match self.editor.scripts_compile(self.config.compile_timeout()).await {
            Ok(text) => {
                let clean = is_compilation_clean(&text);
                if !clean {
                    debug!("Compile check: {}", text);
                }
                clean
            }
            Err(e) => {
                warn!("Could not verify compilation state: {}", e);
                false
            }
        }
    }

    /// Asset refresh, retried while another refresh is in progress or on
    /// non-timeout errors.
    pub async fn refresh(&self, force: bool) -> Result<()> {
        let policy = self.config.refresh_retry();
        let mut attempt = 1;

        loop {
            let last = attempt >= policy.max_attempts;
            match self.editor.assets_refresh(force).await {
                Ok(text) if is_refresh_in_progress(&text) && !last => {
                    debug!(
                        "Asset refresh in progress (attempt {}/{})",
                        attempt, policy.max_attempts
                    );
                }
                Ok(_) => return Ok(()),
                Err(e) if e.is_timeout() || last => return Err(e),
                Err(e) => {
                    warn!(
                        "Asset refresh attempt {}/{} failed: {}",
                        attempt, policy.max_attempts, e
                    );
                }
            }
            tokio::time::sleep(policy.delay).await;
            attempt += 1;
        }
    }

    async fn wait_idle(&self) -> Result<()> {
        wait_for_idle(
            &self.editor,
            self.config.idle_timeout(),
            self.config.idle_poll_interval(),
        )
        .await
    }

    /// Delete files a test created (with their `.meta` siblings) and force
    /// a refresh so the editor forgets them. Best effort, under the lock.
    pub async fn remove_temp_files(&self, paths: &[PathBuf]) -> ResyncOutcome {
        if paths.is_empty() {
            return ResyncOutcome::Skipped;
        }

        let result = async {
            let _guard = self.lock.acquire_async().await?;
            self.wait_idle().await?;
            for path in paths {
                remove_with_meta(path);
            }
            self.refresh(true).await?;
            self.wait_idle().await?;
            Ok::<_, edharness_common::Error>(ResyncOutcome::Refreshed { refreshes: 1 })
        }
        .await;

        result.unwrap_or_else(|e| {
            warn!("Temp file cleanup failed: {}", e);
            ResyncOutcome::BestEffort {
                reason: e.to_string(),
            }
        })
    }

    /// Put back every file saved in `backups` and force a refresh so the
    /// editor recompiles the originals. Best effort, under the lock.
    pub async fn restore_backups(&self, backups: &mut FileBackups) -> ResyncOutcome {
        if backups.is_empty() {
            return ResyncOutcome::Skipped;
        }

        let result = async {
            let _guard = self.lock.acquire_async().await?;
            self.wait_idle().await?;
            let restored = backups.restore_all();
            debug!("Restored {} backed up file(s)", restored);
            self.refresh(true).await?;
            self.wait_idle().await?;
            Ok::<_, edharness_common::Error>(ResyncOutcome::Refreshed { refreshes: 1 })
        }
        .await;

        result.unwrap_or_else(|e| {
            warn!("Restoring backed up files failed: {}", e);
            ResyncOutcome::BestEffort {
                reason: e.to_string(),
            }
        })
    }
}

/// Original contents of project files a test is about to edit.
#[derive(Debug, Default)]
pub struct FileBackups {
    saved: Vec<(PathBuf, Vec<u8>)>,
}

impl FileBackups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save the current content of `path`. The first backup of a path wins,
    /// so restoring always returns to the pre-test state.
    pub fn backup_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if self.saved.iter().any(|(p, _)| p == path) {
            return Ok(());
        }
        let content = fs::read(path)?;
        self.saved.push((path.to_path_buf(), content));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.saved.is_empty()
    }

    pub fn len(&self) -> usize {
        self.saved.len()
    }

    /// Write every saved file back and forget it. A file that cannot be
    /// written is logged and skipped; returns how many were restored.
    pub fn restore_all(&mut self) -> usize {
        let mut restored = 0;
        for (path, content) in self.saved.drain(..) {
            match fs::write(&path, &content) {
                Ok(()) => restored += 1,
                Err(e) => warn!("Could not restore {}: {}", path.display(), e),
            }
        }
        restored
    }
}

fn remove_with_meta(path: &Path) {
    let removed = if path.is_dir() {
        fs::remove_dir_all(path)
    } else if path.exists() {
        fs::remove_file(path)
    } else {
        Ok(())
    };
    if let Err(e) = removed {
        warn!("Could not remove {}: {}", path.display(), e);
    }

    let mut meta = path.as_os_str().to_owned();
    meta.push(".meta");
    let meta = PathBuf::from(meta);
    if meta.exists() {
        if let Err(e) = fs::remove_file(&meta) {
            warn!("Could not remove {}: {}", meta.display(), e);
        }
    }
}
