//! Cross-process exclusive lock over an editor instance's mutable state
//!
//! Every state-mutating operation against an editor (asset refresh, compile,
//! temp-file cleanup) runs under the lock of the project that editor has open.
//! The lock is an advisory `flock(LOCK_EX)` on a per-project lock file, plus a
//! process-wide holder count so nested scopes in one process never block on
//! their own lock.
//!
//! State lives in a registry keyed by lock-file path. The OS lock is taken by
//! the first holder and dropped by the last release, so it is held
//! continuously for the whole nesting chain.

use crate::{Error, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// File name of the machine-wide lock that serializes port registration.
pub const PORT_REGISTRATION_LOCK: &str = "port_registration.lock";

static REGISTRY: Lazy<Mutex<HashMap<PathBuf, Arc<Mutex<LockRecord>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Default)]
struct LockRecord {
    holders: usize,
    handle: Option<Flock<File>>,
    os_acquisitions: u64,
}

/// Reentrant, cross-process exclusive lock bound to one lock file.
#[derive(Clone)]
pub struct ExclusiveStateLock {
    path: PathBuf,
    record: Arc<Mutex<LockRecord>>,
}

impl std::fmt::Debug for ExclusiveStateLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusiveStateLock")
            .field("path", &self.path)
            .field("holders", &self.holder_count())
            .finish()
    }
}

impl ExclusiveStateLock {
    /// Lock guarding the editor instance that has `project` open.
    pub fn for_project(locks_dir: &Path, project: &Path) -> Result<Self> {
        Self::at_path(locks_dir.join(Self::lock_file_name(project)))
    }

    /// Machine-wide lock used while pre-registering editor ports.
    pub fn port_registration(locks_dir: &Path) -> Result<Self> {
        Self::at_path(locks_dir.join(PORT_REGISTRATION_LOCK))
    }

    /// Lock on an explicit lock-file path.
    pub fn at_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let record = REGISTRY
            .lock()
            .entry(path.clone())
            .or_default()
            .clone();

        Ok(Self { path, record })
    }

    /// Lock file name for a project: a short stable hash of its path, so
    /// workers on different projects never contend.
    pub fn lock_file_name(project: &Path) -> String {
        let digest = Sha256::digest(project.to_string_lossy().as_bytes());
        format!("editor_state_{}.lock", &hex::encode(digest)[..8])
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Holders in this process, including nested scopes.
    pub fn holder_count(&self) -> usize {
        self.record.lock().holders
    }

    /// Number of times this process actually took the OS lock.
    pub fn os_acquisitions(&self) -> u64 {
        self.record.lock().os_acquisitions
    }

    /// Acquire the lock, blocking the calling thread until it is available.
    ///
    /// Must not be called from an async context; use [`acquire_async`].
    ///
    /// [`acquire_async`]: ExclusiveStateLock::acquire_async
    pub fn acquire(&self) -> Result<StateLockGuard> {
        let mut record = self.record.lock();

        if record.holders > 0 {
            record.holders += 1;
            trace!("Reentrant acquire of {} (holders={})", self.path.display(), record.holders);
            return Ok(self.guard());
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)?;

        debug!("Acquiring state lock {}", self.path.display());
        match Flock::lock(file, FlockArg::LockExclusive) {
            Ok(mut handle) => {
                let _ = handle.set_len(0);
                let _ = writeln!(*handle, "{}", std::process::id());
                record.handle = Some(handle);
                record.os_acquisitions += 1;
            }
            Err((_, Errno::EDEADLK)) => {
                // Already held by this process through a path the counter
                // did not see.
                debug!("EDEADLK on {}, treating as reentrant", self.path.display());
            }
            Err((_, errno)) => {
                return Err(Error::Lock {
                    path: self.path.clone(),
                    errno,
                });
            }
        }

        record.holders = 1;
        Ok(self.guard())
    }

    /// Acquire the lock from async code without stalling the runtime.
    pub async fn acquire_async(&self) -> Result<StateLockGuard> {
        let lock = self.clone();
        tokio::task::spawn_blocking(move || lock.acquire())
            .await
            .map_err(|e| Error::Internal(format!("lock task failed: {}", e)))?
    }

    fn guard(&self) -> StateLockGuard {
        StateLockGuard {
            lock: self.clone(),
            released: false,
        }
    }

    fn release_one(&self) -> Result<()> {
        let mut record = self.record.lock();

        if record.holders == 0 {
            return Err(Error::Internal(format!(
                "release of {} without a matching acquire",
                self.path.display()
            )));
        }

        record.holders -= 1;
        if record.holders > 0 {
            return Ok(());
        }

        if let Some(handle) = record.handle.take() {
            debug!("Releasing state lock {}", self.path.display());
            if let Err((_, errno)) = handle.unlock() {
                return Err(Error::Lock {
                    path: self.path.clone(),
                    errno,
                });
            }
        }

        Ok(())
    }
}

/// Scoped hold on an [`ExclusiveStateLock`]. Dropping it releases one level.
#[must_use = "the lock is released when the guard is dropped"]
pub struct StateLockGuard {
    lock: ExclusiveStateLock,
    released: bool,
}

impl StateLockGuard {
    /// Release explicitly, surfacing any OS error.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.lock.release_one()
    }

    pub fn lock(&self) -> &ExclusiveStateLock {
        &self.lock
    }
}

impl Drop for StateLockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.lock.release_one() {
                warn!("Failed to release state lock: {}", e);
            }
        }
    }
}
