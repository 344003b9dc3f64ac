//! Build lock.
//!
//! A marker file signals that a build or test cycle owns the hardware. The
//! file is created with `create_new`, so two contenders can never both
//! succeed. Acquisition never waits: a held lock is reported immediately.
//!
//! A process killed while holding the lock leaves the marker behind; it has
//! to be removed by an operator (`ufoci unlock`).

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, UfoError};

#[derive(Debug, Clone)]
pub struct BuildLock {
    path: PathBuf,
}

impl BuildLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_locked(&self) -> bool {
        self.path.exists()
    }

    /// Create the marker; `LockHeld` when it already exists.
    pub fn acquire(&self) -> Result<()> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(UfoError::LockHeld {
                    path: self.path.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        // holder info is diagnostic only
        let _ = writeln!(
            file,
            "pid={}\nacquired={}",
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        );
        debug!(path = %self.path.display(), "Acquired build lock");
        Ok(())
    }

    pub fn release(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Released build lock");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(UfoError::LockNotHeld {
                path: self.path.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Acquire and release again when the guard is dropped.
    pub fn acquire_guard(&self) -> Result<BuildLockGuard> {
        self.acquire()?;
        Ok(BuildLockGuard { lock: self.clone() })
    }

    /// Remove a stale marker. Returns whether one existed.
    pub fn force_release(&self) -> Result<bool> {
        match self.release() {
            Ok(()) => {
                warn!(path = %self.path.display(), "Build lock removed manually");
                Ok(true)
            }
            Err(UfoError::LockNotHeld { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Releases the build lock on drop.
#[derive(Debug)]
pub struct BuildLockGuard {
    lock: BuildLock,
}

impl BuildLockGuard {
    pub fn path(&self) -> &Path {
        self.lock.path()
    }
}

impl Drop for BuildLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release() {
            warn!(error = %e, "Failed to release build lock");
        }
    }
}
