//! Host-wide advisory locks keyed by name.
//!
//! A named lock is a symlink under the configured lock directory whose target
//! is the PID of the holder. `symlink(2)` is atomic, so creation doubles as
//! acquisition, and any process on the host (the long-running service and
//! one-shot administrative commands alike) observes the same exclusion.

use parking_lot::Mutex;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use thiserror::Error;

// Serializes lock-file operations within this process so that two tasks
// cannot both conclude a stale link is theirs to break.
static PROCESS_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock '{0}' is already held")]
    NotAvailable(String),
    #[error("invalid lock name '{0}': only letters, digits and hyphens are allowed")]
    InvalidName(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Filesystem-backed advisory lock for an abstract name.
#[derive(Debug, Clone)]
pub struct NamedLock {
    name: String,
    path: PathBuf,
}

/// Holds a [`NamedLock`] until dropped.
#[derive(Debug)]
pub struct NamedLockGuard {
    path: PathBuf,
}

impl NamedLock {
    pub fn new(lock_dir: &Path, name: &str) -> Result<Self, LockError> {
        let acceptable = |c: char| c.is_ascii_alphanumeric() || c == '-';
        if name.is_empty() || !name.chars().all(acceptable) {
            return Err(LockError::InvalidName(name.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            path: lock_dir.join(format!("rackline:{name}")),
        })
    }

    /// Acquire the lock without blocking.
    ///
    /// Fails with [`LockError::NotAvailable`] when another holder exists.
    /// A link whose target PID is no longer alive is broken and re-acquired.
    pub fn try_acquire(&self) -> Result<NamedLockGuard, LockError> {
        let _proc = PROCESS_LOCK.lock();
        for attempt in 0..2 {
            match symlink(std::process::id().to_string(), &self.path) {
                Ok(()) => {
                    return Ok(NamedLockGuard {
                        path: self.path.clone(),
                    })
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if attempt == 0 && !holder_alive(&self.path) {
                        // Stale: the previous holder died without releasing.
                        let _ = fs::remove_file(&self.path);
                        continue;
                    }
                    return Err(LockError::NotAvailable(self.name.clone()));
                }
                Err(err) => return Err(LockError::Io(err)),
            }
        }
        Err(LockError::NotAvailable(self.name.clone()))
    }

    /// Informational only; the answer may be outdated by the time it returns.
    pub fn is_locked(&self) -> bool {
        let _proc = PROCESS_LOCK.lock();
        fs::read_link(&self.path).is_ok() && holder_alive(&self.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn holder_alive(path: &Path) -> bool {
    let Ok(target) = fs::read_link(path) else {
        return false;
    };
    let Ok(pid) = target.to_string_lossy().parse::<u32>() else {
        // Unparseable target: not one of ours, treat as stale.
        return false;
    };
    Path::new("/proc").join(pid.to_string()).exists()
}

impl Drop for NamedLockGuard {
    fn drop(&mut self) {
        let _proc = PROCESS_LOCK.lock();
        let _ = fs::remove_file(&self.path);
    }
}
