//! One active deployment per environment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::utils::io;

/// Who holds an environment lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockHolder {
    pub run_id: String,
    pub pid: u32,
    pub version: Option<String>,
    pub acquired_at: DateTime<Utc>,
}

/// Exclusive environment lock; the file is removed on drop.
#[derive(Debug)]
pub struct EnvironmentLock {
    path: PathBuf,
}

fn lock_path(dir: &Path, environment: &str) -> PathBuf {
    dir.join(format!("{}.lock", environment))
}

/// True when `pid` names no live process on this host. Lock files live in the
/// operator's config directory, so the holder always ran here.
#[cfg(unix)]
fn holder_is_gone(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return false;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn holder_is_gone(_pid: u32) -> bool {
    false
}

fn already_deploying(dir: &Path, environment: &str) -> Error {
    let current = read_holder(dir, environment)
        .ok()
        .flatten()
        .map(|h| serde_json::to_value(h).unwrap_or_default())
        .unwrap_or_default();
    Error::already_deploying(environment, current)
}

impl EnvironmentLock {
    /// Take the lock or fail immediately with `deploy.already_deploying`.
    ///
    /// A lock whose recorded holder process has exited (a killed or cancelled
    /// run) is removed and taken over once. Unreadable lock files stay held.
    pub fn acquire(dir: &Path, environment: &str, holder: &LockHolder) -> Result<Self> {
        io::ensure_dir(dir, "create lock directory")?;
        let path = lock_path(dir, environment);

        if let Some(lock) = Self::try_create(&path, holder)? {
            return Ok(lock);
        }
        let stale = read_holder(dir, environment)
            .ok()
            .flatten()
            .filter(|h| holder_is_gone(h.pid));
        let Some(stale) = stale else {
            return Err(already_deploying(dir, environment));
        };

        log_status!(
            "deploy",
            "Removing stale {} lock left by run {} (pid {} has exited)",
            environment,
            stale.run_id,
            stale.pid
        );
        io::remove_file_if_exists(&path, "remove stale lock")?;
        match Self::try_create(&path, holder)? {
            Some(lock) => Ok(lock),
            None => Err(already_deploying(dir, environment)),
        }
    }

    /// `None` when someone else holds the file.
    fn try_create(path: &Path, holder: &LockHolder) -> Result<Option<Self>> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => {
                return Err(Error::internal_io(
                    e.to_string(),
                    Some(format!("create lock {}", path.display())),
                ))
            }
        };

        // The file exists from here on, so the guard owns it even if the write fails.
        let lock = Self {
            path: path.to_path_buf(),
        };
        let content = serde_json::to_string_pretty(holder)
            .map_err(|e| Error::internal_json(e.to_string(), Some("serialize lock holder".to_string())))?;
        file.write_all(content.as_bytes())
            .map_err(|e| Error::internal_io(e.to_string(), Some("write lock".to_string())))?;
        Ok(Some(lock))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for EnvironmentLock {
    fn drop(&mut self) {
        let _ = io::remove_file_if_exists(&self.path, "release lock");
    }
}

pub fn is_locked(dir: &Path, environment: &str) -> bool {
    lock_path(dir, environment).exists()
}

/// Current lock holder for an environment, if locked.
pub fn read_holder(dir: &Path, environment: &str) -> Result<Option<LockHolder>> {
    let path = lock_path(dir, environment);
    if !path.exists() {
        return Ok(None);
    }
    let raw = io::read_file(&path, "read lock")?;
    if raw.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| Error::internal_json(e.to_string(), Some(format!("parse {}", path.display()))))
}
