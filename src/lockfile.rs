//! Single-instance lock.
//!
//! The lock file holds the owner's PID. A lock whose PID no longer names a
//! live process is stale and gets replaced.

use anyhow::{Context, Result, bail};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "camdeploy-agent.lock";

/// Held for the lifetime of the service; removes the file on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock in the per-user data directory.
    pub fn acquire() -> Result<Self> {
        let data_dir = dirs::data_local_dir()
            .or_else(dirs::data_dir)
            .context("Could not find data directory")?;
        let app_dir = data_dir.join("camdeploy");
        fs::create_dir_all(&app_dir).context("Failed to create app data directory")?;
        Self::acquire_at(app_dir.join(LOCK_FILE))
    }

    pub fn acquire_at(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(pid) = read_pid(&path) {
            if process_alive(pid) {
                bail!("camdeploy-agent is already running (PID {})", pid);
            }
            tracing::warn!("Replacing stale lock {:?} left by PID {}", path, pid);
        } else if path.exists() {
            tracing::warn!("Replacing unreadable lock {:?}", path);
        }

        write_pid(&path, std::process::id())
            .with_context(|| format!("Failed to write lock file {:?}", path))?;
        tracing::debug!("Acquired instance lock {:?}", path);
        Ok(Self { path })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if read_pid(&self.path) == Some(std::process::id()) {
            if let Err(e) = fs::remove_file(&self.path) {
                tracing::warn!("Failed to remove lock file {:?}: {}", self.path, e);
            }
        }
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn write_pid(path: &Path, pid: u32) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    writeln!(file, "{}", pid)
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 only checks for existence; EPERM means it exists under another user.
    let result = unsafe { libc::kill(pid, 0) };
    result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(pid: u32) -> bool {
    pid == std::process::id()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE);

        let lock = InstanceLock::acquire_at(&path).unwrap();
        assert_eq!(read_pid(&path), Some(std::process::id()));

        let err = InstanceLock::acquire_at(&path).unwrap_err();
        assert!(err.to_string().contains("already running"));

        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_lock_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE);
        fs::write(&path, "99999999\n").unwrap();

        let _lock = InstanceLock::acquire_at(&path).unwrap();
        assert_eq!(read_pid(&path), Some(std::process::id()));
    }

    #[test]
    fn test_garbage_lock_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE);
        fs::write(&path, "not a pid").unwrap();

        assert!(InstanceLock::acquire_at(&path).is_ok());
    }
}
