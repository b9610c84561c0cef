//! Run lock
//!
//! One scheduler slot, one run: a second invocation overlapping a slow run
//! must exit without touching the report. The lock is a PID file in the
//! report output directory, released on drop and reclaimed when the
//! recorded process is gone.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

const LOCK_FILE_NAME: &str = ".rae-automation.lock";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another run is already in progress (PID: {pid}, lock: {path})")]
    Held { pid: u32, path: PathBuf },

    #[error("failed to access lock file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Exclusive run lock, held for the lifetime of one pipeline invocation.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    held: bool,
}

impl RunLock {
    /// Acquire the lock in `dir`, reclaiming a stale lock whose process no
    /// longer exists.
    pub fn acquire(dir: &Path) -> Result<Self, LockError> {
        fs::create_dir_all(dir).map_err(|source| LockError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(LOCK_FILE_NAME);

        if path.exists() {
            match read_holder(&path) {
                Some(pid) if process_alive(pid) => {
                    return Err(LockError::Held { pid, path });
                }
                _ => {
                    // Stale or unreadable lock from a dead run.
                    tracing::info!(path = %path.display(), "reclaiming stale run lock");
                    let _ = fs::remove_file(&path);
                }
            }
        }

        let pid = std::process::id();
        let mut file = File::create(&path).map_err(|source| LockError::Io {
            path: path.clone(),
            source,
        })?;
        writeln!(file, "{pid}").map_err(|source| LockError::Io {
            path: path.clone(),
            source,
        })?;

        tracing::debug!(pid, path = %path.display(), "run lock acquired");
        Ok(Self { path, held: true })
    }

    /// Release the lock. Also called on drop.
    pub fn release(&mut self) {
        if self.held {
            if let Err(e) = fs::remove_file(&self.path) {
                tracing::warn!(error = %e, "failed to remove run lock");
            } else {
                tracing::debug!(path = %self.path.display(), "run lock released");
            }
            self.held = false;
        }
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // No liveness check available; assume the holder is alive rather than
    // corrupt a run.
    true
}
