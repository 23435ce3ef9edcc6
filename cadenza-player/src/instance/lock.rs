//! Cross-process named mutex and the instance lock file
//!
//! The mutex is an exclusive OS file lock on `<data_dir>/<name>.lock`. Locks
//! belong to the open file handle, so two handles in one process exclude
//! each other exactly like two processes do.

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Interval between lock attempts while waiting
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Machine-wide mutex guarding the lock file
#[derive(Debug, Clone)]
pub struct NamedMutex {
    path: PathBuf,
}

impl NamedMutex {
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            path: dir.join(format!("{}.lock", name)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait up to `timeout` for the mutex
    ///
    /// Returns `Ok(None)` when the wait timed out.
    pub async fn acquire(&self, timeout: Duration) -> Result<Option<NamedMutexGuard>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || acquire_blocking(&path, timeout))
            .await
            .map_err(|e| Error::Instance(format!("Mutex wait task failed: {}", e)))?
    }
}

fn acquire_blocking(path: &Path, timeout: Duration) -> Result<Option<NamedMutexGuard>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    let deadline = Instant::now() + timeout;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("Acquired named mutex {}", path.display());
                return Ok(Some(NamedMutexGuard {
                    file,
                    path: path.to_path_buf(),
                }));
            }
            Err(e) if is_contended(&e) => {}
            Err(e) => return Err(e.into()),
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(LOCK_POLL_INTERVAL);
    }
}

fn is_contended(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Held mutex, released on drop
#[derive(Debug)]
pub struct NamedMutexGuard {
    file: File,
    path: PathBuf,
}

impl Drop for NamedMutexGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release named mutex {}: {}", self.path.display(), e);
        } else {
            debug!("Released named mutex {}", self.path.display());
        }
    }
}

/// Plain-text file recording the primary's listening port
#[derive(Debug, Clone)]
pub struct InstanceLockFile {
    path: PathBuf,
}

impl InstanceLockFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Port recorded in the file
    ///
    /// A missing, empty or garbled file reads as no port.
    pub fn read_port(&self) -> Option<u16> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Cannot read instance lock file {}: {}", self.path.display(), e);
                return None;
            }
        };
        match text.trim().parse::<u16>() {
            Ok(0) => None,
            Ok(port) => Some(port),
            Err(_) => {
                warn!(
                    "Ignoring garbled instance lock file {}: {:?}",
                    self.path.display(),
                    text.trim()
                );
                None
            }
        }
    }

    /// Record `port`, replacing any previous content
    pub fn write_port(&self, port: u16) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, port.to_string())?;
        Ok(())
    }

    /// Delete the file if it still records `port`
    ///
    /// Returns true when the file was removed.
    pub fn remove_if_port(&self, port: u16) -> Result<bool> {
        if self.read_port() != Some(port) {
            return Ok(false);
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
