//! # thinbak-lock
//!
//! Scoped advisory locks serializing backup passes per volume.
//!
//! Exactly one pass (monitor tick or session build) may run against a
//! volume at a time; passes for distinct volumes are independent. The lock
//! is an exclusive `flock` on `<volume dir>/.lock`, acquired non-blocking:
//! a held lock reports [`LockError::Busy`] immediately instead of waiting,
//! which keeps monitor ticks cheap and stops a send pass from racing a
//! concurrent tick.
//!
//! Release happens on drop, so every exit path (success, error, panic
//! unwind in the caller) gives the lock back.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tracing::debug;

/// Lock file name inside a volume's archive directory.
pub const LOCK_FILE_NAME: &str = ".lock";

#[derive(Error, Debug)]
pub enum LockError {
    /// Another pass holds the volume lock. Expected and transient during
    /// monitor ticks; elevated to an error for send passes by the caller.
    #[error("volume is busy: another pass holds {0}")]
    Busy(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, LockError>;

/// An exclusive per-volume lock, released on drop.
#[derive(Debug)]
pub struct VolumeLock {
    file: File,
    path: PathBuf,
}

impl VolumeLock {
    /// Try to take the exclusive lock for the volume directory `dir`.
    ///
    /// Non-blocking: returns [`LockError::Busy`] if any other process or
    /// thread holds it. The lock file is created if missing and is never
    /// removed; only the flock state matters.
    pub fn try_acquire(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(lock = %path.display(), "volume lock acquired");
                Ok(Self { file, path })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(LockError::Busy(path)),
            Err(e) => Err(LockError::Io(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for VolumeLock {
    fn drop(&mut self) {
        // Unlock errors are unreportable here; the fd close releases the
        // flock regardless.
        let _ = fs2::FileExt::unlock(&self.file);
        debug!(lock = %self.path.display(), "volume lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let lock = VolumeLock::try_acquire(dir.path()).unwrap();
        assert!(lock.path().exists());
        drop(lock);
        // Reacquire after release succeeds.
        let _lock = VolumeLock::try_acquire(dir.path()).unwrap();
    }

    #[test]
    fn test_second_acquire_reports_busy() {
        let dir = TempDir::new().unwrap();
        let _held = VolumeLock::try_acquire(dir.path()).unwrap();
        match VolumeLock::try_acquire(dir.path()) {
            Err(LockError::Busy(path)) => {
                assert_eq!(path, dir.path().join(LOCK_FILE_NAME));
            }
            other => panic!("expected Busy, got {other:?}"),
        }
    }

    #[test]
    fn test_distinct_volumes_are_independent() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let _la = VolumeLock::try_acquire(a.path()).unwrap();
        let _lb = VolumeLock::try_acquire(b.path()).unwrap();
    }

    #[test]
    fn test_creates_volume_dir_if_missing() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("vm-root");
        let _lock = VolumeLock::try_acquire(&nested).unwrap();
        assert!(nested.join(LOCK_FILE_NAME).exists());
    }
}
