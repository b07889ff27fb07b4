//! Single-orchestrator guard for a flotilla home directory.
//!
//! Two orchestrators sharing a home would truncate each other's VM
//! directories and fight over tap leases, so only one may hold `<home>/.lock`.

use crate::runtime::constants::filenames;
use flotilla_shared::errors::{FlotillaError, FlotillaResult};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Exclusive `flock` on `<home>/.lock`.
///
/// The kernel drops the lock when this value is dropped or the process dies,
/// so a crashed orchestrator never leaves the home wedged.
#[derive(Debug)]
pub struct RuntimeLock {
    _flock: Flock<File>,
    path: PathBuf,
}

impl RuntimeLock {
    /// Take the lock, failing immediately if another orchestrator has it.
    ///
    /// # Errors
    /// * `Internal` - the home directory is already in use
    /// * `Storage` - the home directory or lock file could not be created
    pub fn acquire(home_dir: &Path) -> FlotillaResult<Self> {
        std::fs::create_dir_all(home_dir).map_err(|e| {
            FlotillaError::Storage(format!(
                "failed to create home dir {}: {}",
                home_dir.display(),
                e
            ))
        })?;

        let path = home_dir.join(filenames::LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| {
                FlotillaError::Storage(format!("failed to open {}: {}", path.display(), e))
            })?;

        let flock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => flock,
            Err((_, Errno::EWOULDBLOCK)) => {
                return Err(FlotillaError::Internal(format!(
                    "Another flotilla orchestrator is already using {}\n\
                     Stop it first, or point this one elsewhere with --home / FLOTILLA_HOME.",
                    home_dir.display()
                )));
            }
            Err((_, errno)) => {
                return Err(FlotillaError::Storage(format!(
                    "failed to lock {}: {}",
                    path.display(),
                    errno
                )));
            }
        };

        tracing::debug!(lock_path = %path.display(), "Acquired orchestrator lock");

        Ok(Self {
            _flock: flock,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_file_under_home() {
        let home = TempDir::new().unwrap();
        let lock = RuntimeLock::acquire(home.path()).unwrap();

        assert!(lock.path().exists());
        assert_eq!(lock.path(), home.path().join(".lock"));
    }

    #[test]
    fn test_creates_missing_home() {
        let temp = TempDir::new().unwrap();
        let home = temp.path().join("nested/home");

        let _lock = RuntimeLock::acquire(&home).unwrap();
        assert!(home.is_dir());
    }

    #[test]
    fn test_second_orchestrator_rejected() {
        let home = TempDir::new().unwrap();

        let _held = RuntimeLock::acquire(home.path()).unwrap();
        let err = RuntimeLock::acquire(home.path()).unwrap_err();

        assert!(matches!(err, FlotillaError::Internal(_)));
        assert!(err.to_string().contains("Another flotilla orchestrator"));
    }

    #[test]
    fn test_released_on_drop() {
        let home = TempDir::new().unwrap();

        drop(RuntimeLock::acquire(home.path()).unwrap());
        assert!(RuntimeLock::acquire(home.path()).is_ok());
    }
}
