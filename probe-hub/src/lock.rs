//! Per-probe mutual exclusion.
//!
//! One advisory exclusive file lock per probe id, taken non-blocking. The
//! lock file's existence means nothing; only the held OS lock does, so stale
//! files from a crashed hub are harmless. The returned handle releases the
//! lock on drop, which also covers process exit.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

/// Errors from probe lock acquisition.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum LockError {
    /// Probe {probe_id} is locked by another session.
    Busy { probe_id: u16 },
    /// Could not open the lock file for probe {probe_id}.
    Io {
        probe_id: u16,
        #[source]
        source: std::io::Error,
    },
}

/// A held probe lock. Dropping it releases the advisory lock.
pub struct ProbeLock {
    _flock: Flock<File>,
    probe_id: u16,
    path: PathBuf,
}

impl std::fmt::Debug for ProbeLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeLock")
            .field("probe_id", &self.probe_id)
            .field("path", &self.path)
            .finish()
    }
}

impl ProbeLock {
    pub fn probe_id(&self) -> u16 {
        self.probe_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Lock file path for a probe id: `<dir>/probe_<id>.lock`.
pub fn lock_path(dir: &Path, probe_id: u16) -> PathBuf {
    dir.join(format!("probe_{probe_id}.lock"))
}

/// Tries to take the exclusive lock for `probe_id` without blocking.
pub fn try_acquire(dir: &Path, probe_id: u16) -> Result<ProbeLock, LockError> {
    std::fs::create_dir_all(dir).map_err(|source| LockError::Io { probe_id, source })?;

    let path = lock_path(dir, probe_id);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|source| LockError::Io { probe_id, source })?;

    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(flock) => {
            tracing::debug!(probe = probe_id, path = %path.display(), "probe lock acquired");
            Ok(ProbeLock {
                _flock: flock,
                probe_id,
                path,
            })
        }
        Err((_, Errno::EWOULDBLOCK)) => Err(LockError::Busy { probe_id }),
        Err((_, errno)) => Err(LockError::Io {
            probe_id,
            source: std::io::Error::from(errno),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_busy_then_reacquire() {
        let dir = tempfile::tempdir().unwrap();

        let held = try_acquire(dir.path(), 1).unwrap();
        assert_eq!(held.probe_id(), 1);
        assert!(held.path().ends_with("probe_1.lock"));

        // A second attempt on the same id sees BUSY, a different id does not.
        assert!(matches!(
            try_acquire(dir.path(), 1),
            Err(LockError::Busy { probe_id: 1 })
        ));
        let other = try_acquire(dir.path(), 2).unwrap();
        drop(other);

        drop(held);
        let reacquired = try_acquire(dir.path(), 1).unwrap();
        drop(reacquired);
    }

    #[test]
    fn stale_lock_file_is_not_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(lock_path(dir.path(), 3), b"leftover").unwrap();

        // The file already exists, but nothing holds the advisory lock.
        let held = try_acquire(dir.path(), 3).unwrap();
        drop(held);
    }
}
