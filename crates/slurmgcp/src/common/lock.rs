use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::common::error::SyncError;

/// Exclusive advisory lock held for the lifetime of the value.
pub struct ProcessLock {
    path: PathBuf,
    _lock: Flock<File>,
}

impl ProcessLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn lock_path(command: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/{command}.pid"))
}

/// Tries to take the lock without blocking.
/// Returns `Ok(None)` when another process holds it.
pub fn try_lock(path: &Path) -> crate::Result<Option<ProcessLock>> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(mut lock) => {
            lock.set_len(0)?;
            writeln!(lock, "{}", std::process::id())?;
            Ok(Some(ProcessLock {
                path: path.to_path_buf(),
                _lock: lock,
            }))
        }
        Err((_, Errno::EWOULDBLOCK)) => Ok(None),
        Err((_, errno)) => Err(SyncError::IoError(std::io::Error::from(errno))),
    }
}
