use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::error::{Error, Result};

/// Name of the lock file inside a storage unit directory.
pub const LOCK_FILE: &str = "tsdb.lock";

/// Exclusive process-level ownership of a storage unit directory.
///
/// Only one commit engine may drive a storage unit's file-sets; a second
/// process opening the same directory fails instead of racing on the catalog.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Locks `dir/tsdb.lock`, writing the owner's process ID into it.
    pub fn acquire(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(LOCK_FILE);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Self::try_lock(&file).map_err(Error::LockError)?;

        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_lock_writes_pid() -> Result<()> {
        let dir = TempDir::new()?;
        let lock = FileLock::acquire(dir.path())?;

        assert_eq!(lock.path(), dir.path().join(LOCK_FILE));
        let content = fs::read_to_string(lock.path())?;
        assert!(content.contains(&std::process::id().to_string()));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_double_lock_fails() -> Result<()> {
        let dir = TempDir::new()?;
        let _first = FileLock::acquire(dir.path())?;

        let second = FileLock::acquire(dir.path());
        assert!(matches!(second, Err(Error::LockError(_))));
        Ok(())
    }

    #[test]
    fn test_released_on_drop() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let _lock = FileLock::acquire(dir.path())?;
        }
        let _again = FileLock::acquire(dir.path())?;
        Ok(())
    }
}
