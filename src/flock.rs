use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Advisory lock on the persistent state directory. Two store instances
/// reattaching the same state would both rewrite the snapshot and corrupt
/// each other's block inventory, so the second open fails instead.
///
/// The lock file contains the owning process ID for debugging. It is held
/// for the lifetime of the store and released when the store is dropped.
pub struct StateDirectoryLock {
    _file: File,
    path: PathBuf,
}

impl StateDirectoryLock {
    pub fn acquire<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Self::try_lock(&file)?;

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
        // No advisory locking on this platform; rely on the caller not
        // opening the same state directory twice.
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateDirectoryLock {
    fn drop(&mut self) {
        // The OS releases the lock when the file handle closes. The lock
        // file itself is left in place to avoid unlink races with a
        // concurrent acquire.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_writes_pid() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("LOCK");

        let lock = StateDirectoryLock::acquire(&lock_path).expect("Failed to acquire lock");
        assert_eq!(lock.path(), lock_path.as_path());

        let content = std::fs::read_to_string(&lock_path).unwrap();
        assert!(content.contains(&std::process::id().to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_second_acquire_fails_while_held() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("LOCK");

        let _held = StateDirectoryLock::acquire(&lock_path).expect("Failed to acquire lock");
        assert!(StateDirectoryLock::acquire(&lock_path).is_err());
    }

    #[test]
    fn test_reacquire_after_drop() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("LOCK");

        {
            let _lock = StateDirectoryLock::acquire(&lock_path).expect("Failed to acquire lock");
        }

        let _lock = StateDirectoryLock::acquire(&lock_path)
            .expect("Should be able to reacquire after drop");
    }
}
