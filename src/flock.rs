//! Destination-directory locking.
//!
//! A compaction run holds an exclusive advisory lock on the destination
//! directory for its whole duration so that two compactions (or a
//! compaction and a writer) cannot interleave output files. The lock file
//! records the owning process id for debugging; it is left in place on
//! release to avoid unlink races.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// An exclusive, non-blocking advisory lock on a file.
///
/// The lock is released when the value is dropped.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Create (or open) `path` and take an exclusive lock on it.
    ///
    /// Fails immediately with the OS error if another process holds the
    /// lock; this never blocks.
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
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
        if unsafe { flock(fd, LOCK_EX | LOCK_NB) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        // No advisory locking on this platform; rely on the caller not to
        // run two compactions into the same destination.
        Ok(())
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Closing the file releases the lock; the lock file itself stays.
    }
}
