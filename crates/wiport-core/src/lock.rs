use crate::error::ErrorCode;
use fs2::FileExt;
use std::{
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

/// Advisory lock errors for journal files.
#[derive(Debug)]
pub enum LockError {
    Timeout { path: PathBuf, waited: Duration },
    IoError(io::Error),
}

impl From<io::Error> for LockError {
    fn from(err: io::Error) -> Self {
        Self::IoError(err)
    }
}

impl LockError {
    /// Machine-readable code associated with this lock error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::LockContention,
            Self::IoError(_) => ErrorCode::JournalWriteFailed,
        }
    }

    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { path, waited } => {
                write!(
                    f,
                    "{}: journal lock timed out after {:?} at {}",
                    self.code().code(),
                    waited,
                    path.display()
                )
            }
            Self::IoError(err) => write!(f, "{}: {}", self.code().code(), err),
        }
    }
}

impl std::error::Error for LockError {}

/// Lock file guarding `journal`: the journal path with `.lock` appended.
#[must_use]
pub fn lock_path_for(journal: &Path) -> PathBuf {
    let mut name = OsString::from(journal.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

#[derive(Clone, Copy)]
enum LockKind {
    Shared,
    Exclusive,
}

#[derive(Debug)]
struct FileGuard {
    file: File,
    path: PathBuf,
}

impl FileGuard {
    fn acquire(path: &Path, timeout: Duration, kind: LockKind) -> Result<Self, LockError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let start = Instant::now();
        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(path)?;

            let contended = match kind {
                LockKind::Shared => file.try_lock_shared().is_err(),
                LockKind::Exclusive => file.try_lock_exclusive().is_err(),
            };

            if !contended {
                return Ok(Self {
                    file,
                    path: path.to_path_buf(),
                });
            }

            if start.elapsed() >= timeout {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited: start.elapsed(),
                });
            }

            thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// RAII guard held by a replay run for the lifetime of its journal.
///
/// Writers take it exclusively; inspection takes it shared, so progress can
/// be read by several readers but never while a run is appending.
#[derive(Debug)]
pub struct JournalLock {
    guard: FileGuard,
}

impl JournalLock {
    /// Exclusive lock on the lock file next to `journal`.
    ///
    /// # Errors
    ///
    /// [`LockError::Timeout`] if another holder keeps the lock past
    /// `timeout`; [`LockError::IoError`] if the lock file cannot be opened.
    pub fn acquire(journal: &Path, timeout: Duration) -> Result<Self, LockError> {
        Ok(Self {
            guard: FileGuard::acquire(&lock_path_for(journal), timeout, LockKind::Exclusive)?,
        })
    }

    /// Shared lock on the lock file next to `journal`.
    ///
    /// # Errors
    ///
    /// Same as [`JournalLock::acquire`].
    pub fn acquire_shared(journal: &Path, timeout: Duration) -> Result<Self, LockError> {
        Ok(Self {
            guard: FileGuard::acquire(&lock_path_for(journal), timeout, LockKind::Shared)?,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.guard.path
    }
}

#[cfg(test)]
mod tests {
    use super::{JournalLock, LockError, lock_path_for};
    use crate::error::ErrorCode;
    use std::path::Path;
    use std::time::Duration;

    #[test]
    fn lock_file_sits_next_to_journal() {
        assert_eq!(
            lock_path_for(Path::new("/tmp/run/journal.sqlite3")),
            Path::new("/tmp/run/journal.sqlite3.lock")
        );
    }

    #[test]
    fn exclusive_lock_times_out_when_held() -> Result<(), LockError> {
        let dir = tempfile::tempdir()?;
        let journal = dir.path().join("journal.sqlite3");
        let held = JournalLock::acquire(&journal, Duration::from_millis(50))?;
        assert_eq!(held.path(), lock_path_for(&journal));

        let err = JournalLock::acquire(&journal, Duration::from_millis(20))
            .expect_err("lock is held");
        assert!(matches!(err, LockError::Timeout { .. }));
        assert_eq!(err.code(), ErrorCode::LockContention);
        assert!(err.hint().is_some());

        drop(held);
        JournalLock::acquire(&journal, Duration::from_millis(50))?;
        Ok(())
    }

    #[test]
    fn shared_locks_coexist_but_block_writers() -> Result<(), LockError> {
        let dir = tempfile::tempdir()?;
        let journal = dir.path().join("journal.sqlite3");
        let _first = JournalLock::acquire_shared(&journal, Duration::from_millis(50))?;
        let _second = JournalLock::acquire_shared(&journal, Duration::from_millis(50))?;
        let writer = JournalLock::acquire(&journal, Duration::from_millis(20));
        assert!(matches!(writer, Err(LockError::Timeout { .. })));
        Ok(())
    }
}
