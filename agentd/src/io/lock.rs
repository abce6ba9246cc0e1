//! Cross-process advisory locks keyed on a sanitized target path.
//!
//! A lock for `/srv/repo` lives at `<temp>/agentd-locks/_ssrv_srepo.lock`.
//! Acquisition never blocks: contention is reported immediately as
//! [`LockError::AlreadyHeld`] so callers can poll or give up.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::sanitize::sanitize_path;

/// Subdirectory of the system temp dir holding all lock files.
pub const LOCK_DIR_NAME: &str = "agentd-locks";

/// Attempts made when the lock file is swapped underneath us between open and lock.
const INODE_RACE_ATTEMPTS: usize = 3;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum LockError {
    #[error(
        "{} is already locked by another agentd instance (lock file {})",
        target.display(),
        lock_path.display()
    )]
    AlreadyHeld { target: PathBuf, lock_path: PathBuf },

    #[error("lock file {}: {source}", lock_path.display())]
    Io {
        lock_path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    pub fn is_already_held(&self) -> bool {
        matches!(self, LockError::AlreadyHeld { .. })
    }
}

/// Default directory for lock files.
pub fn default_lock_dir() -> PathBuf {
    std::env::temp_dir().join(LOCK_DIR_NAME)
}

/// Lock file path for `target`. Symlinks are resolved when the target exists
/// so that aliases of the same directory share one lock.
pub fn lock_path_for(lock_dir: &Path, target: &Path) -> PathBuf {
    let resolved = fs::canonicalize(target).unwrap_or_else(|_| target.to_path_buf());
    lock_dir.join(format!("{}.lock", sanitize_path(&resolved)))
}

/// Advisory lock on a path. Released on [`FileLock::unlock`] or drop.
#[derive(Debug)]
pub struct FileLock {
    target: PathBuf,
    path: PathBuf,
    file: Option<File>,
}

impl FileLock {
    /// Lock handle for `target` in the default lock directory.
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self::in_dir(&default_lock_dir(), target)
    }

    pub fn in_dir(lock_dir: &Path, target: impl Into<PathBuf>) -> Self {
        let target = target.into();
        let path = lock_path_for(lock_dir, &target);
        Self {
            target,
            path,
            file: None,
        }
    }

    /// Create a handle and acquire it in one step.
    pub fn acquire(lock_dir: &Path, target: impl Into<PathBuf>) -> Result<Self, LockError> {
        let mut lock = Self::in_dir(lock_dir, target);
        lock.try_lock()?;
        Ok(lock)
    }

    /// Poll [`FileLock::try_lock`] until it succeeds or `wait` elapses.
    ///
    /// Only for short critical sections; long-held locks should fail fast.
    pub fn acquire_within(
        lock_dir: &Path,
        target: impl Into<PathBuf>,
        wait: Duration,
    ) -> Result<Self, LockError> {
        let mut lock = Self::in_dir(lock_dir, target);
        let deadline = Instant::now() + wait;
        loop {
            match lock.try_lock() {
                Ok(()) => return Ok(lock),
                Err(err) if err.is_already_held() && Instant::now() < deadline => {
                    thread::sleep(POLL_INTERVAL);
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Try to take the lock without blocking.
    ///
    /// Fails with [`LockError::AlreadyHeld`] if any holder exists, including
    /// this handle or another handle in the same process.
    pub fn try_lock(&mut self) -> Result<(), LockError> {
        if self.file.is_some() {
            return Err(self.already_held());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }

        for _ in 0..INODE_RACE_ATTEMPTS {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&self.path)
                .map_err(|source| self.io_error(source))?;

            match file.try_lock_exclusive() {
                Ok(()) => {}
                Err(err) if is_contended(&err) => {
                    debug!(target = %self.target.display(), "lock already held");
                    return Err(self.already_held());
                }
                Err(source) => return Err(self.io_error(source)),
            }

            // A previous holder may have unlinked the file after we opened it;
            // a lock on an orphaned inode excludes nobody.
            if !still_linked(&file, &self.path) {
                debug!(path = %self.path.display(), "lock file replaced while locking, retrying");
                continue;
            }

            write_owner(&file).map_err(|source| self.io_error(source))?;
            debug!(target = %self.target.display(), path = %self.path.display(), "lock acquired");
            self.file = Some(file);
            return Ok(());
        }

        Err(self.already_held())
    }

    /// Release the lock and delete the lock file. Safe to call repeatedly.
    pub fn unlock(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        // Unlink while still holding the lock so a waiter never locks a file
        // we are about to delete.
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    err = %err,
                    "failed to remove lock file",
                );
            }
        }
        if let Err(err) = FileExt::unlock(&file) {
            warn!(path = %self.path.display(), err = %err, "failed to release lock");
        }
        debug!(target = %self.target.display(), "lock released");
    }

    fn already_held(&self) -> LockError {
        LockError::AlreadyHeld {
            target: self.target.clone(),
            lock_path: self.path.clone(),
        }
    }

    fn io_error(&self, source: io::Error) -> LockError {
        LockError::Io {
            lock_path: self.path.clone(),
            source,
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn still_linked(file: &File, path: &Path) -> bool {
    match (file.metadata(), fs::metadata(path)) {
        (Ok(held), Ok(on_disk)) => held.dev() == on_disk.dev() && held.ino() == on_disk.ino(),
        _ => false,
    }
}

fn write_owner(mut file: &File) -> io::Result<()> {
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_on_same_target_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("repo");

        let mut first = FileLock::in_dir(temp.path(), &target);
        first.try_lock().expect("first lock");

        let mut second = FileLock::in_dir(temp.path(), &target);
        let err = second.try_lock().unwrap_err();
        assert!(err.is_already_held(), "unexpected error: {err}");
        assert!(err.to_string().contains("already locked"));
    }

    #[test]
    fn relock_after_unlock_succeeds() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("repo");

        let mut first = FileLock::in_dir(temp.path(), &target);
        first.try_lock().expect("first lock");
        first.unlock();
        assert!(!first.path().exists());

        let mut second = FileLock::in_dir(temp.path(), &target);
        second.try_lock().expect("relock");
    }

    #[test]
    fn unlock_twice_is_harmless() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut lock = FileLock::in_dir(temp.path(), temp.path().join("x"));
        lock.try_lock().expect("lock");
        lock.unlock();
        lock.unlock();
        assert!(!lock.is_held());
    }

    #[test]
    fn same_handle_cannot_lock_twice() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut lock = FileLock::in_dir(temp.path(), temp.path().join("x"));
        lock.try_lock().expect("lock");
        assert!(lock.try_lock().unwrap_err().is_already_held());
    }

    #[test]
    fn drop_releases_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("repo");
        {
            let _held = FileLock::acquire(temp.path(), &target).expect("lock");
        }
        FileLock::acquire(temp.path(), &target).expect("lock after drop");
    }

    #[test]
    fn different_targets_do_not_contend() {
        let temp = tempfile::tempdir().expect("tempdir");
        let _a = FileLock::acquire(temp.path(), temp.path().join("a")).expect("a");
        let _b = FileLock::acquire(temp.path(), temp.path().join("b")).expect("b");
    }

    #[test]
    fn filesystem_root_and_relative_root_do_not_contend() {
        let temp = tempfile::tempdir().expect("tempdir");
        let fs_root = FileLock::acquire(temp.path(), "/").expect("lock /");
        let named = FileLock::acquire(temp.path(), "root").expect("lock root");
        assert_ne!(fs_root.path(), named.path());
    }

    #[test]
    fn creates_missing_lock_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock_dir = temp.path().join("nested").join(LOCK_DIR_NAME);
        let lock = FileLock::acquire(&lock_dir, "/srv/repo").expect("lock");
        assert!(lock.path().starts_with(&lock_dir));
        assert!(lock.path().to_string_lossy().ends_with("_ssrv_srepo.lock"));
    }

    #[test]
    fn acquire_within_waits_for_release() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("repo");
        let held = FileLock::acquire(temp.path(), &target).expect("lock");

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            drop(held);
        });
        let lock = FileLock::acquire_within(temp.path(), &target, Duration::from_secs(10))
            .expect("lock after release");
        assert!(lock.is_held());
        releaser.join().expect("join");
    }

    #[test]
    fn acquire_within_gives_up() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("repo");
        let _held = FileLock::acquire(temp.path(), &target).expect("lock");
        let err = FileLock::acquire_within(temp.path(), &target, Duration::from_millis(60))
            .unwrap_err();
        assert!(err.is_already_held());
    }

    #[test]
    fn symlinked_alias_shares_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let real = temp.path().join("real");
        fs::create_dir_all(&real).expect("mkdir");
        let alias = temp.path().join("alias");
        std::os::unix::fs::symlink(&real, &alias).expect("symlink");

        let _held = FileLock::acquire(temp.path(), &real).expect("lock real");
        let err = FileLock::acquire(temp.path(), &alias).unwrap_err();
        assert!(err.is_already_held());
    }
}
