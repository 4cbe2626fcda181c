//! Cross-process lock over a lock file
//!
//! Mutual exclusion between threads and processes sharing one token cache.
//! Ownership is an exclusively held handle on `<cache>.lockfile`:
//! - Unix: the file is opened and then `flock(LOCK_EX | LOCK_NB)`-ed, since
//!   opening alone excludes nobody. The holder unlinks the file on release.
//! - Windows: the file is opened without write sharing and with
//!   delete-on-close, so other openers fail with a sharing violation while
//!   diagnostics can still read the owner payload.
//!
//! Contention is retried with a fixed delay up to a bounded attempt count.
//! Waiters are not served in FIFO order.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::LockOptions;

/// Result type for lock operations
pub type LockResult<T> = Result<T, LockError>;

/// Errors raised while acquiring the lock
#[derive(Debug, Error)]
pub enum LockError {
    /// Another holder kept the lock for the whole retry budget
    #[error("Unable to acquire lock {path} after {attempts} attempts")]
    Contention {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    /// The lock file could not be opened for a reason other than contention
    #[error("Cannot open lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Acquisition was cancelled by the caller
    #[error("Acquiring lock {path} was cancelled")]
    Cancelled { path: PathBuf },
}

/// Outcome of one non-blocking acquisition attempt
enum Attempt {
    Acquired(File),
    Contended(io::Error),
}

/// Exclusive ownership of one lock file
///
/// Released on [`CrossPlatLock::release`] or drop, whichever comes first.
#[derive(Debug)]
pub struct CrossPlatLock {
    path: PathBuf,
    file: Option<File>,
}

impl CrossPlatLock {
    /// Acquires the lock at `path`, blocking for up to the retry budget
    pub fn acquire(path: impl Into<PathBuf>, options: LockOptions) -> LockResult<Self> {
        Self::acquire_with_cancel(path, options, &CancellationToken::new())
    }

    /// Acquires the lock, giving up early once `cancel` fires
    ///
    /// The token is checked before every attempt.
    pub fn acquire_with_cancel(
        path: impl Into<PathBuf>,
        options: LockOptions,
        cancel: &CancellationToken,
    ) -> LockResult<Self> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;
        }

        let mut last_error = None;
        for attempt in 1..=options.retry_count {
            if cancel.is_cancelled() {
                debug!("Lock acquisition on {} cancelled", path.display());
                return Err(LockError::Cancelled { path });
            }

            let outcome = try_acquire(&path).map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;

            match outcome {
                Attempt::Acquired(file) => {
                    let mut lock = Self {
                        path,
                        file: Some(file),
                    };
                    lock.write_owner();
                    debug!(
                        "Acquired lock {} on attempt {}",
                        lock.path.display(),
                        attempt
                    );
                    return Ok(lock);
                }
                Attempt::Contended(e) => {
                    trace!("Lock {} busy (attempt {}): {}", path.display(), attempt, e);
                    last_error = Some(e);
                    thread::sleep(options.retry_delay);
                }
            }
        }

        warn!(
            "Giving up on lock {} after {} attempts",
            path.display(),
            options.retry_count
        );
        Err(LockError::Contention {
            path,
            attempts: options.retry_count,
            source: last_error
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "no attempt made")),
        })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true until the lock is released
    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Releases the lock; further calls do nothing
    pub fn release(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };

        // Unlink while still holding the lock so nobody can lock a file that
        // is about to disappear. Waiters already holding the old inode notice
        // the mismatch and retry.
        #[cfg(unix)]
        {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove lock file {}: {}", self.path.display(), e);
                }
            }
        }

        drop(file);
        debug!("Released lock {}", self.path.display());
    }

    /// Records the holder's process id and name for diagnostics
    fn write_owner(&mut self) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_default();
        let result = file
            .set_len(0)
            .and_then(|_| writeln!(file, "{} {}", std::process::id(), name))
            .and_then(|_| file.flush());
        if let Err(e) = result {
            debug!("Could not write lock owner to {}: {}", self.path.display(), e);
        }
    }
}

impl Drop for CrossPlatLock {
    fn drop(&mut self) {
        self.release();
    }
}

// ── Unix: open + flock ──────────────────────────────────────────────

#[cfg(unix)]
fn try_acquire(path: &Path) -> io::Result<Attempt> {
    use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
    use std::os::unix::io::AsRawFd;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(path)?;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result != 0 {
        let err = io::Error::last_os_error();
        return if err.kind() == io::ErrorKind::WouldBlock {
            Ok(Attempt::Contended(err))
        } else {
            Err(err)
        };
    }

    // The previous holder may have unlinked the path between our open and
    // our flock; a lock on an orphaned inode excludes nobody.
    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) if current.dev() == held.dev() && current.ino() == held.ino() => {
            Ok(Attempt::Acquired(file))
        }
        Ok(_) => Ok(Attempt::Contended(io::Error::new(
            io::ErrorKind::WouldBlock,
            "lock file was replaced while waiting",
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Attempt::Contended(io::Error::new(
            io::ErrorKind::WouldBlock,
            "lock file was removed while waiting",
        ))),
        Err(e) => Err(e),
    }
}

// ── Windows: exclusive share mode + delete-on-close ─────────────────

#[cfg(windows)]
fn try_acquire(path: &Path) -> io::Result<Attempt> {
    use std::os::windows::fs::OpenOptionsExt;
    use windows::Win32::Storage::FileSystem::{
        FILE_FLAG_DELETE_ON_CLOSE, FILE_SHARE_DELETE, FILE_SHARE_READ,
    };

    const ERROR_ACCESS_DENIED: i32 = 5;
    const ERROR_SHARING_VIOLATION: i32 = 32;
    const ERROR_LOCK_VIOLATION: i32 = 33;

    let opened = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .share_mode(FILE_SHARE_READ.0 | FILE_SHARE_DELETE.0)
        .custom_flags(FILE_FLAG_DELETE_ON_CLOSE.0)
        .open(path);

    match opened {
        Ok(file) => Ok(Attempt::Acquired(file)),
        Err(e) => match e.raw_os_error() {
            Some(ERROR_SHARING_VIOLATION) | Some(ERROR_LOCK_VIOLATION) => {
                Ok(Attempt::Contended(e))
            }
            // A file pending deletion by the previous holder denies access
            Some(ERROR_ACCESS_DENIED) if path.exists() => Ok(Attempt::Contended(e)),
            _ => Err(e),
        },
    }
}

#[cfg(not(any(unix, windows)))]
fn try_acquire(path: &Path) -> io::Result<Attempt> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => Ok(Attempt::Acquired(file)),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(Attempt::Contended(e)),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn quick() -> LockOptions {
        LockOptions::new(Duration::from_millis(10), 5)
    }

    #[test]
    fn test_acquire_writes_owner() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("msal.cache.lockfile");

        let lock = CrossPlatLock::acquire(&path, quick()).unwrap();
        assert!(lock.is_held());

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with(&std::process::id().to_string()));
    }

    #[test]
    fn test_acquire_creates_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/msal.cache.lockfile");

        let lock = CrossPlatLock::acquire(&path, quick()).unwrap();
        assert!(lock.is_held());
    }

    #[test]
    fn test_second_holder_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("msal.cache.lockfile");

        let _held = CrossPlatLock::acquire(&path, quick()).unwrap();
        let result = CrossPlatLock::acquire(&path, quick());

        match result {
            Err(LockError::Contention { attempts, .. }) => assert_eq!(attempts, 5),
            other => panic!("expected contention, got {other:?}"),
        }
    }

    #[test]
    fn test_release_is_idempotent_and_deletes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("msal.cache.lockfile");

        let mut lock = CrossPlatLock::acquire(&path, quick()).unwrap();
        lock.release();
        lock.release();

        assert!(!lock.is_held());
        assert!(!path.exists());
    }

    #[test]
    fn test_reacquire_after_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("msal.cache.lockfile");

        let first = CrossPlatLock::acquire(&path, quick()).unwrap();
        drop(first);

        let second = CrossPlatLock::acquire(&path, quick());
        assert!(second.is_ok());
    }

    #[test]
    fn test_waiter_acquires_after_holder_releases() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("msal.cache.lockfile");

        let held = CrossPlatLock::acquire(&path, quick()).unwrap();
        let waiter_path = path.clone();
        let waiter = thread::spawn(move || {
            CrossPlatLock::acquire(waiter_path, LockOptions::new(Duration::from_millis(10), 500))
        });

        thread::sleep(Duration::from_millis(100));
        drop(held);

        let acquired = waiter.join().unwrap();
        assert!(acquired.unwrap().is_held());
    }

    #[test]
    fn test_timeout_is_bounded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("msal.cache.lockfile");
        let _held = CrossPlatLock::acquire(&path, quick()).unwrap();

        let options = LockOptions::new(Duration::from_millis(100), 20);
        let start = Instant::now();
        let result = CrossPlatLock::acquire(&path, options);
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(LockError::Contention { .. })));
        assert!(elapsed >= Duration::from_secs(2), "gave up too early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(3500), "waited too long: {elapsed:?}");
    }

    #[test]
    fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("msal.cache.lockfile");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = CrossPlatLock::acquire_with_cancel(&path, quick(), &cancel);
        assert!(matches!(result, Err(LockError::Cancelled { .. })));
    }

    #[test]
    fn test_cancelled_while_waiting() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("msal.cache.lockfile");
        let _held = CrossPlatLock::acquire(&path, quick()).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });

        let start = Instant::now();
        let result = CrossPlatLock::acquire_with_cancel(
            &path,
            LockOptions::new(Duration::from_millis(50), 600),
            &cancel,
        );

        assert!(matches!(result, Err(LockError::Cancelled { .. })));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_path_fails_without_retrying() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"file").unwrap();
        let path = blocker.join("msal.cache.lockfile");

        let start = Instant::now();
        let result = CrossPlatLock::acquire(&path, LockOptions::new(Duration::from_millis(100), 50));

        assert!(matches!(result, Err(LockError::Io { .. })));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
