//! Cross-process advisory lock for key generation.
//!
//! Several worker processes started from the same deployment share a keys
//! directory but no memory. [`KeyGenerationLock`] serializes the
//! "generate and persist" step between them using the OS advisory file lock
//! (`flock` on Unix, `LockFileEx` on Windows). The lock is released when the
//! guard is dropped, on every exit path.

use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use fs2::FileExt;

use crate::error::AuthError;

/// Interval between lock acquisition attempts.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Held exclusive lock on a key generation lock file.
#[derive(Debug)]
pub struct KeyGenerationLock {
    file: File,
    path: PathBuf,
}

impl KeyGenerationLock {
    /// Acquires the lock at `path`, polling until `timeout` elapses.
    ///
    /// The lock file is created if missing. Its contents are never read; only
    /// the advisory lock on it matters.
    ///
    /// # Errors
    ///
    /// - [`AuthError::LockTimeout`] if another holder kept the lock for the whole wait
    /// - [`AuthError::Io`] if the lock file cannot be opened or locking fails for a reason other
    ///   than contention
    #[tracing::instrument(
        skip_all,
        fields(path = %path.display(), timeout_ms = timeout.as_millis() as u64)
    )]
    pub async fn acquire(path: &Path, timeout: Duration) -> Result<Self, AuthError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| AuthError::io(path, e))?;

        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    tracing::debug!(
                        waited_ms = started.elapsed().as_millis() as u64,
                        "acquired key generation lock"
                    );
                    return Ok(Self { file, path: path.to_path_buf() });
                },
                Err(err) if is_contended(&err) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(AuthError::lock_timeout(path, waited.as_millis() as u64));
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL.min(timeout - waited)).await;
                },
                Err(err) => return Err(AuthError::io(path, err)),
            }
        }
    }

    /// Returns the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for KeyGenerationLock {
    fn drop(&mut self) {
        // Closing the descriptor releases the lock too; unlocking explicitly
        // makes the release visible before the File is dropped.
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::warn!(
                path = %self.path.display(),
                error = %err,
                "failed to release key generation lock"
            );
        } else {
            tracing::debug!(path = %self.path.display(), "released key generation lock");
        }
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.lock");

        let lock = KeyGenerationLock::acquire(&path, Duration::from_secs(1)).await.unwrap();
        assert_eq!(lock.path(), path.as_path());
        drop(lock);

        // Released on drop, so a second acquisition succeeds immediately.
        let again = KeyGenerationLock::acquire(&path, Duration::from_millis(50)).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_contended_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.lock");

        let _held = KeyGenerationLock::acquire(&path, Duration::from_secs(1)).await.unwrap();

        let started = Instant::now();
        let result = KeyGenerationLock::acquire(&path, Duration::from_millis(250)).await;
        assert!(matches!(result, Err(AuthError::LockTimeout { .. })), "got {result:?}");
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_holder_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.lock");

        let held = KeyGenerationLock::acquire(&path, Duration::from_secs(1)).await.unwrap();
        let waiter_path = path.clone();
        let waiter = tokio::spawn(async move {
            KeyGenerationLock::acquire(&waiter_path, Duration::from_secs(5)).await.map(|_| ())
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        drop(held);

        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_unwritable_directory_is_io_error() {
        let result = KeyGenerationLock::acquire(
            Path::new("/nonexistent-dir-for-lock-test/keys.lock"),
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(result, Err(AuthError::Io { .. })));
    }
}
