//! Advisory per-record file locks with a bounded wait.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use fs2::FileExt;
use tracing::{debug, warn};

use super::store::StoreError;

const LOCK_RETRY: Duration = Duration::from_millis(25);

/// Exclusive lock on one record. Released when dropped.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire an exclusive lock on `path`, waiting at most `timeout`.
    ///
    /// The lock file is created on demand; its contents are irrelevant.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create lock directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("open lock file {}", path.display()))?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(err) if err.kind() == ErrorKind::WouldBlock || is_contended(&err) => {
                    if start.elapsed() >= timeout {
                        warn!(lock = %path.display(), waited_ms = timeout.as_millis() as u64, "lock wait timed out");
                        return Err(StoreError::LockTimeout {
                            lock: path.display().to_string(),
                            waited_ms: timeout.as_millis() as u64,
                        }
                        .into());
                    }
                    thread::sleep(LOCK_RETRY);
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("lock {}", path.display()));
                }
            }
        }
        debug!(lock = %path.display(), waited_ms = start.elapsed().as_millis() as u64, "lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// fs2 reports contention as `lock_contended_error()`, which is `WouldBlock`
/// on unix but a raw OS error on some platforms.
fn is_contended(err: &std::io::Error) -> bool {
    err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_times_out_while_first_is_held() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("metrics.json.lock");

        let held = FileLock::acquire(&path, Duration::from_millis(100)).expect("first lock");
        let err = FileLock::acquire(&path, Duration::from_millis(100)).expect_err("contended");
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::LockTimeout { .. })
        ));

        drop(held);
        FileLock::acquire(&path, Duration::from_millis(100)).expect("released");
    }

    #[test]
    fn creates_missing_parent_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested/state/patterns.json.lock");
        let lock = FileLock::acquire(&path, Duration::from_millis(100)).expect("lock");
        assert_eq!(lock.path(), path);
        assert!(path.exists());
    }
}
