//! File locking and atomic writes for snail's local files
//!
//! The check-in log and backup archives live outside the database, so two
//! snail processes can race on them. Writers take an exclusive `fs2` lock on
//! a sibling `<file>.lock` and replace the target with a fully written temp
//! file, so readers never see a partial write.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use tempfile::NamedTempFile;

use crate::error::{Error, Result};

/// Default lock timeout in milliseconds
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5000;

const LOCK_RETRY_INTERVAL_MS: u64 = 25;

fn is_lock_contended(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }

    // Windows reports sharing/lock violations as raw OS errors.
    #[cfg(windows)]
    {
        matches!(err.raw_os_error(), Some(32) | Some(33))
    }
    #[cfg(not(windows))]
    {
        false
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

/// Path of the lock file guarding `path`.
pub fn lock_path_for(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.lock", path.display()))
}

/// Exclusive lock guard, released on drop.
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Acquire an exclusive lock, waiting up to `timeout_ms`.
    pub fn acquire(path: impl AsRef<Path>, timeout_ms: u64) -> Result<Self> {
        let path = path.as_ref();
        let file = open_lock_file(path)?;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(FileLock { file }),
                Err(err) if is_lock_contended(&err) => {
                    if Instant::now() >= deadline {
                        return Err(Error::LockFailed(path.to_path_buf()));
                    }
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_INTERVAL_MS));
                }
                Err(err) => return Err(Error::Io(err)),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Replace `path` with `data` via a temp file in the same directory.
///
/// Does not lock; see [`write_atomic_locked`].
pub fn write_atomic(path: impl AsRef<Path>, data: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let mut temp = NamedTempFile::new_in(&parent)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| Error::Io(err.error))?;
    Ok(())
}

/// Atomic write while holding `<path>.lock`.
pub fn write_atomic_locked(path: impl AsRef<Path>, data: &[u8], timeout_ms: u64) -> Result<()> {
    let path = path.as_ref();
    let _lock = FileLock::acquire(lock_path_for(path), timeout_ms)?;
    write_atomic(path, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn lock_is_exclusive_until_dropped() {
        let dir = TempDir::new().expect("tempdir");
        let lock_path = dir.path().join("checkins.json.lock");

        let lock = FileLock::acquire(&lock_path, 1000).expect("acquire");
        assert!(FileLock::acquire(&lock_path, 50).is_err());

        drop(lock);
        FileLock::acquire(&lock_path, 50).expect("free after drop");
    }

    #[test]
    fn timeout_returns_lock_failed() {
        let dir = TempDir::new().expect("tempdir");
        let lock_path = dir.path().join("busy.lock");

        let _held = FileLock::acquire(&lock_path, 1000).expect("acquire");
        let result = FileLock::acquire(&lock_path, 50);
        assert!(matches!(result, Err(Error::LockFailed(_))));
    }

    #[test]
    fn atomic_write_replaces_contents() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nested").join("data.json");

        write_atomic(&path, b"first").expect("write");
        write_atomic(&path, b"second").expect("overwrite");
        assert_eq!(fs::read_to_string(&path).expect("read"), "second");
    }

    #[test]
    fn concurrent_locked_writes_leave_one_whole_payload() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("checkins.json");

        let writers = 6;
        let barrier = Arc::new(Barrier::new(writers));
        let mut expected = Vec::new();
        let mut handles = Vec::new();
        for idx in 0..writers {
            let barrier = Arc::clone(&barrier);
            let path = path.clone();
            let payload = format!("{{\"writer\":{idx},\"pad\":\"{}\"}}", "x".repeat(128));
            expected.push(payload.clone());
            handles.push(thread::spawn(move || {
                barrier.wait();
                write_atomic_locked(&path, payload.as_bytes(), 2000).expect("locked write");
            }));
        }
        for handle in handles {
            handle.join().expect("join");
        }

        let contents = fs::read_to_string(&path).expect("read");
        assert!(expected.contains(&contents));
    }
}
