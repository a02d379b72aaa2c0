use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

/// How long to wait between attempts to take a held lock.
const RETRY_PERIOD: Duration = Duration::from_millis(200);

/// Exclusive access to a file, held through a sibling lock file that exists
/// for as long as this guard lives.
pub struct LockedFile {
    /// Path to the lock file.
    lock_path: PathBuf,
    /// The file this lock protects.
    file_path: PathBuf,
}

impl LockedFile {
    /// Waits until the lock is free, then takes it.
    pub async fn acquire(
        lock_path: impl Into<PathBuf>,
        file_path: impl Into<PathBuf>,
    ) -> io::Result<Self> {
        let lock_path = lock_path.into();
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(_) => break,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    tokio::time::sleep(RETRY_PERIOD).await
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Self {
            lock_path,
            file_path: file_path.into(),
        })
    }

    /// Locks `file_path` through `<file_path>.lock`.
    pub async fn acquire_for(file_path: impl Into<PathBuf>) -> io::Result<Self> {
        let file_path = file_path.into();
        let mut lock_path = file_path.clone().into_os_string();
        lock_path.push(".lock");
        Self::acquire(lock_path, file_path).await
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    pub fn read_handle(&self) -> io::Result<File> {
        File::open(&self.file_path)
    }

    pub fn write_handle(&self) -> io::Result<File> {
        File::create(&self.file_path)
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.lock_path) {
            warn!(path = %self.lock_path.display(), error = %e, "failed to remove lock file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let table = dir.path().join("jobs.yaml");
        let held = LockedFile::acquire_for(&table).await.unwrap();
        assert!(dir.path().join("jobs.yaml.lock").exists());

        let second = tokio::time::timeout(RETRY_PERIOD * 3, LockedFile::acquire_for(&table)).await;
        assert!(second.is_err());

        drop(held);
        assert!(!dir.path().join("jobs.yaml.lock").exists());
        let again = LockedFile::acquire_for(&table).await.unwrap();
        std::io::Write::write_all(&mut again.write_handle().unwrap(), b"[]").unwrap();
        assert_eq!(std::fs::read_to_string(again.path()).unwrap(), "[]");
    }
}
