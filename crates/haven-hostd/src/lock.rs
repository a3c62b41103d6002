//! Exclusive data-directory lock.
//!
//! Startup lock clearing is only sound when a single process owns the
//! metadata store, so the daemon takes an exclusive lockfile before
//! touching anything in the data directory.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

/// Held for the daemon's lifetime; the lockfile is removed on drop.
pub struct DataDirLock {
    path: PathBuf,
}

impl DataDirLock {
    /// Acquire the lock, failing if another process holds it.
    pub fn acquire(data_dir: &std::path::Path) -> anyhow::Result<DataDirLock> {
        let path = data_dir.join("havend.lock");
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| {
                anyhow::anyhow!(
                    "data directory {} is locked (remove {} if no daemon is running): {err}",
                    data_dir.display(),
                    path.display()
                )
            })?;
        writeln!(file, "{}", std::process::id())?;
        Ok(DataDirLock { path })
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), %err, "failed to remove lockfile");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_acquire_and_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = DataDirLock::acquire(dir.path()).expect("first acquire");
        assert!(DataDirLock::acquire(dir.path()).is_err(), "second must fail");
        drop(lock);
        let relock = DataDirLock::acquire(dir.path()).expect("acquire after release");
        drop(relock);
        assert!(!dir.path().join("havend.lock").exists());
    }
}
