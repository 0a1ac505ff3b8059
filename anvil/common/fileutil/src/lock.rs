// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use fs2::FileExt;

/// Advisory cross-process lock held for the lifetime of the guard.
///
/// The lock file itself is left behind on unlock; removing it would race
/// with other processes opening the same path.
pub struct ScopedFileLock {
    file: File,
    path: PathBuf,
}

impl ScopedFileLock {
    /// Blocks until the exclusive lock on `<path>` can be taken.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("mkdir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open lock file {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("lock {}", path.display()))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Tries to take the lock without blocking. Returns None when some other
    /// process holds it.
    pub fn try_new(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("mkdir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open lock file {}", path.display()))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(_) => Ok(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScopedFileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Runs `job` under an exclusive file lock at `<lock_path>`. Other processes
/// calling with the same path wait for the job to finish first.
pub fn single_process_job<T>(lock_path: &Path, job: impl FnOnce() -> Result<T>) -> Result<T> {
    let _lock = ScopedFileLock::new(lock_path)?;
    job()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SafeTempDir;

    #[test]
    fn lock_is_exclusive_within_process() -> Result<()> {
        let dir = SafeTempDir::new()?;
        let path = dir.path().join("x.lock");

        let guard = ScopedFileLock::new(&path)?;
        assert!(ScopedFileLock::try_new(&path)?.is_none());
        drop(guard);
        assert!(ScopedFileLock::try_new(&path)?.is_some());
        Ok(())
    }

    #[test]
    fn single_process_job_runs_job() -> Result<()> {
        let dir = SafeTempDir::new()?;
        let out = single_process_job(&dir.path().join("job.lock"), || Ok(42))?;
        assert_eq!(out, 42);
        Ok(())
    }
}
