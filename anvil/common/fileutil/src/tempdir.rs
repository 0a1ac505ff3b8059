// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
};

use anyhow::Result;
use once_cell::sync::Lazy;
use tracing::info_span;

static DEFAULT_PREFIX: Lazy<OsString> = Lazy::new(|| {
    let current_exe = std::env::current_exe().unwrap_or_default();
    let current_program_name = current_exe
        .file_name()
        .unwrap_or(OsStr::new("__unknown__"))
        .to_string_lossy();
    format!("anvil.{}.", current_program_name).into()
});

/// Thin wrapper of [`tempfile::TempDir`] that prefixes directory names with
/// the current program name so that leftover directories are attributable.
pub struct SafeTempDir {
    dir: Option<PathBuf>,
}

impl SafeTempDir {
    pub fn new() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&*DEFAULT_PREFIX)
            .tempdir()?;
        Ok(Self::take(&dir.into_path()))
    }

    /// Creates a temporary directory under `base_dir` instead of the system
    /// temp dir. Useful to keep scratch files on the same filesystem as the
    /// final destination so renames stay atomic.
    pub fn new_in(base_dir: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&*DEFAULT_PREFIX)
            .tempdir_in(base_dir)?;
        Ok(Self::take(&dir.into_path()))
    }

    /// Takes the ownership of an existing directory.
    pub fn take(dir: &Path) -> Self {
        Self {
            dir: Some(dir.to_path_buf()),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.as_ref().unwrap()
    }

    /// Converts [`SafeTempDir`] into [`PathBuf`]. After calling this function,
    /// it is the caller's responsibility to remove the directory after use.
    pub fn into_path(mut self) -> PathBuf {
        self.dir.take().unwrap()
    }
}

impl Drop for SafeTempDir {
    fn drop(&mut self) {
        if let Some(dir) = &self.dir {
            let _span = info_span!("SafeTempDir::drop", dir = ?dir).entered();
            std::fs::remove_dir_all(dir).expect("Failed to remove temporary directory");
        }
    }
}
