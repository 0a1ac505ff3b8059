// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Helpers shared by unit tests across the workspace.

use std::path::Path;

use anyhow::{Context, Result};

pub use fileutil::SafeTempDir;

/// Creates the listed files under `root`, making parent directories as
/// needed. Paths are relative to `root`.
pub fn write_files(root: &Path, files: &[(&str, &str)]) -> Result<()> {
    for (rel, contents) in files {
        let path = root.join(rel);
        let parent = path.parent().context("Path must have parent")?;
        std::fs::create_dir_all(parent)?;
        std::fs::write(&path, contents)?;
    }
    Ok(())
}

/// Lists the relative paths of all files under `root`, sorted.
pub fn list_files(root: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                stack.push(entry.path());
            } else {
                out.push(
                    entry
                        .path()
                        .strip_prefix(root)?
                        .to_string_lossy()
                        .into_owned(),
                );
            }
        }
    }
    out.sort();
    Ok(out)
}
