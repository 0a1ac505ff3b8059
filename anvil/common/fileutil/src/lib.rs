// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

mod lock;
mod mtime;
mod tempdir;

pub use lock::*;
pub use mtime::*;
pub use tempdir::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Writes `contents` to `path` only when the file is missing or its current
/// contents differ. Returns true when the file was actually (re)written.
pub fn write_file_if_different(path: &Path, contents: &str) -> Result<bool> {
    if let Ok(old) = std::fs::read_to_string(path) {
        if old == contents {
            return Ok(false);
        }
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("mkdir {}", parent.display()))?;
    }
    std::fs::write(path, contents).with_context(|| format!("write {}", path.display()))?;
    Ok(true)
}

/// Renames `src` to `dst`, falling back to copy+remove across filesystems.
pub fn move_file(src: &Path, dst: &Path) -> Result<()> {
    match std::fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(src, dst)
                .with_context(|| format!("copy {} -> {}", src.display(), dst.display()))?;
            std::fs::remove_file(src).with_context(|| format!("rm {}", src.display()))?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_file_if_different_skips_identical_contents() -> Result<()> {
        let dir = SafeTempDir::new()?;
        let path = dir.path().join("sub").join("a.txt");

        assert!(write_file_if_different(&path, "hello")?);
        assert!(!write_file_if_different(&path, "hello")?);
        assert!(write_file_if_different(&path, "world")?);
        assert_eq!(std::fs::read_to_string(&path)?, "world");
        Ok(())
    }

    #[test]
    fn move_file_moves() -> Result<()> {
        let dir = SafeTempDir::new()?;
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::write(&src, "payload")?;

        move_file(&src, &dst)?;

        assert!(!src.exists());
        assert_eq!(std::fs::read_to_string(&dst)?, "payload");
        Ok(())
    }
}
