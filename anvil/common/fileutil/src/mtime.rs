// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};

/// Last write time of `path` in whole seconds since the Unix epoch.
pub fn mtime_seconds(path: &Path) -> Result<u64> {
    let meta = std::fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    let mtime = meta
        .modified()
        .with_context(|| format!("mtime {}", path.display()))?;
    Ok(mtime
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs())
}

pub fn mtime(path: &Path) -> Result<SystemTime> {
    let meta = std::fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    meta.modified()
        .with_context(|| format!("mtime {}", path.display()))
}

/// XOR of the mtimes of `paths`. Used as a cheap fingerprint of "did any of
/// these files change since the last build".
pub fn xor_mtimes<'a>(paths: impl IntoIterator<Item = &'a Path>) -> Result<u64> {
    let mut acc = 0u64;
    for p in paths {
        acc ^= mtime_seconds(p)?;
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SafeTempDir;

    #[test]
    fn xor_of_one_file_is_its_mtime() -> Result<()> {
        let dir = SafeTempDir::new()?;
        let f = dir.path().join("f");
        std::fs::write(&f, "x")?;
        assert_eq!(xor_mtimes([f.as_path()])?, mtime_seconds(&f)?);
        Ok(())
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(mtime_seconds(Path::new("/nonexistent/anvil/file")).is_err());
    }
}
