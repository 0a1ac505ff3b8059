// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Creating and extracting gzip-compressed tarballs of package source trees.

use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use walkdir::WalkDir;

/// Packs the contents of `src_dir` into a `.tar.gz` at `archive`.
///
/// Entries are stored with paths relative to `src_dir` and sorted by name so
/// that packing the same tree twice yields the same entry order.
pub fn pack_dir(src_dir: &Path, archive: &Path) -> Result<()> {
    if let Some(parent) = archive.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("mkdir {}", parent.display()))?;
    }
    let file =
        File::create(archive).with_context(|| format!("create {}", archive.display()))?;
    let enc = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(enc);

    for entry in WalkDir::new(src_dir).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src_dir)?;
        if entry.file_type().is_dir() {
            builder.append_dir(rel, entry.path())?;
        } else if entry.file_type().is_file() {
            let mut f = File::open(entry.path())
                .with_context(|| format!("open {}", entry.path().display()))?;
            builder.append_file(rel, &mut f)?;
        } else {
            bail!("Unsupported file type in {}", entry.path().display());
        }
    }

    builder.into_inner()?.finish()?.into_inner()?;
    Ok(())
}

/// Extracts a `.tar.gz` into `out_dir`, returning the top-level entries that
/// were created.
pub fn unpack(archive: &Path, out_dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(out_dir).with_context(|| format!("mkdir {}", out_dir.display()))?;
    let file = File::open(archive).with_context(|| format!("open {}", archive.display()))?;
    let mut ar = tar::Archive::new(GzDecoder::new(BufReader::new(file)));

    let mut top_level = Vec::new();
    for entry in ar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if let Some(first) = path.components().next() {
            let first = out_dir.join(first);
            if !top_level.contains(&first) {
                top_level.push(first);
            }
        }
        entry
            .unpack_in(out_dir)
            .with_context(|| format!("unpack {} into {}", path.display(), out_dir.display()))?;
    }
    Ok(top_level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fileutil::SafeTempDir;

    #[test]
    fn pack_and_unpack_round_trip() -> Result<()> {
        let dir = SafeTempDir::new()?;
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("nested"))?;
        std::fs::write(src.join("a.txt"), "alpha")?;
        std::fs::write(src.join("nested/b.txt"), "beta")?;

        let archive = dir.path().join("pkg.tar.gz");
        pack_dir(&src, &archive)?;

        let out = dir.path().join("out");
        let tops = unpack(&archive, &out)?;

        assert!(!tops.is_empty());
        assert_eq!(std::fs::read_to_string(out.join("a.txt"))?, "alpha");
        assert_eq!(std::fs::read_to_string(out.join("nested/b.txt"))?, "beta");
        Ok(())
    }

    #[test]
    fn unpack_missing_archive_fails() -> Result<()> {
        let dir = SafeTempDir::new()?;
        assert!(unpack(&dir.path().join("no.tar.gz"), dir.path()).is_err());
        Ok(())
    }
}
