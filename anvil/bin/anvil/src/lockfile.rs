// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The lock file: a JSON pinning of unresolved requests to resolved
//! packages, used to make builds reproducible.

use std::{collections::BTreeMap, path::Path};

use anyhow::{anyhow, bail, Context, Result};
use pkgid::{PackageName, UnresolvedPackageName};
use serde_json::json;
use tracing::info;

use crate::error::Error;

const LOCK_FILE_VERSION: i64 = 1;

/// Loads a lock file, refusing any schema version other than the current
/// one. The design never guesses intent across versions.
pub fn load(path: &Path) -> Result<BTreeMap<UnresolvedPackageName, PackageName>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let j: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| anyhow!(Error::CatalogCorruption(format!("bad lock file: {e}"))))?;

    let version = &j["schema"]["version"];
    if version.is_null() {
        bail!(Error::CatalogCorruption(format!(
            "cannot use this lock file: unknown version, expected {LOCK_FILE_VERSION}"
        )));
    }
    if version.as_i64() != Some(LOCK_FILE_VERSION) {
        bail!(Error::CatalogCorruption(format!(
            "cannot use this lock file: bad version {version}, expected {LOCK_FILE_VERSION}"
        )));
    }

    let mut out = BTreeMap::new();
    if let Some(obj) = j["resolved_packages"].as_object() {
        for (k, v) in obj {
            let u: UnresolvedPackageName = k.parse()?;
            let p: PackageName = v["package"]
                .as_str()
                .ok_or_else(|| {
                    anyhow!(Error::CatalogCorruption(format!(
                        "lock file entry {k:?} has no package"
                    )))
                })?
                .parse()?;
            out.insert(u, p);
        }
    }
    Ok(out)
}

/// Saves the resolved map, sorted for stable diffs.
pub fn save(path: &Path, pkgs: &BTreeMap<UnresolvedPackageName, PackageName>) -> Result<()> {
    let mut resolved = serde_json::Map::new();
    for (u, p) in pkgs {
        resolved.insert(u.to_string(), json!({ "package": p.to_string() }));
    }
    let j = json!({
        "schema": { "version": LOCK_FILE_VERSION },
        "resolved_packages": resolved,
    });
    let text = serde_json::to_string_pretty(&j)?;
    fileutil::write_file_if_different(path, &text)?;
    Ok(())
}

/// Logs a human-readable diff between the previous and the new pin sets.
pub fn log_diff(
    old: &BTreeMap<UnresolvedPackageName, PackageName>,
    new: &BTreeMap<UnresolvedPackageName, PackageName>,
) {
    for (u, p) in old {
        match new.get(u) {
            None => info!("Deleting dependency  : {u} ({p})"),
            Some(np) if np != p => info!("Updating dependency  : {u} ({p} -> {np})"),
            Some(_) => {}
        }
    }
    for (u, p) in new {
        if !old.contains_key(u) {
            info!("Adding new dependency: {u} -> {p}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testutil::SafeTempDir;

    fn sample() -> BTreeMap<UnresolvedPackageName, PackageName> {
        let mut m = BTreeMap::new();
        m.insert(
            "org.example.foo-[1.0.0,2.0.0)".parse().unwrap(),
            "org.example.foo-1.9.0".parse().unwrap(),
        );
        m.insert(
            "org.example.bar-master".parse().unwrap(),
            "org.example.bar-master".parse().unwrap(),
        );
        m
    }

    #[test]
    fn round_trip() -> Result<()> {
        let dir = SafeTempDir::new()?;
        let path = dir.path().join("sw.lock");
        save(&path, &sample())?;
        assert_eq!(load(&path)?, sample());

        // Saving the identical map does not rewrite the file.
        let mtime = fileutil::mtime(&path)?;
        save(&path, &sample())?;
        assert_eq!(fileutil::mtime(&path)?, mtime);
        Ok(())
    }

    #[test]
    fn schema_mismatch_is_fatal() -> Result<()> {
        let dir = SafeTempDir::new()?;
        let path = dir.path().join("sw.lock");
        std::fs::write(
            &path,
            r#"{"schema":{"version":2},"resolved_packages":{}}"#,
        )?;
        let err = load(&path).unwrap_err();
        assert!(matches!(
            crate::error::error_kind(&err),
            Some(Error::CatalogCorruption(_))
        ));
        assert!(err.to_string().contains("expected 1"));
        Ok(())
    }

    #[test]
    fn missing_version_is_fatal() -> Result<()> {
        let dir = SafeTempDir::new()?;
        let path = dir.path().join("sw.lock");
        std::fs::write(&path, r#"{"resolved_packages":{}}"#)?;
        assert!(load(&path).is_err());
        Ok(())
    }
}
