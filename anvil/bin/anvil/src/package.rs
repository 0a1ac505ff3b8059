// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Package instances and the package hash contract.

use std::{
    fmt::{Debug, Display},
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
};

use anyhow::{bail, Result};
use blake2::{Blake2b512, Digest};
use pkgid::{PackageName, UnresolvedPackageName};
use settings::Settings;

use crate::error::Error;

/// Number of hex characters in the short package hash.
pub const SHORT_HASH_LEN: usize = 8;

/// Name of the directory inside a package dir holding the unpacked sources.
pub const SOURCE_DIR_NAME: &str = "sdir";

/// A package pinned by name and build settings. Two instances of one
/// package built with different settings are distinct ids.
#[derive(Clone)]
pub struct PackageId {
    name: PackageName,
    settings: Settings,
}

impl PackageId {
    pub fn new(name: PackageName, settings: Settings) -> Self {
        Self { name, settings }
    }

    pub fn name(&self) -> &PackageName {
        &self.name
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

impl Display for PackageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.settings.hash_string())
    }
}

impl Debug for PackageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PackageId({})", self)
    }
}

impl PartialEq for PackageId {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.settings == other.settings
    }
}

impl Eq for PackageId {}

impl Hash for PackageId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.settings.hash().hash(state);
    }
}

/// A package request pinned by unresolved name and build settings.
#[derive(Clone)]
pub struct UnresolvedPackageId {
    name: UnresolvedPackageName,
    settings: Settings,
}

impl UnresolvedPackageId {
    pub fn new(name: UnresolvedPackageName, settings: Settings) -> Self {
        Self { name, settings }
    }

    pub fn name(&self) -> &UnresolvedPackageName {
        &self.name
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

impl Display for UnresolvedPackageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.settings.hash_string())
    }
}

impl Debug for UnresolvedPackageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UnresolvedPackageId({})", self)
    }
}

/// Metadata attached to an installed or resolvable package.
#[derive(Clone, Debug, Default)]
pub struct PackageData {
    /// Strong hash of the source archive, hex encoded.
    pub hash: String,
    /// Direct dependencies as unresolved names.
    pub dependencies: Vec<UnresolvedPackageName>,
    /// Number of leading path components stripped when addressing files.
    pub prefix: i64,
    /// Overridden source directory; Some means the package resolves to a
    /// local tree instead of an unpacked archive.
    pub sdir: Option<PathBuf>,
}

/// A resolvable package produced by some storage.
pub trait Package: Send + Sync + Debug {
    fn id(&self) -> &PackageId;

    /// Metadata of this package. Storages load it lazily; instances hand
    /// out a snapshot.
    fn data(&self) -> Result<PackageData>;

    /// True when the package can be fed to the local-store install
    /// pipeline. Locally installed wrappers return false.
    fn is_installable(&self) -> bool {
        true
    }

    /// Fetches the source archive into `dst` with hash verification.
    /// Returns the (possibly re-resolved) metadata whose hash matched the
    /// downloaded bytes.
    fn copy_archive(&self, dst: &Path) -> Result<PackageData> {
        let _ = dst;
        bail!(Error::InternalInvariant(format!(
            "package {} has no archive source",
            self.id()
        )))
    }

    /// Directory holding the unpacked sources, when materialized on disk.
    fn source_dir(&self) -> Option<PathBuf> {
        None
    }

    fn clone_package(&self) -> Box<dyn Package>;
}

/// The package hash contract:
/// `blake2b_512(lowercased-dotted-path + "-" + version)`, hex encoded.
/// Changing this breaks cross-version catalog compatibility.
pub fn package_hash(name: &PackageName) -> String {
    let mut hasher = Blake2b512::new();
    hasher.update(name.path().to_string_lower().as_bytes());
    hasher.update(b"-");
    hasher.update(name.version().to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// First [`SHORT_HASH_LEN`] characters of the package hash.
pub fn short_package_hash(name: &PackageName) -> String {
    let mut h = package_hash(name);
    h.truncate(SHORT_HASH_LEN);
    h
}

/// Strong content hash of a file (blake2b-512, hex).
pub fn strong_file_hash(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Blake2b512::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Legacy weak content hash of a file (sha256, hex). Kept so archives
/// recorded by older catalogs still verify.
pub fn weak_file_hash(path: &Path) -> Result<String> {
    use sha2::Sha256;
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Checks a downloaded file against the expected strong hash, falling back
/// to the legacy weak hash. Returns the matching hash on success.
pub fn verify_file_hash(path: &Path, expected: &str) -> Result<Option<String>> {
    let strong = strong_file_hash(path)?;
    if strong == expected {
        return Ok(Some(strong));
    }
    let weak = weak_file_hash(path)?;
    if weak == expected {
        return Ok(Some(weak));
    }
    Ok(None)
}

/// Splits a hex hash into `nsubdirs` directories of `chars_per_subdir`
/// characters each, with the remainder as the final component.
pub fn hash_path(hash: &str, nsubdirs: usize, chars_per_subdir: usize) -> PathBuf {
    let mut p = PathBuf::new();
    let mut i = 0;
    for _ in 0..nsubdirs {
        p.push(&hash[i..i + chars_per_subdir]);
        i += chars_per_subdir;
    }
    if i < hash.len() {
        p.push(&hash[i..]);
    }
    p
}
