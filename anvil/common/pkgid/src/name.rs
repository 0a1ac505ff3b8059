// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    fmt::{Debug, Display},
    hash::Hash,
    str::FromStr,
};

use anyhow::{Context, Error, Result};

use crate::{PackagePath, PackageVersion, PackageVersionRange};

/// A fully pinned package: path plus one concrete version.
///
/// Displayed as `path-version`; package paths cannot contain `-`, so the
/// first `-` always separates the two.
///
/// # Example
///
/// ```
/// # use pkgid::PackageName;
/// let n: PackageName = "org.example.zlib-1.2.13".parse()?;
/// assert_eq!(n.path().to_string(), "org.example.zlib");
/// assert_eq!(n.version().to_string(), "1.2.13");
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Clone, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct PackageName {
    path: PackagePath,
    version: PackageVersion,
}

impl PackageName {
    pub fn new(path: PackagePath, version: PackageVersion) -> Self {
        Self { path, version }
    }

    pub fn path(&self) -> &PackagePath {
        &self.path
    }

    pub fn version(&self) -> &PackageVersion {
        &self.version
    }
}

impl FromStr for PackageName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, version) = s
            .split_once('-')
            .with_context(|| format!("Package name must be <path>-<version>: {s:?}"))?;
        Ok(Self {
            path: path.parse()?,
            version: version.parse()?,
        })
    }
}

impl Display for PackageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.path, self.version)
    }
}

impl Debug for PackageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PackageName({})", self)
    }
}

/// A package request: path plus the acceptable version range.
///
/// Displayed as `path-range`; the bare `path` form means "any version".
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct UnresolvedPackageName {
    path: PackagePath,
    range: PackageVersionRange,
}

impl UnresolvedPackageName {
    pub fn new(path: PackagePath, range: PackageVersionRange) -> Self {
        Self { path, range }
    }

    pub fn any_version(path: PackagePath) -> Self {
        Self {
            path,
            range: PackageVersionRange::any(),
        }
    }

    pub fn path(&self) -> &PackagePath {
        &self.path
    }

    pub fn range(&self) -> &PackageVersionRange {
        &self.range
    }

    /// True when `name` is an acceptable resolution of this request.
    pub fn matches(&self, name: &PackageName) -> bool {
        self.path == *name.path() && self.range.contains(name.version())
    }

    /// Some(name) when the range pins exactly one version.
    pub fn to_package_name(&self) -> Option<PackageName> {
        self.range
            .to_single_version()
            .map(|v| PackageName::new(self.path.clone(), v))
    }
}

impl From<PackageName> for UnresolvedPackageName {
    fn from(n: PackageName) -> Self {
        Self {
            range: n.version.clone().into(),
            path: n.path,
        }
    }
}

impl FromStr for UnresolvedPackageName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('-') {
            None => Ok(Self::any_version(s.parse()?)),
            Some((path, range)) => Ok(Self {
                path: path.parse()?,
                range: range.parse()?,
            }),
        }
    }
}

impl Display for UnresolvedPackageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.path, self.range)
    }
}

impl Debug for UnresolvedPackageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UnresolvedPackageName({})", self)
    }
}
