// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    cmp::Ordering,
    fmt::{Debug, Display},
    hash::{Hash, Hasher},
    str::FromStr,
};

use anyhow::{bail, Error, Result};

/// Top-level namespaces in their fixed sort order. Paths under an earlier
/// namespace sort before paths under a later one regardless of spelling.
const NAMESPACE_ORDER: &[&str] = &["com", "org", "pub", "pvt", "loc"];

const MAX_PATH_LEN: usize = 4096;

/// Dotted hierarchical identifier of a package, e.g. `org.example.zlib`.
///
/// Equality and hashing are case-insensitive; the original spelling is kept
/// for display.
///
/// # Example
///
/// ```
/// # use pkgid::PackagePath;
/// let p: PackagePath = "org.Example.Zlib".parse()?;
/// let q: PackagePath = "org.example.zlib".parse()?;
/// assert_eq!(p, q);
/// assert_eq!(p.to_string(), "org.Example.Zlib");
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Clone, Default)]
pub struct PackagePath {
    parts: Vec<String>,
}

fn is_valid_symbol(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

impl PackagePath {
    pub fn try_new(s: &str) -> Result<Self> {
        if s.len() > MAX_PATH_LEN {
            bail!("Too long package path (must be <= {MAX_PATH_LEN})");
        }
        let mut parts = Vec::new();
        for part in s.split('.') {
            if part.is_empty() {
                bail!("Empty segment in package path: {s:?}");
            }
            if let Some(c) = part.chars().find(|c| !is_valid_symbol(*c)) {
                bail!("Bad symbol {c:?} in package path: {s:?}");
            }
            parts.push(part.to_owned());
        }
        Ok(Self { parts })
    }

    fn from_parts(parts: &[String]) -> Self {
        Self {
            parts: parts.to_vec(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// First segment, e.g. `org` of `org.example.zlib`.
    pub fn namespace(&self) -> Option<&str> {
        self.parts.first().map(String::as_str)
    }

    /// Second segment, e.g. `example` of `org.example.zlib`.
    pub fn owner(&self) -> Option<&str> {
        self.parts.get(1).map(String::as_str)
    }

    /// Everything after the owner.
    pub fn tail(&self) -> PackagePath {
        if self.parts.len() < 2 {
            return PackagePath::default();
        }
        Self::from_parts(&self.parts[2..])
    }

    pub fn parent(&self) -> PackagePath {
        if self.parts.is_empty() {
            return PackagePath::default();
        }
        Self::from_parts(&self.parts[..self.parts.len() - 1])
    }

    /// Sub-path `[start, end)`; `end = None` means "to the end".
    pub fn slice(&self, start: usize, end: Option<usize>) -> PackagePath {
        let end = end.unwrap_or(self.parts.len());
        Self::from_parts(&self.parts[start..end])
    }

    pub fn name(&self) -> Option<&str> {
        self.parts.last().map(String::as_str)
    }

    /// True when `self` is a proper prefix of `rhs` (case-insensitive).
    pub fn is_root_of(&self, rhs: &PackagePath) -> bool {
        if self.parts.len() >= rhs.parts.len() {
            return false;
        }
        self.parts
            .iter()
            .zip(rhs.parts.iter())
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }

    pub fn has_namespace(&self) -> bool {
        match self.namespace() {
            Some(ns) => NAMESPACE_ORDER.iter().any(|n| ns.eq_ignore_ascii_case(n)),
            None => false,
        }
    }

    /// A path is absolute when it starts with a known namespace and names an
    /// owner.
    pub fn is_absolute(&self) -> bool {
        self.has_namespace() && self.parts.len() > 1
    }

    pub fn is_relative(&self) -> bool {
        !self.is_absolute()
    }

    pub fn to_string_lower(&self) -> String {
        self.to_string().to_ascii_lowercase()
    }

    fn namespace_rank(&self) -> usize {
        match self.namespace() {
            Some(ns) => NAMESPACE_ORDER
                .iter()
                .position(|n| ns.eq_ignore_ascii_case(n))
                .unwrap_or(NAMESPACE_ORDER.len()),
            None => NAMESPACE_ORDER.len(),
        }
    }
}

impl FromStr for PackagePath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PackagePath::try_new(s)
    }
}

impl Display for PackagePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.parts.join("."))
    }
}

impl Debug for PackagePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PackagePath({})", self)
    }
}

impl PartialEq for PackagePath {
    fn eq(&self, other: &Self) -> bool {
        self.parts.len() == other.parts.len()
            && self
                .parts
                .iter()
                .zip(other.parts.iter())
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }
}

impl Eq for PackagePath {}

impl Hash for PackagePath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for part in &self.parts {
            for c in part.chars() {
                c.to_ascii_lowercase().hash(state);
            }
            '.'.hash(state);
        }
    }
}

impl PartialOrd for PackagePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackagePath {
    /// Namespace-aware ordering: the fixed namespace list decides first,
    /// case-insensitive lexicographic segment comparison decides the rest.
    fn cmp(&self, other: &Self) -> Ordering {
        let rank_cmp = self.namespace_rank().cmp(&other.namespace_rank());
        if rank_cmp != Ordering::Equal {
            return rank_cmp;
        }
        let n = self.parts.len().min(other.parts.len());
        for (a, b) in self.parts[..n].iter().zip(other.parts[..n].iter()) {
            let c = a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase());
            if c != Ordering::Equal {
                return c;
            }
        }
        self.parts.len().cmp(&other.parts.len())
    }
}
