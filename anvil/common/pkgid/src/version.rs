// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    cmp::Ordering,
    fmt::{Debug, Display},
    hash::Hash,
    str::FromStr,
};

use anyhow::{bail, Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::range::PackageVersionRange;

const MAX_BRANCH_LEN: usize = 200;

static BRANCH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Returns true when `s` is a well-formed branch name.
pub(crate) fn is_branch(s: &str) -> bool {
    s.len() <= MAX_BRANCH_LEN && BRANCH_RE.is_match(s)
}

/// A structured version: up to four numeric components, optional pre-release
/// tags and optional build tags.
///
/// # Example
///
/// ```
/// # use pkgid::Version;
/// let v = Version::try_new("1.2.3-rc.1+build5")?;
/// assert_eq!(v.major(), 1);
/// assert_eq!(v.minor(), 2);
/// assert_eq!(v.patch(), 3);
/// assert!(!v.is_release());
/// assert_eq!(v.to_string(), "1.2.3-rc.1+build5");
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Clone)]
pub struct Version {
    main: Vec<u64>,
    pre: Vec<Ident>,
    build: Vec<Ident>,
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Hash for Version {
    /// Consistent with [`Ord`]: trailing zero components and build tags do
    /// not participate.
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.numeric_key().hash(state);
        self.pre.hash(state);
    }
}

/// One dot-separated tag of a pre-release or build suffix.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Ident {
    Num(u64),
    Alpha(String),
}

impl Display for Ident {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ident::Num(n) => write!(f, "{n}"),
            Ident::Alpha(s) => write!(f, "{s}"),
        }
    }
}

impl PartialOrd for Ident {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ident {
    /// Numeric tags sort below alphanumeric ones; numerics compare as
    /// numbers, the rest as ASCII strings.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Ident::Num(a), Ident::Num(b)) => a.cmp(b),
            (Ident::Num(_), Ident::Alpha(_)) => Ordering::Less,
            (Ident::Alpha(_), Ident::Num(_)) => Ordering::Greater,
            (Ident::Alpha(a), Ident::Alpha(b)) => a.cmp(b),
        }
    }
}

impl Version {
    pub fn try_new(text: &str) -> Result<Self> {
        let (_, ver) = parser::parse_version(text).map_err(|e| e.to_owned())?;
        Ok(ver)
    }

    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            main: vec![major, minor, patch],
            pre: Vec::new(),
            build: Vec::new(),
        }
    }

    pub const ZERO: Version = Version {
        main: Vec::new(),
        pre: Vec::new(),
        build: Vec::new(),
    };

    pub fn major(&self) -> u64 {
        self.main.first().copied().unwrap_or(0)
    }

    pub fn minor(&self) -> u64 {
        self.main.get(1).copied().unwrap_or(0)
    }

    pub fn patch(&self) -> u64 {
        self.main.get(2).copied().unwrap_or(0)
    }

    pub fn tweak(&self) -> u64 {
        self.main.get(3).copied().unwrap_or(0)
    }

    pub fn pre(&self) -> &[Ident] {
        &self.pre
    }

    pub fn is_release(&self) -> bool {
        self.pre.is_empty()
    }

    /// The smallest version sorting above every `self.major().*` release.
    pub fn next_major(&self) -> Version {
        Version::new(self.major() + 1, 0, 0)
    }

    /// The smallest version sorting above every `self.major().minor().*`
    /// release.
    pub fn next_minor(&self) -> Version {
        Version::new(self.major(), self.minor() + 1, 0)
    }

    pub fn next_patch(&self) -> Version {
        Version::new(self.major(), self.minor(), self.patch() + 1)
    }

    fn numeric_key(&self) -> [u64; 4] {
        [self.major(), self.minor(), self.patch(), self.tweak()]
    }
}

impl Default for Version {
    /// The implicit "first version" used when none is given.
    fn default() -> Self {
        Version::new(0, 0, 1)
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        Version::try_new(text)
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.main.is_empty() {
            write!(f, "0")?;
        } else {
            write!(f, "{}", self.main[0])?;
            for v in &self.main[1..] {
                write!(f, ".{v}")?;
            }
        }
        for (i, tag) in self.pre.iter().enumerate() {
            write!(f, "{}{}", if i == 0 { '-' } else { '.' }, tag)?;
        }
        for (i, tag) in self.build.iter().enumerate() {
            write!(f, "{}{}", if i == 0 { '+' } else { '.' }, tag)?;
        }
        Ok(())
    }
}

impl Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Version({})", self)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    /// Numeric components compare as numbers; a release sorts above any
    /// pre-release of the same numeric core; pre-release tags compare
    /// pair-wise with a shorter tag list sorting first. Build tags never
    /// participate.
    fn cmp(&self, other: &Self) -> Ordering {
        let key_cmp = self.numeric_key().cmp(&other.numeric_key());
        if key_cmp != Ordering::Equal {
            return key_cmp;
        }
        match (self.pre.is_empty(), other.pre.is_empty()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => self.pre.cmp(&other.pre),
        }
    }
}

/// A package version: either a structured [`Version`] or a branch name.
///
/// Branches never compare to versions other than by inequality; among
/// themselves they compare by name.
#[derive(Clone, Eq, Hash, PartialEq)]
pub enum PackageVersion {
    Version(Version),
    Branch(String),
}

impl PackageVersion {
    pub fn try_new(s: &str) -> Result<Self> {
        if s.is_empty() {
            bail!("Empty package version");
        }
        if is_branch(s) {
            return Ok(PackageVersion::Branch(s.to_owned()));
        }
        if BRANCH_RE.is_match(s) {
            bail!("Invalid version: {s}, branch must have size <= {MAX_BRANCH_LEN}");
        }
        Ok(PackageVersion::Version(Version::try_new(s)?))
    }

    pub fn is_branch(&self) -> bool {
        matches!(self, PackageVersion::Branch(_))
    }

    pub fn is_version(&self) -> bool {
        matches!(self, PackageVersion::Version(_))
    }

    pub fn is_release(&self) -> bool {
        match self {
            PackageVersion::Version(v) => v.is_release(),
            PackageVersion::Branch(_) => false,
        }
    }

    pub fn is_pre_release(&self) -> bool {
        !self.is_release()
    }

    pub fn as_version(&self) -> Option<&Version> {
        match self {
            PackageVersion::Version(v) => Some(v),
            PackageVersion::Branch(_) => None,
        }
    }

    pub fn as_branch(&self) -> Option<&str> {
        match self {
            PackageVersion::Branch(b) => Some(b),
            PackageVersion::Version(_) => None,
        }
    }
}

impl FromStr for PackageVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PackageVersion::try_new(s)
    }
}

impl Display for PackageVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackageVersion::Version(v) => write!(f, "{v}"),
            PackageVersion::Branch(b) => write!(f, "{b}"),
        }
    }
}

impl Debug for PackageVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PackageVersion({})", self)
    }
}

impl PartialOrd for PackageVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackageVersion {
    /// Branches sort below all structured versions and compare among
    /// themselves by name.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (PackageVersion::Branch(a), PackageVersion::Branch(b)) => a.cmp(b),
            (PackageVersion::Branch(_), PackageVersion::Version(_)) => Ordering::Less,
            (PackageVersion::Version(_), PackageVersion::Branch(_)) => Ordering::Greater,
            (PackageVersion::Version(a), PackageVersion::Version(b)) => a.cmp(b),
        }
    }
}

/// Picks the best version from `versions` satisfying `range`, preferring
/// releases over pre-releases.
pub fn max_satisfying_version<'a>(
    range: &PackageVersionRange,
    versions: impl IntoIterator<Item = &'a PackageVersion>,
) -> Option<PackageVersion> {
    let mut best_release: Option<&PackageVersion> = None;
    let mut best_other: Option<&PackageVersion> = None;
    for v in versions {
        if !range.contains(v) {
            continue;
        }
        let slot = if v.is_release() {
            &mut best_release
        } else {
            &mut best_other
        };
        if slot.map_or(true, |cur| cur < v) {
            *slot = Some(v);
        }
    }
    best_release.or(best_other).cloned()
}

mod parser {
    use super::*;
    use nom::{
        character::complete::{alphanumeric1, char, digit1},
        combinator::{eof, map, map_res, opt},
        multi::separated_list1,
        sequence::preceded,
        IResult,
    };

    fn parse_number(input: &str) -> IResult<&str, u64> {
        map_res(digit1, str::parse)(input)
    }

    fn parse_main(input: &str) -> IResult<&str, Vec<u64>> {
        let (input, main) = separated_list1(char('.'), parse_number)(input)?;
        Ok((input, main))
    }

    fn parse_ident(input: &str) -> IResult<&str, Ident> {
        map(alphanumeric1, |s: &str| {
            if s.bytes().all(|b| b.is_ascii_digit()) {
                Ident::Num(s.parse().unwrap_or(u64::MAX))
            } else {
                Ident::Alpha(s.to_owned())
            }
        })(input)
    }

    fn parse_tags(input: &str) -> IResult<&str, Vec<Ident>> {
        separated_list1(char('.'), parse_ident)(input)
    }

    pub(super) fn parse_version(input: &str) -> IResult<&str, Version> {
        let (input, main) = parse_main(input)?;
        let (input, pre) = opt(preceded(char('-'), parse_tags))(input)?;
        let (input, build) = opt(preceded(char('+'), parse_tags))(input)?;
        let (input, _) = eof(input)?;
        if main.len() > 4 {
            // More than major.minor.patch.tweak.
            return Err(nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::TooLarge,
            )));
        }
        Ok((
            input,
            Version {
                main,
                pre: pre.unwrap_or_default(),
                build: build.unwrap_or_default(),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_and_to_string() -> Result<()> {
        let cases = [
            "0",
            "1.2",
            "1.2.3",
            "1.2.3.4",
            "1.2.3-alpha",
            "1.2.3-alpha.1",
            "1.2.3-rc.1+build5",
            "10000000000000000",
        ];
        for case in cases {
            let ver = Version::try_new(case)?;
            assert_eq!(ver.to_string(), case);
        }
        Ok(())
    }

    #[test]
    fn rejects_garbage() {
        assert!(Version::try_new("").is_err());
        assert!(Version::try_new("1.2.3.4.5").is_err());
        assert!(Version::try_new("1..2").is_err());
        assert!(Version::try_new("v1.2.3").is_err());
    }

    #[test]
    fn ordering_table() -> Result<()> {
        let ordered = [
            "1.0.0-alpha",
            "1.0.0-alpha.1",
            "1.0.0-alpha.beta",
            "1.0.0-beta",
            "1.0.0-rc.1",
            "1.0.0",
            "1.0.1",
            "1.1.0",
            "1.1.0.1",
            "2.0.0",
        ];
        for pair in ordered.windows(2) {
            let a = Version::try_new(pair[0])?;
            let b = Version::try_new(pair[1])?;
            assert!(a < b, "{a} should be < {b}");
        }
        Ok(())
    }

    #[test]
    fn missing_components_read_as_zero() -> Result<()> {
        assert_eq!(Version::try_new("1.2")?, Version::try_new("1.2.0")?);
        assert!(Version::try_new("1.2")? < Version::try_new("1.2.0.1")?);
        Ok(())
    }

    #[test]
    fn build_tags_do_not_order() -> Result<()> {
        assert_eq!(
            Version::try_new("1.0.0+linux")?.cmp(&Version::try_new("1.0.0+windows")?),
            Ordering::Equal
        );
        Ok(())
    }

    #[test]
    fn package_version_branch_rules() -> Result<()> {
        let master = PackageVersion::try_new("master")?;
        let develop = PackageVersion::try_new("develop")?;
        let v1 = PackageVersion::try_new("1.0.0")?;

        assert!(master.is_branch());
        assert!(!master.is_release());
        assert!(v1.is_version());
        assert_ne!(master, develop);
        assert_eq!(master, PackageVersion::try_new("master")?);
        assert!(master < v1);
        Ok(())
    }

    #[test]
    fn branch_length_limit() {
        let long = "a".repeat(201);
        assert!(PackageVersion::try_new(&long).is_err());
        let ok = "a".repeat(200);
        assert!(PackageVersion::try_new(&ok).unwrap().is_branch());
    }

    #[test]
    fn max_satisfying_prefers_releases() -> Result<()> {
        let range: PackageVersionRange = "[1.0.0,2.0.0)".parse()?;
        let versions = [
            PackageVersion::try_new("1.2.3")?,
            PackageVersion::try_new("1.9.0")?,
            PackageVersion::try_new("1.9.1-beta")?,
            PackageVersion::try_new("2.0.0")?,
        ];
        let best = max_satisfying_version(&range, versions.iter()).unwrap();
        assert_eq!(best.to_string(), "1.9.0");
        Ok(())
    }

    #[test]
    fn max_satisfying_falls_back_to_pre_release() -> Result<()> {
        let range: PackageVersionRange = "[2.0.0-0,3.0.0)".parse()?;
        let versions = [PackageVersion::try_new("2.0.0-beta")?];
        let best = max_satisfying_version(&range, versions.iter()).unwrap();
        assert_eq!(best.to_string(), "2.0.0-beta");
        Ok(())
    }

    proptest! {
        #[test]
        fn proptest_parse_no_crash(s in "\\PC*") {
            PackageVersion::try_new(&s).ok();
        }

        #[test]
        fn proptest_parse_and_to_string(s in "(0|[1-9][0-9]{0,3})(\\.(0|[1-9][0-9]{0,3})){0,3}(-[a-z][0-9a-z]{0,7}(\\.[a-z][0-9a-z]{0,7}){0,2})?") {
            let ver = Version::try_new(&s).unwrap();
            prop_assert_eq!(ver.to_string(), s);
        }
    }
}
