// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    cmp::Ordering,
    fmt::{Debug, Display},
    hash::Hash,
    str::FromStr,
};

use anyhow::{bail, Context, Error, Result};

use crate::version::{is_branch, PackageVersion, Version};

/// One endpoint of an interval.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Bound {
    Inclusive(Version),
    Exclusive(Version),
    Unbounded,
}

/// A contiguous interval of versions.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Interval {
    pub lo: Bound,
    pub hi: Bound,
}

impl Interval {
    fn any() -> Self {
        Interval {
            lo: Bound::Unbounded,
            hi: Bound::Unbounded,
        }
    }

    fn exact(v: Version) -> Self {
        Interval {
            lo: Bound::Inclusive(v.clone()),
            hi: Bound::Inclusive(v),
        }
    }

    fn contains(&self, v: &Version) -> bool {
        let lo_ok = match &self.lo {
            Bound::Inclusive(b) => v >= b,
            Bound::Exclusive(b) => v > b,
            Bound::Unbounded => true,
        };
        let hi_ok = match &self.hi {
            Bound::Inclusive(b) => v <= b,
            Bound::Exclusive(b) => v < b,
            Bound::Unbounded => true,
        };
        lo_ok && hi_ok
    }

    /// Intersection of two intervals; None when they do not overlap.
    fn intersect(&self, rhs: &Interval) -> Option<Interval> {
        let lo = max_lower(&self.lo, &rhs.lo);
        let hi = min_upper(&self.hi, &rhs.hi);
        let out = Interval { lo, hi };
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    fn is_empty(&self) -> bool {
        match (&self.lo, &self.hi) {
            (Bound::Inclusive(a), Bound::Inclusive(b)) => a > b,
            (Bound::Inclusive(a), Bound::Exclusive(b))
            | (Bound::Exclusive(a), Bound::Inclusive(b))
            | (Bound::Exclusive(a), Bound::Exclusive(b)) => a >= b,
            _ => false,
        }
    }
}

fn max_lower(a: &Bound, b: &Bound) -> Bound {
    match (a, b) {
        (Bound::Unbounded, x) | (x, Bound::Unbounded) => x.clone(),
        (Bound::Inclusive(va), Bound::Inclusive(vb)) => {
            Bound::Inclusive(va.max(vb).clone())
        }
        (Bound::Exclusive(va), Bound::Exclusive(vb)) => {
            Bound::Exclusive(va.max(vb).clone())
        }
        (Bound::Inclusive(vi), Bound::Exclusive(ve))
        | (Bound::Exclusive(ve), Bound::Inclusive(vi)) => match vi.cmp(ve) {
            Ordering::Greater => Bound::Inclusive(vi.clone()),
            _ => Bound::Exclusive(ve.clone()),
        },
    }
}

fn min_upper(a: &Bound, b: &Bound) -> Bound {
    match (a, b) {
        (Bound::Unbounded, x) | (x, Bound::Unbounded) => x.clone(),
        (Bound::Inclusive(va), Bound::Inclusive(vb)) => {
            Bound::Inclusive(va.min(vb).clone())
        }
        (Bound::Exclusive(va), Bound::Exclusive(vb)) => {
            Bound::Exclusive(va.min(vb).clone())
        }
        (Bound::Inclusive(vi), Bound::Exclusive(ve))
        | (Bound::Exclusive(ve), Bound::Inclusive(vi)) => match vi.cmp(ve) {
            Ordering::Less => Bound::Inclusive(vi.clone()),
            _ => Bound::Exclusive(ve.clone()),
        },
    }
}

/// A disjunction of version intervals.
///
/// # Example
///
/// ```
/// # use pkgid::{Version, VersionRange};
/// let r: VersionRange = "[1.0.0,2.0.0)".parse()?;
/// assert!(r.contains(&Version::try_new("1.9.0")?));
/// assert!(!r.contains(&Version::try_new("2.0.0")?));
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct VersionRange {
    intervals: Vec<Interval>,
}

impl VersionRange {
    /// The range containing every version.
    pub fn any() -> Self {
        Self {
            intervals: vec![Interval::any()],
        }
    }

    pub fn exact(v: Version) -> Self {
        Self {
            intervals: vec![Interval::exact(v)],
        }
    }

    pub fn try_new(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            bail!("Empty version range");
        }
        if s == "*" {
            return Ok(Self::any());
        }
        let mut intervals = Vec::new();
        for clause in s.split("||") {
            intervals.push(parse_clause(clause.trim())?);
        }
        Ok(Self { intervals })
    }

    pub fn contains(&self, v: &Version) -> bool {
        self.intervals.iter().any(|i| i.contains(v))
    }

    pub fn intersect(&self, rhs: &VersionRange) -> VersionRange {
        let mut intervals = Vec::new();
        for a in &self.intervals {
            for b in &rhs.intervals {
                if let Some(i) = a.intersect(b) {
                    intervals.push(i);
                }
            }
        }
        VersionRange { intervals }
    }

    pub fn union(&self, rhs: &VersionRange) -> VersionRange {
        let mut intervals = self.intervals.clone();
        intervals.extend(rhs.intervals.iter().cloned());
        VersionRange { intervals }
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Some(v) when the range admits exactly the one version `v`.
    pub fn to_single_version(&self) -> Option<Version> {
        match self.intervals.as_slice() {
            [Interval {
                lo: Bound::Inclusive(a),
                hi: Bound::Inclusive(b),
            }] if a == b => Some(a.clone()),
            _ => None,
        }
    }
}

fn parse_clause(clause: &str) -> Result<Interval> {
    if clause.is_empty() {
        bail!("Empty version range clause");
    }
    if clause.starts_with('[') || clause.starts_with('(') {
        return parse_bracket(clause);
    }

    // A space-separated conjunction of simple comparators.
    let mut acc = Interval::any();
    for token in clause.split_whitespace() {
        let next = parse_comparator(token)?;
        acc = acc
            .intersect(&next)
            .with_context(|| format!("Empty intersection in range clause {clause:?}"))?;
    }
    Ok(acc)
}

fn parse_bracket(clause: &str) -> Result<Interval> {
    let lo_inclusive = clause.starts_with('[');
    let hi_inclusive = match clause.chars().last() {
        Some(']') => true,
        Some(')') => false,
        _ => bail!("Unterminated interval: {clause:?}"),
    };
    let inner = &clause[1..clause.len() - 1];
    let (lo, hi) = inner
        .split_once(',')
        .with_context(|| format!("Interval must have two endpoints: {clause:?}"))?;
    let lo = Version::try_new(lo.trim())?;
    let hi = Version::try_new(hi.trim())?;
    Ok(Interval {
        lo: if lo_inclusive {
            Bound::Inclusive(lo)
        } else {
            Bound::Exclusive(lo)
        },
        hi: if hi_inclusive {
            Bound::Inclusive(hi)
        } else {
            Bound::Exclusive(hi)
        },
    })
}

fn parse_comparator(token: &str) -> Result<Interval> {
    let (op, rest) = if let Some(rest) = token.strip_prefix(">=") {
        (">=", rest)
    } else if let Some(rest) = token.strip_prefix("<=") {
        ("<=", rest)
    } else if let Some(rest) = token.strip_prefix('>') {
        (">", rest)
    } else if let Some(rest) = token.strip_prefix('<') {
        ("<", rest)
    } else if let Some(rest) = token.strip_prefix('=') {
        ("=", rest)
    } else if let Some(rest) = token.strip_prefix('^') {
        ("^", rest)
    } else if let Some(rest) = token.strip_prefix('~') {
        ("~", rest)
    } else {
        ("=", token)
    };
    let v = Version::try_new(rest)?;
    Ok(match op {
        ">=" => Interval {
            lo: Bound::Inclusive(v),
            hi: Bound::Unbounded,
        },
        ">" => Interval {
            lo: Bound::Exclusive(v),
            hi: Bound::Unbounded,
        },
        "<=" => Interval {
            lo: Bound::Unbounded,
            hi: Bound::Inclusive(v),
        },
        "<" => Interval {
            lo: Bound::Unbounded,
            hi: Bound::Exclusive(v),
        },
        "=" => Interval::exact(v),
        "^" => {
            // Up to the next breaking version.
            let hi = if v.major() > 0 {
                v.next_major()
            } else if v.minor() > 0 {
                v.next_minor()
            } else {
                v.next_patch()
            };
            Interval {
                lo: Bound::Inclusive(v),
                hi: Bound::Exclusive(hi),
            }
        }
        "~" => Interval {
            lo: Bound::Inclusive(v.clone()),
            hi: Bound::Exclusive(v.next_minor()),
        },
        _ => unreachable!(),
    })
}

impl FromStr for VersionRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VersionRange::try_new(s)
    }
}

impl Display for VersionRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, interval) in self.intervals.iter().enumerate() {
            if i > 0 {
                write!(f, " || ")?;
            }
            match (&interval.lo, &interval.hi) {
                (Bound::Unbounded, Bound::Unbounded) => write!(f, "*")?,
                (Bound::Inclusive(a), Bound::Inclusive(b)) if a == b => write!(f, "={a}")?,
                (lo, hi) => {
                    match lo {
                        Bound::Inclusive(v) => write!(f, "[{v},")?,
                        Bound::Exclusive(v) => write!(f, "({v},")?,
                        Bound::Unbounded => write!(f, "(,")?,
                    }
                    match hi {
                        Bound::Inclusive(v) => write!(f, "{v}]")?,
                        Bound::Exclusive(v) => write!(f, "{v})")?,
                        Bound::Unbounded => write!(f, ")")?,
                    }
                }
            }
        }
        Ok(())
    }
}

/// A package version range: either a [`VersionRange`] or the degenerate
/// "single branch" form.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PackageVersionRange {
    Range(VersionRange),
    Branch(String),
}

impl PackageVersionRange {
    pub fn any() -> Self {
        PackageVersionRange::Range(VersionRange::any())
    }

    pub fn try_new(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            bail!("Empty package version range");
        }
        if is_branch(s) {
            return Ok(PackageVersionRange::Branch(s.to_owned()));
        }
        Ok(PackageVersionRange::Range(VersionRange::try_new(s)?))
    }

    pub fn is_branch(&self) -> bool {
        matches!(self, PackageVersionRange::Branch(_))
    }

    pub fn contains(&self, v: &PackageVersion) -> bool {
        match (self, v) {
            (PackageVersionRange::Branch(b), PackageVersion::Branch(vb)) => b == vb,
            (PackageVersionRange::Range(r), PackageVersion::Version(vv)) => r.contains(vv),
            _ => false,
        }
    }

    pub fn intersect(&self, rhs: &Self) -> Result<Self> {
        match (self, rhs) {
            (PackageVersionRange::Range(a), PackageVersionRange::Range(b)) => {
                Ok(PackageVersionRange::Range(a.intersect(b)))
            }
            _ => bail!("Cannot intersect branch package versions"),
        }
    }

    pub fn union(&self, rhs: &Self) -> Result<Self> {
        match (self, rhs) {
            (PackageVersionRange::Range(a), PackageVersionRange::Range(b)) => {
                Ok(PackageVersionRange::Range(a.union(b)))
            }
            _ => bail!("Cannot unite branch package versions"),
        }
    }

    /// Some(v) when the range pins exactly one version or branch.
    pub fn to_single_version(&self) -> Option<PackageVersion> {
        match self {
            PackageVersionRange::Branch(b) => Some(PackageVersion::Branch(b.clone())),
            PackageVersionRange::Range(r) => r.to_single_version().map(PackageVersion::Version),
        }
    }
}

impl From<PackageVersion> for PackageVersionRange {
    fn from(v: PackageVersion) -> Self {
        match v {
            PackageVersion::Branch(b) => PackageVersionRange::Branch(b),
            PackageVersion::Version(v) => PackageVersionRange::Range(VersionRange::exact(v)),
        }
    }
}

impl FromStr for PackageVersionRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PackageVersionRange::try_new(s)
    }
}

impl Display for PackageVersionRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackageVersionRange::Branch(b) => write!(f, "{b}"),
            PackageVersionRange::Range(r) => write!(f, "{r}"),
        }
    }
}
