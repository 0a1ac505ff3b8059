// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsing of `N{d,h,m,s}` time-limit strings.

use std::time::Duration;

use anyhow::{bail, Result};

use crate::error::Error;

#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd)]
enum Unit {
    None,
    Day,
    Hour,
    Minute,
    Second,
}

/// Parses a duration like `1d2h30m15s`. Units must appear in strictly
/// descending order of size.
pub fn parse_time_limit(s: &str) -> Result<Duration> {
    if s.is_empty() {
        bail!(Error::InvalidInput("empty duration".into()));
    }
    let mut total = Duration::ZERO;
    let mut last_unit = Unit::None;
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if digits.is_empty() {
            bail!(Error::InvalidInput(format!("bad duration string: {s:?}")));
        }
        let n: u64 = digits.parse().unwrap();
        digits.clear();
        let (unit, seconds) = match c {
            'd' => (Unit::Day, 24 * 60 * 60),
            'h' => (Unit::Hour, 60 * 60),
            'm' => (Unit::Minute, 60),
            's' => (Unit::Second, 1),
            _ => bail!(Error::InvalidInput(format!(
                "unknown duration specifier: {c:?}"
            ))),
        };
        if unit <= last_unit {
            bail!(Error::InvalidInput(format!(
                "bad duration specifier order: {s:?}"
            )));
        }
        last_unit = unit;
        total += Duration::from_secs(n * seconds);
    }
    if !digits.is_empty() {
        bail!(Error::InvalidInput(format!(
            "duration without a unit: {s:?}"
        )));
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compound_durations() -> Result<()> {
        assert_eq!(parse_time_limit("30s")?, Duration::from_secs(30));
        assert_eq!(parse_time_limit("2m")?, Duration::from_secs(120));
        assert_eq!(
            parse_time_limit("1h30m")?,
            Duration::from_secs(60 * 60 + 30 * 60)
        );
        assert_eq!(
            parse_time_limit("1d2h3m4s")?,
            Duration::from_secs(24 * 3600 + 2 * 3600 + 3 * 60 + 4)
        );
        Ok(())
    }

    #[test]
    fn rejects_bad_order_and_garbage() {
        assert!(parse_time_limit("30s1h").is_err());
        assert!(parse_time_limit("1m1m").is_err());
        assert!(parse_time_limit("5x").is_err());
        assert!(parse_time_limit("5").is_err());
        assert!(parse_time_limit("").is_err());
        assert!(parse_time_limit("s").is_err());
    }
}
