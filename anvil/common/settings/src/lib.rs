// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A recursive key/value tree attached to every package reference.
//!
//! Two package instances built with different settings are distinct even
//! when they share a name, so the tree must hash stably: the hash ignores
//! insertion order, skips subtrees marked `used_in_hash = false`, and skips
//! children whose own hash is zero (empty subtrees).

use std::collections::BTreeMap;

use anyhow::Result;
use serde_json::json;

mod hash;

pub use hash::combine as hash_combine;

/// Error raised when a scalar node is indexed like a map.
#[derive(Debug, thiserror::Error)]
#[error("settings key {0:?} is not a map")]
pub struct InvalidKeyOnScalar(pub String);

/// The payload of one settings node.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Value {
    #[default]
    Empty,
    Scalar(String),
    Array(Vec<Setting>),
    Map(Settings),
    Null,
}

/// One node of the settings tree: a value plus per-node flags.
#[derive(Clone, Debug)]
pub struct Setting {
    value: Value,
    used_in_hash: bool,
    ignore_in_comparison: bool,
    serializable: bool,
}

impl Default for Setting {
    fn default() -> Self {
        Self {
            value: Value::Empty,
            used_in_hash: true,
            ignore_in_comparison: false,
            serializable: true,
        }
    }
}

static EMPTY_SETTING: Setting = Setting {
    value: Value::Empty,
    used_in_hash: true,
    ignore_in_comparison: false,
    serializable: true,
};

impl Setting {
    pub fn is_empty(&self) -> bool {
        matches!(self.value, Value::Empty)
    }

    pub fn is_null(&self) -> bool {
        matches!(self.value, Value::Null)
    }

    pub fn is_value(&self) -> bool {
        matches!(self.value, Value::Scalar(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self.value, Value::Array(_))
    }

    pub fn is_map(&self) -> bool {
        matches!(self.value, Value::Map(_))
    }

    pub fn set_null(&mut self) {
        self.value = Value::Null;
    }

    /// The scalar value, or None when the node holds anything else.
    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            Value::Scalar(s) => Some(s),
            _ => None,
        }
    }

    /// The array items; an empty slice when the node is empty.
    pub fn as_array(&self) -> &[Setting] {
        match &self.value {
            Value::Array(v) => v,
            _ => &[],
        }
    }

    /// The child map; an empty map when the node is empty.
    pub fn as_map(&self) -> &Settings {
        static EMPTY_MAP: Settings = Settings::new();
        match &self.value {
            Value::Map(m) => m,
            _ => &EMPTY_MAP,
        }
    }

    /// Child lookup. Missing children and non-map nodes read as empty.
    pub fn get(&self, key: &str) -> &Setting {
        match &self.value {
            Value::Map(m) => m.get(key),
            _ => &EMPTY_SETTING,
        }
    }

    /// Mutable child lookup, turning an empty node into a map on demand.
    pub fn get_mut(&mut self, key: &str) -> Result<&mut Setting, InvalidKeyOnScalar> {
        if matches!(self.value, Value::Empty) {
            self.value = Value::Map(Settings::new());
        }
        match &mut self.value {
            Value::Map(m) => Ok(m.get_mut(key)),
            _ => Err(InvalidKeyOnScalar(key.to_owned())),
        }
    }

    /// Appends to an array node, turning an empty node into an array.
    pub fn push(&mut self, item: impl Into<Setting>) -> Result<(), InvalidKeyOnScalar> {
        match &mut self.value {
            Value::Empty => {
                self.value = Value::Array(Vec::new());
                self.push(item)
            }
            Value::Array(v) => {
                v.push(item.into());
                Ok(())
            }
            _ => Err(InvalidKeyOnScalar("<array>".to_owned())),
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn reset(&mut self) {
        *self = Setting::default();
    }

    pub fn used_in_hash(&self) -> bool {
        self.used_in_hash
    }

    pub fn use_in_hash(&mut self, b: bool) {
        self.used_in_hash = b;
    }

    pub fn ignored_in_comparison(&self) -> bool {
        self.ignore_in_comparison
    }

    pub fn ignore_in_comparison(&mut self, b: bool) {
        self.ignore_in_comparison = b;
    }

    pub fn serializable(&self) -> bool {
        self.serializable
    }

    /// Not serializing means no round trip, so the node cannot participate
    /// in hashing and must be ignored in comparisons.
    pub fn set_serializable(&mut self, b: bool) {
        self.serializable = b;
        if !b {
            self.use_in_hash(false);
            self.ignore_in_comparison(true);
        }
    }

    /// For each child of `rhs`: copy when self has no value there; recurse
    /// when both sides are maps; keep self otherwise.
    pub fn merge_missing(&mut self, rhs: &Setting) {
        if let (Value::Map(l), Value::Map(r)) = (&mut self.value, &rhs.value) {
            l.merge_missing(r);
            return;
        }
        if self.is_empty() {
            *self = rhs.clone();
        }
    }

    /// Like [`Setting::merge_missing`] but assigns on conflict; maps still
    /// recurse.
    pub fn merge_and_assign(&mut self, rhs: &Setting) {
        if let (Value::Map(l), Value::Map(r)) = (&mut self.value, &rhs.value) {
            l.merge_and_assign(r);
            return;
        }
        *self = rhs.clone();
    }

    pub fn merge_from_json(&mut self, j: &serde_json::Value) -> Result<()> {
        match j {
            serde_json::Value::Object(_) => {
                if !self.is_map() {
                    self.value = Value::Map(Settings::new());
                }
                if let Value::Map(m) = &mut self.value {
                    m.merge_from_json(j)?;
                }
                Ok(())
            }
            serde_json::Value::Array(items) => {
                let mut v = Vec::with_capacity(items.len());
                for item in items {
                    let mut s = Setting::default();
                    s.merge_from_json(item)?;
                    v.push(s);
                }
                self.value = Value::Array(v);
                Ok(())
            }
            serde_json::Value::String(s) => {
                self.value = Value::Scalar(s.clone());
                Ok(())
            }
            serde_json::Value::Null => {
                self.set_null();
                Ok(())
            }
            _ => anyhow::bail!("Bad json value: only objects, arrays and strings are accepted"),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match &self.value {
            Value::Empty => serde_json::Value::Null,
            Value::Scalar(s) => json!(s),
            Value::Array(v) => serde_json::Value::Array(v.iter().map(|s| s.to_json()).collect()),
            Value::Map(m) => m.to_json(),
            Value::Null => serde_json::Value::Null,
        }
    }

    /// Stable 64-bit hash of the node. Empty nodes hash to zero; array items
    /// hash in order; maps delegate to [`Settings::hash`].
    pub fn hash(&self) -> u64 {
        match &self.value {
            Value::Empty => 0,
            Value::Scalar(s) => hash::combine(0, s.as_bytes()),
            Value::Array(v) => {
                let mut h = 0;
                for item in v {
                    h = hash::combine_u64(h, item.hash());
                }
                h
            }
            Value::Map(m) => m.hash(),
            Value::Null => hash::combine_u64(0, 0),
        }
    }
}

impl PartialEq for Setting {
    fn eq(&self, other: &Self) -> bool {
        if self.ignore_in_comparison || other.ignore_in_comparison {
            return true;
        }
        self.value == other.value
    }
}

impl From<&str> for Setting {
    fn from(s: &str) -> Self {
        Setting {
            value: Value::Scalar(s.to_owned()),
            ..Default::default()
        }
    }
}

impl From<String> for Setting {
    fn from(s: String) -> Self {
        Setting {
            value: Value::Scalar(s),
            ..Default::default()
        }
    }
}

impl From<Settings> for Setting {
    fn from(m: Settings) -> Self {
        Setting {
            value: Value::Map(m),
            ..Default::default()
        }
    }
}

impl PartialEq<str> for Setting {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == Some(other)
    }
}

impl PartialEq<&str> for Setting {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == Some(*other)
    }
}

/// The settings tree root: an ordered map of named nodes.
#[derive(Clone, Debug, Default)]
pub struct Settings {
    settings: BTreeMap<String, Setting>,
}

const USED_IN_HASH_SUFFIX: &str = "_used_in_hash";
const IGNORE_IN_COMPARISON_SUFFIX: &str = "_ignore_in_comparison";

impl Settings {
    pub const fn new() -> Self {
        Self {
            settings: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.settings.len()
    }

    pub fn get(&self, key: &str) -> &Setting {
        self.settings.get(key).unwrap_or(&EMPTY_SETTING)
    }

    pub fn get_mut(&mut self, key: &str) -> &mut Setting {
        self.settings.entry(key.to_owned()).or_default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<Setting>) {
        self.settings.insert(key.to_owned(), value.into());
    }

    pub fn remove(&mut self, key: &str) {
        self.settings.remove(key);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Setting)> {
        self.settings.iter()
    }

    pub fn merge_missing(&mut self, rhs: &Settings) {
        for (k, v) in &rhs.settings {
            self.get_mut(k).merge_missing(v);
        }
    }

    pub fn merge_and_assign(&mut self, rhs: &Settings) {
        for (k, v) in &rhs.settings {
            self.get_mut(k).merge_and_assign(v);
        }
    }

    /// Every non-ignored, non-empty key of self must be present in `rhs`
    /// with a matching value; map children recurse.
    pub fn is_subset_of(&self, rhs: &Settings) -> bool {
        for (k, v) in &self.settings {
            if v.is_empty() || v.ignored_in_comparison() {
                continue;
            }
            let other = match rhs.settings.get(k) {
                Some(o) if !o.is_empty() => o,
                _ => return false,
            };
            if let (Value::Map(l), Value::Map(r)) = (v.value(), other.value()) {
                if !l.is_subset_of(r) {
                    return false;
                }
                continue;
            }
            if v != other {
                return false;
            }
        }
        true
    }

    /// Stable hash. Combines `(key, child hash)` for every child whose
    /// `used_in_hash` flag is set and whose own hash is nonzero. The
    /// underlying map is ordered, so insertion order never matters.
    pub fn hash(&self) -> u64 {
        let mut h = 0;
        for (k, v) in &self.settings {
            if !v.used_in_hash() {
                continue;
            }
            let h2 = v.hash();
            if h2 == 0 {
                continue;
            }
            h = hash::combine(h, k.as_bytes());
            h = hash::combine_u64(h, h2);
        }
        h
    }

    /// Hash in the directory-name form: lowercase hex, `"0"` for empty.
    pub fn hash_string(&self) -> String {
        format!("{:x}", self.hash())
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        for (k, v) in &self.settings {
            if !v.serializable() {
                continue;
            }
            let j = v.to_json();
            if j.is_null() && !v.is_null() {
                continue;
            }
            obj.insert(k.clone(), j);
            if !v.used_in_hash() {
                obj.insert(format!("{k}{USED_IN_HASH_SUFFIX}"), json!("false"));
            }
            if v.ignored_in_comparison() {
                obj.insert(format!("{k}{IGNORE_IN_COMPARISON_SUFFIX}"), json!("true"));
            }
        }
        serde_json::Value::Object(obj)
    }

    pub fn to_json_string(&self) -> String {
        self.to_json().to_string()
    }

    pub fn merge_from_json(&mut self, j: &serde_json::Value) -> Result<()> {
        let obj = j
            .as_object()
            .ok_or_else(|| anyhow::anyhow!("Not an object"))?;
        for (k, v) in obj {
            if let Some(base) = k.strip_suffix(USED_IN_HASH_SUFFIX) {
                if !base.is_empty() {
                    if v.as_str() == Some("false") {
                        self.get_mut(base).use_in_hash(false);
                    }
                    continue;
                }
            }
            if let Some(base) = k.strip_suffix(IGNORE_IN_COMPARISON_SUFFIX) {
                if !base.is_empty() {
                    if v.as_str() == Some("true") {
                        self.get_mut(base).ignore_in_comparison(true);
                    }
                    continue;
                }
            }
            self.get_mut(k).merge_from_json(v)?;
        }
        Ok(())
    }

    pub fn merge_from_json_string(&mut self, s: &str) -> Result<()> {
        let j: serde_json::Value = serde_json::from_str(s)?;
        self.merge_from_json(&j)
    }

    pub fn from_json_string(s: &str) -> Result<Self> {
        let mut out = Settings::new();
        out.merge_from_json_string(s)?;
        Ok(out)
    }
}

impl PartialEq for Settings {
    fn eq(&self, other: &Self) -> bool {
        for (k, v) in &other.settings {
            if v.ignored_in_comparison() {
                continue;
            }
            match self.settings.get(k) {
                None => {
                    if !v.is_empty() {
                        return false;
                    }
                }
                Some(mine) => {
                    if mine != v {
                        return false;
                    }
                }
            }
        }
        // Check the keys only present on this side.
        for (k, v) in &self.settings {
            if v.ignored_in_comparison() {
                continue;
            }
            if !other.settings.contains_key(k) && !v.is_empty() {
                return false;
            }
        }
        true
    }
}

impl Eq for Settings {}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> Settings {
        let mut s = Settings::new();
        s.set("os", "linux");
        let mut compiler = Settings::new();
        compiler.set("family", "gnu");
        compiler.set("version", "12");
        s.set("compiler", compiler);
        s
    }

    #[test]
    fn hash_ignores_insertion_order() {
        let mut a = Settings::new();
        a.set("x", "1");
        a.set("y", "2");

        let mut b = Settings::new();
        b.set("y", "2");
        b.set("x", "1");

        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn hash_skips_unused_subtrees() {
        let mut a = sample();
        let base = a.hash();
        a.get_mut("compiler").use_in_hash(false);
        let without_compiler = a.hash();
        assert_ne!(base, without_compiler);

        let mut b = Settings::new();
        b.set("os", "linux");
        assert_eq!(without_compiler, b.hash());
    }

    #[test]
    fn hash_skips_empty_children() {
        let mut a = sample();
        a.get_mut("unset"); // creates an empty node
        assert_eq!(a.hash(), sample().hash());
    }

    #[test]
    fn empty_settings_hash_to_zero() {
        assert_eq!(Settings::new().hash(), 0);
        assert_eq!(Settings::new().hash_string(), "0");
    }

    #[test]
    fn subset_of_is_reflexive() {
        let s = sample();
        assert!(s.is_subset_of(&s));
    }

    #[test]
    fn subset_of_recurses_into_maps() {
        let full = sample();

        let mut sub = Settings::new();
        let mut compiler = Settings::new();
        compiler.set("family", "gnu");
        sub.set("compiler", compiler);

        assert!(sub.is_subset_of(&full));
        assert!(!full.is_subset_of(&sub));
    }

    #[test]
    fn subset_of_ignores_marked_nodes() {
        let mut sub = Settings::new();
        sub.set("debug_id", "12345");
        sub.get_mut("debug_id").ignore_in_comparison(true);
        assert!(sub.is_subset_of(&sample()));
    }

    #[test]
    fn equality_treats_missing_as_empty() {
        let mut a = sample();
        a.get_mut("extra"); // empty node
        assert_eq!(a, sample());
    }

    #[test]
    fn json_round_trip_preserves_flags() -> Result<()> {
        let mut s = sample();
        s.get_mut("compiler").use_in_hash(false);
        s.get_mut("os").ignore_in_comparison(true);

        let restored = Settings::from_json_string(&s.to_json_string())?;

        assert!(!restored.get("compiler").used_in_hash());
        assert!(restored.get("os").ignored_in_comparison());
        assert_eq!(restored.hash(), s.hash());
        Ok(())
    }

    #[test]
    fn non_serializable_nodes_never_serialize_or_hash() {
        let mut s = sample();
        s.get_mut("secret");
        *s.get_mut("secret") = Setting::from("hunter2");
        s.get_mut("secret").set_serializable(false);

        assert_eq!(s.hash(), sample().hash());
        assert!(!s.to_json_string().contains("secret"));
        assert_eq!(s, sample());
    }

    #[test]
    fn indexing_a_scalar_by_key_fails() {
        let mut s = Settings::new();
        s.set("os", "linux");
        assert!(s.get_mut("os").get_mut("kernel").is_err());
    }

    #[test]
    fn merge_missing_keeps_existing_values() {
        let mut a = Settings::new();
        a.set("os", "linux");

        let mut b = Settings::new();
        b.set("os", "windows");
        b.set("arch", "x86_64");

        a.merge_missing(&b);
        assert_eq!(a.get("os"), "linux");
        assert_eq!(a.get("arch"), "x86_64");
    }

    #[test]
    fn merge_and_assign_overwrites() {
        let mut a = Settings::new();
        a.set("os", "linux");

        let mut b = Settings::new();
        b.set("os", "windows");

        a.merge_and_assign(&b);
        assert_eq!(a.get("os"), "windows");
    }

    #[test]
    fn merge_recurses_into_maps() {
        let mut a = sample();
        let mut b = Settings::new();
        let mut compiler = Settings::new();
        compiler.set("version", "13");
        compiler.set("lto", "thin");
        b.set("compiler", compiler);

        a.merge_missing(&b);
        assert_eq!(a.get("compiler").get("version"), "12");
        assert_eq!(a.get("compiler").get("lto"), "thin");

        a.merge_and_assign(&b);
        assert_eq!(a.get("compiler").get("version"), "13");
    }

    #[test]
    fn arrays_hash_in_order() -> Result<()> {
        let mut a = Settings::new();
        a.get_mut("flags").push("-O2")?;
        a.get_mut("flags").push("-g")?;

        let mut b = Settings::new();
        b.get_mut("flags").push("-g")?;
        b.get_mut("flags").push("-O2")?;

        assert_ne!(a.hash(), b.hash());
        Ok(())
    }
}
