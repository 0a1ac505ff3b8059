// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-memory cache of resolved packages. No persistence; repopulated per
//! process, optionally seeded from a lock file.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{Context, Result};
use pkgid::UnresolvedPackageName;

use crate::error::Error;
use crate::package::Package;
use crate::resolver::{Resolve, ResolveRequest};

/// Map of request -> settings hash -> resolved package.
#[derive(Default)]
pub struct CachedStorage {
    resolved_packages: RwLock<HashMap<UnresolvedPackageName, HashMap<u64, Box<dyn Package>>>>,
}

impl CachedStorage {
    pub fn new() -> Self {
        Default::default()
    }

    /// Records the result of a successfully resolved request.
    pub fn store(&self, rr: &ResolveRequest) -> Result<()> {
        let p = rr
            .package()
            .with_context(|| Error::InternalInvariant("storing an unresolved request".into()))?;
        let mut map = self.resolved_packages.write().unwrap();
        map.entry(rr.unresolved().clone())
            .or_default()
            .insert(rr.settings().hash(), p.clone_package());
        Ok(())
    }

    pub fn clear(&self) {
        self.resolved_packages.write().unwrap().clear();
    }
}

impl Resolve for CachedStorage {
    fn resolve(&self, rr: &mut ResolveRequest) -> Result<bool> {
        let map = self.resolved_packages.read().unwrap();
        let by_settings = match map.get(rr.unresolved()) {
            Some(m) => m,
            None => return Ok(false),
        };
        let p = match by_settings.get(&rr.settings().hash()) {
            Some(p) => p,
            None => return Ok(false),
        };
        // A cache hit is authoritative for this (request, settings) pair.
        rr.set_package_force(p.clone_package());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use settings::Settings;

    use crate::resolver::tests::FakePackage;

    fn request(s: &str, settings: Settings) -> ResolveRequest {
        ResolveRequest::new(s.parse().unwrap(), settings)
    }

    #[test]
    fn miss_then_hit() -> Result<()> {
        let cache = CachedStorage::new();
        let mut rr = request("org.example.foo-[1.0.0,2.0.0)", Settings::new());
        assert!(!cache.resolve(&mut rr)?);

        rr.set_package(FakePackage::boxed("org.example.foo-1.5.0"));
        cache.store(&rr)?;

        let mut rr2 = request("org.example.foo-[1.0.0,2.0.0)", Settings::new());
        assert!(cache.resolve(&mut rr2)?);
        assert_eq!(
            rr2.package().unwrap().id().name().to_string(),
            "org.example.foo-1.5.0"
        );
        Ok(())
    }

    #[test]
    fn settings_hash_partitions_the_cache() -> Result<()> {
        let cache = CachedStorage::new();
        let mut rr = request("org.example.foo", Settings::new());
        rr.set_package(FakePackage::boxed("org.example.foo-1.0.0"));
        cache.store(&rr)?;

        let mut other = Settings::new();
        other.set("os", "windows");
        let mut rr2 = request("org.example.foo", other);
        assert!(!cache.resolve(&mut rr2)?);
        Ok(())
    }

    #[test]
    fn storing_unresolved_is_an_invariant_violation() {
        let cache = CachedStorage::new();
        let rr = request("org.example.foo", Settings::new());
        assert!(cache.store(&rr).is_err());
    }
}
