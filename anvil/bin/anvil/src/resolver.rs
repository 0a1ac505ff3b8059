// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The resolver chain: best-candidate selection over an ordered list of
//! storages.

use std::sync::Arc;

use anyhow::Result;
use pkgid::UnresolvedPackageName;
use settings::Settings;
use tracing::trace;

use crate::package::{Package, UnresolvedPackageId};
use crate::storage::cached::CachedStorage;

/// One package request flowing through the resolver chain, accumulating the
/// best candidate seen so far.
pub struct ResolveRequest {
    u: UnresolvedPackageName,
    settings: Settings,
    result: Option<Box<dyn Package>>,
}

impl ResolveRequest {
    pub fn new(u: UnresolvedPackageName, settings: Settings) -> Self {
        Self {
            u,
            settings,
            result: None,
        }
    }

    pub fn from_unresolved_id(id: &UnresolvedPackageId) -> Self {
        Self::new(id.name().clone(), id.settings().clone())
    }

    pub fn unresolved(&self) -> &UnresolvedPackageName {
        &self.u
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn is_resolved(&self) -> bool {
        self.result.is_some()
    }

    pub fn package(&self) -> Option<&dyn Package> {
        self.result.as_deref()
    }

    pub fn take_package(&mut self) -> Option<Box<dyn Package>> {
        self.result.take()
    }

    /// Unconditional assignment; used by caches whose answers are
    /// authoritative.
    pub fn set_package_force(&mut self, p: Box<dyn Package>) {
        self.result = Some(p);
    }

    /// Offers a candidate. Returns true when the candidate was accepted.
    ///
    /// Candidates outside the requested range are rejected up front; the
    /// remaining rules implement the version acceptance policy:
    /// 1. the first candidate always wins;
    /// 2. a branch candidate never replaces an existing result;
    /// 3. a release always replaces a pre-release;
    /// 4. a pre-release never replaces a release;
    /// 5. otherwise a higher version replaces a lower one.
    pub fn set_package(&mut self, p: Box<dyn Package>) -> bool {
        if !self.u.range().contains(p.id().name().version()) {
            return false;
        }
        self.set_package_unchecked(p)
    }

    fn set_package_unchecked(&mut self, p: Box<dyn Package>) -> bool {
        let current = match &self.result {
            None => {
                self.set_package_force(p);
                return true;
            }
            Some(cur) => cur.id().name().version().clone(),
        };

        let candidate = p.id().name().version().clone();

        // An existing result cannot be improved by a branch: when current
        // is a branch we cannot pick a better one, and versions are
        // preferred over branches anyway.
        if candidate.is_branch() {
            return false;
        }

        if current.is_pre_release() && candidate.is_release() {
            self.set_package_force(p);
            return true;
        }
        if current.is_release() && candidate.is_pre_release() {
            return false;
        }

        if current < candidate {
            self.set_package_force(p);
            return true;
        }
        false
    }
}

impl std::fmt::Display for ResolveRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.u, self.settings.hash_string())
    }
}

/// A participant of the resolver chain.
pub trait Resolve: Send + Sync {
    fn resolve(&self, rr: &mut ResolveRequest) -> Result<bool>;
}

/// An ordered chain of storages queried in turn.
#[derive(Default)]
pub struct Resolver {
    storages: Vec<Arc<dyn Resolve>>,
}

impl Resolver {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add_storage(&mut self, s: Arc<dyn Resolve>) {
        self.storages.push(s);
    }
}

impl Resolve for Resolver {
    /// Selects the best candidate across all storages. A branch result
    /// short-circuits: later storages cannot provide a more preferable
    /// branch.
    fn resolve(&self, rr: &mut ResolveRequest) -> Result<bool> {
        for s in &self.storages {
            if !s.resolve(rr)? {
                continue;
            }
            if let Some(p) = rr.package() {
                if p.id().name().version().is_branch() {
                    break;
                }
            }
        }
        Ok(rr.is_resolved())
    }
}

/// A resolver that consults a cache first and writes successful results
/// back to it.
pub struct CachingResolver {
    cache: Arc<CachedStorage>,
    inner: Resolver,
}

impl CachingResolver {
    pub fn new(cache: Arc<CachedStorage>, inner: Resolver) -> Self {
        Self { cache, inner }
    }
}

impl Resolve for CachingResolver {
    fn resolve(&self, rr: &mut ResolveRequest) -> Result<bool> {
        if self.cache.resolve(rr)? {
            trace!("resolved from cache: {}", rr);
            return Ok(true);
        }
        if self.inner.resolve(rr)? {
            self.cache.store(rr)?;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::package::{PackageData, PackageId};
    use anyhow::bail;
    use pkgid::PackageName;
    use std::path::Path;

    /// A storage-less package for exercising the acceptance rules.
    #[derive(Debug)]
    pub(crate) struct FakePackage {
        id: PackageId,
        data: PackageData,
    }

    impl FakePackage {
        pub(crate) fn boxed(name: &str) -> Box<dyn Package> {
            let name: PackageName = name.parse().unwrap();
            Box::new(FakePackage {
                id: PackageId::new(name, Settings::new()),
                data: PackageData::default(),
            })
        }
    }

    impl Package for FakePackage {
        fn id(&self) -> &PackageId {
            &self.id
        }

        fn data(&self) -> Result<PackageData> {
            Ok(self.data.clone())
        }

        fn copy_archive(&self, _dst: &Path) -> Result<PackageData> {
            bail!("fake package has no archive")
        }

        fn clone_package(&self) -> Box<dyn Package> {
            Box::new(FakePackage {
                id: self.id.clone(),
                data: self.data.clone(),
            })
        }
    }

    /// A chain member answering with a fixed version list.
    struct FakeStorage {
        versions: Vec<&'static str>,
    }

    impl Resolve for FakeStorage {
        fn resolve(&self, rr: &mut ResolveRequest) -> Result<bool> {
            let path = rr.unresolved().path().to_string();
            let mut any = false;
            for v in &self.versions {
                any |= rr.set_package(FakePackage::boxed(&format!("{path}-{v}")));
            }
            Ok(any)
        }
    }

    fn request(s: &str) -> ResolveRequest {
        ResolveRequest::new(s.parse().unwrap(), Settings::new())
    }

    fn resolved_version(rr: &ResolveRequest) -> String {
        rr.package().unwrap().id().name().version().to_string()
    }

    #[test]
    fn picks_highest_release_in_range() -> Result<()> {
        // Chain: empty local, then a remote with several versions.
        let mut resolver = Resolver::new();
        resolver.add_storage(Arc::new(FakeStorage { versions: vec![] }));
        resolver.add_storage(Arc::new(FakeStorage {
            versions: vec!["1.2.3", "1.9.0", "2.0.0", "2.0.0-alpha"],
        }));

        let mut rr = request("org.example.foo-[1.0.0,2.0.0)");
        assert!(resolver.resolve(&mut rr)?);
        assert_eq!(resolved_version(&rr), "1.9.0");
        Ok(())
    }

    #[test]
    fn pre_release_accepted_then_upgraded_to_release() -> Result<()> {
        let mut rr = request("org.example.foo-[2.0.0-0,3.0.0)");

        let first = Resolver::new();
        let mut first = first;
        first.add_storage(Arc::new(FakeStorage {
            versions: vec!["2.0.0-beta"],
        }));
        assert!(first.resolve(&mut rr)?);
        assert_eq!(resolved_version(&rr), "2.0.0-beta");

        // A later storage offering the release upgrades the result.
        let mut second = Resolver::new();
        second.add_storage(Arc::new(FakeStorage {
            versions: vec!["2.0.0"],
        }));
        assert!(second.resolve(&mut rr)?);
        assert_eq!(resolved_version(&rr), "2.0.0");
        Ok(())
    }

    #[test]
    fn release_never_downgrades_to_pre_release() -> Result<()> {
        let mut rr = request("org.example.foo-[1.0.0,2.0.0)");
        assert!(rr.set_package(FakePackage::boxed("org.example.foo-1.5.0")));
        assert!(!rr.set_package(FakePackage::boxed("org.example.foo-1.9.0-rc.1")));
        assert_eq!(resolved_version(&rr), "1.5.0");
        Ok(())
    }

    #[test]
    fn branch_resolution_stops_the_chain() -> Result<()> {
        let mut resolver = Resolver::new();
        resolver.add_storage(Arc::new(FakeStorage {
            versions: vec!["master"],
        }));
        // A later storage with versions must not override the branch; the
        // range only admits the branch anyway, but the chain also breaks.
        resolver.add_storage(Arc::new(FakeStorage {
            versions: vec!["master"],
        }));

        let mut rr = request("org.example.bar-master");
        assert!(resolver.resolve(&mut rr)?);
        assert_eq!(resolved_version(&rr), "master");
        Ok(())
    }

    #[test]
    fn branch_candidate_never_replaces_existing_result() -> Result<()> {
        let mut rr = request("org.example.foo");
        assert!(rr.set_package(FakePackage::boxed("org.example.foo-master")));
        // Branch in hand: a second branch cannot improve it.
        assert!(!rr.set_package(FakePackage::boxed("org.example.foo-develop")));
        assert_eq!(resolved_version(&rr), "master");
        Ok(())
    }

    #[test]
    fn out_of_range_candidates_are_rejected() -> Result<()> {
        let mut rr = request("org.example.foo-[1.0.0,2.0.0)");
        assert!(!rr.set_package(FakePackage::boxed("org.example.foo-2.0.0")));
        assert!(!rr.is_resolved());
        Ok(())
    }

    #[test]
    fn caching_resolver_stores_and_serves() -> Result<()> {
        let cache = Arc::new(CachedStorage::new());
        let mut inner = Resolver::new();
        inner.add_storage(Arc::new(FakeStorage {
            versions: vec!["1.9.0"],
        }));
        let caching = CachingResolver::new(cache.clone(), inner);

        let mut rr = request("org.example.foo-[1.0.0,2.0.0)");
        assert!(caching.resolve(&mut rr)?);

        // Second request with an empty inner chain hits the cache.
        let caching_empty = CachingResolver::new(cache, Resolver::new());
        let mut rr2 = request("org.example.foo-[1.0.0,2.0.0)");
        assert!(caching_empty.resolve(&mut rr2)?);
        assert_eq!(resolved_version(&rr2), "1.9.0");
        Ok(())
    }
}
