// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The build context: storages, the resolver chain, entry points and the
//! registry of running builds. One explicit value threaded through the
//! engine instead of process-wide globals.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};

use anyhow::{anyhow, Context as _, Result};
use pkgid::{PackagePath, UnresolvedPackageName};
use settings::Settings;
use tracing::debug;

use crate::error::Error;
use crate::package::{Package, PackageId, UnresolvedPackageId};
use crate::resolver::{CachingResolver, Resolve, ResolveRequest, Resolver};
use crate::storage::cached::CachedStorage;
use crate::storage::local::LocalStorage;
use crate::storage::remote::{RemoteSpec, RemoteStorage};
use crate::target::Target;

/// Creates the targets of one package (or of the local input) for given
/// build settings. Entry points are compiled modules registered with the
/// context; one entry point may serve a whole package subtree.
pub trait EntryPoint: Send + Sync {
    fn load_targets(
        &self,
        ctx: &BuildContext,
        settings: &Settings,
        build_dir: &Path,
    ) -> Result<Vec<Box<dyn Target>>>;
}

/// Everything a build needs from its environment.
pub struct BuildContext {
    storage_dir: PathBuf,
    local: Arc<LocalStorage>,
    remotes: Vec<Arc<RemoteStorage>>,
    cached: Arc<CachedStorage>,
    entry_points: RwLock<Vec<(PackagePath, Arc<dyn EntryPoint>)>>,
    operations: Mutex<HashMap<u64, Arc<AtomicBool>>>,
    next_build_id: AtomicU64,
    pub default_prepare_jobs: usize,
    pub default_build_jobs: usize,
}

impl BuildContext {
    pub fn new(storage_dir: &Path) -> Result<Self> {
        let local = Arc::new(LocalStorage::new(storage_dir)?);
        let jobs = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Ok(Self {
            storage_dir: storage_dir.to_path_buf(),
            local,
            remotes: Vec::new(),
            cached: Arc::new(CachedStorage::new()),
            entry_points: RwLock::new(Vec::new()),
            operations: Mutex::new(HashMap::new()),
            next_build_id: AtomicU64::new(1),
            default_prepare_jobs: jobs,
            default_build_jobs: jobs,
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn local_storage(&self) -> &LocalStorage {
        &self.local
    }

    pub fn cached_storage(&self) -> &Arc<CachedStorage> {
        &self.cached
    }

    pub fn remotes(&self) -> &[Arc<RemoteStorage>] {
        &self.remotes
    }

    /// Attaches a remote registry, syncing its catalog when the network is
    /// allowed. Remotes resolve in attachment order.
    pub fn add_remote(&mut self, spec: RemoteSpec, allow_network: bool) -> Result<()> {
        let remote = RemoteStorage::new(self.local.dirs(), spec, allow_network)?;
        self.remotes.push(remote);
        Ok(())
    }

    /// Registers an entry point serving every package under `prefix`.
    pub fn register_entry_point(&self, prefix: PackagePath, ep: Arc<dyn EntryPoint>) {
        self.entry_points.write().unwrap().push((prefix, ep));
    }

    /// The most specific entry point registered for `path`.
    pub fn entry_point_for(&self, path: &PackagePath) -> Option<Arc<dyn EntryPoint>> {
        let eps = self.entry_points.read().unwrap();
        eps.iter()
            .filter(|(prefix, _)| prefix == path || prefix.is_root_of(path))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, ep)| ep.clone())
    }

    /// The full resolver chain: cache, then local storage, then remotes.
    pub fn resolver(&self) -> CachingResolver {
        let mut chain = Resolver::new();
        chain.add_storage(self.local.clone() as Arc<dyn Resolve>);
        for r in &self.remotes {
            chain.add_storage(r.clone() as Arc<dyn Resolve>);
        }
        CachingResolver::new(self.cached.clone(), chain)
    }

    /// Resolves one request through the chain, failing with `NotResolved`
    /// when it is exhausted.
    pub fn resolve(&self, rr: &mut ResolveRequest) -> Result<()> {
        if !self.resolver().resolve(rr)? {
            return Err(anyhow!(Error::NotResolved(rr.to_string())));
        }
        Ok(())
    }

    /// Resolves and installs a set of requests into the local store.
    /// Returns the resolved name for every request.
    pub fn install(
        &self,
        upkgs: &[UnresolvedPackageId],
    ) -> Result<HashMap<UnresolvedPackageName, PackageId>> {
        let mut out = HashMap::new();
        for u in upkgs {
            let mut rr = ResolveRequest::from_unresolved_id(u);
            self.resolve(&mut rr)?;
            let pkg = rr
                .take_package()
                .ok_or_else(|| anyhow!(Error::InternalInvariant("resolved without result".into())))?;
            let installed = self
                .local
                .install(pkg.as_ref())
                .with_context(|| format!("installing {}", pkg.id()))?;
            out.insert(u.name().clone(), installed.id().clone());
        }
        Ok(out)
    }

    /// Resolves and installs, returning the installed package instances.
    pub fn install_packages(
        &self,
        upkgs: &[UnresolvedPackageId],
    ) -> Result<Vec<Box<dyn Package>>> {
        let mut out = Vec::new();
        for u in upkgs {
            let mut rr = ResolveRequest::from_unresolved_id(u);
            self.resolve(&mut rr)?;
            let pkg = rr
                .take_package()
                .ok_or_else(|| anyhow!(Error::InternalInvariant("resolved without result".into())))?;
            out.push(self.local.install(pkg.as_ref())?);
        }
        Ok(out)
    }

    /// Allocates a build id and registers its stop flag.
    pub fn register_build(&self, stopped: Arc<AtomicBool>) -> u64 {
        let id = self.next_build_id.fetch_add(1, Ordering::SeqCst);
        self.operations.lock().unwrap().insert(id, stopped);
        id
    }

    pub fn unregister_build(&self, id: u64) {
        self.operations.lock().unwrap().remove(&id);
    }

    /// Requests every registered build to stop at its next suspension
    /// point (state transition or command dispatch).
    pub fn stop(&self) {
        debug!("stop requested for all registered builds");
        for flag in self.operations.lock().unwrap().values() {
            flag.store(true, Ordering::SeqCst);
        }
    }
}
