// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The content-addressed local store.
//!
//! On-disk layout, relative to the storage root:
//!
//! ```text
//! <root>/pkg/<hash_path>/p/<settings_hash>/sdir/...   unpacked sources
//! <root>/pkg/<hash_path>/<settings_hash>.tar.gz       transient during install
//! <root>/etc/database/1/packages.db                   SQLite catalog
//! <root>/etc/database/1/remote/<remote_name>/...      mirrored remote catalogs
//! <root>/tmp/...
//! ```
//!
//! The layout is a stable API: renames and unpack order are chosen so that
//! a crash at any point leaves at worst unreferenced files.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use fileutil::ScopedFileLock;
use pkgid::PackageName;
use tracing::info;

use crate::database::PackagesDatabase;
use crate::error::Error;
use crate::package::{
    hash_path, short_package_hash, verify_file_hash, Package, PackageData, PackageId,
    SOURCE_DIR_NAME,
};
use crate::resolver::{Resolve, ResolveRequest};
use crate::storage::{Storage, StorageSchema};

/// Well-known subdirectories of a storage root.
#[derive(Clone, Debug)]
pub struct Directories {
    pub storage_dir: PathBuf,
    pub storage_dir_pkg: PathBuf,
    pub storage_dir_etc: PathBuf,
    pub storage_dir_tmp: PathBuf,
}

impl Directories {
    pub fn new(storage_dir: &Path) -> Self {
        Self {
            storage_dir: storage_dir.to_path_buf(),
            storage_dir_pkg: storage_dir.join("pkg"),
            storage_dir_etc: storage_dir.join("etc"),
            storage_dir_tmp: storage_dir.join("tmp"),
        }
    }

    /// Versioned catalog root; the version component gates migrations.
    pub fn database_root(&self) -> PathBuf {
        self.storage_dir_etc.join("database").join("1")
    }

    pub fn remote_database_root(&self) -> PathBuf {
        self.database_root().join("remote")
    }
}

/// A package already materialized in the local store (or an overridden
/// source tree). Not installable again.
#[derive(Debug)]
struct LocalPackage {
    id: PackageId,
    data: PackageData,
    sdir: PathBuf,
}

impl Package for LocalPackage {
    fn id(&self) -> &PackageId {
        &self.id
    }

    fn data(&self) -> Result<PackageData> {
        Ok(self.data.clone())
    }

    fn is_installable(&self) -> bool {
        false
    }

    fn source_dir(&self) -> Option<PathBuf> {
        Some(self.sdir.clone())
    }

    fn clone_package(&self) -> Box<dyn Package> {
        Box::new(LocalPackage {
            id: self.id.clone(),
            data: self.data.clone(),
            sdir: self.sdir.clone(),
        })
    }
}

/// The local storage: a content-addressed package tree plus the catalog.
pub struct LocalStorage {
    dirs: Directories,
    db: PackagesDatabase,
}

impl LocalStorage {
    pub fn new(storage_dir: &Path) -> Result<Self> {
        let dirs = Directories::new(storage_dir);
        let db = PackagesDatabase::open(&dirs.database_root().join("packages.db"))?;
        Ok(Self { dirs, db })
    }

    pub fn dirs(&self) -> &Directories {
        &self.dirs
    }

    pub fn database(&self) -> &PackagesDatabase {
        &self.db
    }

    fn pkg_root_dir(&self, name: &PackageName) -> PathBuf {
        self.dirs
            .storage_dir_pkg
            .join(hash_path(&short_package_hash(name), 2, 2))
    }

    /// Directory holding the unpacked package for one settings hash.
    pub fn pkg_dir(&self, id: &PackageId) -> PathBuf {
        self.pkg_root_dir(id.name())
            .join("p")
            .join(id.settings().hash_string())
    }

    /// Package source tree inside [`LocalStorage::pkg_dir`].
    pub fn source_dir(&self, id: &PackageId) -> PathBuf {
        self.pkg_dir(id).join(SOURCE_DIR_NAME)
    }

    fn archive_path(&self, id: &PackageId) -> PathBuf {
        self.pkg_root_dir(id.name())
            .join(format!("{}.tar.gz", id.settings().hash_string()))
    }

    pub fn is_package_installed(&self, id: &PackageId, archive_hash: &str) -> Result<bool> {
        Ok(self.db.is_package_installed(id.name(), archive_hash)?
            && self.pkg_dir(id).exists())
    }

    /// Wraps an already-installed package id into a local package instance.
    fn make_package(&self, id: &PackageId, mut data: PackageData) -> Box<dyn Package> {
        let sdir = data
            .sdir
            .clone()
            .unwrap_or_else(|| self.source_dir(id));
        data.sdir = Some(sdir.clone());
        Box::new(LocalPackage {
            id: id.clone(),
            data,
            sdir,
        })
    }

    /// Installs a remote package into the local store.
    ///
    /// download -> verify hash -> atomic rename -> unpack -> catalog insert.
    /// Idempotent: an installed package with an intact directory is
    /// returned without I/O. Multi-process safe: a file lock per archive
    /// path gates the download/unpack section, and the catalog insert runs
    /// in one SQLite transaction.
    pub fn install(&self, p: &dyn Package) -> Result<Box<dyn Package>> {
        let id = p.id().clone();
        let mut data = p.data()?;

        if !p.is_installable() {
            return Ok(self.make_package(&id, data));
        }

        let dst = self.pkg_dir(&id);
        if self.is_package_installed(&id, &data.hash)? {
            return Ok(self.make_package(&id, data));
        }

        std::fs::create_dir_all(&dst).with_context(|| format!("mkdir {}", dst.display()))?;

        let archive = self.archive_path(&id);
        let lock_path = archive.with_extension("lock");
        let _lock = ScopedFileLock::new(&lock_path)?;

        // Another process may have finished the install while we waited.
        if self.is_package_installed(&id, &data.hash)? {
            return Ok(self.make_package(&id, data));
        }

        let settings_name = match id.settings().hash() {
            0 => "Source Archive".to_owned(),
            _ => id.settings().hash_string(),
        };

        info!("Downloading: [{}]/[{}]", id.name(), settings_name);
        let fresh_new = PathBuf::from(format!("{}.new", archive.display()));
        let _remove_new = RemoveOnDrop(fresh_new.clone());
        data = p.copy_archive(&fresh_new)?;

        match verify_file_hash(&fresh_new, &data.hash)? {
            Some(_) => {}
            None => {
                let actual = crate::package::strong_file_hash(&fresh_new)?;
                bail!(Error::HashMismatch {
                    package: id.name().to_string(),
                    expected: data.hash.clone(),
                    actual,
                });
            }
        }

        std::fs::rename(&fresh_new, &archive)
            .with_context(|| format!("rename {} -> {}", fresh_new.display(), archive.display()))?;
        let _remove_archive = RemoveOnDrop(archive.clone());

        // Clear any leftovers of a previous partial unpack.
        for entry in std::fs::read_dir(&dst)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }

        info!("Unpacking  : [{}]/[{}]", id.name(), settings_name);
        archive::unpack(&archive, &dst)?;

        // The catalog records the package without an override dir.
        let mut catalog_data = data.clone();
        catalog_data.sdir = None;
        self.db.install_package(id.name(), &catalog_data)?;

        Ok(self.make_package(&id, data))
    }

    /// Registers a package backed by a local source directory instead of an
    /// archive. Resolution returns the directory as-is.
    pub fn install_overridden(&self, name: &PackageName, sdir: &Path) -> Result<()> {
        if !sdir.is_dir() {
            bail!(Error::InvalidInput(format!(
                "override source dir does not exist: {}",
                sdir.display()
            )));
        }
        let data = PackageData {
            hash: String::new(),
            dependencies: Vec::new(),
            prefix: 0,
            sdir: Some(sdir.to_path_buf()),
        };
        self.db.install_package(name, &data)
    }

    pub fn overridden_packages(&self) -> Result<Vec<PackageName>> {
        self.db.overridden_packages()
    }

    pub fn remove_override(&self, sdir: &Path) -> Result<()> {
        self.db.delete_overridden_package_dir(sdir)
    }

    pub fn delete_package(&self, id: &PackageId) -> Result<()> {
        self.db.delete_package(id.name())?;
        let dir = self.pkg_dir(id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

impl Resolve for LocalStorage {
    /// Catalog-first: a catalog hit without the package directory on disk
    /// is treated as unresolved (overridden packages excepted).
    fn resolve(&self, rr: &mut ResolveRequest) -> Result<bool> {
        let name = match self.db.resolve_one(rr.unresolved())? {
            Some(name) => name,
            None => return Ok(false),
        };
        let data = self.db.package_data(&name)?;
        let id = PackageId::new(name, rr.settings().clone());

        if let Some(sdir) = &data.sdir {
            let pkg = LocalPackage {
                sdir: sdir.clone(),
                id,
                data,
            };
            return Ok(rr.set_package(Box::new(pkg)));
        }

        if !self.pkg_dir(&id).exists() {
            return Ok(false);
        }
        let pkg = self.make_package(&id, data);
        Ok(rr.set_package(pkg))
    }
}

impl Storage for LocalStorage {
    fn name(&self) -> &str {
        "local"
    }

    fn schema(&self) -> StorageSchema {
        StorageSchema::LOCAL
    }

    fn load_data(&self, id: &PackageId) -> Result<PackageData> {
        self.db.package_data(id.name())
    }
}

/// Removes a file when dropped. Used so transient archives never outlive
/// the install attempt, successful or not.
struct RemoveOnDrop(PathBuf);

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}
