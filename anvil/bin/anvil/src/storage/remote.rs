// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Remote registries: a mirrored catalog plus data sources serving package
//! archives.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock, Weak,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, bail, Context, Result};
use fileutil::{single_process_job, SafeTempDir};
use pkgid::{PackageName, UnresolvedPackageName};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::database::PackagesDatabase;
use crate::error::Error;
use crate::package::{
    hash_path, package_hash, short_package_hash, verify_file_hash, Package, PackageData, PackageId,
};
use crate::resolver::{Resolve, ResolveRequest};
use crate::storage::local::Directories;
use crate::storage::{Storage, StorageSchema};

/// How long a mirrored catalog stays fresh before the advertised version is
/// consulted again.
const DB_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

const DB_DOWNLOAD_TIME_FILE: &str = "packages.time";
const DB_VERSION_FILE: &str = "version";
const DB_LOADED_KEY: &str = "db_loaded";

/// Placeholder for the hash path inside a data source URL template.
pub const URL_HASH_PATH: &str = "{PHPF}";
/// Placeholder for the archive file name inside a data source URL template.
pub const URL_FILE_NAME: &str = "{FN}";

/// One URL template serving package archives.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataSource {
    pub url: String,
}

impl DataSource {
    /// Substitutes the placeholders for a concrete package.
    pub fn url_for(&self, name: &PackageName) -> String {
        let hp = hash_path(&package_hash(name), 4, 2);
        let fn_ = format!("{}.tar.gz", short_package_hash(name));
        self.url
            .replace(URL_HASH_PATH, &hp.to_string_lossy())
            .replace(URL_FILE_NAME, &fn_)
    }
}

/// Description of one remote registry, loaded from a spec document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteSpec {
    pub name: String,
    /// Registry API base; used by remote resolving fallbacks.
    pub registry_url: String,
    /// Catalog dump archive.
    pub db_url: String,
    /// Small text file with the advertised catalog version.
    pub db_version_url: String,
    /// Optional git mirror of the catalog dump.
    #[serde(default)]
    pub git_repo_url: Option<String>,
    pub data_sources: Vec<DataSource>,
}

/// Registry API surface used to re-resolve a package when every data source
/// disagrees with the mirrored catalog. Transport details live behind this
/// trait.
pub trait RegistryApi: Send + Sync {
    fn resolve_package(
        &self,
        u: &UnresolvedPackageName,
    ) -> Result<Option<(PackageName, PackageData)>>;
}

/// A remote storage backed by a mirrored catalog database.
pub struct RemoteStorage {
    spec: RemoteSpec,
    db: PackagesDatabase,
    db_repo_dir: PathBuf,
    allow_network: bool,
    force_server_query: AtomicBool,
    registry: RwLock<Option<Arc<dyn RegistryApi>>>,
    weak_self: Weak<RemoteStorage>,
}

impl RemoteStorage {
    /// Opens the remote's mirrored catalog under the local storage
    /// directories, syncing it first when the network is allowed.
    pub fn new(local: &Directories, spec: RemoteSpec, allow_network: bool) -> Result<Arc<Self>> {
        let db_dir = local.remote_database_root().join(&spec.name);
        let db = PackagesDatabase::open(&db_dir.join("packages.db"))?;
        let db_repo_dir = db_dir.join("repository");

        let storage = Arc::new_cyclic(|weak_self| Self {
            spec,
            db,
            db_repo_dir,
            allow_network,
            force_server_query: AtomicBool::new(false),
            registry: RwLock::new(None),
            weak_self: weak_self.clone(),
        });

        if allow_network {
            if storage.db.kv_int(DB_LOADED_KEY)? == 0 {
                debug!("Packages database was not found");
                storage.download()?;
                storage.load()?;
                storage.db.set_kv_int(DB_LOADED_KEY, 1)?;
            } else {
                storage.update_db()?;
            }
        }

        Ok(storage)
    }

    pub fn spec(&self) -> &RemoteSpec {
        &self.spec
    }

    pub fn set_registry(&self, api: Arc<dyn RegistryApi>) {
        *self.registry.write().unwrap() = Some(api);
    }

    /// When set, the mirrored catalog is skipped so that every request goes
    /// to the registry API.
    pub fn set_force_server_query(&self, b: bool) {
        self.force_server_query.store(b, Ordering::SeqCst);
    }

    /// Downloads the catalog dump into the repository mirror dir: a git
    /// pull when a mirror is configured and git is available, the plain
    /// archive otherwise.
    pub fn download(&self) -> Result<()> {
        info!("Downloading database from {} remote", self.spec.name);
        std::fs::create_dir_all(&self.db_repo_dir)?;

        let mut done = false;
        if let Some(git_url) = &self.spec.git_repo_url {
            if git_available() {
                done = self.git_pull(git_url).is_ok();
                if !done {
                    // A broken checkout would poison every later pull.
                    let _ = std::fs::remove_dir_all(&self.db_repo_dir);
                    std::fs::create_dir_all(&self.db_repo_dir)?;
                }
            }
        }
        if !done {
            self.download_archive()?;
        }

        self.write_download_time()
    }

    fn git_pull(&self, git_url: &str) -> Result<()> {
        use std::process::Command;
        let dir = self.db_repo_dir.to_string_lossy().into_owned();
        if !self.db_repo_dir.join(".git").exists() {
            processes::run_and_check(Command::new("git").args(["-C", &dir, "init", "."]))?;
            processes::run_and_check(
                Command::new("git").args(["-C", &dir, "remote", "add", "origin", git_url]),
            )?;
        }
        processes::run_and_check(
            Command::new("git").args(["-C", &dir, "pull", "origin", "master"]),
        )?;
        processes::run_and_check(Command::new("git").args(["-C", &dir, "reset", "--hard"]))?;
        Ok(())
    }

    fn download_archive(&self) -> Result<()> {
        let tmp = SafeTempDir::new()?;
        let archive = tmp.path().join("db.tar.gz");
        fetch_url(&self.spec.db_url, &archive)?;
        let unpack_dir = tmp.path().join("unpacked");
        archive::unpack(&archive, &unpack_dir)?;
        for entry in std::fs::read_dir(&unpack_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            std::fs::copy(entry.path(), self.db_repo_dir.join(entry.file_name()))?;
        }
        Ok(())
    }

    /// Bulk-loads the mirrored CSV dump into the catalog database.
    pub fn load(&self) -> Result<()> {
        self.db.bulk_load_csv(&self.db_repo_dir)
    }

    /// Refreshes the mirror when the remote advertises a newer catalog and
    /// the local copy has outlived the refresh interval. Multi-process
    /// aware via a file lock next to the database.
    pub fn update_db(&self) -> Result<()> {
        if !self.is_current_db_old()? {
            return Ok(());
        }
        let advertised = self.advertised_version()?;
        let local = self.local_version();
        if advertised <= local {
            // Still touch the stamp so the version file is not re-fetched
            // for another interval.
            self.write_download_time()?;
            return Ok(());
        }
        let lock = self
            .db
            .path()
            .parent()
            .map(|p| p.join("db_update.lock"))
            .context("catalog path must have a parent")?;
        single_process_job(&lock, || {
            self.download()?;
            self.load()
        })
    }

    fn advertised_version(&self) -> Result<i64> {
        let tmp = SafeTempDir::new()?;
        let f = tmp.path().join("version");
        fetch_url(&self.spec.db_version_url, &f)?;
        let text = std::fs::read_to_string(&f)?;
        text.trim()
            .parse()
            .map_err(|_| anyhow!(Error::CatalogCorruption(format!(
                "bad remote catalog version: {text:?}"
            ))))
    }

    fn local_version(&self) -> i64 {
        std::fs::read_to_string(self.db_repo_dir.join(DB_VERSION_FILE))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    fn download_time_file(&self) -> PathBuf {
        self.db
            .path()
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(DB_DOWNLOAD_TIME_FILE)
    }

    fn write_download_time(&self) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        std::fs::write(self.download_time_file(), now.to_string())?;
        Ok(())
    }

    fn read_download_time(&self) -> u64 {
        std::fs::read_to_string(self.download_time_file())
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    fn is_current_db_old(&self) -> Result<bool> {
        let last = self.read_download_time();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Ok(now.saturating_sub(last) > DB_REFRESH_INTERVAL.as_secs())
    }

    /// Fetches the package archive into `dst`, trying each data source in
    /// order and checking the strong then the legacy hash. On total
    /// failure, re-resolves through the registry API once and retries with
    /// the fresh metadata.
    fn fetch_archive(&self, name: &PackageName, data: &PackageData, dst: &Path) -> Result<PackageData> {
        if self.try_data_sources(name, data, dst)? {
            return Ok(data.clone());
        }

        let registry = self.registry.read().unwrap().clone();
        if let Some(api) = registry {
            debug!("Re-resolving {name} through the registry");
            let u = UnresolvedPackageName::from(name.clone());
            if let Some((fresh_name, fresh_data)) = api.resolve_package(&u)? {
                if self.try_data_sources(&fresh_name, &fresh_data, dst)? {
                    return Ok(fresh_data);
                }
            }
        }

        bail!(Error::AllSourcesFailed(name.to_string()))
    }

    fn try_data_sources(
        &self,
        name: &PackageName,
        data: &PackageData,
        dst: &Path,
    ) -> Result<bool> {
        for ds in &self.spec.data_sources {
            let url = ds.url_for(name);
            trace!("Downloading file: {url}");
            if let Err(e) = fetch_url(&url, dst) {
                trace!("Downloading file: {url}, error: {e}");
                continue;
            }
            if verify_file_hash(dst, &data.hash)?.is_some() {
                trace!("Downloaded file: {url} hash = {}", data.hash);
                return Ok(true);
            }
            warn!("Data source served wrong content for {name}: {url}");
        }
        Ok(false)
    }
}

impl Resolve for RemoteStorage {
    fn resolve(&self, rr: &mut ResolveRequest) -> Result<bool> {
        if self.force_server_query.load(Ordering::SeqCst) {
            return Ok(false);
        }
        if self.allow_network {
            self.update_db()?;
        }
        let name = match self.db.resolve_one(rr.unresolved())? {
            Some(name) => name,
            None => return Ok(false),
        };
        let data = self.db.package_data(&name)?;
        let storage = self
            .weak_self
            .upgrade()
            .ok_or_else(|| anyhow!(Error::InternalInvariant("remote storage dropped".into())))?;
        let pkg = RemotePackage {
            id: PackageId::new(name, rr.settings().clone()),
            data,
            storage,
        };
        Ok(rr.set_package(Box::new(pkg)))
    }
}

impl Storage for RemoteStorage {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn schema(&self) -> StorageSchema {
        StorageSchema::REMOTE
    }

    fn load_data(&self, id: &PackageId) -> Result<PackageData> {
        self.db.package_data(id.name())
    }
}

/// A package resolved from a remote catalog; fetches its archive through
/// the remote's data sources.
struct RemotePackage {
    id: PackageId,
    data: PackageData,
    storage: Arc<RemoteStorage>,
}

impl std::fmt::Debug for RemotePackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePackage").field("id", &self.id).finish()
    }
}

impl Package for RemotePackage {
    fn id(&self) -> &PackageId {
        &self.id
    }

    fn data(&self) -> Result<PackageData> {
        Ok(self.data.clone())
    }

    fn copy_archive(&self, dst: &Path) -> Result<PackageData> {
        self.storage.fetch_archive(self.id.name(), &self.data, dst)
    }

    fn clone_package(&self) -> Box<dyn Package> {
        Box::new(RemotePackage {
            id: self.id.clone(),
            data: self.data.clone(),
            storage: self.storage.clone(),
        })
    }
}

fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Downloads `url` into `dst`. `file://` URLs read the local filesystem,
/// anything else goes through HTTP with a per-call timeout.
fn fetch_url(url: &str, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if let Some(path) = url.strip_prefix("file://") {
        std::fs::copy(path, dst)
            .map_err(|e| anyhow!(Error::Network(format!("copy {url}: {e}"))))?;
        return Ok(());
    }
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .map_err(|e| anyhow!(Error::Network(e.to_string())))?;
    let response = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(|e| anyhow!(Error::Network(format!("GET {url}: {e}"))))?;
    let bytes = response
        .bytes()
        .map_err(|e| anyhow!(Error::Network(format!("read {url}: {e}"))))?;
    std::fs::write(dst, &bytes).with_context(|| format!("write {}", dst.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::strong_file_hash;
    use crate::storage::local::LocalStorage;
    use settings::Settings;
    use testutil::SafeTempDir;

    fn file_url(p: &Path) -> String {
        format!("file://{}", p.display())
    }

    /// Builds a catalog dump directory with one package and packs it.
    fn make_catalog(dir: &Path, version: i64, hash: &str) -> Result<PathBuf> {
        let dump = dir.join("dump");
        testutil::write_files(
            &dump,
            &[
                ("package.csv", "package_id,path\n1,org.example.foo\n"),
                (
                    "package_version.csv",
                    "package_version_id,package_id,version,prefix,updated,sdir\n1,1,1.9.0,2,,\n",
                ),
                (
                    "package_version_dependency.csv",
                    "package_version_id,package_id,version_range\n",
                ),
                ("file.csv", &format!("file_id,hash\n1,{hash}\n")),
                (
                    "package_version_file.csv",
                    "package_version_id,file_id,type,config_id,archive_version\n1,1,1,1,1\n",
                ),
                ("version", &version.to_string()),
            ],
        )?;
        let archive = dir.join("db.tar.gz");
        archive::pack_dir(&dump, &archive)?;
        Ok(archive)
    }

    struct Fixture {
        dir: SafeTempDir,
        local: LocalStorage,
        archive_hash: String,
        package_name: PackageName,
    }

    /// Lays out a fake remote: catalog dump + data source tree, and returns
    /// the spec pointing at it with `file://` URLs.
    fn fixture() -> Result<(Fixture, RemoteSpec)> {
        let dir = SafeTempDir::new()?;
        let local = LocalStorage::new(&dir.path().join("storage"))?;

        let package_name: PackageName = "org.example.foo-1.9.0".parse()?;

        // Package archive under the data source tree.
        let src = dir.path().join("pkg-src").join("sdir");
        testutil::write_files(&src, &[("lib.c", "int foo;\n")])?;
        let ds_root = dir.path().join("files");
        let rel = hash_path(&package_hash(&package_name), 4, 2)
            .join(format!("{}.tar.gz", short_package_hash(&package_name)));
        let archive_path = ds_root.join(&rel);
        std::fs::create_dir_all(archive_path.parent().unwrap())?;
        archive::pack_dir(src.parent().unwrap(), &archive_path)?;
        let archive_hash = strong_file_hash(&archive_path)?;

        let catalog = make_catalog(dir.path(), 1, &archive_hash)?;

        let spec = RemoteSpec {
            name: "origin".into(),
            registry_url: "file:///dev/null".into(),
            db_url: file_url(&catalog),
            db_version_url: file_url(&dir.path().join("dump").join("version")),
            git_repo_url: None,
            data_sources: vec![DataSource {
                url: format!("{}/{{PHPF}}/{{FN}}", file_url(&ds_root)),
            }],
        };

        Ok((
            Fixture {
                dir,
                local,
                archive_hash,
                package_name,
            },
            spec,
        ))
    }

    #[test]
    fn first_use_syncs_catalog_and_resolves() -> Result<()> {
        let (f, spec) = fixture()?;
        let remote = RemoteStorage::new(f.local.dirs(), spec, true)?;

        let mut rr = ResolveRequest::new("org.example.foo-[1.0.0,2.0.0)".parse()?, Settings::new());
        assert!(remote.resolve(&mut rr)?);
        assert_eq!(
            rr.package().unwrap().id().name().to_string(),
            "org.example.foo-1.9.0"
        );
        assert_eq!(remote.schema(), StorageSchema::REMOTE);
        Ok(())
    }

    #[test]
    fn resolved_package_installs_into_local_store() -> Result<()> {
        let (f, spec) = fixture()?;
        let remote = RemoteStorage::new(f.local.dirs(), spec, true)?;

        let mut rr = ResolveRequest::new("org.example.foo".parse()?, Settings::new());
        assert!(remote.resolve(&mut rr)?);
        let pkg = rr.take_package().unwrap();

        let installed = f.local.install(pkg.as_ref())?;
        let sdir = installed.source_dir().unwrap();
        assert!(sdir.join("lib.c").exists());
        assert!(f
            .local
            .is_package_installed(pkg.id(), &f.archive_hash)?);
        Ok(())
    }

    #[test]
    fn force_server_query_skips_the_catalog() -> Result<()> {
        let (f, spec) = fixture()?;
        let remote = RemoteStorage::new(f.local.dirs(), spec, true)?;
        remote.set_force_server_query(true);

        let mut rr = ResolveRequest::new("org.example.foo".parse()?, Settings::new());
        assert!(!remote.resolve(&mut rr)?);
        Ok(())
    }

    #[test]
    fn stale_hash_retries_through_registry() -> Result<()> {
        let (f, mut spec) = fixture()?;
        // The catalog advertises a bogus hash.
        let catalog = make_catalog(&f.dir.path().join("bogus"), 1, &"0".repeat(128))?;
        spec.db_url = file_url(&catalog);
        spec.db_version_url = file_url(&f.dir.path().join("bogus").join("dump").join("version"));

        let remote = RemoteStorage::new(f.local.dirs(), spec, true)?;

        struct FixedApi {
            name: PackageName,
            data: PackageData,
        }
        impl RegistryApi for FixedApi {
            fn resolve_package(
                &self,
                _u: &UnresolvedPackageName,
            ) -> Result<Option<(PackageName, PackageData)>> {
                Ok(Some((self.name.clone(), self.data.clone())))
            }
        }
        remote.set_registry(Arc::new(FixedApi {
            name: f.package_name.clone(),
            data: PackageData {
                hash: f.archive_hash.clone(),
                dependencies: vec![],
                prefix: 2,
                sdir: None,
            },
        }));

        let mut rr = ResolveRequest::new("org.example.foo".parse()?, Settings::new());
        assert!(remote.resolve(&mut rr)?);
        let pkg = rr.take_package().unwrap();

        // Install verifies against the re-resolved hash and the catalog
        // records it.
        let installed = f.local.install(pkg.as_ref())?;
        assert_eq!(installed.data()?.hash, f.archive_hash);
        assert_eq!(
            f.local
                .database()
                .installed_package_hash(pkg.id().name())?,
            Some(f.archive_hash.clone())
        );
        Ok(())
    }

    #[test]
    fn all_sources_failed_without_registry() -> Result<()> {
        let (f, mut spec) = fixture()?;
        let catalog = make_catalog(&f.dir.path().join("bogus"), 1, &"0".repeat(128))?;
        spec.db_url = file_url(&catalog);
        spec.db_version_url = file_url(&f.dir.path().join("bogus").join("dump").join("version"));

        let remote = RemoteStorage::new(f.local.dirs(), spec, true)?;
        let mut rr = ResolveRequest::new("org.example.foo".parse()?, Settings::new());
        assert!(remote.resolve(&mut rr)?);
        let pkg = rr.take_package().unwrap();

        let err = f.local.install(pkg.as_ref()).unwrap_err();
        assert!(matches!(
            crate::error::error_kind(&err),
            Some(Error::AllSourcesFailed(_))
        ));
        Ok(())
    }

    #[test]
    fn offline_construction_skips_sync() -> Result<()> {
        let (f, spec) = fixture()?;
        let remote = RemoteStorage::new(f.local.dirs(), spec, false)?;
        let mut rr = ResolveRequest::new("org.example.foo".parse()?, Settings::new());
        // Nothing was synced, so nothing resolves.
        assert!(!remote.resolve(&mut rr)?);
        Ok(())
    }

    #[test]
    fn refresh_interval_gates_version_checks() -> Result<()> {
        let (f, spec) = fixture()?;
        let remote = RemoteStorage::new(f.local.dirs(), spec, true)?;
        // Fresh sync: the stamp is recent, no refresh needed.
        assert!(!remote.is_current_db_old()?);

        // An old stamp makes the storage consult the advertised version.
        std::fs::write(remote.download_time_file(), "0")?;
        assert!(remote.is_current_db_old()?);
        remote.update_db()?;
        // Same advertised version: only the stamp is refreshed.
        assert!(!remote.is_current_db_old()?);
        Ok(())
    }
}
