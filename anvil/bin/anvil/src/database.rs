// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The persistent SQLite catalog of known packages, versions, dependencies
//! and installed files.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use pkgid::{max_satisfying_version, PackageName, PackageVersion, UnresolvedPackageName};
use rusqlite::{params, Connection, OpenFlags};
use tracing::{debug, warn};

use crate::error::Error;
use crate::package::PackageData;

/// Tables populated from a remote catalog dump.
pub const CATALOG_TABLES: &[&str] = &[
    "package",
    "package_version",
    "package_version_dependency",
    "file",
    "package_version_file",
];

/// Columns present in remote dumps but never loaded.
const DENIED_COLUMNS: &[(&str, &str)] = &[
    ("package_version", "group_number"),
    ("package_version", "archive_version"),
    ("package_version", "hash"),
];

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS package (
    package_id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS package_version (
    package_version_id INTEGER PRIMARY KEY AUTOINCREMENT,
    package_id INTEGER NOT NULL REFERENCES package (package_id),
    version TEXT NOT NULL,
    prefix INTEGER NOT NULL DEFAULT 2,
    updated TEXT,
    sdir TEXT
);
CREATE TABLE IF NOT EXISTS package_version_dependency (
    package_version_id INTEGER NOT NULL REFERENCES package_version (package_version_id),
    package_id INTEGER NOT NULL REFERENCES package (package_id),
    version_range TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS file (
    file_id INTEGER PRIMARY KEY AUTOINCREMENT,
    hash TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS package_version_file (
    package_version_id INTEGER NOT NULL REFERENCES package_version (package_version_id),
    file_id INTEGER NOT NULL REFERENCES file (file_id),
    type INTEGER,
    config_id INTEGER,
    archive_version INTEGER
);
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// Catalog database handle. One writer at a time: SQLite's file lock plus
/// this application-level mutex.
pub struct PackagesDatabase {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl PackagesDatabase {
    /// Opens (creating as needed) the catalog at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_flags(path, false)
    }

    /// Opens an existing catalog without write access. WAL side files must
    /// already exist for concurrent readers.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        Self::open_with_flags(path, true)
    }

    fn open_with_flags(path: &Path, read_only: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("mkdir {}", parent.display()))?;
        }
        let flags = if read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_FULL_MUTEX
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX
        };
        let conn = Connection::open_with_flags(path, flags)
            .with_context(|| format!("open catalog {}", path.display()))?;

        // One minute should cover any concurrent writer.
        conn.busy_timeout(Duration::from_millis(60000))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        if !read_only {
            // WAL allows readers from other processes while we write.
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.execute_batch(SCHEMA).context("create catalog schema")?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn package_id(&self, path_str: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare_cached("SELECT package_id FROM package WHERE path = ?1 COLLATE NOCASE")?;
        let id = stmt
            .query_row(params![path_str], |row| row.get::<_, i64>(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })?;
        Ok(id)
    }

    pub fn package_path(&self, id: i64) -> Result<String> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached("SELECT path FROM package WHERE package_id = ?1")?;
        stmt.query_row(params![id], |row| row.get(0))
            .with_context(|| format!("No such package: {id}"))
    }

    pub fn versions_for_package(&self, path_str: &str) -> Result<Vec<PackageVersion>> {
        let pid = match self.package_id(path_str)? {
            Some(pid) => pid,
            None => return Ok(Vec::new()),
        };
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare_cached("SELECT version FROM package_version WHERE package_id = ?1")?;
        let rows = stmt.query_map(params![pid], |row| row.get::<_, String>(0))?;
        let mut versions = Vec::new();
        for row in rows {
            let raw = row?;
            match raw.parse::<PackageVersion>() {
                Ok(v) => versions.push(v),
                Err(e) => warn!("Skipping unparsable version {raw:?} of {path_str}: {e}"),
            }
        }
        Ok(versions)
    }

    /// Resolves one request against the catalog, preferring releases.
    pub fn resolve_one(&self, u: &UnresolvedPackageName) -> Result<Option<PackageName>> {
        let versions = self.versions_for_package(&u.path().to_string())?;
        Ok(max_satisfying_version(u.range(), versions.iter())
            .map(|v| PackageName::new(u.path().clone(), v)))
    }

    /// Resolves many requests; misses are appended to `unresolved`.
    pub fn resolve(
        &self,
        in_pkgs: &[UnresolvedPackageName],
        unresolved: &mut Vec<UnresolvedPackageName>,
    ) -> Result<HashMap<UnresolvedPackageName, PackageName>> {
        let mut out = HashMap::new();
        for u in in_pkgs {
            match self.resolve_one(u)? {
                Some(name) => {
                    out.insert(u.clone(), name);
                }
                None => unresolved.push(u.clone()),
            }
        }
        Ok(out)
    }

    fn version_id(&self, name: &PackageName) -> Result<Option<i64>> {
        let pid = match self.package_id(&name.path().to_string())? {
            Some(pid) => pid,
            None => return Ok(None),
        };
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT package_version_id FROM package_version
             WHERE package_id = ?1 AND version = ?2",
        )?;
        let id = stmt
            .query_row(params![pid, name.version().to_string()], |row| row.get(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })?;
        Ok(id)
    }

    /// The recorded source-archive hash of an installed version.
    pub fn installed_package_hash(&self, name: &PackageName) -> Result<Option<String>> {
        let vid = match self.version_id(name)? {
            Some(vid) => vid,
            None => return Ok(None),
        };
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT f.hash FROM file f
             JOIN package_version_file pvf ON pvf.file_id = f.file_id
             WHERE pvf.package_version_id = ?1",
        )?;
        let hash = stmt
            .query_row(params![vid], |row| row.get(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })?;
        Ok(hash)
    }

    /// A package is installed when the catalog knows the version and the
    /// recorded archive hash matches.
    pub fn is_package_installed(&self, name: &PackageName, expected_hash: &str) -> Result<bool> {
        match self.installed_package_hash(name)? {
            Some(h) => Ok(h == expected_hash),
            None => Ok(false),
        }
    }

    pub fn package_data(&self, name: &PackageName) -> Result<PackageData> {
        let vid = self
            .version_id(name)?
            .ok_or_else(|| anyhow!(Error::NotResolved(format!("No such package in db: {name}"))))?;

        let conn = self.conn.lock().unwrap();

        let (prefix, sdir): (i64, Option<String>) = conn.query_row(
            "SELECT prefix, sdir FROM package_version WHERE package_version_id = ?1",
            params![vid],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let hash: String = conn
            .query_row(
                "SELECT f.hash FROM file f
                 JOIN package_version_file pvf ON pvf.file_id = f.file_id
                 WHERE pvf.package_version_id = ?1",
                params![vid],
                |row| row.get(0),
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(String::new()),
                e => Err(e),
            })?;

        let mut deps = Vec::new();
        let mut stmt = conn.prepare_cached(
            "SELECT p.path, d.version_range
             FROM package_version_dependency d
             JOIN package p ON p.package_id = d.package_id
             WHERE d.package_version_id = ?1",
        )?;
        let rows = stmt.query_map(params![vid], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (path, range) = row?;
            deps.push(UnresolvedPackageName::new(path.parse()?, range.parse()?));
        }

        Ok(PackageData {
            hash,
            dependencies: deps,
            prefix,
            sdir: sdir.filter(|s| !s.is_empty()).map(PathBuf::from),
        })
    }

    /// Records one installed package: upsert of the path row, replacement
    /// of the version row, one file record and one dependency row per
    /// dependency. Runs in a single transaction.
    pub fn install_package(&self, name: &PackageName, data: &PackageData) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let path_str = name.path().to_string();
            let version_str = name.version().to_string();

            let package_id = get_or_insert_package(&tx, &path_str)?;

            // Replace any previous row for this (package, version).
            tx.execute(
                "DELETE FROM package_version WHERE package_id = ?1 AND version = ?2",
                params![package_id, version_str],
            )?;
            tx.execute(
                "INSERT INTO package_version (package_id, version, prefix, updated, sdir)
                 VALUES (?1, ?2, ?3, '', ?4)",
                params![
                    package_id,
                    version_str,
                    data.prefix,
                    data.sdir
                        .as_ref()
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_default()
                ],
            )?;
            let vid = tx.last_insert_rowid();

            tx.execute("INSERT INTO file (hash) VALUES (?1)", params![data.hash])?;
            let fid = tx.last_insert_rowid();

            tx.execute(
                "INSERT INTO package_version_file
                 (package_version_id, file_id, type, config_id, archive_version)
                 VALUES (?1, ?2, 1, 1, 1)",
                params![vid, fid],
            )?;

            for dep in &data.dependencies {
                let dep_pid = get_or_insert_package(&tx, &dep.path().to_string())?;
                tx.execute(
                    "INSERT INTO package_version_dependency
                     (package_version_id, package_id, version_range)
                     VALUES (?1, ?2, ?3)",
                    params![vid, dep_pid, dep.range().to_string()],
                )?;
            }
        }
        tx.commit()?;
        debug!("catalog: installed {name}");
        Ok(())
    }

    pub fn delete_package(&self, name: &PackageName) -> Result<()> {
        let pid = match self.package_id(&name.path().to_string())? {
            Some(pid) => pid,
            None => return Ok(()),
        };
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM package_version WHERE package_id = ?1 AND version = ?2",
            params![pid, name.version().to_string()],
        )?;
        Ok(())
    }

    /// Versions whose `sdir` is set: packages substituted by a local source
    /// tree.
    pub fn overridden_packages(&self) -> Result<Vec<PackageName>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT p.path, v.version FROM package_version v
             JOIN package p ON p.package_id = v.package_id
             WHERE v.sdir IS NOT NULL AND v.sdir != ''",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (path, version) = row?;
            out.push(PackageName::new(path.parse()?, version.parse()?));
        }
        Ok(out)
    }

    pub fn overridden_dir(&self, name: &PackageName) -> Result<Option<PathBuf>> {
        Ok(self.package_data(name).ok().and_then(|d| d.sdir))
    }

    pub fn delete_overridden_package_dir(&self, sdir: &Path) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM package_version WHERE sdir = ?1",
            params![sdir.to_string_lossy().into_owned()],
        )?;
        Ok(())
    }

    /// Case-insensitive substring search over package paths.
    pub fn matching_packages(&self, needle: &str, limit: i64) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT path FROM package WHERE path LIKE ?1
             ORDER BY path COLLATE NOCASE LIMIT ?2",
        )?;
        let pattern = format!("%{needle}%");
        let rows = stmt.query_map(params![pattern, limit], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn kv_int(&self, key: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let v: Option<String> = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })?;
        Ok(v.and_then(|s| s.parse().ok()).unwrap_or(0))
    }

    pub fn set_kv_int(&self, key: &str, value: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![key, value.to_string()],
        )?;
        Ok(())
    }

    /// Bulk-loads catalog tables from per-table CSV files in `dir`.
    ///
    /// Runs delete+insert for every catalog table inside one transaction
    /// with foreign keys off. The column set comes from each CSV header;
    /// denied columns are dropped. Empty cells insert NULL.
    pub fn bulk_load_csv(&self, dir: &Path) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        conn.pragma_update(None, "foreign_keys", "OFF")?;
        let result = (|| -> Result<()> {
            let tx = conn.transaction()?;
            for table in CATALOG_TABLES {
                let csv_path = dir.join(format!("{table}.csv"));
                let reader = csv::ReaderBuilder::new()
                    .has_headers(true)
                    .from_path(&csv_path)
                    .map_err(|e| {
                        anyhow!(Error::CatalogCorruption(format!(
                            "cannot read {}: {e}",
                            csv_path.display()
                        )))
                    })?;
                load_table(&tx, table, reader)
                    .with_context(|| format!("loading table {table}"))?;
            }
            tx.commit()?;
            Ok(())
        })();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        result
    }
}

fn get_or_insert_package(conn: &Connection, path_str: &str) -> Result<i64> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT package_id FROM package WHERE path = ?1 COLLATE NOCASE",
            params![path_str],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            e => Err(e),
        })?;
    if let Some(id) = existing {
        return Ok(id);
    }
    conn.execute("INSERT INTO package (path) VALUES (?1)", params![path_str])?;
    Ok(conn.last_insert_rowid())
}

fn load_table(
    conn: &Connection,
    table: &str,
    mut reader: csv::Reader<std::fs::File>,
) -> Result<()> {
    conn.execute(&format!("DELETE FROM {table}"), [])?;

    let headers = reader
        .headers()
        .map_err(|e| anyhow!(Error::CatalogCorruption(format!("bad CSV header: {e}"))))?
        .clone();
    let keep: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(_, name)| !DENIED_COLUMNS.contains(&(table, name)))
        .map(|(i, name)| (i, name.to_owned()))
        .collect();
    if keep.is_empty() {
        bail!(Error::CatalogCorruption(format!(
            "no usable columns in {table}.csv"
        )));
    }

    let columns = keep
        .iter()
        .map(|(_, name)| name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=keep.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("INSERT INTO {table} ({columns}) VALUES ({placeholders})");
    let mut stmt = conn.prepare(&sql)?;

    for record in reader.records() {
        let record =
            record.map_err(|e| anyhow!(Error::CatalogCorruption(format!("bad CSV row: {e}"))))?;
        for (slot, (idx, _)) in keep.iter().enumerate() {
            match record.get(*idx) {
                Some("") | None => stmt.raw_bind_parameter(slot + 1, rusqlite::types::Null)?,
                Some(v) => stmt.raw_bind_parameter(slot + 1, v)?,
            }
        }
        stmt.raw_execute()?;
    }
    Ok(())
}
