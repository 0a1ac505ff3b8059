// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! File records and the commands producing them.
//!
//! Files live in a central table and commands refer to them by stable
//! index. This keeps the command graph free of shared mutable file nodes
//! and makes plans serializable.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::{Path, PathBuf},
    sync::RwLock,
    time::Duration,
};

use serde::{Deserialize, Serialize};

/// Stable index into a [`FileTable`].
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
pub struct FileId(pub u32);

#[derive(Default)]
struct FileTableInner {
    paths: Vec<PathBuf>,
    by_path: HashMap<PathBuf, FileId>,
}

/// Arena of file records keyed by absolute path.
#[derive(Default)]
pub struct FileTable {
    inner: RwLock<FileTableInner>,
}

impl FileTable {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn from_paths(paths: Vec<PathBuf>) -> Self {
        let table = Self::new();
        for p in paths {
            table.register(&p);
        }
        table
    }

    /// Interns a path, returning its stable id.
    pub fn register(&self, path: &Path) -> FileId {
        if let Some(id) = self.inner.read().unwrap().by_path.get(path) {
            return *id;
        }
        let mut inner = self.inner.write().unwrap();
        if let Some(id) = inner.by_path.get(path) {
            return *id;
        }
        let id = FileId(inner.paths.len() as u32);
        inner.paths.push(path.to_path_buf());
        inner.by_path.insert(path.to_path_buf(), id);
        id
    }

    pub fn path(&self, id: FileId) -> PathBuf {
        self.inner.read().unwrap().paths[id.0 as usize].clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All interned paths, indexed by [`FileId`].
    pub fn snapshot(&self) -> Vec<PathBuf> {
        self.inner.read().unwrap().paths.clone()
    }
}

/// One file-producing command of the build graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    pub program: PathBuf,
    pub arguments: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub environment: BTreeMap<String, String>,
    pub inputs: BTreeSet<FileId>,
    pub outputs: BTreeSet<FileId>,
    /// Rerun even when outputs are newer than inputs.
    pub always: bool,
    /// Wall-clock budget for this single command.
    pub time_limit: Option<Duration>,
    pub stdout_file: Option<PathBuf>,
    pub stderr_file: Option<PathBuf>,
}

impl Command {
    pub fn new(name: &str, program: &Path) -> Self {
        Self {
            name: name.to_owned(),
            program: program.to_path_buf(),
            arguments: Vec::new(),
            working_directory: None,
            environment: BTreeMap::new(),
            inputs: BTreeSet::new(),
            outputs: BTreeSet::new(),
            always: false,
            time_limit: None,
            stdout_file: None,
            stderr_file: None,
        }
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.arguments.push(a.into());
        self
    }

    pub fn env(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.environment.insert(k.into(), v.into());
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.working_directory = Some(dir.to_path_buf());
        self
    }

    pub fn input(mut self, id: FileId) -> Self {
        self.inputs.insert(id);
        self
    }

    pub fn output(mut self, id: FileId) -> Self {
        self.outputs.insert(id);
        self
    }

    pub fn always(mut self) -> Self {
        self.always = true;
        self
    }
}
