// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Storages: sources of resolution answers and, for local/remote, file
//! bytes.

pub mod cached;
pub mod local;
pub mod remote;

use anyhow::Result;

use crate::package::{PackageData, PackageId};
use crate::resolver::Resolve;

/// Versioned storage layout identifiers gating future migrations.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StorageSchema {
    pub hash_version: u32,
    pub hash_path_version: u32,
}

impl StorageSchema {
    /// The local store: short hashes split into two 2-char subdirs.
    pub const LOCAL: StorageSchema = StorageSchema {
        hash_version: 1,
        hash_path_version: 2,
    };

    /// Remote registries: full hashes split into four 2-char subdirs.
    pub const REMOTE: StorageSchema = StorageSchema {
        hash_version: 1,
        hash_path_version: 1,
    };
}

/// A named storage that can resolve requests and load package metadata.
pub trait Storage: Resolve {
    fn name(&self) -> &str;

    fn schema(&self) -> StorageSchema;

    fn load_data(&self, id: &PackageId) -> Result<PackageData>;
}
