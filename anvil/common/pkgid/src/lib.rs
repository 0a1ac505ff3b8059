// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Package identity: hierarchical paths, versions, version ranges and the
//! resolved/unresolved name pairs built from them.

mod name;
mod path;
mod range;
mod version;

pub use name::{PackageName, UnresolvedPackageName};
pub use path::PackagePath;
pub use range::{PackageVersionRange, VersionRange};
pub use version::{max_satisfying_version, Ident, PackageVersion, Version};
