// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Domain error taxonomy.
//!
//! Functions return [`anyhow::Result`] with one of these variants at the
//! root of the chain, so callers can classify failures with
//! [`error_kind`] while intermediate layers keep attaching context.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed package name, bad settings JSON, bad duration string.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Resolver chain exhausted for a request.
    #[error("not resolved: {0}")]
    NotResolved(String),

    /// Downloaded file content does not match the catalog hash.
    #[error("hash mismatch for {package}: expected {expected}, got {actual}")]
    HashMismatch {
        package: String,
        expected: String,
        actual: String,
    },

    /// Transport failure.
    #[error("network error: {0}")]
    Network(String),

    /// No data source produced content with an acceptable hash.
    #[error("all data sources failed for {0}")]
    AllSourcesFailed(String),

    /// Schema mismatch, lock-file version mismatch, malformed CSV.
    #[error("catalog corruption: {0}")]
    CatalogCorruption(String),

    /// The execution plan cannot be topologically sorted.
    #[error("cannot create execution plan because of cyclic dependencies: strong component sizes = {scc_sizes:?}")]
    CyclicDependencies { scc_sizes: Vec<usize> },

    /// Child process failed.
    #[error("command failed: {name} (exit code {exit_code:?})")]
    CommandFailed {
        name: String,
        exit_code: Option<i32>,
    },

    /// Several commands failed within one plan execution.
    #[error("{failed} commands failed, first: {first}")]
    CommandsFailed { failed: usize, first: String },

    /// Wall-time budget exhausted.
    #[error("time limit exceeded")]
    TimeLimitExceeded,

    /// External stop request before or during a state transition.
    #[error("interrupted")]
    Interrupted,

    /// An unexpected state transition or missing data. Always a bug.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

/// Classifies an [`anyhow::Error`] chain.
pub fn error_kind(err: &anyhow::Error) -> Option<&Error> {
    err.chain().find_map(|e| e.downcast_ref::<Error>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn kind_survives_context() {
        let err = anyhow::Error::new(Error::Interrupted).context("while resolving");
        assert!(matches!(error_kind(&err), Some(Error::Interrupted)));
    }

    #[test]
    fn unknown_kind_is_none() {
        let err = anyhow::anyhow!("plain");
        assert!(error_kind(&err).is_none());
    }
}
