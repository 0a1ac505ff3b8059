// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Core of a package-aware build orchestrator.
//!
//! The engine resolves package requests against a chain of storages (cache,
//! local store, remote registries), installs packages into a
//! content-addressed local store backed by a SQLite catalog, drives builds
//! through an explicit state machine, and executes the resulting command
//! graph on a worker pool.

pub mod build;
pub mod command;
pub mod context;
pub mod database;
pub mod duration;
pub mod error;
pub mod lockfile;
pub mod package;
pub mod plan;
pub mod resolver;
pub mod storage;
pub mod target;
pub mod test_runner;
