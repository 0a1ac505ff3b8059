// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::Layer;

/// Name of the environment variable containing the log file path.
/// If not provided, no logging to files is performed.
pub const LOG_FILE_ENV: &str = "ANVIL_LOG_FILE";

/// An environment variable choosing whether to log to the console.
/// If "0", don't log to the console. Otherwise, do log to the console.
pub const CONSOLE_LOG_ENV: &str = "ANVIL_LOG_CONSOLE";

/// The configuration for the logger.
pub struct LoggingConfig {
    /// The path to dump the logs to. If None, logs will not be written to a
    /// file.
    pub log_file: Option<PathBuf>,
    /// Whether logs should be written to the console (stderr).
    pub console_logger: bool,
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        Self {
            log_file: std::env::var_os(LOG_FILE_ENV).map(PathBuf::from),
            console_logger: std::env::var(CONSOLE_LOG_ENV).ok().as_deref() != Some("0"),
        }
    }

    /// Sets up the global tracing subscriber in accordance with the config.
    ///
    /// The log level comes from `RUST_LOG` and defaults to INFO.
    pub fn setup(self) -> Result<()> {
        let mut layers = Vec::new();

        if self.console_logger {
            let filter = EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?;
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_ansi(true)
                    .with_writer(std::io::stderr)
                    .with_filter(filter)
                    .boxed(),
            );
        }

        if let Some(log_file) = self.log_file {
            let f = std::fs::File::create(&log_file)
                .with_context(|| format!("Failed to open log file {log_file:?}"))?;
            let filter = EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?;
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(f)
                    .with_filter(filter)
                    .boxed(),
            );
        }

        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .context("Failed to start tracing. A global subscriber is already set.")?;
        Ok(())
    }
}
