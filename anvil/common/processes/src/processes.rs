// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    path::Path,
    process::{Command, ExitStatus, Stdio},
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use tracing::instrument;

/// Captured result of one child process run.
#[derive(Debug)]
pub struct RunOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl RunOutput {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }
}

#[instrument(skip_all, fields(command = %cmd.get_program().to_string_lossy()))]
pub fn run(cmd: &mut Command) -> Result<ExitStatus> {
    let status = cmd
        .status()
        .with_context(|| format!("spawn {:?}", cmd.get_program()))?;
    Ok(status)
}

#[instrument(skip_all, fields(command = %cmd.get_program().to_string_lossy()))]
pub fn run_and_check(cmd: &mut Command) -> Result<()> {
    let status = run(cmd)?;
    if !status.success() {
        bail!("Command {cmd:?} failed with {status}");
    }
    Ok(())
}

/// Runs the command with stdout/stderr captured in memory.
#[instrument(skip_all, fields(command = %cmd.get_program().to_string_lossy()))]
pub fn run_captured(cmd: &mut Command) -> Result<RunOutput> {
    let out = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("spawn {:?}", cmd.get_program()))?;
    Ok(RunOutput {
        status: out.status,
        stdout: out.stdout,
        stderr: out.stderr,
    })
}

/// Runs the command with stdout/stderr redirected to the given files.
/// Parent directories are created as needed.
#[instrument(skip_all, fields(command = %cmd.get_program().to_string_lossy()))]
pub fn run_redirected(cmd: &mut Command, stdout: &Path, stderr: &Path) -> Result<ExitStatus> {
    for p in [stdout, stderr] {
        if let Some(parent) = p.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("mkdir {}", parent.display()))?;
        }
    }
    let out_file = std::fs::File::create(stdout)
        .with_context(|| format!("create {}", stdout.display()))?;
    let err_file = std::fs::File::create(stderr)
        .with_context(|| format!("create {}", stderr.display()))?;
    let status = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::from(out_file))
        .stderr(Stdio::from(err_file))
        .status()
        .with_context(|| format!("spawn {:?}", cmd.get_program()))?;
    Ok(status)
}

/// Runs the command with stdout/stderr redirected to files, killing the
/// child when `limit` expires. Returns None on timeout.
#[instrument(skip_all, fields(command = %cmd.get_program().to_string_lossy()))]
pub fn run_redirected_with_timeout(
    cmd: &mut Command,
    stdout: &Path,
    stderr: &Path,
    limit: Duration,
) -> Result<Option<ExitStatus>> {
    for p in [stdout, stderr] {
        if let Some(parent) = p.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("mkdir {}", parent.display()))?;
        }
    }
    let out_file = std::fs::File::create(stdout)
        .with_context(|| format!("create {}", stdout.display()))?;
    let err_file = std::fs::File::create(stderr)
        .with_context(|| format!("create {}", stderr.display()))?;
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::from(out_file))
        .stderr(Stdio::from(err_file))
        .spawn()
        .with_context(|| format!("spawn {:?}", cmd.get_program()))?;

    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
