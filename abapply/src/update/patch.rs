// SPDX-FileCopyrightText: 2026 abapply contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    ffi::OsString,
    fs::File,
    io,
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
};

use thiserror::Error;
use tracing::debug;

use crate::{format::extent::Positions, util::DebugString};

pub const DEFAULT_BSPATCH_PATH: &str = "bspatch";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Patching an open file by descriptor is not supported on this platform")]
    Unsupported,
    #[error("Failed to run command: {0:?}")]
    CommandSpawn(DebugString, #[source] io::Error),
    #[error("Command failed with status: {1}: {0:?}")]
    CommandExecution(DebugString, ExitStatus),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Applies a binary diff in place. The old and new data both live in
/// `target`: the patch reads the byte ranges in `src` and writes the ranges
/// in `dst`.
pub trait PatchApplier: Send + Sync {
    fn apply(&self, target: &File, patch: &Path, src: &Positions, dst: &Positions) -> Result<()>;
}

/// Runs an external bspatch-compatible tool, invoked as:
///
/// ```text
/// <program> <old path> <new path> <patch path> <old positions> <new positions>
/// ```
///
/// Both paths refer to the already open target file.
#[derive(Clone, Debug)]
pub struct BspatchApplier {
    program: PathBuf,
}

impl Default for BspatchApplier {
    fn default() -> Self {
        Self::new(DEFAULT_BSPATCH_PATH)
    }
}

impl BspatchApplier {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// A path that opens the same file as `file`. Descriptors are not
    /// inherited by child processes, so the path goes through the parent's
    /// descriptor table.
    #[cfg(unix)]
    fn fd_path(file: &File) -> Result<OsString> {
        use std::os::fd::AsRawFd;

        Ok(format!("/proc/{}/fd/{}", std::process::id(), file.as_raw_fd()).into())
    }

    #[cfg(not(unix))]
    fn fd_path(_file: &File) -> Result<OsString> {
        Err(Error::Unsupported)
    }
}

impl PatchApplier for BspatchApplier {
    fn apply(&self, target: &File, patch: &Path, src: &Positions, dst: &Positions) -> Result<()> {
        let target_path = Self::fd_path(target)?;

        let mut command = Command::new(&self.program);
        command.arg(&target_path);
        command.arg(&target_path);
        command.arg(patch);
        command.arg(src.to_string());
        command.arg(dst.to_string());
        command.stdin(Stdio::null());

        debug!("Running: {command:?}");

        let status = command
            .status()
            .map_err(|e| Error::CommandSpawn(DebugString::new(&command), e))?;

        if !status.success() {
            return Err(Error::CommandExecution(DebugString::new(&command), status));
        }

        Ok(())
    }
}
