// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Re-signing a working copy of the virtualization APEX images.

use crate::error::HarnessError;
use crate::host::host_command;
use crate::host::run_timed;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

/// The signing tool is slow on loaded CI machines.
pub const DEFAULT_SIGNING_TIMEOUT: Duration = Duration::from_secs(50);

/// A request to re-sign the images under `working_dir`.
#[derive(Debug, Clone)]
pub struct ResignRequest {
    /// Path to `sign_virt_apex`. Its directory is prepended to `PATH` so the
    /// tools next to it are found.
    pub tool: PathBuf,
    /// Directory holding the pulled `etc/` tree.
    pub working_dir: PathBuf,
    /// Key used for every image without an override.
    pub signing_key: PathBuf,
    /// Per-image keys, keyed by image file name.
    pub key_overrides: BTreeMap<String, PathBuf>,
    /// Whether the vbmeta digests in the bootconfigs are updated too.
    pub update_bootconfigs: bool,
    /// Upper bound on the signing run.
    pub timeout: Duration,
}

impl ResignRequest {
    /// Creates a request with no key overrides that updates bootconfigs.
    pub fn new(tool: PathBuf, working_dir: PathBuf, signing_key: PathBuf) -> Self {
        Self {
            tool,
            working_dir,
            signing_key,
            key_overrides: BTreeMap::new(),
            update_bootconfigs: true,
            timeout: DEFAULT_SIGNING_TIMEOUT,
        }
    }

    /// Returns the shell command line passed to `bash -c`.
    ///
    /// Key overrides are emitted in file name order.
    pub fn command_line(&self) -> String {
        let mut args = vec![self.tool.display().to_string()];
        if !self.update_bootconfigs {
            args.push("--do_not_update_bootconfigs".into());
        }
        // The tool may be built from a different branch than the images.
        args.push("--do_not_validate_avb_version".into());
        for (name, key) in &self.key_overrides {
            args.push("--key_override".into());
            args.push(format!("{name}={}", key.display()));
        }
        args.push(self.signing_key.display().to_string());
        args.push(self.working_dir.display().to_string());
        shell_words::join(args)
    }

    fn search_path(&self) -> OsString {
        let mut dirs: Vec<PathBuf> = self
            .tool
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .into_iter()
            .collect();
        if let Some(path) = std::env::var_os("PATH") {
            dirs.extend(std::env::split_paths(&path));
        }
        // Joining only fails if a directory contains the separator.
        std::env::join_paths(&dirs).unwrap_or_else(|_| std::env::var_os("PATH").unwrap_or_default())
    }
}

/// Runs the signing tool. Success is solely a zero exit status.
pub fn resign(request: &ResignRequest) -> Result<(), HarnessError> {
    let command_line = request.command_line();
    tracing::info!(command = %command_line, "resigning images");
    let mut cmd = host_command("/bin/bash");
    cmd.arg("-c")
        .arg(&command_line)
        .env("PATH", request.search_path());
    let output = run_timed(&mut cmd, request.timeout)?;
    if !output.status.success() {
        return Err(HarnessError::Signing {
            status: output.status.to_string(),
            stdout: output.stdout,
            stderr: output.stderr,
        });
    }
    Ok(())
}
