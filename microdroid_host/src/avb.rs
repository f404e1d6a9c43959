// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Inspection of AVB-signed images with `avbtool`.

use crate::error::HarnessError;
use crate::host::host_command;
use crate::host::run_timed;
use regex::Regex;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

const TOOL_TIMEOUT: Duration = Duration::from_secs(5);

/// Images whose descriptors cover every signed Microdroid image, relative to
/// the virtualization APEX `etc/` directory.
pub const VBMETA_IMAGES: [&str; 2] = ["fs/microdroid_kernel", "fs/microdroid_vbmeta.img"];

static HASH_ALGORITHM: LazyLock<Regex> =
    LazyLock::new(|| crate::classify::builtin(r"Hash Algorithm:[ ]*(sha1|sha256)"));

/// Host tools used to inspect images.
#[derive(Debug, Clone)]
pub struct AvbTools {
    /// The `lz4` binary.
    pub lz4: PathBuf,
    /// The `avbtool` script.
    pub avbtool: PathBuf,
}

fn run_tool(cmd: &mut Command) -> Result<String, HarnessError> {
    let command = format!("{cmd:?}");
    let output = run_timed(cmd, TOOL_TIMEOUT)?;
    if !output.status.success() {
        return Err(HarnessError::Tool {
            command,
            status: output.status.to_string(),
            stdout: output.stdout,
            stderr: output.stderr,
        });
    }
    Ok(output.stdout)
}

impl AvbTools {
    fn is_lz4(&self, image: &Path) -> Result<bool, HarnessError> {
        let output = run_timed(
            host_command(&self.lz4).arg("-t").arg(image),
            TOOL_TIMEOUT,
        )?;
        Ok(output.status.success())
    }

    /// Returns `avbtool info_image` output for `image`, decompressing it
    /// first if it is LZ4 compressed.
    pub fn avb_info(&self, image: &Path) -> Result<String, HarnessError> {
        let decompressed;
        let image = if self.is_lz4(image)? {
            decompressed = tempfile::Builder::new()
                .prefix("decompressed")
                .suffix(".img")
                .tempfile()?;
            run_tool(
                host_command(&self.lz4)
                    .args(["-d", "-f"])
                    .arg(image)
                    .arg(decompressed.path()),
            )?;
            decompressed.path()
        } else {
            image
        };
        run_tool(
            host_command(&self.avbtool)
                .args(["info_image", "--image"])
                .arg(image),
        )
    }

    /// Fails unless every image in [`VBMETA_IMAGES`] under `etc_dir` uses
    /// SHA-256 only.
    pub fn check_vbmeta_sha256(&self, etc_dir: &Path) -> Result<(), HarnessError> {
        for image in VBMETA_IMAGES {
            let info = self.avb_info(&etc_dir.join(image))?;
            check_sha256(&info).map_err(|err| match err {
                HarnessError::Config(message) => HarnessError::Config(format!("{image}: {message}")),
                err => err,
            })?;
        }
        Ok(())
    }
}

/// Every hash algorithm named in `avbtool info_image` output, in order.
pub fn hash_algorithms(info: &str) -> Vec<&str> {
    HASH_ALGORITHM
        .captures_iter(info)
        .filter_map(|captures| captures.get(1))
        .map(|m| m.as_str())
        .collect()
}

/// Fails if any descriptor uses a hash algorithm other than SHA-256.
pub fn check_sha256(info: &str) -> Result<(), HarnessError> {
    let weak: Vec<_> = hash_algorithms(info)
        .into_iter()
        .filter(|algorithm| *algorithm != "sha256")
        .collect();
    if weak.is_empty() {
        Ok(())
    } else {
        Err(HarnessError::Config(format!(
            "descriptors use {}, expected sha256",
            weak.join(", ")
        )))
    }
}
