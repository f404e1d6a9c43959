// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Run settings, from command line flags or the environment.

use crate::device::adb::AdbDevice;
use crate::error::HarnessError;
use std::path::Path;
use std::path::PathBuf;

/// Where to find the device, host tools and test files.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct Settings {
    /// Serial of the device to test. Optional if exactly one is attached.
    #[clap(long, env = "ANDROID_SERIAL")]
    pub serial: Option<String>,
    /// Directory holding the signing tools, keys and test APKs.
    #[clap(long, env = "MICRODROID_TEST_FILES")]
    pub test_files: Option<PathBuf>,
    /// Root of the per-test log directories.
    #[clap(long, env = "MICRODROID_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,
    /// The adb binary.
    #[clap(long, env = "ADB")]
    pub adb: Option<PathBuf>,
    /// GKI versions to run the kernel-parameterised tests with.
    #[clap(long, env = "MICRODROID_GKI_VERSIONS", value_delimiter = ',')]
    pub gki_versions: Vec<String>,
}

impl Settings {
    /// Finds a host test file, first in the test files directory and then on
    /// `PATH`.
    pub fn find_test_file(&self, name: &str) -> Result<PathBuf, HarnessError> {
        if let Some(dir) = &self.test_files {
            for candidate in [dir.join(name), dir.join("bin").join(name)] {
                if candidate.exists() {
                    return Ok(candidate);
                }
            }
        }
        which::which(name).map_err(|err| {
            HarnessError::Config(format!(
                "test file {name} not found in {} or on PATH: {err}",
                self.test_files
                    .as_deref()
                    .unwrap_or(Path::new("<unset>"))
                    .display()
            ))
        })
    }

    /// The adb binary to use.
    pub fn adb_path(&self) -> Result<PathBuf, HarnessError> {
        match &self.adb {
            Some(adb) => Ok(adb.clone()),
            None => which::which("adb")
                .map_err(|err| HarnessError::Config(format!("adb not found on PATH: {err}"))),
        }
    }

    /// Connects to the configured device.
    pub fn connect(&self) -> Result<AdbDevice, HarnessError> {
        let adb = self.adb_path()?;
        Ok(match &self.serial {
            Some(serial) => AdbDevice::new(adb, serial.as_str()),
            None => AdbDevice::only_attached(adb)?,
        })
    }
}
