// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The device transport capability consumed by the orchestration engine.
//!
//! A [`Device`] is either the Android host running the VM manager or the
//! booted Microdroid guest. Shell commands are passed through as a single
//! string so that device-side shell expansion (`$(pidof ...)`, redirects)
//! works the same as an interactive `adb shell`.

pub mod adb;
#[cfg(test)]
pub(crate) mod fake;

use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Error running a device transport operation.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Failed to launch the transport command or collect its output.
    #[error("failed to run {program}")]
    Launch {
        /// The program that failed to run.
        program: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The command exited with a non-zero status.
    #[error("`{command}` exited with non-zero status ({status}): {stderr}")]
    Command {
        /// The command that failed.
        command: String,
        /// Exit status description.
        status: String,
        /// Captured standard error.
        stderr: String,
    },
    /// The command did not complete within its timeout.
    #[error("`{command}` timed out after {timeout:?}")]
    TimedOut {
        /// The command that timed out.
        command: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },
    /// The transport rejected the request.
    #[error("{0}")]
    Unavailable(String),
}

/// Captured result of a device command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, if the command exited normally.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns true if the command exited with code zero.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A process running on a device in the background.
pub trait DeviceProcess: Send {
    /// Returns everything the process has written so far.
    fn output(&self) -> String;
    /// Returns the exit code if the process has exited.
    fn try_wait(&mut self) -> Result<Option<i32>, DeviceError>;
    /// Kills the process. Succeeds if it has already exited.
    fn kill(&mut self) -> Result<(), DeviceError>;
}

/// Narrow capability interface over a host or guest device.
pub trait Device: Send {
    /// The transport serial of this device.
    fn serial(&self) -> &str;

    /// Runs `command` through the device shell and captures its output.
    ///
    /// A non-zero exit status is reported in the output, not as an error.
    fn execute(&self, command: &str, timeout: Option<Duration>)
    -> Result<CommandOutput, DeviceError>;

    /// Copies a device file to the host.
    fn pull_file(&self, remote: &str, local: &Path) -> Result<(), DeviceError>;

    /// Copies a device directory's contents into a host directory.
    fn pull_dir(&self, remote: &str, local: &Path) -> Result<(), DeviceError>;

    /// Copies a host file to the device.
    fn push_file(&self, local: &Path, remote: &str) -> Result<(), DeviceError>;

    /// Copies a host directory's contents into a device directory.
    fn push_dir(&self, local: &Path, remote: &str) -> Result<(), DeviceError>;

    /// Starts `command` through the device shell without waiting for it.
    fn spawn(&self, command: &str) -> Result<Box<dyn DeviceProcess>, DeviceError>;

    /// Connects to the transport of the guest VM with the given CID.
    fn connect_guest(&self, cid: u32) -> Result<Box<dyn Device>, DeviceError>;

    /// Releases a guest transport created by [`Device::connect_guest`].
    ///
    /// Succeeds if the guest is already gone.
    fn disconnect_guest(&self, guest_serial: &str) -> Result<(), DeviceError>;

    /// Restarts the transport daemon as root. Returns whether root is active.
    fn enable_root(&self) -> Result<bool, DeviceError>;

    /// Restarts the transport daemon without root.
    fn disable_root(&self) -> Result<(), DeviceError>;

    /// Installs a host APK on the device.
    fn install_package(&self, apk: &Path, reinstall: bool) -> Result<(), DeviceError>;

    /// Uninstalls a package. Succeeds if it is not installed.
    fn uninstall_package(&self, package: &str) -> Result<(), DeviceError>;

    /// Runs `args` joined by spaces and returns the trimmed stdout, failing on
    /// a non-zero exit status.
    fn run(&self, args: &[&str]) -> Result<String, DeviceError> {
        run_checked(self, &args.join(" "), None)
    }

    /// Like [`Device::run`], with a timeout.
    fn run_with_timeout(&self, timeout: Duration, args: &[&str]) -> Result<String, DeviceError> {
        run_checked(self, &args.join(" "), Some(timeout))
    }

    /// Runs `args`, returning the output whatever the exit status.
    fn run_for_result(&self, args: &[&str]) -> Result<CommandOutput, DeviceError> {
        self.execute(&args.join(" "), None)
    }

    /// Runs `args`, returning the trimmed stdout on success and `None` on
    /// failure. Used for commands that are allowed to fail.
    fn try_run(&self, args: &[&str]) -> Option<String> {
        match self.run(args) {
            Ok(out) => Some(out),
            Err(err) => {
                tracing::debug!(
                    error = &err as &dyn std::error::Error,
                    "ignoring command failure"
                );
                None
            }
        }
    }

    /// Reads a text file from the device.
    fn pull_file_contents(&self, path: &str) -> Result<String, DeviceError> {
        let command = format!("cat {path}");
        let output = self.execute(&command, None)?;
        check_status(&command, &output)?;
        Ok(output.stdout)
    }

    /// Writes `contents` to a device file.
    fn push_string(&self, contents: &str, remote: &str) -> Result<(), DeviceError> {
        let mut file = tempfile::NamedTempFile::new().map_err(|source| DeviceError::Launch {
            program: "tempfile".into(),
            source,
        })?;
        std::io::Write::write_all(&mut file, contents.as_bytes()).map_err(|source| {
            DeviceError::Launch {
                program: "tempfile".into(),
                source,
            }
        })?;
        self.push_file(file.path(), remote)
    }

    /// Reads a system property. Empty properties are reported as `None`.
    fn property(&self, name: &str) -> Result<Option<String>, DeviceError> {
        let value = self.run(&["getprop", name])?;
        Ok((!value.is_empty()).then_some(value))
    }

    /// Returns whether a path exists on the device.
    fn file_exists(&self, path: &str) -> Result<bool, DeviceError> {
        Ok(self.execute(&format!("test -e {path}"), None)?.success())
    }

    /// Returns whether the shell runs as root.
    fn is_root(&self) -> Result<bool, DeviceError> {
        Ok(self.run(&["id", "-u"])? == "0")
    }

    /// Returns the on-device path of an installed package's APK.
    fn package_path(&self, package: &str) -> Result<String, DeviceError> {
        let out = self.run(&["pm", "path", package])?;
        out.lines()
            .find_map(|line| line.strip_prefix("package:"))
            .map(str::to_owned)
            .ok_or_else(|| DeviceError::Unavailable(format!("package {package} is not installed")))
    }

    /// Returns the number of CPUs the device reports.
    fn num_cpus(&self) -> Result<u32, DeviceError> {
        let out = self.run(&["nproc", "--all"])?;
        out.trim()
            .parse()
            .map_err(|_| DeviceError::Unavailable(format!("unexpected nproc output: {out:?}")))
    }
}

fn run_checked<D: Device + ?Sized>(
    device: &D,
    command: &str,
    timeout: Option<Duration>,
) -> Result<String, DeviceError> {
    let output = device.execute(command, timeout)?;
    check_status(command, &output)?;
    Ok(output.stdout.trim().to_owned())
}

fn check_status(command: &str, output: &CommandOutput) -> Result<(), DeviceError> {
    if output.success() {
        return Ok(());
    }
    Err(DeviceError::Command {
        command: command.to_owned(),
        status: output
            .exit_code
            .map_or_else(|| "signal".to_owned(), |code| code.to_string()),
        stderr: output.stderr.trim().to_owned(),
    })
}
