// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! [`Device`] implementation backed by the `adb` command-line tool.

use super::CommandOutput;
use super::Device;
use super::DeviceError;
use super::DeviceProcess;
use crate::host::HostProcess;
use crate::host::TimedOutput;
use crate::host::TimedStatus;
use crate::host::host_command;
use crate::host::run_timed;
use std::net::Ipv4Addr;
use std::net::TcpListener;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Port adbd listens on inside the guest.
const GUEST_ADBD_PORT: u32 = 5555;

/// A device reached through `adb -s <serial>`.
#[derive(Debug, Clone)]
pub struct AdbDevice {
    adb: PathBuf,
    serial: String,
}

impl AdbDevice {
    /// Creates a device handle for `serial` using the `adb` binary at `adb`.
    pub fn new(adb: impl Into<PathBuf>, serial: impl Into<String>) -> Self {
        Self {
            adb: adb.into(),
            serial: serial.into(),
        }
    }

    /// Creates a handle for the only device attached to the host.
    pub fn only_attached(adb: impl Into<PathBuf>) -> Result<Self, DeviceError> {
        let adb = adb.into();
        let output = run_adb(&adb, &["devices"], DEFAULT_COMMAND_TIMEOUT)?;
        let serials = parse_device_list(&output.stdout);
        match serials.as_slice() {
            [serial] => Ok(Self::new(adb, serial.clone())),
            [] => Err(DeviceError::Unavailable("no device attached".into())),
            _ => Err(DeviceError::Unavailable(format!(
                "more than one device attached ({}), pass a serial",
                serials.join(", ")
            ))),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = host_command(&self.adb);
        cmd.arg("-s").arg(&self.serial);
        cmd
    }

    fn adb(&self, args: &[&str], timeout: Duration) -> Result<TimedOutput, DeviceError> {
        let mut cmd = self.command();
        cmd.args(args);
        timed(&mut cmd, &self.adb, args, timeout)
    }

    fn adb_checked(&self, args: &[&str], timeout: Duration) -> Result<String, DeviceError> {
        let output = self.adb(args, timeout)?;
        if !output.status.success() {
            return Err(DeviceError::Command {
                command: format!("adb {}", args.join(" ")),
                status: output.status.to_string(),
                stderr: output.stderr.trim().to_owned(),
            });
        }
        Ok(output.stdout)
    }
}

fn timed(
    cmd: &mut Command,
    program: &Path,
    args: &[&str],
    timeout: Duration,
) -> Result<TimedOutput, DeviceError> {
    let output = run_timed(cmd, timeout).map_err(|source| DeviceError::Launch {
        program: program.display().to_string(),
        source,
    })?;
    if let TimedStatus::TimedOut(timeout) = output.status {
        return Err(DeviceError::TimedOut {
            command: format!("adb {}", args.join(" ")),
            timeout,
        });
    }
    Ok(output)
}

fn run_adb(adb: &Path, args: &[&str], timeout: Duration) -> Result<TimedOutput, DeviceError> {
    let mut cmd = host_command(adb);
    cmd.args(args);
    timed(&mut cmd, adb, args, timeout)
}

/// Parses the serials in `adb devices` output that are in the `device` state.
fn parse_device_list(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|line| !line.starts_with("List of devices"))
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let serial = fields.next()?;
            (fields.next() == Some("device")).then(|| serial.to_owned())
        })
        .collect()
}

/// Returns the forwarded host port encoded in a guest serial.
fn forwarded_port(guest_serial: &str) -> Option<u16> {
    guest_serial.strip_prefix("localhost:")?.parse().ok()
}

fn free_local_port() -> Result<u16, DeviceError> {
    let listener =
        TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).map_err(|source| DeviceError::Launch {
            program: "tcp listener".into(),
            source,
        })?;
    let port = listener
        .local_addr()
        .map_err(|source| DeviceError::Launch {
            program: "tcp listener".into(),
            source,
        })?
        .port();
    Ok(port)
}

impl Device for AdbDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn execute(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, DeviceError> {
        let timeout = timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT);
        let output = self.adb(&["shell", command], timeout)?;
        let exit_code = match output.status {
            TimedStatus::Exited(status) => status.code(),
            TimedStatus::TimedOut(_) => None,
        };
        Ok(CommandOutput {
            exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn pull_file(&self, remote: &str, local: &Path) -> Result<(), DeviceError> {
        let local = local.to_string_lossy();
        self.adb_checked(&["pull", remote, &local], TRANSFER_TIMEOUT)?;
        Ok(())
    }

    fn pull_dir(&self, remote: &str, local: &Path) -> Result<(), DeviceError> {
        let remote = format!("{}/.", remote.trim_end_matches('/'));
        let local = local.to_string_lossy();
        self.adb_checked(&["pull", &remote, &local], TRANSFER_TIMEOUT)?;
        Ok(())
    }

    fn push_file(&self, local: &Path, remote: &str) -> Result<(), DeviceError> {
        let local = local.to_string_lossy();
        self.adb_checked(&["push", &local, remote], TRANSFER_TIMEOUT)?;
        Ok(())
    }

    fn push_dir(&self, local: &Path, remote: &str) -> Result<(), DeviceError> {
        let local = format!("{}/.", local.to_string_lossy().trim_end_matches('/'));
        self.adb_checked(&["push", &local, remote], TRANSFER_TIMEOUT)?;
        Ok(())
    }

    fn spawn(&self, command: &str) -> Result<Box<dyn DeviceProcess>, DeviceError> {
        let mut cmd = self.command();
        cmd.args(["shell", command]);
        tracing::debug!(serial = %self.serial, command, "spawning device process");
        let process = HostProcess::spawn(&mut cmd).map_err(|source| DeviceError::Launch {
            program: self.adb.display().to_string(),
            source,
        })?;
        Ok(Box::new(AdbProcess { process }))
    }

    fn connect_guest(&self, cid: u32) -> Result<Box<dyn Device>, DeviceError> {
        let port = free_local_port()?;
        let local = format!("tcp:{port}");
        let remote = format!("vsock:{cid}:{GUEST_ADBD_PORT}");
        self.adb_checked(&["forward", &local, &remote], DEFAULT_COMMAND_TIMEOUT)?;

        let guest_serial = format!("localhost:{port}");
        let connected = run_adb(&self.adb, &["connect", &guest_serial], DEFAULT_COMMAND_TIMEOUT)
            .map(|output| output.stdout.contains("connected to"));
        match connected {
            Ok(true) => {
                tracing::info!(cid, guest = %guest_serial, "connected to guest adbd");
                Ok(Box::new(AdbDevice::new(self.adb.clone(), guest_serial)))
            }
            Ok(false) => {
                self.disconnect_guest(&guest_serial)?;
                Err(DeviceError::Unavailable(format!(
                    "guest with cid {cid} refused the connection"
                )))
            }
            Err(err) => {
                self.disconnect_guest(&guest_serial)?;
                Err(err)
            }
        }
    }

    fn disconnect_guest(&self, guest_serial: &str) -> Result<(), DeviceError> {
        // Both commands fail harmlessly if the guest or forward is already gone.
        let output = run_adb(&self.adb, &["disconnect", guest_serial], DEFAULT_COMMAND_TIMEOUT)?;
        tracing::debug!(guest = guest_serial, stdout = %output.stdout.trim(), "adb disconnect");
        if let Some(port) = forwarded_port(guest_serial) {
            let local = format!("tcp:{port}");
            self.adb(&["forward", "--remove", &local], DEFAULT_COMMAND_TIMEOUT)?;
        }
        Ok(())
    }

    fn enable_root(&self) -> Result<bool, DeviceError> {
        self.adb_checked(&["root"], DEFAULT_COMMAND_TIMEOUT)?;
        self.adb_checked(&["wait-for-device"], DEFAULT_COMMAND_TIMEOUT)?;
        self.is_root()
    }

    fn disable_root(&self) -> Result<(), DeviceError> {
        self.adb_checked(&["unroot"], DEFAULT_COMMAND_TIMEOUT)?;
        self.adb_checked(&["wait-for-device"], DEFAULT_COMMAND_TIMEOUT)?;
        Ok(())
    }

    fn install_package(&self, apk: &Path, reinstall: bool) -> Result<(), DeviceError> {
        let apk = apk.to_string_lossy();
        let mut args = vec!["install"];
        if reinstall {
            args.push("-r");
        }
        args.push(&apk);
        let stdout = self.adb_checked(&args, TRANSFER_TIMEOUT)?;
        if !stdout.contains("Success") {
            return Err(DeviceError::Unavailable(format!(
                "failed to install {apk}: {}",
                stdout.trim()
            )));
        }
        Ok(())
    }

    fn uninstall_package(&self, package: &str) -> Result<(), DeviceError> {
        let output = self.adb(&["uninstall", package], DEFAULT_COMMAND_TIMEOUT)?;
        if !output.status.success() {
            tracing::debug!(package, stderr = %output.stderr.trim(), "package was not installed");
        }
        Ok(())
    }
}

struct AdbProcess {
    process: HostProcess,
}

impl DeviceProcess for AdbProcess {
    fn output(&self) -> String {
        self.process.output()
    }

    fn try_wait(&mut self) -> Result<Option<i32>, DeviceError> {
        let status = self
            .process
            .try_wait()
            .map_err(|source| DeviceError::Launch {
                program: "adb".into(),
                source,
            })?;
        // A process killed by a signal has no code; report it as -1.
        Ok(status.map(|status| status.code().unwrap_or(-1)))
    }

    fn kill(&mut self) -> Result<(), DeviceError> {
        self.process.kill().map_err(|source| DeviceError::Launch {
            program: "adb".into(),
            source,
        })
    }
}
