// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Classification of console text and host logs into scenario outcomes.

use crate::device::Device;
use crate::device::DeviceError;
use crate::error::HarnessError;
use crate::poll::Clock;
use crate::poll::DEFAULT_INTERVAL;
use crate::poll::poll_until;
use jiff::civil::DateTime;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

/// Printed by pvmfw when it starts.
pub const PVMFW_STARTED: &str = "pVM firmware";
/// Printed by pvmfw when it hands over to the kernel.
pub const PVMFW_STARTING_PAYLOAD: &str = "Starting payload...";
/// Printed by pvmfw when the payload signature does not verify.
pub const PAYLOAD_VERIFICATION_FAILED: &str = "Failed to verify the payload";
/// Printed by microdroid_manager once the guest OS is up.
pub const BOOT_COMPLETED: &str = "boot completed, time to run payload";
/// Printed by first-stage init when vbmeta does not match the bootconfig.
pub const VBMETA_DIGEST_MISMATCH: &str = "init: [libfs_avb] Failed to verify vbmeta digest";
/// Printed by `vm run-app` when the payload binary name has a path.
pub const PAYLOAD_BINARY_PATH_REJECTED: &str = "Payload binary name must not specify a path";

/// Host log line emitted when a guest tombstone or ramdump is received.
pub const TOMBSTONE_PATTERN: &str = "Received [0-9]+ bytes from guest & wrote to tombstone file|\
     Ramdump \"[^ ]+/ramdump\" sent to tombstoned";
/// Host log line emitted when the VM process exits.
pub const CROSVM_EXIT_PATTERN: &str =
    "virtualizationmanager::crosvm.*exited with status exit status:";

const TOMBSTONE_QUERY_TIMEOUT: Duration = Duration::from_secs(3);
const CROSVM_EXIT_TIMEOUT: Duration = Duration::from_secs(15);
const DATE_TIMEOUT: Duration = Duration::from_secs(1);

static TOMBSTONE: LazyLock<Regex> = LazyLock::new(|| builtin(TOMBSTONE_PATTERN));
static AVC_DENIAL: LazyLock<Regex> = LazyLock::new(|| builtin(r"avc:\s+denied"));

pub(crate) fn builtin(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(err) => unreachable!("invalid built-in pattern {pattern}: {err}"),
    }
}

/// What a console log says about how far a VM got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    /// pvmfw rejected the payload signature.
    PayloadVerificationFailed,
    /// init rejected the vbmeta digest passed in the bootconfig.
    VbmetaDigestMismatch,
    /// The guest OS finished booting.
    BootCompleted,
    /// pvmfw started the kernel.
    PayloadStarted,
    /// pvmfw is running.
    FirmwareStarted,
    /// None of the known markers appeared yet.
    Pending,
}

impl BootOutcome {
    /// Returns true if the outcome can no longer change.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            BootOutcome::PayloadVerificationFailed
                | BootOutcome::VbmetaDigestMismatch
                | BootOutcome::BootCompleted
        )
    }
}

/// Classifies console text. Failure markers win over progress markers.
pub fn classify_console(text: &str) -> BootOutcome {
    if text.contains(PAYLOAD_VERIFICATION_FAILED) {
        BootOutcome::PayloadVerificationFailed
    } else if text.contains(VBMETA_DIGEST_MISMATCH) {
        BootOutcome::VbmetaDigestMismatch
    } else if text.contains(BOOT_COMPLETED) {
        BootOutcome::BootCompleted
    } else if text.contains(PVMFW_STARTING_PAYLOAD) {
        BootOutcome::PayloadStarted
    } else if text.contains(PVMFW_STARTED) {
        BootOutcome::FirmwareStarted
    } else {
        BootOutcome::Pending
    }
}

/// Checks that pvmfw started and rejected the payload, and that the guest
/// never reported a completed boot.
pub fn check_payload_rejected(console: &str) -> Result<(), HarnessError> {
    for (marker, what) in [
        (PVMFW_STARTED, "pvmfw did not start"),
        (PAYLOAD_VERIFICATION_FAILED, "pvmfw did not reject the payload"),
    ] {
        if !console.contains(marker) {
            return Err(HarnessError::BootOutcome(what.to_owned()));
        }
    }
    if console.contains(BOOT_COMPLETED) {
        return Err(HarnessError::BootOutcome(
            "the guest booted although the payload was rejected".to_owned(),
        ));
    }
    Ok(())
}

/// Returns true if `line` reports a received tombstone or ramdump.
pub fn is_tombstone_line(line: &str) -> bool {
    TOMBSTONE.is_match(line)
}

/// Returns true if `text` contains an SELinux denial.
pub fn contains_avc_denial(text: &str) -> bool {
    AVC_DENIAL.is_match(text)
}

/// The device clock at the start of a scenario, used to scope log queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTimestamp {
    raw: String,
    time: DateTime,
}

impl DeviceTimestamp {
    /// Reads the device clock.
    pub fn now(device: &dyn Device) -> Result<Self, HarnessError> {
        let raw = device.run_with_timeout(DATE_TIMEOUT, &["date", "'+%Y-%m-%d %H:%M:%S.%N'"])?;
        Self::parse(&raw)
    }

    /// Parses `date '+%Y-%m-%d %H:%M:%S.%N'` output.
    pub fn parse(raw: &str) -> Result<Self, HarnessError> {
        let raw = raw.trim();
        let time = DateTime::strptime("%Y-%m-%d %H:%M:%S%.f", raw)
            .map_err(|err| HarnessError::parse("device timestamp", err))?;
        Ok(Self {
            raw: raw.to_owned(),
            time,
        })
    }

    /// The parsed civil time.
    pub fn time(&self) -> DateTime {
        self.time
    }

    /// The timestamp as the device printed it.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn logcat_since(pattern: &str, start: &DeviceTimestamp) -> String {
    format!("logcat -m 1 -e '{pattern}' -T '{}'", start.as_str())
}

/// Returns whether the host logged a received tombstone since `start`.
///
/// The log query waits at most a few seconds; no matching line in that time
/// means no tombstone.
pub fn tombstone_received(
    device: &dyn Device,
    start: &DeviceTimestamp,
) -> Result<bool, HarnessError> {
    match device.execute(
        &logcat_since(TOMBSTONE_PATTERN, start),
        Some(TOMBSTONE_QUERY_TIMEOUT),
    ) {
        Ok(output) => Ok(output.stdout.lines().any(is_tombstone_line)),
        Err(DeviceError::TimedOut { .. }) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Waits for the host to log that the VM process exited after `start`.
pub fn wait_for_crosvm_exit(
    device: &dyn Device,
    start: &DeviceTimestamp,
) -> Result<(), HarnessError> {
    match device.run_with_timeout(CROSVM_EXIT_TIMEOUT, &[&logcat_since(CROSVM_EXIT_PATTERN, start)])
    {
        Ok(line) => {
            tracing::debug!(line, "vm process exited");
            Ok(())
        }
        Err(DeviceError::TimedOut { timeout, .. }) => Err(HarnessError::Timeout {
            elapsed: timeout,
            last: "no vm exit logged".into(),
        }),
        Err(err) => Err(err.into()),
    }
}

/// Reads a device log file, treating a file that does not exist yet as empty.
pub fn read_log(device: &dyn Device, path: &str) -> Result<String, HarnessError> {
    let output = device.execute(&format!("cat {path}"), None)?;
    Ok(if output.success() {
        output.stdout
    } else {
        String::new()
    })
}

/// Polls the concatenation of `paths` until it contains `marker`.
pub fn wait_for_log_marker(
    device: &dyn Device,
    clock: &dyn Clock,
    paths: &[&str],
    marker: &str,
    timeout: Duration,
) -> Result<String, HarnessError> {
    tracing::info!(marker, ?paths, "waiting for log marker");
    poll_until(
        clock,
        timeout,
        DEFAULT_INTERVAL,
        || {
            let mut text = String::new();
            for path in paths {
                text.push_str(&read_log(device, path)?);
            }
            Ok(LogTail(text))
        },
        |text| text.0.contains(marker),
    )
    .map(|text| text.0)
}

/// Log text whose debug form is only the last few lines.
struct LogTail(String);

impl std::fmt::Debug for LogTail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lines: Vec<_> = self.0.lines().rev().take(10).collect();
        for line in lines.into_iter().rev() {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}
