// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error taxonomy for the orchestration engine.

use crate::device::DeviceError;
use std::time::Duration;
use thiserror::Error;

/// An error surfaced by the orchestration engine.
///
/// Nothing in this crate retries on failure: each variant carries enough
/// captured context to diagnose the failure without re-running the scenario.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Malformed manifest or configuration text.
    #[error("failed to parse {what}: {message}")]
    Parse {
        /// What was being parsed.
        what: &'static str,
        /// The parser's complaint.
        message: String,
    },
    /// A required configuration field or component is missing or invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A managed launch did not reach the ready state in time.
    #[error("vm {name} did not finish booting within {timeout:?}")]
    BootTimeout {
        /// The VM name, or its config path if unnamed.
        name: String,
        /// The configured boot timeout.
        timeout: Duration,
    },
    /// The image signing tool failed or timed out.
    #[error("resigning the images failed ({status}):\n\tout: {stdout}\n\terr: {stderr}\n")]
    Signing {
        /// Exit status, or a timeout description.
        status: String,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },
    /// A host tool other than the signer failed or timed out.
    #[error("{command} failed ({status}):\n\tout: {stdout}\n\terr: {stderr}\n")]
    Tool {
        /// The command line that was run.
        command: String,
        /// Exit status, or a timeout description.
        status: String,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },
    /// A bounded poll never observed the expected condition.
    #[error("condition not met after {elapsed:?}, last observed value: {last}")]
    Timeout {
        /// Time spent polling.
        elapsed: Duration,
        /// The last value fetched, in debug form.
        last: String,
    },
    /// A VM's console did not show the expected boot outcome.
    #[error("unexpected boot outcome: {0}")]
    BootOutcome(String),
    /// Telemetry events did not match the expected VM lifecycle.
    #[error("telemetry mismatch: {0}")]
    Telemetry(String),
    /// A device transport operation failed.
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// A host filesystem operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    pub(crate) fn parse(what: &'static str, err: impl std::fmt::Display) -> Self {
        HarnessError::Parse {
            what,
            message: err.to_string(),
        }
    }
}
