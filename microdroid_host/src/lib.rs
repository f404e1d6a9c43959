// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host-side orchestration for booting and validating Microdroid VMs on an
//! Android device.
//!
//! The crate drives a device over adb: it inspects the virtualization APEX,
//! builds raw VM configurations, resigns images, launches VMs through the
//! `vm` tool, classifies their console and log output, and checks the
//! lifecycle telemetry the VM manager emits. [`test_main`] runs the device
//! tests registered with [`test!`] over every protection mode and kernel.

#![warn(missing_docs)]

pub mod avb;
pub mod classify;
pub mod config;
pub mod device;
pub mod error;
pub mod guard;
pub mod host;
pub mod inventory;
pub mod launch;
pub mod memstat;
pub mod payload_metadata;
pub mod poll;
pub mod requirements;
pub mod resign;
pub mod scenario;
pub mod settings;
pub mod statsd;
pub mod telemetry;
mod tracing;
pub mod vm_tool;

pub use crate::tracing::GUEST_LOG_TARGET;
pub use crate::tracing::HARNESS_LOG;
pub use crate::tracing::log_guest_output;
pub use crate::tracing::trace_attachment;
pub use crate::tracing::try_init_tracing;
pub use device::Device;
pub use error::HarnessError;
pub use requirements::TestCaseRequirements;
pub use scenario::Scenario;
pub use settings::Settings;
pub use test::ScenarioParams;
pub use test::TestParams;
pub use test::test_main;

/// 1 kibibyte's worth of bytes.
pub const SIZE_1_KB: u64 = 1024;
/// 1 mebibyte's worth of bytes.
pub const SIZE_1_MB: u64 = 1024 * SIZE_1_KB;

/// Mount point of the virtualization APEX on the device.
pub const VIRT_APEX: &str = "/apex/com.android.virt/";
/// Device directory holding everything a test stages.
pub const TEST_ROOT: &str = "/data/local/tmp/virt/";

/// Console output of raw VMs.
pub const CONSOLE_PATH: &str = "/data/local/tmp/virt/console.txt";
/// Log output of raw VMs.
pub const LOG_PATH: &str = "/data/local/tmp/virt/log.txt";
/// Console output of managed VMs.
pub const MANAGED_CONSOLE_PATH: &str = "/data/local/tmp/virt/managed_console.txt";
/// Log output of managed VMs.
pub const MANAGED_LOG_PATH: &str = "/data/local/tmp/virt/managed_log.txt";
/// Where raw VM configurations are pushed.
pub const RAW_CONFIG_PATH: &str = "/data/local/tmp/virt/raw_config.json";
/// Signature of the test APK.
pub const IDSIG_PATH: &str = "/data/local/tmp/virt/idsig";
/// Instance image of VMs started by the tests.
pub const INSTANCE_IMG_PATH: &str = "/data/local/tmp/virt/instance.img";
/// Instance id file, on devices with per-instance ids.
pub const INSTANCE_ID_PATH: &str = "/data/local/tmp/virt/instance_id";
/// Payload metadata image of raw VMs.
pub const PAYLOAD_METADATA_PATH: &str = "/data/local/tmp/virt/payload-metadata.img";
