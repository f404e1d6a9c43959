// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Device tests for Microdroid VMs.
//!
//! Every test runs once per protection mode and kernel the device supports.
//! Instances whose requirements are not met are reported as ignored.

// Managed VM boots and in-guest checks.
mod boot;
// Device assignment.
mod device_assignment;
// Boots from resigned images and image checks.
mod images;
// Guest memory usage.
mod memory;
// Guest crash reporting.
mod tombstone;
// VM manager telemetry.
mod telemetry;
// Instance upgrades.
mod upgrade;

fn main() {
    microdroid_host::test_main()
}
