// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Context as _;
use anyhow::ensure;
use microdroid_host::Scenario;
use microdroid_host::TestCaseRequirements;
use microdroid_host::TestParams;
use microdroid_host::requirements::DeviceRequirement;
use microdroid_host::scenario::vm_configs;
use microdroid_host::test;

const DT_SYSFS_PATH: &str = "/proc/device-tree/";

/// Each assignable device shows up in the guest device tree, bound to a
/// platform device.
fn device_assignment(params: TestParams<'_>) -> anyhow::Result<()> {
    let scenario = Scenario::new(&params)?;
    let devices = scenario.assignable_devices()?;
    ensure!(!devices.is_empty(), "the VM manager reports no assignable devices");

    for device in devices {
        let mut config = scenario.microdroid_config(vm_configs::DEFAULT, None)?;
        config.devices = vec![device.node.clone()];
        let mut vm = scenario
            .boot_managed(&config)
            .with_context(|| format!("failed to boot with {} assigned", device.node))?;
        ensure!(vm.enable_root()?, "adb root is not available in the guest");
        let guest = vm.guest()?;

        let dt_path = guest.run(&[
            "cat",
            &format!("{DT_SYSFS_PATH}__symbols__/{}", device.dtbo_label),
        ])?;
        ensure!(!dt_path.is_empty(), "no symbol for {}", device.dtbo_label);

        let resolved = guest.run(&["readlink", "-e", &format!("{DT_SYSFS_PATH}{dt_path}")])?;
        ensure!(!resolved.is_empty(), "{dt_path} does not resolve");

        let bound = guest.run(&["readlink", "-e", "/sys/bus/platform/devices/*/of_node"])?;
        ensure!(
            bound.lines().any(|line| line == resolved),
            "no platform device is bound to {resolved}"
        );
        vm.shutdown()?;
    }
    Ok(())
}

test!(device_assignment, || {
    TestCaseRequirements::new()
        .require(DeviceRequirement::VfioPlatform)
        .require(DeviceRequirement::AssignableDevices)
});
