// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest crashes reach the host as tombstones only when the payload exports
//! them and the VM is debuggable.

use anyhow::ensure;
use microdroid_host::Scenario;
use microdroid_host::TestCaseRequirements;
use microdroid_host::TestParams;
use microdroid_host::requirements::DeviceRequirement;
use microdroid_host::scenario::vm_configs;
use microdroid_host::test;
use microdroid_host::vm_tool::DebugLevel;

const CRASH_PAYLOAD: &str = "MicrodroidCrashNativeLib.so";
const KILL_LAUNCHER: [&str; 3] = ["kill", "-SIGSEGV", "$(pidof microdroid_launcher)"];

fn not_hwasan() -> TestCaseRequirements {
    TestCaseRequirements::new().require(DeviceRequirement::NotHwasan)
}

fn crash_with_run_app(
    params: &TestParams<'_>,
    debug: DebugLevel,
    crash_config: bool,
) -> anyhow::Result<bool> {
    let scenario = Scenario::new(params)?;
    let mut args = scenario.run_app_args(debug)?;
    if crash_config {
        args.config_path = Some(vm_configs::CRASH.into());
    } else {
        args.payload_binary_name = Some(CRASH_PAYLOAD.into());
    }
    scenario.tombstone_generated_with_run_app(&args)
}

fn tombstones_generated_on_userspace_crash(params: TestParams<'_>) -> anyhow::Result<()> {
    let scenario = Scenario::new(&params)?;
    ensure!(
        scenario.tombstone_generated_with_cmd(vm_configs::DEFAULT, &KILL_LAUNCHER)?,
        "no tombstone received"
    );
    Ok(())
}

test!(tombstones_generated_on_userspace_crash, not_hwasan);

fn tombstones_not_generated_if_not_exported(params: TestParams<'_>) -> anyhow::Result<()> {
    let scenario = Scenario::new(&params)?;
    ensure!(
        !scenario.tombstone_generated_with_cmd(vm_configs::NO_TOMBSTONE, &KILL_LAUNCHER)?,
        "tombstone received although the payload does not export them"
    );
    Ok(())
}

test!(tombstones_not_generated_if_not_exported, not_hwasan);

fn tombstones_generated_with_crash_payload(params: TestParams<'_>) -> anyhow::Result<()> {
    ensure!(crash_with_run_app(&params, DebugLevel::Full, false)?);
    Ok(())
}

test!(tombstones_generated_with_crash_payload, not_hwasan);

fn tombstones_not_generated_with_crash_payload_when_not_debuggable(
    params: TestParams<'_>,
) -> anyhow::Result<()> {
    ensure!(!crash_with_run_app(&params, DebugLevel::None, false)?);
    Ok(())
}

test!(
    tombstones_not_generated_with_crash_payload_when_not_debuggable,
    not_hwasan
);

fn tombstones_generated_with_crash_config(params: TestParams<'_>) -> anyhow::Result<()> {
    ensure!(crash_with_run_app(&params, DebugLevel::Full, true)?);
    Ok(())
}

test!(tombstones_generated_with_crash_config, not_hwasan);

fn tombstones_not_generated_with_crash_config_when_not_debuggable(
    params: TestParams<'_>,
) -> anyhow::Result<()> {
    ensure!(!crash_with_run_app(&params, DebugLevel::None, true)?);
    Ok(())
}

test!(
    tombstones_not_generated_with_crash_config_when_not_debuggable,
    not_hwasan
);
