// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use microdroid_host::Scenario;
use microdroid_host::TestParams;
use microdroid_host::scenario::APEX_CONFIG_APEXES;
use microdroid_host::scenario::vm_configs;
use microdroid_host::test;

/// The VM manager logs creation, boot and exit of a named VM.
fn telemetry_pushed_atoms(params: TestParams<'_>) -> anyhow::Result<()> {
    let scenario = Scenario::new(&params)?;
    scenario.telemetry_lifecycle(
        vm_configs::APEX,
        "test_telemetry_pushed_atoms",
        Some(APEX_CONFIG_APEXES),
    )
}

test!(telemetry_pushed_atoms);
