// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::bail;
use microdroid_host::INSTANCE_ID_PATH;
use microdroid_host::INSTANCE_IMG_PATH;
use microdroid_host::Scenario;
use microdroid_host::TestCaseRequirements;
use microdroid_host::TestParams;
use microdroid_host::requirements::DeviceRequirement;
use microdroid_host::scenario::APK_NAME;
use microdroid_host::scenario::APK_UPDATED_NAME;
use microdroid_host::test;

/// An instance keeps booting after its app is upgraded.
fn upgraded_package_is_accepted(params: TestParams<'_>) -> anyhow::Result<()> {
    let scenario = Scenario::new(&params)?;
    scenario.reinstall_apk(APK_NAME)?;
    scenario.ensure_boots_successfully(INSTANCE_ID_PATH, INSTANCE_IMG_PATH)?;

    scenario.reinstall_apk(APK_UPDATED_NAME)?;
    scenario.ensure_boots_successfully(INSTANCE_ID_PATH, INSTANCE_IMG_PATH)?;
    Ok(())
}

test!(upgraded_package_is_accepted, || {
    TestCaseRequirements::new().require(DeviceRequirement::UpdatableVm)
});

/// Rollback protection refuses an older app for an existing instance.
fn downgraded_package_is_rejected(params: TestParams<'_>) -> anyhow::Result<()> {
    let scenario = Scenario::new(&params)?;
    scenario.reinstall_apk(APK_UPDATED_NAME)?;
    scenario.ensure_boots_successfully(INSTANCE_ID_PATH, INSTANCE_IMG_PATH)?;

    scenario.reinstall_apk(APK_NAME)?;
    match scenario.ensure_boots_successfully(INSTANCE_ID_PATH, INSTANCE_IMG_PATH) {
        Ok(()) => bail!("a protected vm booted a downgraded payload"),
        Err(err) => {
            tracing::info!(error = %format!("{err:#}"), "downgraded payload rejected");
            Ok(())
        }
    }
}

test!(downgraded_package_is_rejected, || {
    TestCaseRequirements::new().require(DeviceRequirement::Protection(true))
});
