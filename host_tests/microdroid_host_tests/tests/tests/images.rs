// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::ensure;
use microdroid_host::CONSOLE_PATH;
use microdroid_host::LOG_PATH;
use microdroid_host::Scenario;
use microdroid_host::TestCaseRequirements;
use microdroid_host::TestParams;
use microdroid_host::VIRT_APEX;
use microdroid_host::avb::AvbTools;
use microdroid_host::classify;
use microdroid_host::classify::BootOutcome;
use microdroid_host::requirements::DeviceRequirement;
use microdroid_host::scenario::SECOND_SIGNING_KEY;
use microdroid_host::test;
use std::collections::BTreeMap;
use std::time::Duration;

/// How long a non-protected VM gets to reach a console marker.
const MARKER_TIMEOUT: Duration = Duration::from_secs(100);
/// How long pvmfw gets to reject the payload.
const PVMFW_REJECT_TIMEOUT: Duration = Duration::from_secs(30);

fn non_protected() -> TestCaseRequirements {
    TestCaseRequirements::new().require(DeviceRequirement::Protection(false))
}

/// pvmfw only accepts images signed with the platform key.
fn protected_vm_rejects_resigned_images(params: TestParams<'_>) -> anyhow::Result<()> {
    let scenario = Scenario::new(&params)?;
    let vm = scenario.run_with_resigned_images(BTreeMap::new(), true, true)?;
    let console = classify::wait_for_log_marker(
        scenario.host(),
        scenario.clock(),
        &[CONSOLE_PATH],
        classify::PAYLOAD_VERIFICATION_FAILED,
        PVMFW_REJECT_TIMEOUT,
    )?;
    tracing::info!(output = vm.output(), "vm rejected the payload");
    classify::check_payload_rejected(&console)?;
    Ok(())
}

test!(protected_vm_rejects_resigned_images, || {
    TestCaseRequirements::new().require(DeviceRequirement::Protection(true))
});

/// Without pvmfw nothing checks the image signatures.
fn non_protected_vm_boots_resigned_images(params: TestParams<'_>) -> anyhow::Result<()> {
    let scenario = Scenario::new(&params)?;
    let _vm = scenario.run_with_resigned_images(BTreeMap::new(), false, true)?;
    classify::wait_for_log_marker(
        scenario.host(),
        scenario.clock(),
        &[CONSOLE_PATH, LOG_PATH],
        classify::BOOT_COMPLETED,
        MARKER_TIMEOUT,
    )?;
    Ok(())
}

test!(non_protected_vm_boots_resigned_images, non_protected);

/// A vbmeta image signed with another key no longer matches the digest in the
/// bootconfig.
fn boot_fails_on_vbmeta_digest_mismatch(params: TestParams<'_>) -> anyhow::Result<()> {
    let scenario = Scenario::new(&params)?;
    let key_overrides = BTreeMap::from([(
        "microdroid_vbmeta.img".to_owned(),
        scenario.settings().find_test_file(SECOND_SIGNING_KEY)?,
    )]);
    let _vm = scenario.run_with_resigned_images(key_overrides, false, false)?;
    let text = classify::wait_for_log_marker(
        scenario.host(),
        scenario.clock(),
        &[CONSOLE_PATH, LOG_PATH],
        classify::VBMETA_DIGEST_MISMATCH,
        MARKER_TIMEOUT,
    )?;
    ensure!(classify::classify_console(&text) == BootOutcome::VbmetaDigestMismatch);
    Ok(())
}

test!(boot_fails_on_vbmeta_digest_mismatch, non_protected);

/// Every descriptor in the shipped vbmeta images uses SHA-256.
fn all_vbmeta_use_sha256(params: TestParams<'_>) -> anyhow::Result<()> {
    let scenario = Scenario::new(&params)?;
    let virt_apex = tempfile::tempdir()?;
    let etc_dir = virt_apex.path().join("etc");
    fs_err::create_dir_all(&etc_dir)?;
    scenario
        .host()
        .pull_dir(&format!("{VIRT_APEX}etc"), &etc_dir)?;

    let tools = AvbTools {
        lz4: scenario.settings().find_test_file("lz4")?,
        avbtool: scenario.settings().find_test_file("avbtool")?,
    };
    tools.check_vbmeta_sha256(&etc_dir)?;
    Ok(())
}

test!(all_vbmeta_use_sha256, non_protected);

/// Locked devices carry no AVF debug policy in their device tree.
fn no_avf_debug_policy_in_locked_device(params: TestParams<'_>) -> anyhow::Result<()> {
    let scenario = Scenario::new(&params)?;
    ensure!(
        !scenario.avf_debug_policy_present()?,
        "the device tree carries a debug policy"
    );
    Ok(())
}

test!(no_avf_debug_policy_in_locked_device, || {
    TestCaseRequirements::new().require(DeviceRequirement::LockedDevice)
});

/// The device only ships kernels this run knows how to test.
fn gki_versions_are_known(params: TestParams<'_>) -> anyhow::Result<()> {
    let known = &params.settings.gki_versions;
    for gki in &params.context.device_gki_versions {
        ensure!(
            known.contains(gki),
            "unknown gki {gki:?}, known versions: {known:?}"
        );
    }
    Ok(())
}

test!(gki_versions_are_known, non_protected);
