// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Context as _;
use anyhow::ensure;
use microdroid_host::MANAGED_CONSOLE_PATH;
use microdroid_host::MANAGED_LOG_PATH;
use microdroid_host::Scenario;
use microdroid_host::TestCaseRequirements;
use microdroid_host::TestParams;
use microdroid_host::classify;
use microdroid_host::guard::AdbRootGuard;
use microdroid_host::guard::ShmemHugePages;
use microdroid_host::host::host_command;
use microdroid_host::host::run_timed;
use microdroid_host::requirements::DeviceRequirement;
use microdroid_host::scenario::vm_configs;
use microdroid_host::test;
use microdroid_host::vm_tool::DebugLevel;
use microdroid_host::vm_tool::VmTool;
use microdroid_host::vm_tool::shell_line;
use std::time::Duration;

const SEPOLICY_TIMEOUT: Duration = Duration::from_secs(10);

/// Boots the test payload and checks the guest from the inside.
fn microdroid_boots(params: TestParams<'_>) -> anyhow::Result<()> {
    let scenario = Scenario::new(&params)?;
    let host = scenario.host();
    let config = scenario.microdroid_config(vm_configs::DEFAULT, Some("test_microdroid_boots"))?;
    let vm = scenario.boot_managed(&config)?;
    let guest = vm.guest()?;

    let uid = host.run(&["id", "-u"])?;
    let list = shell_line(&VmTool::default().list());
    let list = host.run(&[list.as_str()])?;
    ensure!(
        list.contains(&format!("requesterUid: {uid}")),
        "vm list does not show a vm owned by uid {uid}:\n{list}"
    );

    let test_file = "/data/local/tmp/test.txt";
    guest.run(&["echo", "MicrodroidTest", ">", test_file])?;
    ensure!(guest.run(&["cat", test_file])? == "MicrodroidTest");

    for partition in ["microdroid-apk", "microdroid-apk-idsig", "vm-instance"] {
        guest
            .run(&["ls", &format!("/dev/block/by-name/{partition}")])
            .with_context(|| format!("partition {partition} is missing"))?;
    }

    let abilist = guest.run(&["getprop", "ro.product.cpu.abilist"])?;
    ensure!(
        abilist.split(',').count() == 1,
        "guest reports more than one abi: {abilist}"
    );

    let console = classify::read_log(host, MANAGED_CONSOLE_PATH)?;
    let log = classify::read_log(host, MANAGED_LOG_PATH)?;
    ensure!(!console.is_empty(), "empty console output");
    ensure!(!log.is_empty(), "empty log output");
    ensure!(
        !classify::contains_avc_denial(&console) && !classify::contains_avc_denial(&log),
        "selinux denials in the guest output"
    );

    let (guest_cpus, host_cpus) = (guest.num_cpus()?, host.num_cpus()?);
    ensure!(
        guest_cpus == host_cpus,
        "guest has {guest_cpus} cpus, host has {host_cpus}"
    );

    ensure!(guest.run(&["getenforce"])? == "Enforcing");

    if !scenario.context().cuttlefish {
        vm.enable_root()?;
        let policy = tempfile::NamedTempFile::new()?;
        guest.pull_file("/sys/fs/selinux/policy", policy.path())?;
        let analyze = scenario.settings().find_test_file("sepolicy-analyze")?;
        let neverallows = scenario
            .settings()
            .find_test_file("microdroid_general_sepolicy.conf")?;
        let output = run_timed(
            host_command(&analyze)
                .arg(policy.path())
                .args(["neverallow", "-w", "-f"])
                .arg(&neverallows),
            SEPOLICY_TIMEOUT,
        )?;
        ensure!(
            output.status.success(),
            "neverallow violations ({}):\n{}{}",
            output.status,
            output.stdout,
            output.stderr
        );
    }
    Ok(())
}

test!(microdroid_boots);

/// A protected VM goes through pvmfw before the kernel.
fn protected_vm_runs_pvmfw(params: TestParams<'_>) -> anyhow::Result<()> {
    let scenario = Scenario::new(&params)?;
    let config = scenario.microdroid_config(vm_configs::APEX, Some("protected_vm_runs_pvmfw"))?;
    let mut vm = scenario.boot_managed(&config)?;
    vm.shutdown()?;

    let console = classify::read_log(scenario.host(), MANAGED_CONSOLE_PATH)?;
    ensure!(
        console.contains(classify::PVMFW_STARTED),
        "pvmfw did not start"
    );
    ensure!(
        console.contains(classify::PVMFW_STARTING_PAYLOAD),
        "pvmfw did not start the payload"
    );
    Ok(())
}

test!(protected_vm_runs_pvmfw, || {
    TestCaseRequirements::new().require(DeviceRequirement::Protection(true))
});

/// Payload binaries are named relative to the APK's library directory.
fn path_to_binary_is_rejected(params: TestParams<'_>) -> anyhow::Result<()> {
    let scenario = Scenario::new(&params)?;
    scenario.prepare_run_app_files()?;
    let mut args = scenario.run_app_args(DebugLevel::Full)?;
    args.payload_binary_name = Some("./MicrodroidTestNativeLib.so".into());
    let command = shell_line(&VmTool::default().run_app(&args));
    let output = scenario.host().run_for_result(&[command.as_str()])?;
    ensure!(!output.success(), "run-app accepted a binary path");
    ensure!(
        output.stderr.contains(classify::PAYLOAD_BINARY_PATH_REJECTED),
        "unexpected error output: {}",
        output.stderr
    );
    Ok(())
}

test!(path_to_binary_is_rejected);

/// Boots with guest memory backed by transparent huge pages.
fn huge_pages(params: TestParams<'_>) -> anyhow::Result<()> {
    let scenario = Scenario::new(&params)?;
    let host = scenario.host();
    let _root = AdbRootGuard::new(host)?;
    let _shmem = ShmemHugePages::enable_advise(host)?;

    let mut config = scenario.microdroid_config(vm_configs::DEFAULT, Some("test_huge_pages"))?;
    config.hugepages = true;
    let mut vm = scenario.boot_managed(&config)?;
    vm.shutdown()?;
    Ok(())
}

test!(huge_pages, || {
    TestCaseRequirements::new().require(DeviceRequirement::ShmemHugePagesOff)
});
