// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Building blocks shared by the device test cases.
//!
//! A [`Scenario`] prepares the host device when it is created and restores it
//! when dropped: the test APK is installed for the scenario's lifetime, the
//! test root is emptied on both ends, and the VM logs left on the device are
//! archived into the test output directory.

use crate::classify;
use crate::classify::DeviceTimestamp;
use crate::config::payload_components;
use crate::config::staged_raw_config;
use crate::device::Device;
use crate::inventory::Inventory;
use crate::launch::LaunchState;
use crate::launch::ManagedVm;
use crate::launch::MicrodroidConfig;
use crate::launch::RawVm;
use crate::launch::launch_managed;
use crate::launch::launch_raw;
use crate::launch::min_memory_mib;
use crate::payload_metadata;
use crate::poll::Clock;
use crate::poll::SystemClock;
use crate::requirements::HostContext;
use crate::resign::ResignRequest;
use crate::resign::resign;
use crate::settings::Settings;
use crate::statsd::StatsdTelemetry;
use crate::telemetry::LIFECYCLE_ATOMS;
use crate::telemetry::LifecycleExpectation;
use crate::telemetry::TelemetrySource;
use crate::telemetry::collect_events;
use crate::telemetry::validate_lifecycle;
use crate::test::ScenarioParams;
use crate::test::TestParams;
use crate::tracing::log_guest_output;
use crate::tracing::trace_attachment;
use crate::vm_tool::DebugLevel;
use crate::vm_tool::INSTANCE_IMAGE_SIZE;
use crate::vm_tool::RunAppArgs;
use crate::vm_tool::VmTool;
use crate::vm_tool::shell_line;
use anyhow::Context as _;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

/// The test app.
pub const APK_NAME: &str = "MicrodroidTestApp.apk";
/// A newer version of the test app.
pub const APK_UPDATED_NAME: &str = "MicrodroidTestAppUpdated.apk";
/// Package name of both test app versions.
pub const PACKAGE_NAME: &str = "com.android.microdroid.test";
const SHELL_PACKAGE_NAME: &str = "com.android.shell";
const CUSTOM_VM_PERMISSION: &str = "android.permission.USE_CUSTOM_VIRTUAL_MACHINE";

/// Key the resigned images are signed with.
pub const SIGNING_KEY: &str = "test.com.android.virt.pem";
/// A second key, for images signed differently from the rest.
pub const SECOND_SIGNING_KEY: &str = "test2.com.android.virt.pem";

/// VM config paths inside the test APK.
pub mod vm_configs {
    /// Runs the test payload.
    pub const DEFAULT: &str = "assets/vm_config.json";
    /// Requests extra APEXes.
    pub const APEX: &str = "assets/vm_config_apex.json";
    /// Does not export tombstones.
    pub const NO_TOMBSTONE: &str = "assets/vm_config_no_tombstone.json";
    /// Runs a crashing payload.
    pub const CRASH: &str = "assets/vm_config_crash.json";
}

/// Present in the device tree when an AVF debug policy is installed.
pub const AVF_DEBUG_POLICY_PATH: &str = "/proc/device-tree/avf/guest";

/// APEXes [`vm_configs::APEX`] requests, as telemetry reports them.
pub const APEX_CONFIG_APEXES: &str = "com.android.art:com.android.compos:com.android.sdkext";

/// A device that can be assigned to a VM.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AssignableDevice {
    /// Sysfs node of the device.
    pub node: String,
    /// Label of the device in the VM device tree overlay.
    pub dtbo_label: String,
}

/// Extracts assignable devices from `vm info` output.
pub fn parse_assignable_devices(info: &str) -> anyhow::Result<Vec<AssignableDevice>> {
    for line in info.lines() {
        if let Some(json) = line.trim().strip_prefix("Assignable devices:") {
            return serde_json::from_str(json.trim())
                .with_context(|| format!("invalid assignable device list {json:?}"));
        }
    }
    Ok(Vec::new())
}

/// A prepared host device for one test instance.
pub struct Scenario<'a> {
    host: &'a dyn Device,
    settings: &'a Settings,
    params: &'a ScenarioParams,
    context: &'a HostContext,
    output_dir: &'a Path,
    test_name: &'a str,
    clock: SystemClock,
}

impl<'a> Scenario<'a> {
    /// Installs the test app and resets the test root.
    pub fn new(params: &TestParams<'a>) -> anyhow::Result<Self> {
        let scenario = Self {
            host: params.host,
            settings: params.settings,
            params: params.scenario,
            context: params.context,
            output_dir: params.output_dir,
            test_name: params.test_name,
            clock: SystemClock::new(),
        };
        scenario.reset_test_root()?;
        scenario.install_apk(APK_NAME, false)?;
        scenario
            .host
            .try_run(&["pm", "grant", SHELL_PACKAGE_NAME, CUSTOM_VM_PERMISSION]);
        Ok(scenario)
    }

    /// The host device.
    pub fn host(&self) -> &'a dyn Device {
        self.host
    }

    /// The VM flavor under test.
    pub fn params(&self) -> &ScenarioParams {
        self.params
    }

    /// Facts about the host device.
    pub fn context(&self) -> &HostContext {
        self.context
    }

    /// Run settings.
    pub fn settings(&self) -> &Settings {
        self.settings
    }

    /// The wall clock used for polling.
    pub fn clock(&self) -> &dyn Clock {
        &self.clock
    }

    /// Empties the test root on the device.
    pub fn reset_test_root(&self) -> anyhow::Result<()> {
        self.host.run(&["rm", "-rf", crate::TEST_ROOT])?;
        self.host.run(&["mkdir", "-p", crate::TEST_ROOT])?;
        Ok(())
    }

    /// Installs the test APK `name` from the test files.
    pub fn install_apk(&self, name: &str, reinstall: bool) -> anyhow::Result<()> {
        let apk = self.settings.find_test_file(name)?;
        self.host
            .install_package(&apk, reinstall)
            .with_context(|| format!("failed to install {}", apk.display()))
    }

    /// Replaces the installed test app with `name`, starting from an empty
    /// test root.
    pub fn reinstall_apk(&self, name: &str) -> anyhow::Result<()> {
        self.host.uninstall_package(PACKAGE_NAME)?;
        self.reset_test_root()?;
        self.install_apk(name, true)
    }

    /// Device path of the installed test APK.
    pub fn apk_path(&self) -> anyhow::Result<String> {
        Ok(self.host.package_path(PACKAGE_NAME)?)
    }

    /// The launch settings most cases use: full debug, minimum memory, one
    /// vCPU per host CPU, and the scenario's protection and kernel.
    pub fn microdroid_config(
        &self,
        config_path: &str,
        name: Option<&str>,
    ) -> anyhow::Result<MicrodroidConfig> {
        let mut config =
            MicrodroidConfig::new(self.apk_path()?, config_path, min_memory_mib(self.host)?);
        config.protected = self.params.protected;
        config.gki = self.params.gki.clone();
        config.name = name.map(str::to_owned);
        Ok(config)
    }

    /// Launches a managed VM and waits for it to boot.
    pub fn boot_managed(&self, config: &MicrodroidConfig) -> anyhow::Result<ManagedVm<'a>> {
        launch_managed(self.host, config, &self.clock)
            .with_context(|| format!("failed to boot {}", config.config_path))
    }

    /// Boots the default payload with the given instance files and checks that
    /// root is available in the guest. The VM is shut down either way.
    pub fn ensure_boots_successfully(
        &self,
        instance_id_file: &str,
        instance_image: &str,
    ) -> anyhow::Result<()> {
        let mut config = self.microdroid_config(vm_configs::DEFAULT, None)?;
        config.gki = None;
        config.instance_id_file = Some(instance_id_file.to_owned());
        config.instance_image = Some(instance_image.to_owned());
        let mut vm = self.boot_managed(&config)?;
        if !vm.enable_root()? {
            anyhow::bail!("adb root is not available in the guest");
        }
        vm.shutdown()?;
        Ok(())
    }

    /// Pulls the virtualization APEX images, resigns them and starts a raw VM
    /// from the resigned copy.
    ///
    /// Nothing waits for the VM to boot; callers poll its console.
    pub fn run_with_resigned_images(
        &self,
        key_overrides: BTreeMap<String, PathBuf>,
        protected: bool,
        update_bootconfigs: bool,
    ) -> anyhow::Result<RawVm<'a>> {
        let os = self.params.os();
        let virt_apex_dir = tempfile::Builder::new().prefix("virt_apex").tempdir()?;
        let etc_dir = virt_apex_dir.path().join("etc");
        fs_err::create_dir_all(&etc_dir)?;
        self.host
            .pull_dir(&format!("{}etc", crate::VIRT_APEX), &etc_dir)?;

        let mut request = ResignRequest::new(
            self.settings.find_test_file("sign_virt_apex")?,
            virt_apex_dir.path().to_owned(),
            self.settings.find_test_file(SIGNING_KEY)?,
        );
        request.key_overrides = key_overrides;
        request.update_bootconfigs = update_bootconfigs;
        resign(&request)?;

        self.host.push_dir(virt_apex_dir.path(), crate::TEST_ROOT)?;
        let apk_path = self.prepare_run_app_files()?;

        let inventory = Inventory::pull(self.host)?;
        let components = payload_components(&inventory)?;

        let local_metadata = virt_apex_dir.path().join("payload-metadata.img");
        payload_metadata::write(
            &payload_metadata::payload_metadata(
                payload_metadata::DEFAULT_CONFIG_PATH,
                components.iter().map(|(name, _)| name.as_str()),
            ),
            &local_metadata,
        )?;
        self.host
            .push_file(&local_metadata, crate::PAYLOAD_METADATA_PATH)?;

        let template = fs_err::read_to_string(etc_dir.join(format!("{os}.json")))?;
        let config = staged_raw_config(&template, &os, components, apk_path, protected)?;
        self.host
            .push_string(&config.to_json()?, crate::RAW_CONFIG_PATH)?;

        Ok(launch_raw(
            self.host,
            crate::RAW_CONFIG_PATH,
            crate::CONSOLE_PATH,
            crate::LOG_PATH,
        )?)
    }

    /// Boots `config_path`, runs `crash_command` in the guest and reports
    /// whether the host received a tombstone once the VM exited.
    pub fn tombstone_generated_with_cmd(
        &self,
        config_path: &str,
        crash_command: &[&str],
    ) -> anyhow::Result<bool> {
        let start = DeviceTimestamp::now(self.host)?;
        let config = self.microdroid_config(config_path, None)?;
        let mut vm = self.boot_managed(&config)?;
        vm.enable_root()?;

        // The guest may die part way through the command.
        vm.guest()?.try_run(crash_command);

        classify::wait_for_crosvm_exit(self.host, &start)?;
        if vm.state() == LaunchState::Running {
            vm.mark_crashed()?;
        }
        Ok(classify::tombstone_received(self.host, &start)?)
    }

    /// Creates the APK signature and the instance partition `run-app` reads,
    /// returning the installed APK path.
    pub fn prepare_run_app_files(&self) -> anyhow::Result<String> {
        let vm_tool = VmTool::default();
        let apk_path = self.apk_path()?;
        let create_idsig = shell_line(&vm_tool.create_idsig(&apk_path, crate::IDSIG_PATH));
        let create_instance = shell_line(
            &vm_tool.create_instance_partition(crate::INSTANCE_IMG_PATH, INSTANCE_IMAGE_SIZE),
        );
        self.host.run(&[create_idsig.as_str()])?;
        self.host.run(&[create_instance.as_str()])?;
        Ok(apk_path)
    }

    /// `run-app` arguments for a foreground run of the test payload, without
    /// console redirection.
    pub fn run_app_args(&self, debug: DebugLevel) -> anyhow::Result<RunAppArgs> {
        Ok(RunAppArgs {
            apk: self.apk_path()?,
            idsig: crate::IDSIG_PATH.to_owned(),
            instance_image: crate::INSTANCE_IMG_PATH.to_owned(),
            debug,
            protected: self.params.protected,
            gki: self.params.gki.clone(),
            instance_id_file: self
                .context
                .instance_ids
                .then(|| crate::INSTANCE_ID_PATH.to_owned()),
            ..Default::default()
        })
    }

    /// Runs `args` in the foreground from an empty test root and reports
    /// whether the host received a tombstone.
    pub fn tombstone_generated_with_run_app(&self, args: &RunAppArgs) -> anyhow::Result<bool> {
        let start = DeviceTimestamp::now(self.host)?;
        self.reset_test_root()?;
        let command = shell_line(&VmTool::default().run_app(args));
        // The crashing payload takes the VM down with a failure status.
        let output = self.host.run_for_result(&[command.as_str()])?;
        tracing::info!(
            exit_code = output.exit_code,
            stderr = output.stderr.trim(),
            "run-app finished"
        );
        Ok(classify::tombstone_received(self.host, &start)?)
    }

    /// Boots and shuts down a named VM, then checks the telemetry the VM
    /// manager logged for it.
    pub fn telemetry_lifecycle(
        &self,
        config_path: &str,
        vm_name: &str,
        expected_apexes: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut source = StatsdTelemetry::new(self.host, PACKAGE_NAME);
        source.reset()?;
        source.subscribe(&LIFECYCLE_ATOMS)?;

        let config = self.microdroid_config(config_path, Some(vm_name))?;
        {
            let mut vm = self.boot_managed(&config)?;
            vm.shutdown()?;
        }

        let events = collect_events(&mut source, &self.clock)?;
        let lifecycle = validate_lifecycle(&events)?;
        LifecycleExpectation {
            vm_identifier: vm_name.to_owned(),
            protected: self.params.protected,
            num_cpus: self.host.num_cpus()?,
            memory_mib: config.memory_mib,
            apexes: expected_apexes.map(str::to_owned),
            pkvm: self.context.is_pkvm(),
        }
        .check(&lifecycle)?;
        Ok(())
    }

    /// Devices the VM manager can assign to a VM.
    pub fn assignable_devices(&self) -> anyhow::Result<Vec<AssignableDevice>> {
        let command = shell_line(&VmTool::default().info());
        let info = self.host.run(&[command.as_str()])?;
        parse_assignable_devices(&info)
    }

    /// Whether the host device tree carries an AVF debug policy.
    pub fn avf_debug_policy_present(&self) -> anyhow::Result<bool> {
        Ok(self.host.file_exists(AVF_DEBUG_POLICY_PATH)?)
    }

    /// Copies a device log into the test output and attaches it.
    pub fn archive_log(&self, remote: &str, name: &str) -> anyhow::Result<()> {
        let contents = classify::read_log(self.host, remote)?;
        if contents.is_empty() {
            return Ok(());
        }
        let local = self.output_dir.join(name);
        fs_err::write(&local, &contents)?;
        trace_attachment(&local);
        log_guest_output(name, &contents);
        Ok(())
    }

    fn tear_down(&self) -> anyhow::Result<()> {
        tracing::debug!(test = self.test_name, "restoring the device");
        for (remote, name) in [
            (crate::LOG_PATH, "vm.log"),
            (crate::CONSOLE_PATH, "vm.console"),
            (crate::MANAGED_LOG_PATH, "managed.log"),
            (crate::MANAGED_CONSOLE_PATH, "managed.console"),
        ] {
            self.archive_log(remote, name)?;
        }
        self.host.run(&["rm", "-rf", crate::TEST_ROOT])?;
        self.host.uninstall_package(PACKAGE_NAME)?;
        Ok(())
    }
}

impl Drop for Scenario<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.tear_down() {
            tracing::error!(
                error = err.as_ref() as &dyn std::error::Error,
                "failed to restore the device after the test"
            );
        }
    }
}
