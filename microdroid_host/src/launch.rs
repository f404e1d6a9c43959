// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Launching Microdroid VMs and tearing them down.
//!
//! A managed launch goes through `vm run-app` and only returns once the
//! guest's adbd is reachable and the guest reports boot completion. A raw
//! launch starts `vm run` with an explicit config and returns immediately.
//! Either handle stops its VM when dropped.

use crate::device::Device;
use crate::device::DeviceError;
use crate::device::DeviceProcess;
use crate::error::HarnessError;
use crate::poll::Clock;
use crate::poll::DEFAULT_INTERVAL;
use crate::poll::poll_until;
use crate::vm_tool::CpuTopology;
use crate::vm_tool::DebugLevel;
use crate::vm_tool::INSTANCE_IMAGE_SIZE;
use crate::vm_tool::RunAppArgs;
use crate::vm_tool::VmTool;
use crate::vm_tool::shell_line;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

/// How long a guest has to finish booting once reachable.
pub const BOOT_COMPLETE_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a guest has to become reachable after launch.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Smallest guest memory that boots on arm64 hosts.
pub const MIN_MEMORY_ARM64_MIB: u32 = 170;
/// Smallest guest memory that boots on x86_64 hosts.
pub const MIN_MEMORY_X86_64_MIB: u32 = 196;

const CID_POLL_INTERVAL: Duration = Duration::from_millis(100);
const GUEST_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

static CREATED_WITH_CID: LazyLock<Regex> = LazyLock::new(|| match Regex::new(r"with CID (\d+)") {
    Ok(regex) => regex,
    Err(err) => unreachable!("invalid built-in pattern: {err}"),
});

/// Returns the smallest memory size a VM on `device` can boot with.
pub fn min_memory_mib(device: &dyn Device) -> Result<u32, HarnessError> {
    let abi = device.run(&["getprop", "ro.product.cpu.abi"])?;
    if abi.starts_with("arm64") {
        Ok(MIN_MEMORY_ARM64_MIB)
    } else if abi.starts_with("x86_64") {
        Ok(MIN_MEMORY_X86_64_MIB)
    } else {
        Err(HarnessError::Config(format!("unsupported ABI: {abi:?}")))
    }
}

/// Lifecycle state of a launched VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    /// Nothing started yet.
    NotStarted,
    /// The VM process is starting.
    Starting,
    /// The VM is up.
    Running,
    /// The guest did not become ready in time.
    BootTimedOut,
    /// The VM process failed to start.
    LaunchFailed,
    /// Teardown is in progress.
    ShuttingDown,
    /// The VM failed on its own while running.
    Crashed,
    /// All resources are released. Terminal.
    Stopped,
}

impl LaunchState {
    /// Returns whether `self -> to` is a valid transition.
    pub fn can_transition(self, to: LaunchState) -> bool {
        use LaunchState::*;
        matches!(
            (self, to),
            (NotStarted, Starting)
                | (Starting, Running | BootTimedOut | LaunchFailed)
                | (Running, ShuttingDown | Crashed)
                | (ShuttingDown | Crashed | BootTimedOut | LaunchFailed, Stopped)
        )
    }

    fn advance(&mut self, to: LaunchState) -> Result<(), HarnessError> {
        if !self.can_transition(to) {
            return Err(HarnessError::Config(format!(
                "invalid launch state transition {self:?} -> {to:?}"
            )));
        }
        tracing::debug!(from = ?*self, ?to, "launch state");
        *self = to;
        Ok(())
    }
}

/// Settings of a managed launch.
#[derive(Debug, Clone)]
pub struct MicrodroidConfig {
    /// Device path of the payload APK.
    pub apk_path: String,
    /// VM config path inside the APK.
    pub config_path: String,
    /// Guest memory.
    pub memory_mib: u32,
    /// vCPU topology.
    pub cpu_topology: CpuTopology,
    /// Whether the VM is protected.
    pub protected: bool,
    /// Debug level. Managed launches need [`DebugLevel::Full`] to reach adbd.
    pub debug: DebugLevel,
    /// Device-tree labels of devices to assign.
    pub devices: Vec<String>,
    /// GKI version to boot instead of the Microdroid kernel.
    pub gki: Option<String>,
    /// VM name, which is also its telemetry identifier.
    pub name: Option<String>,
    /// Whether to back guest memory with huge pages.
    pub hugepages: bool,
    /// Instance id file.
    pub instance_id_file: Option<String>,
    /// Instance image. Created if it does not exist.
    pub instance_image: Option<String>,
    /// Payload binary inside the APK.
    pub payload_binary_name: Option<String>,
    /// How long the guest has to become reachable.
    pub connect_timeout: Duration,
}

impl MicrodroidConfig {
    /// Creates a debuggable config for the VM config `config_path` in the APK at
    /// `apk_path`.
    pub fn new(apk_path: impl Into<String>, config_path: impl Into<String>, memory_mib: u32) -> Self {
        Self {
            apk_path: apk_path.into(),
            config_path: config_path.into(),
            memory_mib,
            cpu_topology: CpuTopology::MatchHost,
            protected: false,
            debug: DebugLevel::Full,
            devices: Vec::new(),
            gki: None,
            name: None,
            hugepages: false,
            instance_id_file: None,
            instance_image: None,
            payload_binary_name: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.config_path.clone())
    }

    fn run_app_args(&self, idsig: &str, instance_image: &str) -> RunAppArgs {
        RunAppArgs {
            apk: self.apk_path.clone(),
            idsig: idsig.to_owned(),
            instance_image: instance_image.to_owned(),
            debug: self.debug,
            console: Some(crate::MANAGED_CONSOLE_PATH.to_owned()),
            log: Some(crate::MANAGED_LOG_PATH.to_owned()),
            memory_mib: Some(self.memory_mib),
            cpu_topology: Some(self.cpu_topology),
            protected: self.protected,
            gki: self.gki.clone(),
            name: self.name.clone(),
            devices: self.devices.clone(),
            hugepages: self.hugepages,
            payload_binary_name: self.payload_binary_name.clone(),
            config_path: Some(self.config_path.clone()),
            instance_id_file: self.instance_id_file.clone(),
        }
    }
}

/// What the launch has observed of the `vm run-app` process so far.
#[derive(Debug)]
enum LaunchObservation {
    Pending,
    Created(u32),
    Exited { code: i32, output: String },
}

/// What the launch has observed of the guest so far.
enum GuestObservation {
    Unreachable(String),
    Connected,
    Booting(String),
    Booted,
    VmExited { code: i32, output: String },
}

impl std::fmt::Debug for GuestObservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuestObservation::Unreachable(reason) => write!(f, "unreachable: {reason}"),
            GuestObservation::Connected => f.write_str("connected"),
            GuestObservation::Booting(value) => write!(f, "sys.boot_completed={value:?}"),
            GuestObservation::Booted => f.write_str("booted"),
            GuestObservation::VmExited { code, .. } => write!(f, "vm exited with {code}"),
        }
    }
}

fn parse_cid(output: &str) -> Option<u32> {
    CREATED_WITH_CID
        .captures(output)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// A VM started through `vm run-app`, with a connected guest transport.
pub struct ManagedVm<'a> {
    host: &'a dyn Device,
    name: String,
    state: LaunchState,
    process: Option<Box<dyn DeviceProcess>>,
    guest: Option<Box<dyn Device>>,
    cid: Option<u32>,
}

/// Launches a VM and waits until its guest has booted.
///
/// A launch that fails part way is torn down before the error is returned.
pub fn launch_managed<'a>(
    host: &'a dyn Device,
    config: &MicrodroidConfig,
    clock: &dyn Clock,
) -> Result<ManagedVm<'a>, HarnessError> {
    let mut vm = ManagedVm {
        host,
        name: config.display_name(),
        state: LaunchState::NotStarted,
        process: None,
        guest: None,
        cid: None,
    };
    vm.state.advance(LaunchState::Starting)?;
    match vm.start(config, clock) {
        Ok(()) => {
            vm.state.advance(LaunchState::Running)?;
            tracing::info!(vm = %vm.name, cid = vm.cid, "vm booted");
            Ok(vm)
        }
        Err(err) => {
            let failed = match err {
                HarnessError::BootTimeout { .. } => LaunchState::BootTimedOut,
                _ => LaunchState::LaunchFailed,
            };
            vm.state.advance(failed)?;
            tracing::error!(
                vm = %vm.name,
                error = &err as &dyn std::error::Error,
                "launch failed"
            );
            if let Err(shutdown_err) = vm.shutdown() {
                tracing::error!(
                    vm = %vm.name,
                    error = &shutdown_err as &dyn std::error::Error,
                    "failed to tear down partial launch"
                );
            }
            Err(err)
        }
    }
}

impl ManagedVm<'_> {
    fn start(&mut self, config: &MicrodroidConfig, clock: &dyn Clock) -> Result<(), HarnessError> {
        let vm_tool = VmTool::default();
        let idsig = crate::IDSIG_PATH.to_owned();
        let instance_image = config
            .instance_image
            .clone()
            .unwrap_or_else(|| crate::INSTANCE_IMG_PATH.to_owned());

        self.host.run(&["mkdir", "-p", crate::TEST_ROOT])?;
        self.host
            .run(&[&shell_line(&vm_tool.create_idsig(&config.apk_path, &idsig))])?;
        if !self.host.file_exists(&instance_image)? {
            self.host.run(&[&shell_line(
                &vm_tool.create_instance_partition(&instance_image, INSTANCE_IMAGE_SIZE),
            )])?;
        }

        let command = shell_line(&vm_tool.run_app(&config.run_app_args(&idsig, &instance_image)));
        tracing::info!(vm = %self.name, command, "starting vm");
        self.process = Some(self.host.spawn(&command)?);

        let cid = self.wait_for_cid(clock, config.connect_timeout)?;
        self.cid = Some(cid);
        self.wait_for_guest(clock, config.connect_timeout, cid)?;
        self.wait_for_boot_complete(clock, BOOT_COMPLETE_TIMEOUT)
    }

    fn process_mut(&mut self) -> Result<&mut Box<dyn DeviceProcess>, HarnessError> {
        self.process
            .as_mut()
            .ok_or_else(|| HarnessError::Config(format!("vm {} is not running", self.name)))
    }

    fn wait_for_cid(&mut self, clock: &dyn Clock, timeout: Duration) -> Result<u32, HarnessError> {
        let name = self.name.clone();
        let process = self.process_mut()?;
        let observed = poll_until(
            clock,
            timeout,
            CID_POLL_INTERVAL,
            || {
                let output = process.output();
                if let Some(cid) = parse_cid(&output) {
                    return Ok(LaunchObservation::Created(cid));
                }
                Ok(match process.try_wait()? {
                    Some(code) => LaunchObservation::Exited { code, output },
                    None => LaunchObservation::Pending,
                })
            },
            |observed| !matches!(observed, LaunchObservation::Pending),
        );
        match observed {
            Ok(LaunchObservation::Created(cid)) => Ok(cid),
            Ok(LaunchObservation::Exited { code, output }) => Err(DeviceError::Command {
                command: "vm run-app".into(),
                status: code.to_string(),
                stderr: output,
            }
            .into()),
            Ok(LaunchObservation::Pending) | Err(HarnessError::Timeout { .. }) => {
                Err(HarnessError::BootTimeout { name, timeout })
            }
            Err(err) => Err(err),
        }
    }

    fn wait_for_guest(
        &mut self,
        clock: &dyn Clock,
        timeout: Duration,
        cid: u32,
    ) -> Result<(), HarnessError> {
        let host = self.host;
        let mut guest = None;
        let observed = {
            let process = self.process_mut()?;
            poll_until(
                clock,
                timeout,
                DEFAULT_INTERVAL,
                || {
                    if let Some(code) = process.try_wait()? {
                        return Ok(GuestObservation::VmExited {
                            code,
                            output: process.output(),
                        });
                    }
                    if guest.is_none() {
                        match host.connect_guest(cid) {
                            Ok(connected) => guest = Some(connected),
                            Err(err) => return Ok(GuestObservation::Unreachable(err.to_string())),
                        }
                    }
                    Ok(GuestObservation::Connected)
                },
                |observed| {
                    matches!(
                        observed,
                        GuestObservation::Connected | GuestObservation::VmExited { .. }
                    )
                },
            )
        };
        self.guest = guest;
        match observed {
            Ok(GuestObservation::Connected) => Ok(()),
            Ok(GuestObservation::VmExited { code, output }) => Err(DeviceError::Command {
                command: "vm run-app".into(),
                status: code.to_string(),
                stderr: output,
            }
            .into()),
            Ok(_) | Err(HarnessError::Timeout { .. }) => Err(HarnessError::BootTimeout {
                name: self.name.clone(),
                timeout,
            }),
            Err(err) => Err(err),
        }
    }

    /// Waits until the guest reports `sys.boot_completed`.
    pub fn wait_for_boot_complete(
        &mut self,
        clock: &dyn Clock,
        timeout: Duration,
    ) -> Result<(), HarnessError> {
        let guest = self.guest()?;
        let observed = poll_until(
            clock,
            timeout,
            DEFAULT_INTERVAL,
            || {
                Ok(
                    match guest.execute("getprop sys.boot_completed", Some(GUEST_QUERY_TIMEOUT)) {
                        Ok(output) if output.stdout.trim() == "1" => GuestObservation::Booted,
                        Ok(output) => GuestObservation::Booting(output.stdout.trim().to_owned()),
                        Err(err) => GuestObservation::Unreachable(err.to_string()),
                    },
                )
            },
            |observed| matches!(observed, GuestObservation::Booted),
        );
        match observed {
            Ok(_) => Ok(()),
            Err(HarnessError::Timeout { last, .. }) => {
                tracing::warn!(vm = %self.name, last, "guest did not finish booting");
                Err(HarnessError::BootTimeout {
                    name: self.name.clone(),
                    timeout,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// The guest transport.
    pub fn guest(&self) -> Result<&dyn Device, HarnessError> {
        self.guest
            .as_deref()
            .ok_or_else(|| HarnessError::Config(format!("vm {} has no guest connection", self.name)))
    }

    /// Restarts the guest's adbd as root.
    pub fn enable_root(&self) -> Result<bool, HarnessError> {
        Ok(self.guest()?.enable_root()?)
    }

    /// The CID the VM manager assigned.
    pub fn cid(&self) -> Option<u32> {
        self.cid
    }

    /// The VM's name, or its config path if unnamed.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current lifecycle state.
    pub fn state(&self) -> LaunchState {
        self.state
    }

    /// Records that the VM failed on its own.
    pub fn mark_crashed(&mut self) -> Result<(), HarnessError> {
        self.state.advance(LaunchState::Crashed)
    }

    /// Disconnects the guest and stops the VM.
    ///
    /// Safe to call more than once and after a failed launch.
    pub fn shutdown(&mut self) -> Result<(), HarnessError> {
        if self.state == LaunchState::Stopped {
            return Ok(());
        }
        if self.state == LaunchState::Running {
            self.state.advance(LaunchState::ShuttingDown)?;
        }
        let mut first_err = None;
        if let Some(guest) = self.guest.take() {
            if let Err(err) = self.host.disconnect_guest(guest.serial()) {
                first_err.get_or_insert(err);
            }
        }
        if let Some(mut process) = self.process.take() {
            if let Err(err) = process.kill() {
                first_err.get_or_insert(err);
            }
        }
        // A VM that never started goes straight to stopped.
        if self.state == LaunchState::NotStarted || self.state == LaunchState::Starting {
            self.state = LaunchState::Stopped;
        } else {
            self.state.advance(LaunchState::Stopped)?;
        }
        tracing::info!(vm = %self.name, "vm stopped");
        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

impl Drop for ManagedVm<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::error!(
                vm = %self.name,
                error = &err as &dyn std::error::Error,
                "failed to stop vm"
            );
        }
    }
}

/// A VM started with `vm run` and a raw config.
pub struct RawVm<'a> {
    host: &'a dyn Device,
    state: LaunchState,
    process: Option<Box<dyn DeviceProcess>>,
}

/// Starts `vm run` with the raw config at `config_path` and returns at once.
pub fn launch_raw<'a>(
    host: &'a dyn Device,
    config_path: &str,
    console: &str,
    log: &str,
) -> Result<RawVm<'a>, HarnessError> {
    let mut state = LaunchState::NotStarted;
    state.advance(LaunchState::Starting)?;
    let command = shell_line(&VmTool::default().run(config_path, console, log));
    tracing::info!(command, "starting raw vm");
    let process = match host.spawn(&command) {
        Ok(process) => process,
        Err(err) => {
            state.advance(LaunchState::LaunchFailed)?;
            return Err(err.into());
        }
    };
    state.advance(LaunchState::Running)?;
    Ok(RawVm {
        host,
        state,
        process: Some(process),
    })
}

impl RawVm<'_> {
    /// The host the VM runs on.
    pub fn host(&self) -> &dyn Device {
        self.host
    }

    /// The current lifecycle state.
    pub fn state(&self) -> LaunchState {
        self.state
    }

    /// Output of `vm run` so far.
    pub fn output(&self) -> String {
        self.process
            .as_ref()
            .map(|p| p.output())
            .unwrap_or_default()
    }

    /// Waits up to `timeout` for the VM process to exit, returning its exit
    /// code if it did.
    pub fn wait_for_exit(
        &mut self,
        clock: &dyn Clock,
        timeout: Duration,
    ) -> Result<Option<i32>, HarnessError> {
        let Some(process) = self.process.as_mut() else {
            return Ok(None);
        };
        match poll_until(
            clock,
            timeout,
            DEFAULT_INTERVAL,
            || Ok(process.try_wait()?),
            Option::is_some,
        ) {
            Ok(code) => Ok(code),
            Err(HarnessError::Timeout { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Records that the VM failed on its own.
    pub fn mark_crashed(&mut self) -> Result<(), HarnessError> {
        self.state.advance(LaunchState::Crashed)
    }

    /// Stops the VM. Safe to call more than once.
    pub fn shutdown(&mut self) -> Result<(), HarnessError> {
        if self.state == LaunchState::Stopped {
            return Ok(());
        }
        if self.state == LaunchState::Running {
            self.state.advance(LaunchState::ShuttingDown)?;
        }
        let result = match self.process.take() {
            Some(mut process) => process.kill(),
            None => Ok(()),
        };
        self.state.advance(LaunchState::Stopped)?;
        Ok(result?)
    }
}

impl Drop for RawVm<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "failed to stop raw vm"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::FakeDevice;
    use crate::device::fake::failed;
    use crate::poll::ManualClock;

    const APK: &str = "/data/app/com.android.microdroid.test/base.apk";

    fn host_with_guest() -> (FakeDevice, FakeDevice) {
        let host = FakeDevice::new("host");
        host.respond("mkdir", "")
            .respond("/apex/com.android.virt/bin/vm create-idsig", "")
            .respond("/apex/com.android.virt/bin/vm create-partition", "")
            .set_spawn_output(
                "Created VM from /data/app/base.apk with CID 2049, state is STARTING.\n",
                None,
            );
        let guest = FakeDevice::new("localhost:40000");
        guest.respond("getprop sys.boot_completed", "1\n");
        host.set_guest(guest.clone());
        (host, guest)
    }

    #[test]
    fn state_transitions() {
        use LaunchState::*;
        assert!(NotStarted.can_transition(Starting));
        assert!(Starting.can_transition(BootTimedOut));
        assert!(Running.can_transition(Crashed));
        assert!(Crashed.can_transition(Stopped));
        assert!(!Running.can_transition(Stopped));
        assert!(!Stopped.can_transition(Starting));
        assert!(!NotStarted.can_transition(Running));
    }

    #[test]
    fn min_memory_by_abi() {
        let device = FakeDevice::new("host");
        device.respond("getprop ro.product.cpu.abi", "arm64-v8a\n");
        assert_eq!(min_memory_mib(&device).unwrap(), 170);
        device.respond("getprop ro.product.cpu.abi", "x86_64\n");
        assert_eq!(min_memory_mib(&device).unwrap(), 196);
        device.respond("getprop ro.product.cpu.abi", "riscv64\n");
        assert!(matches!(
            min_memory_mib(&device),
            Err(HarnessError::Config(_))
        ));
    }

    #[test]
    fn managed_launch_boots_and_shuts_down_once() {
        let (host, _guest) = host_with_guest();
        let clock = ManualClock::new();
        let mut config = MicrodroidConfig::new(APK, "assets/vm_config.json", 170);
        config.protected = true;
        config.name = Some("test_microdroid_boots".into());
        let mut vm = launch_managed(&host, &config, &clock).unwrap();
        assert_eq!(vm.state(), LaunchState::Running);
        assert_eq!(vm.cid(), Some(2049));

        let spawned = host.spawned();
        assert_eq!(spawned.len(), 1);
        assert!(spawned[0].contains(" --protected "));
        assert!(spawned[0].contains("--name test_microdroid_boots"));
        assert!(spawned[0].ends_with(&format!(
            "{APK} /data/local/tmp/virt/idsig /data/local/tmp/virt/instance.img"
        )));

        vm.shutdown().unwrap();
        vm.shutdown().unwrap();
        drop(vm);
        assert_eq!(host.killed(), 1);
        assert_eq!(host.disconnected(), ["localhost:40000"]);
    }

    #[test]
    fn existing_instance_image_is_reused() {
        let (host, _guest) = host_with_guest();
        host.add_file("/data/local/tmp/virt/instance.img", "");
        let clock = ManualClock::new();
        let config = MicrodroidConfig::new(APK, "assets/vm_config.json", 170);
        let _vm = launch_managed(&host, &config, &clock).unwrap();
        assert!(
            !host
                .history()
                .iter()
                .any(|c| c.contains("create-partition"))
        );
    }

    #[test]
    fn boot_timeout_tears_down() {
        let (host, guest) = host_with_guest();
        guest.respond("getprop sys.boot_completed", "\n");
        let clock = ManualClock::new();
        let config = MicrodroidConfig::new(APK, "assets/vm_config.json", 170);
        let err = launch_managed(&host, &config, &clock).err().unwrap();
        assert!(matches!(err, HarnessError::BootTimeout { .. }));
        assert_eq!(host.killed(), 1);
        assert_eq!(host.disconnected().len(), 1);
    }

    #[test]
    fn unreachable_guest_times_out() {
        let host = FakeDevice::new("host");
        host.respond("mkdir", "")
            .respond("/apex/com.android.virt/bin/vm", "")
            .set_spawn_output("Created VM from x with CID 7, state is STARTING.\n", None);
        let clock = ManualClock::new();
        let config = MicrodroidConfig::new(APK, "assets/vm_config.json", 170);
        let err = launch_managed(&host, &config, &clock).err().unwrap();
        assert!(matches!(err, HarnessError::BootTimeout { .. }));
        assert_eq!(clock.now(), DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(host.killed(), 1);
        assert!(host.disconnected().is_empty());
    }

    #[test]
    fn run_app_failure_is_reported() {
        let host = FakeDevice::new("host");
        host.respond("mkdir", "")
            .respond("/apex/com.android.virt/bin/vm", "")
            .set_spawn_output(
                "Error: Payload binary name must not specify a path\n",
                Some(1),
            );
        let clock = ManualClock::new();
        let mut config = MicrodroidConfig::new(APK, "assets/vm_config.json", 170);
        config.payload_binary_name = Some("./MicrodroidTestNativeLib.so".into());
        let err = launch_managed(&host, &config, &clock).err().unwrap();
        assert!(
            err.to_string()
                .contains(crate::classify::PAYLOAD_BINARY_PATH_REJECTED)
        );
        assert_eq!(clock.now(), Duration::ZERO);
    }

    #[test]
    fn setup_failure_leaves_nothing_running() {
        let host = FakeDevice::new("host");
        host.respond("mkdir", "")
            .respond_seq("/apex/com.android.virt/bin/vm create-idsig", [failed(1, "no apk")]);
        let clock = ManualClock::new();
        let config = MicrodroidConfig::new(APK, "assets/vm_config.json", 170);
        assert!(launch_managed(&host, &config, &clock).is_err());
        assert!(host.spawned().is_empty());
        assert_eq!(host.killed(), 0);
    }

    #[test]
    fn raw_launch_returns_immediately_and_kills_on_drop() {
        let host = FakeDevice::new("host");
        {
            let vm = launch_raw(
                &host,
                "/data/local/tmp/virt/raw_config.json",
                crate::CONSOLE_PATH,
                crate::LOG_PATH,
            )
            .unwrap();
            assert_eq!(vm.state(), LaunchState::Running);
        }
        assert_eq!(
            host.spawned(),
            [
                "/apex/com.android.virt/bin/vm run --console /data/local/tmp/virt/console.txt \
                 --log /data/local/tmp/virt/log.txt /data/local/tmp/virt/raw_config.json"
            ]
        );
        assert_eq!(host.killed(), 1);
    }

    #[test]
    fn raw_vm_that_exited_reports_code() {
        let host = FakeDevice::new("host");
        host.set_spawn_output("", Some(0));
        let mut vm = launch_raw(&host, "/cfg.json", "/c", "/l").unwrap();
        let clock = ManualClock::new();
        assert_eq!(
            vm.wait_for_exit(&clock, Duration::from_secs(5)).unwrap(),
            Some(0)
        );
        vm.mark_crashed().unwrap();
        vm.shutdown().unwrap();
        assert_eq!(vm.state(), LaunchState::Stopped);
        assert_eq!(host.killed(), 0);
    }
}
