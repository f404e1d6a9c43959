// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Test requirements framework for runtime test filtering.

use crate::device::Device;
use crate::guard::ShmemHugePages;
use crate::guard::ShmemMode;
use crate::scenario::AssignableDevice;
use crate::scenario::parse_assignable_devices;
use crate::test::ScenarioParams;
use crate::vm_tool::VmTool;
use crate::vm_tool::shell_line;

/// Feature flag that adds per-instance ids to `run-app`.
pub const LLPVM_CHANGES_FEATURE: &str = "com.android.kvm.LLPVM_CHANGES";

const SECRETKEEPER_SERVICE: &str = "android.hardware.security.secretkeeper.ISecretkeeper/default";

/// Facts about the host device, queried once per test.
#[derive(Debug, Clone, Default)]
pub struct HostContext {
    /// Protected VMs can be started.
    pub protected_vm_supported: bool,
    /// Non-protected VMs can be started.
    pub non_protected_vm_supported: bool,
    /// The build is instrumented with HWASan.
    pub hwasan: bool,
    /// The device is a Cuttlefish virtual device.
    pub cuttlefish: bool,
    /// `ro.boot.hypervisor.version`.
    pub hypervisor_version: String,
    /// `ro.boot.verifiedbootstate`.
    pub verified_boot_state: String,
    /// VFIO platform device assignment is available.
    pub vfio_platform: bool,
    /// Devices the VM manager can assign to a VM.
    pub assignable_devices: Vec<AssignableDevice>,
    /// Secretkeeper is present, so VM images can be updated.
    pub updatable_vm: bool,
    /// `run-app` takes `--instance-id-file`.
    pub instance_ids: bool,
    /// GKI versions the virtualization APEX ships kernels for.
    pub device_gki_versions: Vec<String>,
    /// Current shmem huge page mode, if the kernel reports one.
    pub shmem_mode: Option<ShmemMode>,
}

fn prop(device: &dyn Device, name: &str) -> String {
    device.property(name).ok().flatten().unwrap_or_default()
}

impl HostContext {
    /// Create a new host context by querying the device.
    ///
    /// Properties that cannot be read are treated as unset.
    pub fn query(device: &dyn Device) -> Self {
        let exists = |path: &str| device.file_exists(path).unwrap_or(false);
        let vm = VmTool::default();
        let check_feature = shell_line(&vm.check_feature_enabled(LLPVM_CHANGES_FEATURE));
        let info = shell_line(&vm.info());
        let info = device.try_run(&[info.as_str()]).unwrap_or_default();
        Self {
            protected_vm_supported: prop(device, "ro.boot.hypervisor.protected_vm.supported")
                == "1",
            non_protected_vm_supported: prop(device, "ro.boot.hypervisor.vm.supported") == "1",
            hwasan: prop(device, "ro.build.flavor").contains("hwasan"),
            cuttlefish: prop(device, "ro.product.vendor.device").starts_with("vsoc_"),
            hypervisor_version: prop(device, "ro.boot.hypervisor.version"),
            verified_boot_state: prop(device, "ro.boot.verifiedbootstate"),
            vfio_platform: exists("/dev/vfio/vfio")
                && exists("/sys/bus/platform/drivers/vfio-platform"),
            assignable_devices: parse_assignable_devices(&info).unwrap_or_else(|err| {
                tracing::warn!(
                    error = err.as_ref() as &dyn std::error::Error,
                    "ignoring assignable device list"
                );
                Vec::new()
            }),
            updatable_vm: device
                .try_run(&["service", "check", SECRETKEEPER_SERVICE])
                .is_some_and(|out| !out.contains("not found")),
            instance_ids: device
                .try_run(&[check_feature.as_str()])
                .is_some_and(|out| out.trim_end().ends_with("is enabled")),
            device_gki_versions: parse_gki_versions(&info),
            shmem_mode: ShmemHugePages::current(device).ok(),
        }
    }

    /// Create an empty host context (for testing)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether the host runs protected KVM.
    pub fn is_pkvm(&self) -> bool {
        self.hypervisor_version.starts_with("kvm.arm-protected")
    }

    /// Whether VMs with the given protection can be started.
    pub fn supports_microdroid(&self, protected: bool) -> bool {
        if protected {
            self.protected_vm_supported
        } else {
            self.non_protected_vm_supported
        }
    }
}

/// Extracts GKI versions from the `Available OS list:` line of `vm info`.
pub fn parse_gki_versions(info: &str) -> Vec<String> {
    info.lines()
        .filter_map(|line| line.trim().strip_prefix("Available OS list:"))
        .flat_map(str::split_whitespace)
        .filter_map(|os| os.strip_prefix("microdroid_gki-"))
        .map(str::to_owned)
        .collect()
}

/// Core trait for test requirements that can be evaluated at runtime
pub trait TestRequirement: Send + Sync + std::fmt::Debug {
    /// Unique identifier for this requirement type
    fn requirement_type(&self) -> &'static str;

    /// Evaluate if this requirement is met for a test instance
    fn is_satisfied_with_context(
        &self,
        context: &HostContext,
        params: &ScenarioParams,
    ) -> anyhow::Result<bool>;

    /// Human-readable description of the requirement
    fn description(&self) -> String;
}

/// Result of evaluating a single requirement
#[derive(Debug, Clone)]
pub enum RequirementResult {
    /// Requirement was satisfied
    Satisfied(String),
    /// Requirement failed
    Failed {
        /// Type of the requirement that failed
        requirement_type: String,
        /// What the requirement asks for
        description: String,
    },
    /// Error occurred while evaluating the requirement
    Error {
        /// Type of the requirement that errored
        requirement_type: String,
        /// Error message
        error: String,
    },
}

/// Result of evaluating all requirements for a test
#[derive(Debug, Clone)]
pub struct TestEvaluationResult {
    /// Name of the test being evaluated
    pub test_name: String,
    /// Detailed results for each requirement
    pub results: Vec<RequirementResult>,
    /// Overall result: can the test be run?
    pub can_run: bool,
}

impl TestEvaluationResult {
    /// Describes every unmet requirement, for the skip message.
    pub fn skip_reason(&self) -> String {
        self.results
            .iter()
            .filter_map(|result| match result {
                RequirementResult::Satisfied(_) => None,
                RequirementResult::Failed { description, .. } => Some(description.clone()),
                RequirementResult::Error {
                    requirement_type,
                    error,
                } => Some(format!("{requirement_type}: {error}")),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Container for test requirements that can be evaluated
#[derive(Debug, Default)]
pub struct TestCaseRequirements {
    requirements: Vec<Box<dyn TestRequirement>>,
}

impl TestCaseRequirements {
    /// Create a new empty requirements container
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a requirement to this test case
    pub fn require<R: TestRequirement + 'static>(mut self, requirement: R) -> Self {
        self.requirements.push(Box::new(requirement));
        self
    }

    /// Evaluate all requirements with the host context and return the
    /// comprehensive result
    pub fn evaluate_with_context(
        &self,
        test_name: &str,
        context: &HostContext,
        params: &ScenarioParams,
    ) -> TestEvaluationResult {
        let mut results = Vec::new();
        let mut can_run = true;

        for requirement in &self.requirements {
            match requirement.is_satisfied_with_context(context, params) {
                Ok(true) => {
                    results.push(RequirementResult::Satisfied(
                        requirement.requirement_type().to_string(),
                    ));
                }
                Ok(false) => {
                    can_run = false;
                    results.push(RequirementResult::Failed {
                        requirement_type: requirement.requirement_type().to_string(),
                        description: requirement.description(),
                    });
                }
                Err(e) => {
                    can_run = false;
                    results.push(RequirementResult::Error {
                        requirement_type: requirement.requirement_type().to_string(),
                        error: format!("{:#}", e),
                    });
                }
            }
        }

        TestEvaluationResult {
            test_name: test_name.to_string(),
            results,
            can_run,
        }
    }
}

/// Requirements on the device or the test parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRequirement {
    /// The device supports VMs of the test's protection type.
    MicrodroidSupported,
    /// The test instance boots its VM with the given protection.
    Protection(bool),
    /// The device ships the test's GKI version, if it has one.
    GkiSupported,
    /// The build is not HWASan instrumented.
    NotHwasan,
    /// VFIO platform assignment is available.
    VfioPlatform,
    /// At least one device can be assigned to a VM.
    AssignableDevices,
    /// VM images can be updated.
    UpdatableVm,
    /// The device is locked, so no debug policy may be present.
    LockedDevice,
    /// Shmem huge pages are currently `never`.
    ShmemHugePagesOff,
}

impl TestRequirement for DeviceRequirement {
    fn requirement_type(&self) -> &'static str {
        match self {
            DeviceRequirement::MicrodroidSupported => "MicrodroidSupported",
            DeviceRequirement::Protection(_) => "Protection",
            DeviceRequirement::GkiSupported => "GkiSupported",
            DeviceRequirement::NotHwasan => "NotHwasan",
            DeviceRequirement::VfioPlatform => "VfioPlatform",
            DeviceRequirement::AssignableDevices => "AssignableDevices",
            DeviceRequirement::UpdatableVm => "UpdatableVm",
            DeviceRequirement::LockedDevice => "LockedDevice",
            DeviceRequirement::ShmemHugePagesOff => "ShmemHugePagesOff",
        }
    }

    fn is_satisfied_with_context(
        &self,
        context: &HostContext,
        params: &ScenarioParams,
    ) -> anyhow::Result<bool> {
        Ok(match self {
            DeviceRequirement::MicrodroidSupported => {
                context.supports_microdroid(params.protected)
            }
            DeviceRequirement::Protection(protected) => params.protected == *protected,
            DeviceRequirement::GkiSupported => params
                .gki
                .as_ref()
                .is_none_or(|gki| context.device_gki_versions.contains(gki)),
            DeviceRequirement::NotHwasan => !context.hwasan,
            DeviceRequirement::VfioPlatform => context.vfio_platform,
            DeviceRequirement::AssignableDevices => !context.assignable_devices.is_empty(),
            DeviceRequirement::UpdatableVm => {
                context.protected_vm_supported && context.updatable_vm
            }
            DeviceRequirement::LockedDevice => context.verified_boot_state != "orange",
            DeviceRequirement::ShmemHugePagesOff => {
                context.shmem_mode == Some(ShmemMode::Never)
            }
        })
    }

    fn description(&self) -> String {
        match self {
            DeviceRequirement::MicrodroidSupported => {
                "Requires Microdroid support for the VM protection type".to_string()
            }
            DeviceRequirement::Protection(true) => "Only for protected VMs".to_string(),
            DeviceRequirement::Protection(false) => "Only for non-protected VMs".to_string(),
            DeviceRequirement::GkiSupported => {
                "Requires the GKI version to be available on the device".to_string()
            }
            DeviceRequirement::NotHwasan => {
                "Tombstones are not delivered from HWASan Microdroid".to_string()
            }
            DeviceRequirement::VfioPlatform => "Requires VFIO platform support".to_string(),
            DeviceRequirement::AssignableDevices => {
                "Requires a device that can be assigned to a VM".to_string()
            }
            DeviceRequirement::UpdatableVm => "Requires updatable VM support".to_string(),
            DeviceRequirement::LockedDevice => {
                "Unlocked devices may have an AVF debug policy".to_string()
            }
            DeviceRequirement::ShmemHugePagesOff => {
                "Requires shmem huge pages to be supported and off".to_string()
            }
        }
    }
}
