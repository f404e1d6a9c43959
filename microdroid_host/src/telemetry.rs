// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! VM lifecycle telemetry atoms and their validation.
//!
//! Events come from a [`TelemetrySource`]; see [`crate::statsd`] for the one
//! backed by the device's statsd.

use crate::error::HarnessError;
use crate::poll::Clock;
use crate::poll::DEFAULT_INTERVAL;
use crate::poll::poll_until;
use std::time::Duration;

/// Atom id of [`VmCreationRequested`].
pub const VM_CREATION_REQUESTED_ATOM: u32 = 76;
/// Atom id of [`VmBooted`].
pub const VM_BOOTED_ATOM: u32 = 87;
/// Atom id of [`VmExited`].
pub const VM_EXITED_ATOM: u32 = 88;
/// The atoms making up one VM lifecycle, in order.
pub const LIFECYCLE_ATOMS: [u32; 3] = [VM_CREATION_REQUESTED_ATOM, VM_BOOTED_ATOM, VM_EXITED_ATOM];

const COLLECT_TIMEOUT: Duration = Duration::from_secs(60);
const MIN_EVENTS: usize = LIFECYCLE_ATOMS.len();
/// Signal the VM manager uses to kill a VM on shutdown.
const SIGKILL: i32 = 9;

/// Hypervisor a VM was created on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hypervisor {
    /// Not reported.
    Unknown,
    /// Protected KVM.
    Pkvm,
    /// Any other hypervisor.
    Other,
}

/// How a VM was configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigType {
    /// Not reported.
    Unknown,
    /// From an app payload config, as `vm run-app` does.
    AppConfig,
    /// From a raw VM config, as `vm run` does.
    RawConfig,
}

/// Logged when a VM creation is requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmCreationRequested {
    /// Uid of the requesting app.
    pub uid: i32,
    /// The VM's name.
    pub vm_identifier: String,
    /// Hypervisor the VM was created on.
    pub hypervisor: Hypervisor,
    /// Whether the VM is protected.
    pub is_protected: bool,
    /// Whether creation succeeded.
    pub creation_succeeded: bool,
    /// Binder exception code of the creation call.
    pub binder_exception_code: i32,
    /// How the VM was configured.
    pub config_type: ConfigType,
    /// Number of vCPUs.
    pub num_cpus: u32,
    /// Guest memory in MiB.
    pub memory_mib: u32,
    /// Colon-separated APEXes the payload requested.
    pub apexes: String,
}

/// Logged when the guest reports it booted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmBooted {
    /// Uid of the requesting app.
    pub uid: i32,
    /// The VM's name.
    pub vm_identifier: String,
    /// Milliseconds from creation to boot.
    pub elapsed_time_millis: i64,
}

/// Why a VM exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeathReason {
    /// The virtualization service died.
    InfrastructureError,
    /// The VM was killed by its owner.
    Killed,
    /// The guest shut down.
    Shutdown,
    /// The VM manager hit an error.
    Error,
    /// The guest rebooted.
    Reboot,
    /// The guest crashed.
    Crash,
    /// Any other reason.
    Unknown,
}

/// Logged when the VM process exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmExited {
    /// Uid of the requesting app.
    pub uid: i32,
    /// The VM's name.
    pub vm_identifier: String,
    /// Milliseconds from creation to exit.
    pub elapsed_time_millis: i64,
    /// Why the VM exited.
    pub death_reason: DeathReason,
    /// Signal that ended the VM process, if any.
    pub exit_signal: i32,
    /// Guest CPU time.
    pub guest_time_millis: i64,
    /// Resident set of the guest memory.
    pub rss_vm_kb: i64,
    /// Resident set of the VMM process.
    pub rss_crosvm_kb: i64,
}

/// A VM lifecycle telemetry event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryEvent {
    /// See [`VmCreationRequested`].
    VmCreationRequested(VmCreationRequested),
    /// See [`VmBooted`].
    VmBooted(VmBooted),
    /// See [`VmExited`].
    VmExited(VmExited),
}

impl TelemetryEvent {
    /// The event's atom id.
    pub fn atom_id(&self) -> u32 {
        match self {
            TelemetryEvent::VmCreationRequested(_) => VM_CREATION_REQUESTED_ATOM,
            TelemetryEvent::VmBooted(_) => VM_BOOTED_ATOM,
            TelemetryEvent::VmExited(_) => VM_EXITED_ATOM,
        }
    }

    /// Uid of the requesting app.
    pub fn uid(&self) -> i32 {
        match self {
            TelemetryEvent::VmCreationRequested(e) => e.uid,
            TelemetryEvent::VmBooted(e) => e.uid,
            TelemetryEvent::VmExited(e) => e.uid,
        }
    }

    /// Name of the VM.
    pub fn vm_identifier(&self) -> &str {
        match self {
            TelemetryEvent::VmCreationRequested(e) => &e.vm_identifier,
            TelemetryEvent::VmBooted(e) => &e.vm_identifier,
            TelemetryEvent::VmExited(e) => &e.vm_identifier,
        }
    }
}

/// A telemetry collection backend.
pub trait TelemetrySource {
    /// Removes any existing subscription and collected events.
    fn reset(&mut self) -> Result<(), HarnessError>;
    /// Starts collecting the given atoms.
    fn subscribe(&mut self, atoms: &[u32]) -> Result<(), HarnessError>;
    /// Returns events collected since the previous fetch, in arrival order.
    fn fetch(&mut self) -> Result<Vec<TelemetryEvent>, HarnessError>;
}

/// Collects events until at least one lifecycle's worth arrived or a minute
/// passed, then reads once more so late duplicates are not missed.
///
/// Running out of time is not an error here; [`validate_lifecycle`] reports
/// what is missing.
pub fn collect_events(
    source: &mut dyn TelemetrySource,
    clock: &dyn Clock,
) -> Result<Vec<TelemetryEvent>, HarnessError> {
    let mut events = Vec::new();
    let result = poll_until(
        clock,
        COLLECT_TIMEOUT,
        DEFAULT_INTERVAL,
        || {
            events.extend(source.fetch()?);
            Ok(events.len())
        },
        |&count| count >= MIN_EVENTS,
    );
    match result {
        Ok(_) => events.extend(source.fetch()?),
        Err(HarnessError::Timeout { elapsed, .. }) => {
            tracing::warn!(?elapsed, count = events.len(), "telemetry collection timed out");
        }
        Err(err) => return Err(err),
    }
    Ok(events)
}

/// One VM's validated lifecycle.
#[derive(Debug, Clone, Copy)]
pub struct Lifecycle<'a> {
    /// The creation event.
    pub created: &'a VmCreationRequested,
    /// The boot event.
    pub booted: &'a VmBooted,
    /// The exit event.
    pub exited: &'a VmExited,
}

/// Checks that `events` is exactly one creation, boot and exit of the same VM
/// in that order.
pub fn validate_lifecycle(events: &[TelemetryEvent]) -> Result<Lifecycle<'_>, HarnessError> {
    let (created, booted, exited) = match events {
        [
            TelemetryEvent::VmCreationRequested(created),
            TelemetryEvent::VmBooted(booted),
            TelemetryEvent::VmExited(exited),
        ] => (created, booted, exited),
        _ => {
            let atoms: Vec<_> = events.iter().map(TelemetryEvent::atom_id).collect();
            return Err(HarnessError::Telemetry(format!(
                "expected atoms {LIFECYCLE_ATOMS:?} in order, got {atoms:?}"
            )));
        }
    };
    for event in &events[1..] {
        if event.vm_identifier() != created.vm_identifier {
            return Err(HarnessError::Telemetry(format!(
                "atom {} is for vm {:?}, expected {:?}",
                event.atom_id(),
                event.vm_identifier(),
                created.vm_identifier
            )));
        }
        if event.uid() != created.uid {
            return Err(HarnessError::Telemetry(format!(
                "atom {} has uid {}, expected {}",
                event.atom_id(),
                event.uid(),
                created.uid
            )));
        }
    }
    if booted.elapsed_time_millis >= exited.elapsed_time_millis {
        return Err(HarnessError::Telemetry(format!(
            "vm booted at {} ms, not before it exited at {} ms",
            booted.elapsed_time_millis, exited.elapsed_time_millis
        )));
    }
    Ok(Lifecycle {
        created,
        booted,
        exited,
    })
}

/// Field values a lifecycle of a VM killed on shutdown must carry.
#[derive(Debug, Clone)]
pub struct LifecycleExpectation {
    /// The VM's name.
    pub vm_identifier: String,
    /// Whether the VM was protected.
    pub protected: bool,
    /// Expected vCPU count.
    pub num_cpus: u32,
    /// Expected guest memory.
    pub memory_mib: u32,
    /// Expected requested APEXes, if checked.
    pub apexes: Option<String>,
    /// The VM ran on pKVM, which must be reported and which also reports
    /// guest CPU time.
    pub pkvm: bool,
}

impl LifecycleExpectation {
    /// Checks every expected field, reporting all mismatches together.
    pub fn check(&self, lifecycle: &Lifecycle<'_>) -> Result<(), HarnessError> {
        let Lifecycle {
            created, exited, ..
        } = lifecycle;
        let mut mismatches = Vec::new();
        let mut expect = |ok: bool, what: String| {
            if !ok {
                mismatches.push(what);
            }
        };
        expect(
            created.vm_identifier == self.vm_identifier,
            format!("vm identifier {:?}", created.vm_identifier),
        );
        expect(
            created.is_protected == self.protected,
            format!("is_protected {}", created.is_protected),
        );
        expect(created.creation_succeeded, "creation did not succeed".into());
        expect(
            created.config_type == ConfigType::AppConfig,
            format!("config type {:?}", created.config_type),
        );
        expect(
            created.binder_exception_code == 0,
            format!("binder exception {}", created.binder_exception_code),
        );
        expect(
            created.num_cpus == self.num_cpus,
            format!("num_cpus {} != {}", created.num_cpus, self.num_cpus),
        );
        expect(
            created.memory_mib == self.memory_mib,
            format!("memory_mib {} != {}", created.memory_mib, self.memory_mib),
        );
        if let Some(apexes) = &self.apexes {
            expect(
                &created.apexes == apexes,
                format!("apexes {:?} != {apexes:?}", created.apexes),
            );
        }
        expect(
            exited.death_reason == DeathReason::Killed,
            format!("death reason {:?}", exited.death_reason),
        );
        expect(
            exited.exit_signal == SIGKILL,
            format!("exit signal {}", exited.exit_signal),
        );
        expect(exited.rss_vm_kb > 0, format!("rss_vm_kb {}", exited.rss_vm_kb));
        expect(
            exited.rss_crosvm_kb > 0,
            format!("rss_crosvm_kb {}", exited.rss_crosvm_kb),
        );
        if self.pkvm {
            expect(
                created.hypervisor == Hypervisor::Pkvm,
                format!("hypervisor {:?}", created.hypervisor),
            );
            expect(
                exited.guest_time_millis > 0,
                format!("guest_time_millis {}", exited.guest_time_millis),
            );
        }
        if mismatches.is_empty() {
            Ok(())
        } else {
            Err(HarnessError::Telemetry(mismatches.join(", ")))
        }
    }
}
