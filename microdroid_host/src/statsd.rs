// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Telemetry collection through statsd.
//!
//! A config with one event metric per atom is pushed with
//! `cmd stats config update`, and the collected events are read back with
//! `cmd stats dump-report --proto`. Dumping a report clears it, so every fetch
//! only returns events logged since the previous one.
//!
//! Only the fields this crate reads are declared below. Field numbers follow
//! statsd's `statsd_config.proto`, `stats_log.proto` and the VM atoms in
//! `atoms.proto`; everything else is skipped when decoding.

use crate::device::Device;
use crate::error::HarnessError;
use crate::telemetry::ConfigType;
use crate::telemetry::DeathReason;
use crate::telemetry::Hypervisor;
use crate::telemetry::TelemetryEvent;
use crate::telemetry::TelemetrySource;
use crate::telemetry::VmBooted;
use crate::telemetry::VmCreationRequested;
use crate::telemetry::VmExited;
use prost::Message;

/// Id of the config this crate installs.
pub const CONFIG_ID: i64 = 0x6d64_686f_7374;
/// Device path the encoded config is staged at before it is installed.
pub const CONFIG_STAGING_PATH: &str = "/data/local/tmp/microdroid_statsd_config.pb";
/// Device path reports are dumped to before they are pulled.
pub const REPORT_STAGING_PATH: &str = "/data/local/tmp/microdroid_statsd_report.pb";

/// Processes whose atoms statsd accepts into the report. The VM manager logs
/// from the uid of the client that started the VM.
const LOG_SOURCES: [&str; 3] = ["AID_SYSTEM", "AID_SHELL", "AID_ROOT"];

const METRIC_ID_BASE: i64 = 1 << 32;

#[derive(Clone, PartialEq, Message)]
struct StatsdConfig {
    #[prost(int64, optional, tag = "1")]
    id: Option<i64>,
    #[prost(message, repeated, tag = "2")]
    event_metric: Vec<EventMetric>,
    #[prost(message, repeated, tag = "7")]
    atom_matcher: Vec<AtomMatcher>,
    #[prost(string, repeated, tag = "12")]
    allowed_log_source: Vec<String>,
    #[prost(bool, optional, tag = "16")]
    hash_strings_in_metric_report: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
struct EventMetric {
    #[prost(int64, optional, tag = "1")]
    id: Option<i64>,
    #[prost(int64, optional, tag = "2")]
    what: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
struct AtomMatcher {
    #[prost(int64, optional, tag = "1")]
    id: Option<i64>,
    #[prost(message, optional, tag = "2")]
    simple_atom_matcher: Option<SimpleAtomMatcher>,
}

#[derive(Clone, PartialEq, Message)]
struct SimpleAtomMatcher {
    #[prost(int32, optional, tag = "1")]
    atom_id: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
struct ConfigMetricsReportList {
    #[prost(message, repeated, tag = "2")]
    reports: Vec<ConfigMetricsReport>,
}

#[derive(Clone, PartialEq, Message)]
struct ConfigMetricsReport {
    #[prost(message, repeated, tag = "1")]
    metrics: Vec<StatsLogReport>,
}

#[derive(Clone, PartialEq, Message)]
struct StatsLogReport {
    #[prost(int64, optional, tag = "1")]
    metric_id: Option<i64>,
    #[prost(message, optional, tag = "4")]
    event_metrics: Option<EventMetricDataWrapper>,
}

#[derive(Clone, PartialEq, Message)]
struct EventMetricDataWrapper {
    #[prost(message, repeated, tag = "1")]
    data: Vec<EventMetricData>,
}

#[derive(Clone, PartialEq, Message)]
struct EventMetricData {
    #[prost(int64, optional, tag = "1")]
    elapsed_timestamp_nanos: Option<i64>,
    #[prost(message, optional, tag = "2")]
    atom: Option<Atom>,
    #[prost(message, optional, tag = "4")]
    aggregated_atom_info: Option<AggregatedAtomInfo>,
}

#[derive(Clone, PartialEq, Message)]
struct AggregatedAtomInfo {
    #[prost(message, optional, tag = "1")]
    atom: Option<Atom>,
    #[prost(int64, repeated, packed = "false", tag = "2")]
    elapsed_timestamp_nanos: Vec<i64>,
}

#[derive(Clone, PartialEq, Message)]
struct Atom {
    #[prost(message, optional, tag = "76")]
    vm_creation_requested: Option<VmCreationRequestedAtom>,
    #[prost(message, optional, tag = "87")]
    vm_booted: Option<VmBootedAtom>,
    #[prost(message, optional, tag = "88")]
    vm_exited: Option<VmExitedAtom>,
}

#[derive(Clone, PartialEq, Message)]
struct VmCreationRequestedAtom {
    #[prost(int32, optional, tag = "1")]
    uid: Option<i32>,
    #[prost(string, optional, tag = "2")]
    vm_identifier: Option<String>,
    #[prost(int32, optional, tag = "3")]
    hypervisor: Option<i32>,
    #[prost(bool, optional, tag = "4")]
    is_protected: Option<bool>,
    #[prost(bool, optional, tag = "5")]
    creation_succeeded: Option<bool>,
    #[prost(int32, optional, tag = "6")]
    binder_exception_code: Option<i32>,
    #[prost(int32, optional, tag = "7")]
    config_type: Option<i32>,
    #[prost(int32, optional, tag = "8")]
    num_cpus: Option<i32>,
    #[prost(int32, optional, tag = "10")]
    memory_mib: Option<i32>,
    #[prost(string, optional, tag = "11")]
    apexes: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
struct VmBootedAtom {
    #[prost(int32, optional, tag = "1")]
    uid: Option<i32>,
    #[prost(string, optional, tag = "2")]
    vm_identifier: Option<String>,
    #[prost(int64, optional, tag = "3")]
    elapsed_time_millis: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
struct VmExitedAtom {
    #[prost(int32, optional, tag = "1")]
    uid: Option<i32>,
    #[prost(string, optional, tag = "2")]
    vm_identifier: Option<String>,
    #[prost(int64, optional, tag = "3")]
    elapsed_time_millis: Option<i64>,
    #[prost(int32, optional, tag = "4")]
    death_reason: Option<i32>,
    #[prost(int64, optional, tag = "5")]
    guest_time_millis: Option<i64>,
    #[prost(int64, optional, tag = "6")]
    rss_vm_kb: Option<i64>,
    #[prost(int64, optional, tag = "7")]
    rss_crosvm_kb: Option<i64>,
    #[prost(int32, optional, tag = "8")]
    exit_signal: Option<i32>,
}

fn hypervisor(value: i32) -> Hypervisor {
    match value {
        1 => Hypervisor::Pkvm,
        2 => Hypervisor::Other,
        _ => Hypervisor::Unknown,
    }
}

fn config_type(value: i32) -> ConfigType {
    match value {
        1 => ConfigType::AppConfig,
        2 => ConfigType::RawConfig,
        _ => ConfigType::Unknown,
    }
}

fn death_reason(value: i32) -> DeathReason {
    match value {
        1 => DeathReason::InfrastructureError,
        2 => DeathReason::Killed,
        4 => DeathReason::Shutdown,
        5 => DeathReason::Error,
        6 => DeathReason::Reboot,
        7 => DeathReason::Crash,
        _ => DeathReason::Unknown,
    }
}

fn unsigned(field: &str, value: Option<i32>) -> Result<u32, HarnessError> {
    let value = value.unwrap_or_default();
    u32::try_from(value)
        .map_err(|_| HarnessError::Telemetry(format!("negative {field} {value}")))
}

impl Atom {
    fn into_event(self) -> Result<Option<TelemetryEvent>, HarnessError> {
        if let Some(atom) = self.vm_creation_requested {
            return Ok(Some(TelemetryEvent::VmCreationRequested(VmCreationRequested {
                uid: atom.uid.unwrap_or_default(),
                vm_identifier: atom.vm_identifier.unwrap_or_default(),
                hypervisor: hypervisor(atom.hypervisor.unwrap_or_default()),
                is_protected: atom.is_protected.unwrap_or_default(),
                creation_succeeded: atom.creation_succeeded.unwrap_or_default(),
                binder_exception_code: atom.binder_exception_code.unwrap_or_default(),
                config_type: config_type(atom.config_type.unwrap_or_default()),
                num_cpus: unsigned("num_cpus", atom.num_cpus)?,
                memory_mib: unsigned("memory_mib", atom.memory_mib)?,
                apexes: atom.apexes.unwrap_or_default(),
            })));
        }
        if let Some(atom) = self.vm_booted {
            return Ok(Some(TelemetryEvent::VmBooted(VmBooted {
                uid: atom.uid.unwrap_or_default(),
                vm_identifier: atom.vm_identifier.unwrap_or_default(),
                elapsed_time_millis: atom.elapsed_time_millis.unwrap_or_default(),
            })));
        }
        if let Some(atom) = self.vm_exited {
            return Ok(Some(TelemetryEvent::VmExited(VmExited {
                uid: atom.uid.unwrap_or_default(),
                vm_identifier: atom.vm_identifier.unwrap_or_default(),
                elapsed_time_millis: atom.elapsed_time_millis.unwrap_or_default(),
                death_reason: death_reason(atom.death_reason.unwrap_or_default()),
                exit_signal: atom.exit_signal.unwrap_or_default(),
                guest_time_millis: atom.guest_time_millis.unwrap_or_default(),
                rss_vm_kb: atom.rss_vm_kb.unwrap_or_default(),
                rss_crosvm_kb: atom.rss_crosvm_kb.unwrap_or_default(),
            })));
        }
        Ok(None)
    }
}

/// Decodes a `ConfigMetricsReportList` as written by
/// `cmd stats dump-report --proto`, returning the VM lifecycle events it
/// holds in the order they were logged. Other atoms are skipped.
pub fn parse_report(report: &[u8]) -> Result<Vec<TelemetryEvent>, HarnessError> {
    let list = ConfigMetricsReportList::decode(report)
        .map_err(|err| HarnessError::parse("statsd report", err))?;
    let mut timed = Vec::new();
    for data in list
        .reports
        .into_iter()
        .flat_map(|report| report.metrics)
        .filter_map(|metric| metric.event_metrics)
        .flat_map(|wrapper| wrapper.data)
    {
        if let Some(atom) = data.atom {
            timed.push((data.elapsed_timestamp_nanos.unwrap_or_default(), atom));
        }
        // Repeated identical atoms may be reported once with every timestamp.
        if let Some(AggregatedAtomInfo {
            atom: Some(atom),
            elapsed_timestamp_nanos,
        }) = data.aggregated_atom_info
        {
            for timestamp in elapsed_timestamp_nanos {
                timed.push((timestamp, atom.clone()));
            }
        }
    }
    timed.sort_by_key(|(timestamp, _)| *timestamp);

    let mut events = Vec::new();
    for (timestamp, atom) in timed {
        match atom.into_event()? {
            Some(event) => events.push(event),
            None => tracing::debug!(timestamp, "skipping unknown atom"),
        }
    }
    Ok(events)
}

fn config_for(atoms: &[u32], log_sources: &[String]) -> StatsdConfig {
    let mut config = StatsdConfig {
        id: Some(CONFIG_ID),
        allowed_log_source: log_sources.to_vec(),
        hash_strings_in_metric_report: Some(false),
        ..Default::default()
    };
    for &atom in atoms {
        let matcher_id = i64::from(atom);
        config.atom_matcher.push(AtomMatcher {
            id: Some(matcher_id),
            simple_atom_matcher: Some(SimpleAtomMatcher {
                atom_id: i32::try_from(atom).ok(),
            }),
        });
        config.event_metric.push(EventMetric {
            id: Some(METRIC_ID_BASE + matcher_id),
            what: Some(matcher_id),
        });
    }
    config
}

/// Collects pushed atoms through the device's statsd.
pub struct StatsdTelemetry<'a> {
    device: &'a dyn Device,
    log_sources: Vec<String>,
}

impl<'a> StatsdTelemetry<'a> {
    /// Creates a source accepting atoms logged by system processes and by
    /// `package`.
    pub fn new(device: &'a dyn Device, package: &str) -> Self {
        Self {
            device,
            log_sources: LOG_SOURCES
                .iter()
                .map(|source| (*source).to_owned())
                .chain([package.to_owned()])
                .collect(),
        }
    }

    fn dump_report(&self) -> Result<Vec<u8>, HarnessError> {
        self.device.run(&[
            "cmd",
            "stats",
            "dump-report",
            &CONFIG_ID.to_string(),
            "--include_current_bucket",
            "--proto",
            ">",
            REPORT_STAGING_PATH,
        ])?;
        let local = tempfile::NamedTempFile::new()?;
        self.device.pull_file(REPORT_STAGING_PATH, local.path())?;
        self.device.run(&["rm", "-f", REPORT_STAGING_PATH])?;
        Ok(fs_err::read(local.path())?)
    }
}

impl TelemetrySource for StatsdTelemetry<'_> {
    fn reset(&mut self) -> Result<(), HarnessError> {
        self.device
            .run(&["cmd", "stats", "config", "remove", &CONFIG_ID.to_string()])?;
        // Dumping drops anything collected under a previous config.
        self.dump_report()?;
        Ok(())
    }

    fn subscribe(&mut self, atoms: &[u32]) -> Result<(), HarnessError> {
        let config = config_for(atoms, &self.log_sources);
        let local = tempfile::NamedTempFile::new()?;
        fs_err::write(local.path(), config.encode_to_vec())?;
        self.device.push_file(local.path(), CONFIG_STAGING_PATH)?;
        self.device.run(&[
            "cat",
            CONFIG_STAGING_PATH,
            "|",
            "cmd",
            "stats",
            "config",
            "update",
            &CONFIG_ID.to_string(),
        ])?;
        self.device.run(&["rm", "-f", CONFIG_STAGING_PATH])?;
        tracing::info!(?atoms, config_id = CONFIG_ID, "subscribed to statsd atoms");
        Ok(())
    }

    fn fetch(&mut self) -> Result<Vec<TelemetryEvent>, HarnessError> {
        parse_report(&self.dump_report()?)
    }
}
