// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::ensure;
use microdroid_host::Scenario;
use microdroid_host::TestParams;
use microdroid_host::memstat::MemStat;
use microdroid_host::scenario::vm_configs;
use microdroid_host::test;
use microdroid_host::trace_attachment;

/// Records guest memory usage as test metrics.
fn microdroid_ram_usage(params: TestParams<'_>) -> anyhow::Result<()> {
    let scenario = Scenario::new(&params)?;
    let config =
        scenario.microdroid_config(vm_configs::DEFAULT, Some("test_microdroid_ram_usage"))?;
    let vm = scenario.boot_managed(&config)?;
    vm.enable_root()?;

    let memstat = MemStat::collect(vm.guest()?)?;
    ensure!(!memstat.meminfo.is_empty(), "guest reported no meminfo");

    let metrics: serde_json::Map<_, _> = memstat
        .metrics()
        .into_iter()
        .map(|(name, value)| (format!("microdroid/{name}"), value.into()))
        .collect();
    let path = params.output_dir.join("memstat.json");
    fs_err::write(&path, serde_json::to_string_pretty(&metrics)?)?;
    trace_attachment(&path);
    tracing::info!(metrics = metrics.len(), "recorded guest memory usage");
    Ok(())
}

test!(microdroid_ram_usage);
