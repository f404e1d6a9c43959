// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest memory usage collection

use crate::device::Device;
use crate::error::HarnessError;
use serde::Serialize;
use std::collections::BTreeMap;

#[expect(missing_docs)]
#[derive(Serialize, Clone, Debug, Default)]
pub struct MemStat {
    pub meminfo: BTreeMap<String, u64>,
    /// `smaps_rollup` values keyed by process name.
    pub smaps_rollup: BTreeMap<String, BTreeMap<String, u64>>,
}

impl MemStat {
    /// Reads `/proc/meminfo` and the `smaps_rollup` of every guest process.
    ///
    /// Processes that exit between listing and reading are skipped.
    pub fn collect(guest: &dyn Device) -> Result<Self, HarnessError> {
        let meminfo = Self::parse_memfile(&guest.pull_file_contents("/proc/meminfo")?, 0, 0, 1)?;
        let processes = Self::parse_ps(&guest.run(&["ps", "-A", "-o", "PID,NAME"])?)?;

        let mut smaps_rollup = BTreeMap::new();
        for (pid, name) in processes {
            let Some(rollup) = guest.try_run(&["cat", &format!("/proc/{pid}/smaps_rollup")])
            else {
                continue;
            };
            // Kernel threads have no mappings and an empty rollup.
            let values = Self::parse_memfile(&rollup, 1, 0, 1)?;
            if !values.is_empty() {
                smaps_rollup.insert(name, values);
            }
        }

        tracing::debug!(
            meminfo = meminfo.len(),
            processes = smaps_rollup.len(),
            "collected guest memory statistics"
        );
        Ok(Self {
            meminfo,
            smaps_rollup,
        })
    }

    /// Flattens the statistics into `meminfo/<key>` and
    /// `smaps/<key>/<process>` metrics with lower-cased keys.
    pub fn metrics(&self) -> Vec<(String, u64)> {
        let meminfo = self
            .meminfo
            .iter()
            .map(|(key, value)| (format!("meminfo/{}", key.to_lowercase()), *value));
        let smaps = self.smaps_rollup.iter().flat_map(|(process, values)| {
            values.iter().map(move |(key, value)| {
                (format!("smaps/{}/{process}", key.to_lowercase()), *value)
            })
        });
        meminfo.chain(smaps).collect()
    }

    fn parse_memfile(
        input: &str,
        start_row: usize,
        field_col: usize,
        value_col: usize,
    ) -> Result<BTreeMap<String, u64>, HarnessError> {
        let mut parsed_data = BTreeMap::new();
        for line in input.lines().skip(start_row).filter(|l| !l.trim().is_empty()) {
            let split_line = line.split_whitespace().collect::<Vec<&str>>();
            let (Some(field), Some(value)) = (split_line.get(field_col), split_line.get(value_col))
            else {
                return Err(HarnessError::parse("memory statistics", format_args!("{line:?}")));
            };
            let value = value
                .parse::<u64>()
                .map_err(|err| HarnessError::parse("memory statistics", format_args!("{line:?}: {err}")))?;
            parsed_data.insert(field.trim_matches(':').to_owned(), value);
        }
        Ok(parsed_data)
    }

    fn parse_ps(input: &str) -> Result<Vec<(u32, String)>, HarnessError> {
        input
            .lines()
            .skip(1)
            .filter(|l| !l.trim().is_empty())
            .map(|line| {
                let mut fields = line.split_whitespace();
                let pid = fields.next().and_then(|pid| pid.parse().ok());
                let name = fields.next().and_then(|name| name.rsplit('/').next());
                match (pid, name) {
                    (Some(pid), Some(name)) => Ok((pid, name.to_owned())),
                    _ => Err(HarnessError::parse("process list", format_args!("{line:?}"))),
                }
            })
            .collect()
    }
}
