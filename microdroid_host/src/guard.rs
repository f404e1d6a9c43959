// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Scoped changes to host device state, undone on drop.

use crate::device::Device;
use crate::device::DeviceError;
use crate::error::HarnessError;

/// Controls transparent huge pages for shared memory.
pub const SHMEM_ENABLED_PATH: &str = "/sys/kernel/mm/transparent_hugepage/shmem_enabled";

/// A transparent huge page mode for shared memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmemMode {
    /// `always`
    Always,
    /// `within_size`
    WithinSize,
    /// `advise`
    Advise,
    /// `never`
    Never,
    /// `deny`
    Deny,
    /// `force`
    Force,
}

impl ShmemMode {
    /// The sysfs name of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            ShmemMode::Always => "always",
            ShmemMode::WithinSize => "within_size",
            ShmemMode::Advise => "advise",
            ShmemMode::Never => "never",
            ShmemMode::Deny => "deny",
            ShmemMode::Force => "force",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "always" => ShmemMode::Always,
            "within_size" => ShmemMode::WithinSize,
            "advise" => ShmemMode::Advise,
            "never" => ShmemMode::Never,
            "deny" => ShmemMode::Deny,
            "force" => ShmemMode::Force,
            _ => return None,
        })
    }

    /// Parses the current mode out of `shmem_enabled`, which lists every mode
    /// and brackets the active one: `always within_size advise [never] deny force`.
    pub fn parse_current(contents: &str) -> Result<Self, HarnessError> {
        contents
            .split_whitespace()
            .find_map(|word| word.strip_prefix('[')?.strip_suffix(']'))
            .and_then(Self::from_name)
            .ok_or_else(|| {
                HarnessError::parse("shmem_enabled", format_args!("no active mode in {contents:?}"))
            })
    }
}

fn write_shmem_mode(device: &dyn Device, mode: ShmemMode) -> Result<(), DeviceError> {
    device.run(&["echo", mode.as_str(), ">", SHMEM_ENABLED_PATH])?;
    Ok(())
}

/// Sets the shmem huge page mode to `advise` for the guard's lifetime.
///
/// Writing the sysfs file requires root on the host device.
pub struct ShmemHugePages<'a> {
    device: &'a dyn Device,
    original: ShmemMode,
}

impl<'a> ShmemHugePages<'a> {
    /// Reads the current mode.
    pub fn current(device: &dyn Device) -> Result<ShmemMode, HarnessError> {
        ShmemMode::parse_current(&device.pull_file_contents(SHMEM_ENABLED_PATH)?)
    }

    /// Switches to `advise`, remembering the current mode.
    pub fn enable_advise(device: &'a dyn Device) -> Result<Self, HarnessError> {
        let original = Self::current(device)?;
        write_shmem_mode(device, ShmemMode::Advise)?;
        tracing::info!(original = original.as_str(), "enabled shmem huge pages");
        Ok(Self { device, original })
    }

    /// The mode that is restored on drop.
    pub fn original(&self) -> ShmemMode {
        self.original
    }
}

impl Drop for ShmemHugePages<'_> {
    fn drop(&mut self) {
        if let Err(err) = write_shmem_mode(self.device, self.original) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                mode = self.original.as_str(),
                "failed to restore shmem huge page mode"
            );
        }
    }
}

/// Holds adb root on the host device, dropping it again if it was not held
/// before.
pub struct AdbRootGuard<'a> {
    device: &'a dyn Device,
    was_root: bool,
}

impl<'a> AdbRootGuard<'a> {
    /// Enables root. Fails if the device refuses.
    pub fn new(device: &'a dyn Device) -> Result<Self, HarnessError> {
        let was_root = device.is_root()?;
        if !was_root && !device.enable_root()? {
            return Err(HarnessError::Config(format!(
                "adb root is not available on {}",
                device.serial()
            )));
        }
        Ok(Self { device, was_root })
    }

    /// Whether root was already held when the guard was created.
    pub fn was_root(&self) -> bool {
        self.was_root
    }
}

impl Drop for AdbRootGuard<'_> {
    fn drop(&mut self) {
        if self.was_root {
            return;
        }
        if let Err(err) = self.device.disable_root() {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "failed to disable adb root"
            );
        }
    }
}
