// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Raw VM configuration builder.
//!
//! A raw configuration starts from the template shipped in the virtualization
//! APEX, has its paths rewritten to the pushed working copy, and gets the
//! instance and payload disks appended.

use crate::error::HarnessError;
use crate::inventory::Inventory;
use serde::Deserialize;
use serde::Serialize;

/// Partition label of the per-instance state image.
pub const INSTANCE_PARTITION: &str = "vm-instance";
/// Partition label of the payload metadata image.
pub const PAYLOAD_METADATA_PARTITION: &str = "payload-metadata";
/// Partition label of the payload APK.
pub const APK_PARTITION: &str = "microdroid-apk";
/// Partition label of the payload APK signature.
pub const APK_IDSIG_PARTITION: &str = "microdroid-apk-idsig";
/// Components every payload disk carries, ahead of the shared-library ones.
pub const REQUIRED_COMPONENTS: &[&str] = &["com.android.os.statsd", "com.android.adbd"];

type Extra = serde_json::Map<String, serde_json::Value>;

/// A partition of a composite disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    /// Device-visible label.
    pub label: String,
    /// Path of the backing image.
    pub path: String,
    /// Fields this crate does not interpret.
    #[serde(flatten)]
    pub extra: Extra,
}

impl Partition {
    /// Creates a partition with no extra fields.
    pub fn new(label: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            path: path.into(),
            extra: Extra::new(),
        }
    }
}

/// A disk attached to the VM. Partition order determines slot indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disk {
    /// Whether the guest may write to the disk.
    #[serde(default)]
    pub writable: bool,
    /// The disk's partitions, in slot order.
    #[serde(default)]
    pub partitions: Vec<Partition>,
    /// Fields this crate does not interpret, e.g. a whole-disk `image`.
    #[serde(flatten)]
    pub extra: Extra,
}

/// A raw VM configuration as consumed by `vm run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    /// Kernel image path.
    pub kernel: String,
    /// Optional initrd path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initrd: Option<String>,
    /// Whether the VM is protected.
    #[serde(default)]
    pub protected: bool,
    /// Attached disks, in order.
    pub disks: Vec<Disk>,
    /// Template fields copied verbatim, e.g. `params` or `memory_mib`.
    #[serde(flatten)]
    pub extra: Extra,
}

impl VmConfig {
    /// Parses a configuration template.
    ///
    /// Malformed JSON is a parse error; a template lacking `kernel` or
    /// `disks` is a configuration error.
    pub fn from_template(template: &str) -> Result<Self, HarnessError> {
        let value: serde_json::Value = serde_json::from_str(template)
            .map_err(|err| HarnessError::parse("vm config template", err))?;
        let object = value
            .as_object()
            .ok_or_else(|| HarnessError::Config("vm config template is not an object".into()))?;
        for field in ["kernel", "disks"] {
            if !object.contains_key(field) {
                return Err(HarnessError::Config(format!(
                    "vm config template has no {field} field"
                )));
            }
        }
        serde_json::from_value(value).map_err(|err| HarnessError::Config(err.to_string()))
    }

    /// Serializes the configuration, including pass-through fields.
    pub fn to_json(&self) -> Result<String, HarnessError> {
        serde_json::to_string_pretty(self).map_err(|err| HarnessError::Config(err.to_string()))
    }

    /// Applies `substitution` to the kernel, initrd and every partition path.
    pub fn rewrite_paths(&mut self, substitution: &PathSubstitution) {
        substitution.apply(&mut self.kernel);
        if let Some(initrd) = &mut self.initrd {
            substitution.apply(initrd);
        }
        for partition in self.disks.iter_mut().flat_map(|d| d.partitions.iter_mut()) {
            substitution.apply(&mut partition.path);
        }
    }
}

/// Replaces every occurrence of one path root with another.
#[derive(Debug, Clone)]
pub struct PathSubstitution {
    from: String,
    to: String,
}

impl PathSubstitution {
    /// Creates a substitution of `from` by `to`.
    ///
    /// Rejects pairs where either string contains the other, so a rewritten
    /// root is never rewritten again. A second pass leaves a path unchanged as
    /// long as the path holds `from` at most once, as VM config paths do.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Result<Self, HarnessError> {
        let from = from.into();
        let to = to.into();
        if from.is_empty() || to.is_empty() || to.contains(&from) || from.contains(&to) {
            return Err(HarnessError::Config(format!(
                "cannot substitute {from:?} with {to:?}"
            )));
        }
        Ok(Self { from, to })
    }

    /// Rewrites the virtualization APEX root to the pushed working copy.
    pub fn virt_apex_to_test_root() -> Self {
        Self {
            from: crate::VIRT_APEX.into(),
            to: crate::TEST_ROOT.into(),
        }
    }

    /// Applies the substitution in place.
    pub fn apply(&self, path: &mut String) {
        if path.contains(&self.from) {
            *path = path.replace(&self.from, &self.to);
        }
    }
}

/// The writable disk holding the instance image.
#[derive(Debug, Clone)]
pub struct InstanceDisk {
    /// Device path of the instance image.
    pub path: String,
}

/// The read-only disk holding the payload.
#[derive(Debug, Clone)]
pub struct PayloadDisk {
    /// Device path of the payload metadata image.
    pub metadata_path: String,
    /// `(name, path)` of each component image, in slot order.
    pub components: Vec<(String, String)>,
    /// Device path of the payload APK.
    pub apk_path: String,
    /// Device path of the APK signature.
    pub idsig_path: String,
}

/// Returns the components the payload disk carries: the required ones, then
/// every shared-library component in manifest order.
pub fn payload_components(inventory: &Inventory) -> Result<Vec<(String, String)>, HarnessError> {
    let mut components = Vec::new();
    for name in REQUIRED_COMPONENTS {
        let record = inventory.require(name)?;
        components.push((record.name.clone(), record.path.clone()));
    }
    components.extend(
        inventory
            .shared_library_components()
            .into_iter()
            .map(|c| (c.name.clone(), c.path.clone())),
    );
    Ok(components)
}

/// The disks appended to the template, each optional.
#[derive(Debug, Clone, Default)]
pub struct ExtraDisks {
    /// Appended first.
    pub instance: Option<InstanceDisk>,
    /// Appended second.
    pub payload: Option<PayloadDisk>,
}

/// Optional overrides applied on top of the template.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Replaces the template's initrd.
    pub initrd: Option<String>,
}

/// Builds a raw VM configuration.
pub fn build_raw_config(
    template: &str,
    substitution: &PathSubstitution,
    extra_disks: &ExtraDisks,
    protected: bool,
    overrides: &ConfigOverrides,
) -> Result<VmConfig, HarnessError> {
    let mut config = VmConfig::from_template(template)?;
    if let Some(initrd) = &overrides.initrd {
        config.initrd = Some(initrd.clone());
    }
    config.rewrite_paths(substitution);

    if let Some(instance) = &extra_disks.instance {
        config.disks.push(Disk {
            writable: true,
            partitions: vec![Partition::new(INSTANCE_PARTITION, &instance.path)],
            extra: Extra::new(),
        });
    }

    if let Some(payload) = &extra_disks.payload {
        let mut partitions = vec![Partition::new(
            PAYLOAD_METADATA_PARTITION,
            &payload.metadata_path,
        )];
        partitions.extend(
            payload
                .components
                .iter()
                .map(|(name, path)| Partition::new(name, path)),
        );
        partitions.push(Partition::new(APK_PARTITION, &payload.apk_path));
        partitions.push(Partition::new(APK_IDSIG_PARTITION, &payload.idsig_path));
        config.disks.push(Disk {
            writable: false,
            partitions,
            extra: Extra::new(),
        });
    }

    config.protected = protected;
    Ok(config)
}

/// Builds the configuration of a raw VM booting images staged under the test
/// root, with the instance and payload disks at their test root paths.
pub fn staged_raw_config(
    template: &str,
    os: &str,
    components: Vec<(String, String)>,
    apk_path: String,
    protected: bool,
) -> Result<VmConfig, HarnessError> {
    build_raw_config(
        template,
        &PathSubstitution::virt_apex_to_test_root(),
        &ExtraDisks {
            instance: Some(InstanceDisk {
                path: crate::INSTANCE_IMG_PATH.to_owned(),
            }),
            payload: Some(PayloadDisk {
                metadata_path: crate::PAYLOAD_METADATA_PATH.to_owned(),
                components,
                apk_path,
                idsig_path: crate::IDSIG_PATH.to_owned(),
            }),
        },
        protected,
        &ConfigOverrides {
            initrd: Some(format!("{}etc/{os}_initrd_debuggable.img", crate::TEST_ROOT)),
        },
    )
}
