// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Inventory of the components (APEXes) active on a device.
//!
//! The device publishes its active components as an XML manifest at
//! [`MANIFEST_PATH`]. Only elements whose `isActive` attribute is exactly
//! `"true"` are kept, and booleans are never parsed leniently: `"True"` and
//! `"1"` are false.

use crate::device::Device;
use crate::error::HarnessError;

/// Device path of the active component manifest.
pub const MANIFEST_PATH: &str = "/apex/apex-info-list.xml";

const COMPONENT_TAGS: &[&str] = &["apex-info", "component-info"];
const SHARED_LIBRARY_ATTRS: &[&str] = &["provideSharedApexLibs", "providesSharedLibraries"];

/// An active component on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentRecord {
    /// The component's module name, e.g. `com.android.adbd`.
    pub name: String,
    /// The on-device path of the component image.
    pub path: String,
    /// Whether the component provides shared libraries to other components.
    pub provides_shared_libraries: bool,
}

/// The active components of one device snapshot, in manifest order.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    components: Vec<ComponentRecord>,
}

fn is_true(value: Option<&str>) -> bool {
    value == Some("true")
}

impl Inventory {
    /// Parses a manifest.
    pub fn load(manifest: &str) -> Result<Self, HarnessError> {
        let doc = roxmltree::Document::parse(manifest)
            .map_err(|err| HarnessError::parse("component manifest", err))?;

        let mut components = Vec::new();
        for node in doc
            .descendants()
            .filter(|node| node.is_element() && COMPONENT_TAGS.contains(&node.tag_name().name()))
        {
            if !is_true(node.attribute("isActive")) {
                continue;
            }
            let required = |attr: &str| {
                node.attribute(attr).map(str::to_owned).ok_or_else(|| {
                    HarnessError::parse(
                        "component manifest",
                        format_args!(
                            "active component on line {} has no {attr}",
                            doc.text_pos_at(node.range().start).row
                        ),
                    )
                })
            };
            components.push(ComponentRecord {
                name: required("moduleName")?,
                path: required("modulePath")?,
                provides_shared_libraries: SHARED_LIBRARY_ATTRS
                    .iter()
                    .any(|attr| is_true(node.attribute(*attr))),
            });
        }
        Ok(Self { components })
    }

    /// Reads and parses the manifest of `device`.
    pub fn pull(device: &dyn Device) -> Result<Self, HarnessError> {
        let manifest = device.pull_file_contents(MANIFEST_PATH)?;
        Self::load(&manifest)
    }

    /// Returns the first component named `name`.
    pub fn find(&self, name: &str) -> Option<&ComponentRecord> {
        self.components.iter().find(|c| c.name == name)
    }

    /// Like [`Inventory::find`], but a missing component is a configuration
    /// error.
    pub fn require(&self, name: &str) -> Result<&ComponentRecord, HarnessError> {
        self.find(name).ok_or_else(|| {
            HarnessError::Config(format!("required component {name} is not active"))
        })
    }

    /// Returns the components that provide shared libraries, in manifest order.
    pub fn shared_library_components(&self) -> Vec<&ComponentRecord> {
        self.components
            .iter()
            .filter(|c| c.provides_shared_libraries)
            .collect()
    }

    /// Returns every active component, in manifest order.
    pub fn components(&self) -> &[ComponentRecord] {
        &self.components
    }

    /// Returns the number of active components.
    pub fn len(&self) -> usize {
        self.components.len()
    }
}
