//! Immutable plugin identity as reported by the registry.

use crate::dependency::DependencySpec;
use crate::permissions::{Capability, CapabilitySet};
use semver::Version;
use serde::{Deserialize, Serialize};

/// Identity and declarations of one plugin version.
///
/// Created at discovery from registry metadata and never mutated by the
/// host. A reload swaps the whole descriptor for the new version's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    pub version: Version,
    /// Interfaces this plugin offers to other plugins.
    #[serde(default)]
    pub provides: Vec<String>,
    /// Host capabilities the plugin asks to be granted.
    #[serde(default)]
    pub requests: CapabilitySet,
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            provides: Vec::new(),
            requests: CapabilitySet::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn requesting(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.requests.extend(capabilities);
        self
    }

    pub fn providing(mut self, interface: impl Into<String>) -> Self {
        self.provides.push(interface.into());
        self
    }

    pub fn depends_on(mut self, dependency: DependencySpec) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn depends_on_name(&self, name: &str) -> Option<&DependencySpec> {
        self.dependencies.iter().find(|d| d.name == name)
    }
}
