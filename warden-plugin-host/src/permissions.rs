//! Capability-based permission model for plugin sandboxes.
//!
//! Host capabilities form a fixed enumeration so every permission check is
//! a set lookup over known variants rather than an open-ended string match.
//! Three tiers:
//! - Basic: read-only host status and logging
//! - DataAccess: reads from the host's memory and context stores
//! - Privileged: anything that mutates host state or leaves the process

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Individual host capability a plugin may be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Capability {
    // Basic
    StatusQuery,
    Logger,

    // DataAccess
    MemoryRead,
    ContextRead,

    // Privileged
    MemoryWrite,
    TaskCreate,
    PlanSubmit,
    AgentMessage,
    NetworkFetch,
}

impl Capability {
    pub const ALL: [Capability; 9] = [
        Self::StatusQuery,
        Self::Logger,
        Self::MemoryRead,
        Self::ContextRead,
        Self::MemoryWrite,
        Self::TaskCreate,
        Self::PlanSubmit,
        Self::AgentMessage,
        Self::NetworkFetch,
    ];

    /// Returns the tier for this capability.
    pub fn tier(&self) -> CapabilityTier {
        match self {
            Self::StatusQuery | Self::Logger => CapabilityTier::Basic,
            Self::MemoryRead | Self::ContextRead => CapabilityTier::DataAccess,
            Self::MemoryWrite
            | Self::TaskCreate
            | Self::PlanSubmit
            | Self::AgentMessage
            | Self::NetworkFetch => CapabilityTier::Privileged,
        }
    }

    /// Whether invoking this capability counts against the plugin's
    /// network request budget and destination allowlist.
    pub fn uses_network(&self) -> bool {
        matches!(self, Self::NetworkFetch)
    }

    /// Returns the stable identifier used in manifests and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatusQuery => "status.query",
            Self::Logger => "logger",
            Self::MemoryRead => "memory.read",
            Self::ContextRead => "context.read",
            Self::MemoryWrite => "memory.write",
            Self::TaskCreate => "task.create",
            Self::PlanSubmit => "plan.submit",
            Self::AgentMessage => "agent.message",
            Self::NetworkFetch => "network.fetch",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown capability '{0}'")]
pub struct UnknownCapability(pub String);

impl FromStr for Capability {
    type Err = UnknownCapability;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownCapability(s.to_string()))
    }
}

impl TryFrom<String> for Capability {
    type Error = UnknownCapability;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Capability> for String {
    fn from(value: Capability) -> Self {
        value.as_str().to_string()
    }
}

/// Capability tier classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityTier {
    Basic,
    DataAccess,
    Privileged,
}

/// An ordered set of capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every capability the host knows about.
    pub fn all() -> Self {
        Capability::ALL.into_iter().collect()
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn insert(&mut self, capability: Capability) -> bool {
        self.0.insert(capability)
    }

    pub fn remove(&mut self, capability: Capability) -> bool {
        self.0.remove(&capability)
    }

    pub fn is_subset_of(&self, other: &CapabilitySet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn intersection(&self, other: &CapabilitySet) -> CapabilitySet {
        Self(self.0.intersection(&other.0).copied().collect())
    }

    pub fn difference(&self, other: &CapabilitySet) -> CapabilitySet {
        Self(self.0.difference(&other.0).copied().collect())
    }

    /// Returns the capabilities at or below `tier`.
    pub fn up_to_tier(&self, tier: CapabilityTier) -> CapabilitySet {
        self.iter().filter(|c| c.tier() <= tier).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<Capability> for CapabilitySet {
    fn extend<I: IntoIterator<Item = Capability>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl<const N: usize> From<[Capability; N]> for CapabilitySet {
    fn from(value: [Capability; N]) -> Self {
        value.into_iter().collect()
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|c| c.as_str()).collect();
        write!(f, "[{}]", names.join(", "))
    }
}
