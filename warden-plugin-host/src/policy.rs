//! Per-plugin security policy and the administrator policy engine.
//!
//! `SecurityPolicy` is built once per Validated -> Loaded transition from
//! the plugin's descriptor, its resolved [`PluginSettings`] and the
//! administrator's [`PolicyEngine`]. It is immutable afterwards; changing
//! limits requires a reload.
//!
//! The policy engine reads an optional `policy.toml`:
//!
//! ```toml
//! [policy]
//! mode = "allowlist"
//! denied-capabilities = ["agent.message"]
//!
//! [policy.allowed-plugins]
//! ids = ["acme.fetcher"]
//! ```

use crate::config::PluginSettings;
use crate::descriptor::PluginDescriptor;
use crate::error::PluginHostError;
use crate::permissions::{Capability, CapabilitySet};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Immutable limits and grants for one loaded plugin version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecurityPolicy {
    plugin: String,
    version: Version,
    granted: CapabilitySet,
    max_memory_bytes: u64,
    max_cpu_time: Duration,
    max_network_requests: u32,
    network_window: Duration,
    allowed_destinations: BTreeSet<String>,
    rate_limit_per_minute: u32,
    violation_threshold: u32,
    violation_window: Duration,
    sampling_interval: Duration,
    call_timeout: Duration,
}

impl SecurityPolicy {
    /// Builds the policy for `descriptor`.
    ///
    /// The granted set is `requested ∩ approved ∖ admin-denied`, so it is
    /// always a subset of what the plugin declared.
    pub fn build(
        descriptor: &PluginDescriptor,
        settings: &PluginSettings,
        engine: &PolicyEngine,
    ) -> Result<Self, PluginHostError> {
        let invalid = |field: &str, detail: &str| {
            PluginHostError::Config(format!(
                "invalid '{field}' for plugin '{}': {detail}",
                descriptor.name
            ))
        };

        if settings.rate_limit_per_minute == 0 {
            return Err(invalid("rate_limit_per_minute", "must be at least 1"));
        }
        if settings.violation_threshold == 0 {
            return Err(invalid("violation_threshold", "must be at least 1"));
        }
        if settings.sampling_interval_ms == 0 {
            return Err(invalid("sampling_interval_ms", "must be at least 1"));
        }
        if settings.network_window_secs == 0 {
            return Err(invalid("network_window_secs", "must be at least 1"));
        }
        let max_cpu_time = Duration::try_from_secs_f64(settings.max_cpu_seconds)
            .map_err(|e| invalid("max_cpu_seconds", &e.to_string()))?;

        let approved = descriptor.requests.intersection(&settings.permissions);
        let mut granted = approved.clone();
        for capability in approved.iter() {
            if engine.is_capability_denied(capability) {
                debug!(plugin = %descriptor.name, %capability, "Capability withheld by admin policy");
                granted.remove(capability);
            }
        }

        let refused = descriptor.requests.difference(&granted);
        if !refused.is_empty() {
            info!(
                plugin = %descriptor.name,
                granted = %granted,
                refused = %refused,
                "Plugin requested capabilities that were not granted"
            );
        }

        Ok(Self {
            plugin: descriptor.name.clone(),
            version: descriptor.version.clone(),
            granted,
            max_memory_bytes: settings.max_memory_mb.saturating_mul(1024 * 1024),
            max_cpu_time,
            max_network_requests: settings.max_network_requests_per_window,
            network_window: Duration::from_secs(settings.network_window_secs),
            allowed_destinations: settings.allowed_network_destinations.clone(),
            rate_limit_per_minute: settings.rate_limit_per_minute,
            violation_threshold: settings.violation_threshold,
            violation_window: Duration::from_secs(settings.violation_window_secs),
            sampling_interval: Duration::from_millis(settings.sampling_interval_ms),
            call_timeout: Duration::from_millis(settings.call_timeout_ms),
        })
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn granted(&self) -> &CapabilitySet {
        &self.granted
    }

    pub fn is_granted(&self, capability: Capability) -> bool {
        self.granted.contains(capability)
    }

    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_bytes
    }

    pub fn max_cpu_time(&self) -> Duration {
        self.max_cpu_time
    }

    pub fn max_network_requests(&self) -> u32 {
        self.max_network_requests
    }

    pub fn network_window(&self) -> Duration {
        self.network_window
    }

    pub fn allowed_destinations(&self) -> &BTreeSet<String> {
        &self.allowed_destinations
    }

    /// Exact host match against the allowed destination set.
    pub fn is_destination_allowed(&self, destination: &str) -> bool {
        self.allowed_destinations.contains(destination)
    }

    pub fn rate_limit_per_minute(&self) -> u32 {
        self.rate_limit_per_minute
    }

    pub fn violation_threshold(&self) -> u32 {
        self.violation_threshold
    }

    pub fn violation_window(&self) -> Duration {
        self.violation_window
    }

    pub fn sampling_interval(&self) -> Duration {
        self.sampling_interval
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }
}

/// Administrator policy mode for plugin admission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Only explicitly listed plugins are admitted.
    Allowlist,
    /// All plugins except explicitly listed ones are admitted.
    Denylist,
    #[default]
    Unrestricted,
}

/// Administrator policy configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub mode: PolicyMode,
    /// Admitted plugins in allowlist mode, blocked plugins in denylist mode.
    #[serde(default)]
    pub plugin_ids: Vec<String>,
    /// Capabilities never granted to any plugin.
    #[serde(default)]
    pub denied_capabilities: CapabilitySet,
}

/// Enforces administrator policy decisions.
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    config: PolicyConfig,
    policy_path: Option<PathBuf>,
}

impl PolicyEngine {
    /// Loads policy from `policy_path`.
    /// Falls back to unrestricted mode with a warning on read or parse errors.
    pub fn load_from(policy_path: PathBuf) -> Self {
        if !policy_path.exists() {
            info!("No policy file found at {:?}, running unrestricted", policy_path);
            return Self::default();
        }

        match std::fs::read_to_string(&policy_path) {
            Ok(contents) => match toml::from_str::<PolicyFile>(&contents) {
                Ok(file) => {
                    info!("Loaded admin policy from {:?}", policy_path);
                    Self {
                        config: file.into_config(),
                        policy_path: Some(policy_path),
                    }
                }
                Err(e) => {
                    warn!(
                        "Failed to parse policy file {:?}: {}. Falling back to unrestricted mode.",
                        policy_path, e
                    );
                    Self {
                        config: PolicyConfig::default(),
                        policy_path: Some(policy_path),
                    }
                }
            },
            Err(e) => {
                warn!("Failed to read policy file {:?}: {}", policy_path, e);
                Self {
                    config: PolicyConfig::default(),
                    policy_path: Some(policy_path),
                }
            }
        }
    }

    /// Creates a policy engine with explicit config.
    pub fn with_config(config: PolicyConfig) -> Self {
        Self {
            config,
            policy_path: None,
        }
    }

    /// Check if a plugin may be admitted.
    pub fn is_plugin_allowed(&self, plugin: &str) -> bool {
        let listed = self.config.plugin_ids.iter().any(|id| id == plugin);
        match self.config.mode {
            PolicyMode::Unrestricted => true,
            PolicyMode::Allowlist => listed,
            PolicyMode::Denylist => !listed,
        }
    }

    pub fn is_capability_denied(&self, capability: Capability) -> bool {
        self.config.denied_capabilities.contains(capability)
    }

    /// Returns whether a policy file was found.
    pub fn has_policy_file(&self) -> bool {
        self.policy_path.is_some()
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }
}

/// Raw TOML structure matching the policy.toml format.
#[derive(Deserialize)]
struct PolicyFile {
    #[serde(default)]
    policy: PolicySection,
}

#[derive(Deserialize, Default)]
struct PolicySection {
    #[serde(default)]
    mode: PolicyMode,
    #[serde(default, rename = "allowed-plugins")]
    plugins: PluginList,
    #[serde(default, rename = "denied-capabilities")]
    denied_capabilities: CapabilitySet,
}

#[derive(Deserialize, Default)]
struct PluginList {
    #[serde(default)]
    ids: Vec<String>,
}

impl PolicyFile {
    fn into_config(self) -> PolicyConfig {
        PolicyConfig {
            mode: self.policy.mode,
            plugin_ids: self.policy.plugins.ids,
            denied_capabilities: self.policy.denied_capabilities,
        }
    }
}
