//! Host configuration: reads `warden.toml` and resolves per-plugin settings.
//!
//! ```toml
//! reset_violations_on_reload = false
//!
//! [defaults]
//! max_memory_mb = 64
//! rate_limit_per_minute = 100
//!
//! [plugins."acme.fetcher"]
//! permissions = ["network.fetch", "status.query"]
//! allowed_network_destinations = ["api.example.com"]
//! max_network_requests_per_window = 10
//! ```
//!
//! Keys omitted from a `[plugins.<name>]` table fall back to the built-in
//! defaults, not to `[defaults]`; overrides are complete settings tables.

use crate::permissions::CapabilitySet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// The per-plugin configuration surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSettings {
    /// Capabilities the host administrator approves for this plugin.
    /// The granted set is the intersection with what the plugin requests.
    pub permissions: CapabilitySet,
    pub max_memory_mb: u64,
    pub max_cpu_seconds: f64,
    pub max_network_requests_per_window: u32,
    pub network_window_secs: u64,
    pub allowed_network_destinations: BTreeSet<String>,
    pub rate_limit_per_minute: u32,
    /// Violations within `violation_window_secs` that force the plugin to `Failed`.
    pub violation_threshold: u32,
    pub violation_window_secs: u64,
    pub sampling_interval_ms: u64,
    /// Deadline for a single gateway call into a host capability.
    pub call_timeout_ms: u64,
    /// Deadline for each plugin lifecycle hook.
    pub hook_timeout_ms: u64,
    /// Opaque settings forwarded to the plugin's `load` hook.
    pub settings: serde_json::Value,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            permissions: CapabilitySet::new(),
            max_memory_mb: 64,
            max_cpu_seconds: 30.0,
            max_network_requests_per_window: 60,
            network_window_secs: 60,
            allowed_network_destinations: BTreeSet::new(),
            rate_limit_per_minute: 100,
            violation_threshold: 3,
            violation_window_secs: 60,
            sampling_interval_ms: 1_000,
            call_timeout_ms: 5_000,
            hook_timeout_ms: 10_000,
            settings: serde_json::Value::Null,
        }
    }
}

impl PluginSettings {
    pub fn hook_timeout(&self) -> Duration {
        Duration::from_millis(self.hook_timeout_ms)
    }
}

/// Host-wide configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Settings for plugins without an explicit entry in `plugins`.
    pub defaults: PluginSettings,
    pub plugins: HashMap<String, PluginSettings>,
    /// When true, a successful reload starts a fresh violation-counting
    /// epoch. Recorded violations are kept either way.
    pub reset_violations_on_reload: bool,
}

impl HostConfig {
    /// Loads configuration from `path`.
    /// Falls back to built-in defaults with a warning when the file is
    /// missing, unreadable, or malformed.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            info!("No host config found at {:?}, using defaults", path);
            return Self::default();
        }

        match std::fs::read_to_string(path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(config) => {
                    info!(plugins = config.plugins.len(), "Loaded host config from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("{e}. Falling back to default host config.");
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read host config {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, crate::PluginHostError> {
        toml::from_str(contents)
            .map_err(|e| crate::PluginHostError::Config(format!("failed to parse host config: {e}")))
    }

    /// Resolves the settings that apply to `plugin`.
    pub fn settings_for(&self, plugin: &str) -> &PluginSettings {
        self.plugins.get(plugin).unwrap_or(&self.defaults)
    }

    pub fn with_plugin(mut self, plugin: impl Into<String>, settings: PluginSettings) -> Self {
        self.plugins.insert(plugin.into(), settings);
        self
    }
}
