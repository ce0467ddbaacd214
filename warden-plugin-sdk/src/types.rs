//! SDK types shared between plugins and the host.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---- Configuration ----

/// Configuration handed to [`crate::Plugin::load`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// The plugin's registered name.
    pub plugin: String,
    /// The version being loaded.
    pub version: String,
    /// Opaque plugin-specific settings from the host configuration.
    #[serde(default)]
    pub settings: Value,
}

impl PluginConfig {
    pub fn new(plugin: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            version: version.into(),
            settings: Value::Null,
        }
    }

    pub fn with_settings(mut self, settings: Value) -> Self {
        self.settings = settings;
        self
    }

    /// Looks up a top-level settings key.
    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }
}

// ---- Reload continuity ----

/// Opaque, plugin-defined state carried across a hot reload.
///
/// The host never inspects the contents; it only moves the snapshot from
/// the outgoing generation to the incoming one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateSnapshot(Value);

impl StateSnapshot {
    pub fn empty() -> Self {
        Self(Value::Null)
    }

    pub fn from_value(value: Value) -> Self {
        Self(value)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_null()
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

// ---- Health ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Serving, but with reduced function.
    Degraded(String),
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}
