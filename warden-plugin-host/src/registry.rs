//! External collaborators of the plugin manager.
//!
//! The manager never persists descriptors or turns packages into code
//! itself; it goes through these traits. In-process implementations are
//! provided for hosts whose plugins are compiled in.

use crate::descriptor::PluginDescriptor;
use crate::permissions::CapabilityTier;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use warden_plugin_sdk::Plugin;

/// Source of truth for plugin discovery.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn find(&self, name: &str) -> anyhow::Result<Option<PluginDescriptor>>;
    async fn list(&self) -> anyhow::Result<Vec<PluginDescriptor>>;
    async fn upsert(&self, descriptor: PluginDescriptor) -> anyhow::Result<()>;
}

/// Successful validation outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub plugin: String,
    pub checks: Vec<String>,
    pub warnings: Vec<String>,
}

/// Failed validation outcome with every reason found.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", reasons.join("; "))]
pub struct ValidationError {
    pub reasons: Vec<String>,
}

impl ValidationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reasons: vec![reason.into()],
        }
    }
}

/// Structural and security checks run before a plugin may be loaded.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, descriptor: &PluginDescriptor) -> Result<ValidationReport, ValidationError>;
}

/// Turns a validated descriptor into a live plugin instance.
/// Called exactly once per load and once per reload.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn import(&self, descriptor: &PluginDescriptor) -> anyhow::Result<Box<dyn Plugin>>;
}

// ============================================================================
// In-memory registry
// ============================================================================

#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    descriptors: RwLock<BTreeMap<String, PluginDescriptor>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_descriptors(descriptors: impl IntoIterator<Item = PluginDescriptor>) -> Self {
        let registry = Self::new();
        {
            let mut map = registry.descriptors.write().unwrap_or_else(|e| e.into_inner());
            for descriptor in descriptors {
                map.insert(descriptor.name.clone(), descriptor);
            }
        }
        registry
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn find(&self, name: &str) -> anyhow::Result<Option<PluginDescriptor>> {
        Ok(self
            .descriptors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned())
    }

    async fn list(&self) -> anyhow::Result<Vec<PluginDescriptor>> {
        Ok(self
            .descriptors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect())
    }

    async fn upsert(&self, descriptor: PluginDescriptor) -> anyhow::Result<()> {
        self.descriptors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(descriptor.name.clone(), descriptor);
        Ok(())
    }
}

// ============================================================================
// Basic validator
// ============================================================================

/// Structural checks only: name rules, no self-dependency, no duplicate
/// dependency names. Privileged capability requests produce warnings.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicValidator;

#[async_trait]
impl Validator for BasicValidator {
    async fn validate(&self, descriptor: &PluginDescriptor) -> Result<ValidationReport, ValidationError> {
        let mut reasons = Vec::new();
        let mut report = ValidationReport {
            plugin: descriptor.name.clone(),
            ..Default::default()
        };

        match warden_types::validate_plugin_name(&descriptor.name) {
            Ok(()) => report.checks.push("name".to_string()),
            Err(e) => reasons.push(e.to_string()),
        }

        let mut seen = HashSet::new();
        for dep in &descriptor.dependencies {
            if dep.name == descriptor.name {
                reasons.push(format!("plugin '{}' depends on itself", descriptor.name));
            } else if !seen.insert(dep.name.as_str()) {
                reasons.push(format!("duplicate dependency '{}'", dep.name));
            }
        }
        report.checks.push("dependencies".to_string());

        let privileged: Vec<String> = descriptor
            .requests
            .iter()
            .filter(|c| c.tier() == CapabilityTier::Privileged)
            .map(|c| c.to_string())
            .collect();
        if !privileged.is_empty() {
            report
                .warnings
                .push(format!("requests privileged capabilities: {}", privileged.join(", ")));
        }
        report.checks.push("permissions".to_string());

        if reasons.is_empty() {
            Ok(report)
        } else {
            Err(ValidationError { reasons })
        }
    }
}

// ============================================================================
// Static loader
// ============================================================================

type PluginFactory = dyn Fn(&PluginDescriptor) -> anyhow::Result<Box<dyn Plugin>> + Send + Sync;

/// Loader for plugins compiled into the host, keyed by plugin name.
#[derive(Default)]
pub struct StaticLoader {
    factories: RwLock<HashMap<String, Arc<PluginFactory>>>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the factory for `name`. The factory receives the
    /// descriptor being loaded so it can vary by version.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&PluginDescriptor) -> anyhow::Result<Box<dyn Plugin>> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), Arc::new(factory));
    }

    pub fn with<F>(self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&PluginDescriptor) -> anyhow::Result<Box<dyn Plugin>> + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }
}

#[async_trait]
impl Loader for StaticLoader {
    async fn import(&self, descriptor: &PluginDescriptor) -> anyhow::Result<Box<dyn Plugin>> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&descriptor.name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no factory registered for '{}'", descriptor.name))?;
        factory(descriptor)
    }
}
