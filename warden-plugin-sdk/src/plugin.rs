use crate::types::{HealthStatus, PluginConfig, StateSnapshot};
use async_trait::async_trait;

/// Lifecycle hooks implemented by every plugin.
///
/// Only `load` is required. The remaining hooks default to successful
/// no-ops so small plugins stay small. Hooks may suspend on I/O; the host
/// bounds every call with a deadline.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Prepares the plugin with its host-supplied configuration.
    async fn load(&mut self, config: &PluginConfig) -> anyhow::Result<()>;

    /// Starts serving. Called after the host has established the sandbox scope.
    async fn activate(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Stops serving. The host treats errors as warnings; deactivation
    /// always completes.
    async fn deactivate(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Releases everything acquired in `load`.
    async fn unload(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        HealthStatus::Healthy
    }

    /// Captures state that must survive a hot reload.
    async fn export_state(&self) -> anyhow::Result<StateSnapshot> {
        Ok(StateSnapshot::empty())
    }

    /// Restores state captured by a previous generation's `export_state`.
    /// Called after `load` and before `activate` on the new generation.
    async fn import_state(&mut self, _snapshot: StateSnapshot) -> anyhow::Result<()> {
        Ok(())
    }
}
