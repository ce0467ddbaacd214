//! Convenience re-exports for plugin authors.

pub use crate::plugin::Plugin;
pub use crate::types::{HealthStatus, PluginConfig, StateSnapshot};
pub use async_trait::async_trait;
