//! Error types for the plugin host.

use crate::lifecycle::LifecycleState;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable error classification.
///
/// Every lifecycle result and every gateway response carries one of these
/// alongside the human-readable message from `Display`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationFailed,
    DependencyUnsatisfied,
    LoadFailed,
    ActivationFailed,
    PermissionDenied,
    RateLimited,
    ResourceLimitExceeded,
    NotActive,
    Busy,
    Timeout,
    ReloadFailed,
    PluginNotFound,
    InvalidTransition,
    PolicyDenied,
    CapabilityUnavailable,
    Provider,
    Config,
    Serialization,
}

#[derive(Debug, Error)]
pub enum PluginHostError {
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    #[error("validation failed for '{plugin}': {reason}")]
    ValidationFailed { plugin: String, reason: String },

    #[error("dependency unsatisfied for '{plugin}': {reason}")]
    DependencyUnsatisfied { plugin: String, reason: String },

    #[error("load failed for '{plugin}': {reason}")]
    LoadFailed { plugin: String, reason: String },

    #[error("activation failed for '{plugin}': {reason}")]
    ActivationFailed { plugin: String, reason: String },

    #[error("permission denied: plugin '{plugin}' lacks '{capability}' capability")]
    PermissionDenied { plugin: String, capability: String },

    #[error("rate limited: plugin '{plugin}' exceeded {limit} requests per minute")]
    RateLimited { plugin: String, limit: u32 },

    #[error("resource limit exceeded: {plugin}: {detail}")]
    ResourceLimitExceeded { plugin: String, detail: String },

    #[error("plugin '{plugin}' is not active")]
    NotActive { plugin: String },

    #[error("plugin '{0}' already has a lifecycle operation in flight")]
    Busy(String),

    #[error("timeout: plugin '{plugin}' exceeded {timeout_ms}ms deadline")]
    Timeout { plugin: String, timeout_ms: u64 },

    #[error("reload of '{plugin}' failed and was rolled back: {reason}")]
    ReloadFailed { plugin: String, reason: String },

    #[error("invalid transition for '{plugin}': {from} -> {to}")]
    InvalidTransition {
        plugin: String,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("capability '{capability}' has no registered provider")]
    CapabilityUnavailable { capability: String },

    #[error("capability provider error: {0}")]
    Provider(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PluginHostError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PluginNotFound(_) => ErrorKind::PluginNotFound,
            Self::ValidationFailed { .. } => ErrorKind::ValidationFailed,
            Self::DependencyUnsatisfied { .. } => ErrorKind::DependencyUnsatisfied,
            Self::LoadFailed { .. } => ErrorKind::LoadFailed,
            Self::ActivationFailed { .. } => ErrorKind::ActivationFailed,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::ResourceLimitExceeded { .. } => ErrorKind::ResourceLimitExceeded,
            Self::NotActive { .. } => ErrorKind::NotActive,
            Self::Busy(_) => ErrorKind::Busy,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ReloadFailed { .. } => ErrorKind::ReloadFailed,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::PolicyDenied(_) => ErrorKind::PolicyDenied,
            Self::CapabilityUnavailable { .. } => ErrorKind::CapabilityUnavailable,
            Self::Provider(_) => ErrorKind::Provider,
            Self::Config(_) => ErrorKind::Config,
            Self::Serialization(_) => ErrorKind::Serialization,
        }
    }
}
