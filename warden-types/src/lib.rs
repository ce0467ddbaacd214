//! Core type definitions for the Warden plugin host.
//!
//! This crate defines the plugin-agnostic identifiers shared by the host and
//! by extension code:
//! - Correlation identifiers that tie a gateway response to its request
//! - Instance identifiers, one per loaded plugin generation
//! - Plugin name validation rules
//!
//! Anything describing sandboxing or lifecycle behaviour belongs in
//! `warden-plugin-host`, not here.

mod ids;
mod name;

pub use ids::{CorrelationId, InstanceId};
pub use name::{validate_plugin_name, MAX_PLUGIN_NAME_LEN};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from parsing identifiers and checking plugin names.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid plugin name '{name}': {reason}")]
    InvalidPluginName { name: String, reason: String },
}
