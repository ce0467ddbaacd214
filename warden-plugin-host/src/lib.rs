//! Sandboxed plugin host for Warden.
//!
//! Extends a host application with third-party plugins while constraining
//! what each plugin may do. Three components share one plugin table:
//!
//! - [`PluginManager`] drives the lifecycle state machine, resolves
//!   dependencies, and performs hot reloads.
//! - [`SecuritySandbox`] owns a [`ResourceMonitor`] and [`SecurityPolicy`]
//!   per active plugin, records violations, and escalates repeat offenders.
//! - [`ApiGateway`] is the single entry point for plugin-to-host calls and
//!   applies the lifecycle, permission, and rate-limit gates in that order.
//!
//! Plugin code, persistent discovery, and the host's own capabilities are
//! external collaborators reached through [`Registry`], [`Validator`],
//! [`Loader`], and [`CapabilityProvider`].

mod config;
mod dependency;
mod descriptor;
mod error;
mod gateway;
mod lifecycle;
mod manager;
mod monitor;
mod permissions;
mod policy;
mod rate_limit;
mod registry;
mod sandbox;

pub use config::{HostConfig, PluginSettings};
pub use dependency::{resolve_load_order, DependencyFailure, DependencyResolution, DependencySpec};
pub use descriptor::PluginDescriptor;
pub use error::{ErrorKind, PluginHostError};
pub use gateway::{ApiError, ApiGateway, ApiRequest, ApiResponse, CapabilityProvider};
pub use lifecycle::{LifecycleEvent, LifecycleState};
pub use manager::{BatchReport, PluginManager, PluginSummary};
pub use monitor::{MonitorSnapshot, NetworkAdmission, ResourceMonitor, ViolationKind, ViolationRecord};
pub use permissions::{Capability, CapabilitySet, CapabilityTier, UnknownCapability};
pub use policy::{PolicyConfig, PolicyEngine, PolicyMode, SecurityPolicy};
pub use rate_limit::TokenBucket;
pub use registry::{
    BasicValidator, InMemoryRegistry, Loader, Registry, StaticLoader, ValidationError,
    ValidationReport, Validator,
};
pub use sandbox::{SandboxSignal, ScopeHandle, SecuritySandbox};

pub use warden_plugin_sdk::{HealthStatus, Plugin, PluginConfig, StateSnapshot};
pub use warden_types::{CorrelationId, InstanceId};
