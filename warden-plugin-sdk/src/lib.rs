//! SDK for building Warden host plugins.
//!
//! Plugin authors implement the [`Plugin`] trait. The host calls each hook
//! exclusively at the matching lifecycle transition:
//!
//! | Hook | Called when |
//! |---|---|
//! | `load(config)` | Validated → Loaded |
//! | `activate()` | Loaded → Active |
//! | `deactivate()` | Active → Deactivated |
//! | `unload()` | Deactivated → Unloaded |
//! | `health_check()` | on operator request while Active |
//! | `export_state()` / `import_state()` | around a hot reload |
//!
//! Plugins never call host capabilities directly; every host call goes
//! through the host's API gateway, which checks permissions and rate limits.
//!
//! # Example
//!
//! ```ignore
//! use warden_plugin_sdk::prelude::*;
//!
//! #[derive(Default)]
//! struct Counter {
//!     hits: u64,
//! }
//!
//! #[async_trait]
//! impl Plugin for Counter {
//!     async fn load(&mut self, _config: &PluginConfig) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//!
//!     async fn export_state(&self) -> anyhow::Result<StateSnapshot> {
//!         Ok(StateSnapshot::from_value(serde_json::json!({ "hits": self.hits })))
//!     }
//! }
//! ```

mod plugin;
pub mod prelude;
pub mod types;

pub use plugin::Plugin;
pub use types::*;
