//! Plugin lifecycle state machine.
//!
//! Allowed edges:
//!
//! ```text
//! Discovered ──validate──▶ Validated ──load──▶ Loaded ──activate──▶ Active
//!     │                        │                 ▲                    │
//!     └──────▶ Failed ◀────────┘                 │               deactivate
//!                ▲                             reload                 ▼
//!                └────────── forced ────────── Deactivated ──unload──▶ Unloaded
//! ```
//!
//! `Active` and `Deactivated` may additionally be forced to `Failed` by the
//! sandbox, and `Loaded`, `Active` and `Deactivated` may be reloaded back to
//! `Loaded`. Only the plugin manager moves a plugin along these edges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Discovered,
    Validated,
    Loaded,
    Active,
    Deactivated,
    Failed,
    Unloaded,
}

impl LifecycleState {
    /// Whether the state machine has an edge from `self` to `to`.
    pub fn can_transition_to(self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, to),
            (Discovered, Validated)
                | (Discovered, Failed)
                | (Validated, Loaded)
                | (Validated, Failed)
                | (Loaded, Active)
                | (Active, Deactivated)
                | (Deactivated, Unloaded)
                | (Active, Failed)
                | (Deactivated, Failed)
                | (Loaded, Loaded)
                | (Active, Loaded)
                | (Deactivated, Loaded)
        )
    }

    /// Whether a hot reload may start from this state.
    pub fn is_reloadable(self) -> bool {
        matches!(self, Self::Loaded | Self::Active | Self::Deactivated)
    }

    /// States with no outgoing edges.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Unloaded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Validated => "validated",
            Self::Loaded => "loaded",
            Self::Active => "active",
            Self::Deactivated => "deactivated",
            Self::Failed => "failed",
            Self::Unloaded => "unloaded",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emitted for every committed transition (and for rolled-back reloads,
/// where `from == to`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub plugin: String,
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(
        plugin: impl Into<String>,
        from: LifecycleState,
        to: LifecycleState,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            plugin: plugin.into(),
            from,
            to,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    /// True when the plugin started or stopped serving gateway requests.
    pub fn toggles_gateway(&self) -> bool {
        (self.from == LifecycleState::Active) != (self.to == LifecycleState::Active)
    }
}
