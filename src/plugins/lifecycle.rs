//! Legal lifecycle transitions.
//!
//! ```text
//! Unloaded -> Loading -> Loaded -> Initializing -> Active <-> Paused
//!                                      |   ^
//!                                      v   |
//!                                      Error
//! Active | Paused | Error -> Unloading -> Unloaded
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::PluginState;

/// Returns `true` if `from -> to` is on the lifecycle graph.
pub fn can_transition(from: PluginState, to: PluginState) -> bool {
    use PluginState::*;

    matches!(
        (from, to),
        (Unloaded, Loading)
            | (Loading, Loaded)
            | (Loaded, Initializing)
            | (Initializing, Active)
            | (Initializing, Error)
            | (Active, Paused)
            | (Paused, Active)
            | (Error, Initializing)
            | (Active, Unloading)
            | (Paused, Unloading)
            | (Error, Unloading)
            | (Unloading, Unloaded)
    )
}

/// One observed state change, kept in the manager's transition log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    pub plugin: String,
    pub from: PluginState,
    pub to: PluginState,
    pub at: DateTime<Utc>,
}

impl StateTransition {
    pub fn new(plugin: &str, from: PluginState, to: PluginState) -> Self {
        Self {
            plugin: plugin.to_string(),
            from,
            to,
            at: Utc::now(),
        }
    }
}

/// Returns `true` if `transitions` (for one plugin, in order) forms a
/// connected path through the lifecycle graph.
pub fn is_valid_path(transitions: &[StateTransition]) -> bool {
    transitions.iter().all(|t| can_transition(t.from, t.to))
        && transitions.windows(2).all(|w| w[0].to == w[1].from)
}
