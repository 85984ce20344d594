//! Error types for chatplug
//!
//! This module defines the error taxonomy used by the plugin orchestration
//! core. Uses `thiserror` for ergonomic error handling with automatic
//! `Display` and `Error` trait implementations.
//!
//! Plugin code itself never returns these errors: plugin operations report
//! failure through [`crate::plugins::PluginResult`]. `PluginError` is what the
//! core hands back to its own callers (the HTTP layer, the CLI, tests).

use std::time::Duration;

use thiserror::Error;

use crate::plugins::types::PluginState;

/// The primary error type for chatplug operations.
#[derive(Error, Debug)]
pub enum PluginError {
    /// A source could not produce a valid plugin (unknown factory, bad
    /// manifest, instantiation failure, no recognized capability).
    #[error("Plugin load error: {0}")]
    Load(String),

    /// A declared dependency is missing or not active.
    #[error("Dependency error: plugin '{plugin}' requires '{dependency}' ({reason})")]
    Dependency {
        plugin: String,
        dependency: String,
        reason: String,
    },

    /// An illegal lifecycle transition was requested.
    #[error("Illegal state transition for plugin '{plugin}': {from} -> {to}")]
    State {
        plugin: String,
        from: PluginState,
        to: PluginState,
    },

    /// A plugin call exceeded its time budget.
    #[error("Plugin '{plugin}' timed out after {}s", timeout.as_secs_f64())]
    Timeout { plugin: String, timeout: Duration },

    /// A plugin call returned `Fail` or panicked.
    #[error("Plugin '{plugin}' failed: {message}")]
    Execution { plugin: String, message: String },

    /// Configuration errors (invalid manager section, unreadable file, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Plugin, hook or factory not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A plugin with this name is already registered.
    #[error("Plugin already registered: {0}")]
    AlreadyRegistered(String),

    /// Manual retries for a failed plugin are used up.
    #[error("Plugin '{plugin}' exhausted its {max_retries} retries")]
    RetriesExhausted { plugin: String, max_retries: u32 },

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PluginError {
    /// Short machine-readable kind, recorded in `PluginResult` metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Load(_) => "load",
            Self::Dependency { .. } => "dependency",
            Self::State { .. } => "state",
            Self::Timeout { .. } => "timeout",
            Self::Execution { .. } => "execution",
            Self::Config(_) => "config",
            Self::NotFound(_) => "not_found",
            Self::AlreadyRegistered(_) => "already_registered",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}

/// A specialized `Result` type for chatplug operations.
pub type Result<T> = std::result::Result<T, PluginError>;
