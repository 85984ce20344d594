//! chatplug - plugin orchestration core for chat applications
//!
//! Loads plugins from a factory table and on-disk manifests, drives them
//! through a checked lifecycle, and runs their hooks in priority order
//! with per-hook timeouts, rate limits and circuit breakers.

pub mod builtin;
pub mod config;
pub mod error;
pub mod hooks;
pub mod plugins;
pub mod session;
pub mod utils;

pub use config::{ConfigLoader, LoadedConfig, ManagerConfig};
pub use error::{PluginError, Result};
pub use plugins::PluginManager;
