//! Plugin orchestration for chatplug.
//!
//! A plugin is any [`Plugin`] implementation. It exposes one or more
//! capabilities (message processor, backend, extension, middleware) through
//! the `as_*` views on the trait. Plugins are produced by named factories
//! held in a [`PluginLoader`], optionally located through a `plugin.json`
//! manifest on disk.
//!
//! # Architecture
//!
//! - **types**: names, metadata, states, per-plugin config
//! - **result**: [`PluginResult`], the value every plugin call returns
//! - **traits**: the plugin trait and its capability traits
//! - **lifecycle**: the legal state transitions
//! - **isolation**: timeout and panic containment for plugin calls
//! - **loader**: factories, manifests and directory discovery
//! - **registry**: name and capability indexes over loaded plugins
//! - **deps**: dependency ordering for batch load and shutdown
//! - **manager**: [`PluginManager`], which ties the rest together with the
//!   hook system
//!
//! # Plugin Directory Structure
//!
//! ```text
//! ~/.chatplug/plugins/
//! ├── content-filter/
//! │   └── plugin.json
//! └── audit-log/
//!     └── plugin.json
//! ```
//!
//! A manifest names the factory that builds the plugin and may carry
//! default settings:
//!
//! ```json
//! {
//!   "name": "contentFilter",
//!   "factory": "content-filter",
//!   "settings": { "blocked_terms": ["secret"] }
//! }
//! ```

pub mod deps;
pub mod isolation;
pub mod lifecycle;
pub mod loader;
pub mod manager;
pub mod registry;
pub mod result;
pub mod traits;
pub mod types;

pub use isolation::isolate;
pub use lifecycle::{can_transition, is_valid_path, StateTransition};
pub use loader::{
    discover_sources, read_manifest, validate_manifest, DiscoveredPlugin, PluginFactory,
    PluginLoader, PluginManifest, PluginSource, MANIFEST_FILE,
};
pub use manager::{LoadFailure, LoadReport, PluginHealth, PluginManager};
pub use registry::{PluginRegistry, RegistryEntry};
pub use result::{PluginResult, ERROR_KIND_KEY};
pub use traits::{
    BackendProvider, CapabilityView, FeatureExtension, MessageProcessor, Middleware, Plugin,
};
pub use types::{
    is_valid_plugin_name, Capability, HealthStatus, PluginConfig, PluginMetadata, PluginState,
    PluginStatus,
};
