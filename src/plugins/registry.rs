//! Plugin registry for chatplug
//!
//! This module provides the `PluginRegistry` struct, the single owner of
//! every loaded plugin instance and its lifecycle state. It maintains a
//! capability index so lookups by type do not scan the whole table.
//!
//! The registry stores whatever state it is told to; checking that a
//! transition is legal is the manager's job.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::{PluginError, Result};

use super::traits::{capabilities_of, Plugin};
use super::types::{Capability, PluginConfig, PluginState};

/// Everything the registry knows about one plugin.
#[derive(Clone)]
pub struct RegistryEntry {
    pub plugin: Arc<dyn Plugin>,
    pub config: PluginConfig,
    pub state: PluginState,
    /// Capability views the instance exposed when it was registered.
    pub capabilities: Vec<Capability>,
    /// Manual retries used since the last successful initialization.
    pub retries: u32,
    pub last_error: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl RegistryEntry {
    pub fn name(&self) -> &str {
        &self.plugin.metadata().name
    }
}

impl std::fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("name", &self.name())
            .field("state", &self.state)
            .field("capabilities", &self.capabilities)
            .field("retries", &self.retries)
            .field("last_error", &self.last_error)
            .finish()
    }
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<String, RegistryEntry>,
    /// Capability -> plugin names, in registration order.
    by_type: HashMap<Capability, Vec<String>>,
    /// Plugin names in registration order.
    order: Vec<String>,
}

impl RegistryInner {
    fn index(&mut self, name: &str, capabilities: &[Capability]) {
        for cap in capabilities {
            let names = self.by_type.entry(*cap).or_default();
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }

    fn unindex(&mut self, name: &str) {
        for names in self.by_type.values_mut() {
            names.retain(|n| n != name);
        }
        self.by_type.retain(|_, names| !names.is_empty());
    }
}

/// Name -> instance, config and state, with a capability index.
///
/// Readers run concurrently; `register`, `unregister`, `replace`,
/// `set_state` and `transition` take the write lock.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use async_trait::async_trait;
/// use chatplug::plugins::{
///     BackendProvider, Capability, Plugin, PluginConfig, PluginMetadata, PluginRegistry,
///     PluginResult, PluginState,
/// };
/// use chatplug::session::{ChatContext, Message};
///
/// struct Echo(PluginMetadata);
///
/// #[async_trait]
/// impl Plugin for Echo {
///     fn metadata(&self) -> &PluginMetadata { &self.0 }
///     async fn initialize(&self, _: &PluginConfig) -> PluginResult<()> { PluginResult::ok(()) }
///     fn as_backend(self: Arc<Self>) -> Option<Arc<dyn BackendProvider>> { Some(self) }
/// }
///
/// #[async_trait]
/// impl BackendProvider for Echo {
///     async fn chat(&self, _: &ChatContext) -> PluginResult<Message> {
///         PluginResult::ok(Message::assistant("echo"))
///     }
///     async fn list_models(&self) -> PluginResult<Vec<String>> { PluginResult::ok(vec![]) }
/// }
///
/// let registry = PluginRegistry::new();
/// let plugin = Arc::new(Echo(PluginMetadata::new("echo", "1.0.0", Capability::Backend)));
/// registry
///     .register(plugin, PluginConfig::named("echo"), PluginState::Loaded)
///     .unwrap();
///
/// assert_eq!(registry.len(), 1);
/// assert_eq!(registry.get_by_type(Capability::Backend).len(), 1);
/// assert_eq!(registry.state("echo"), Some(PluginState::Loaded));
/// ```
#[derive(Default)]
pub struct PluginRegistry {
    inner: RwLock<RegistryInner>,
}

impl PluginRegistry {
    /// Create a new empty plugin registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a plugin under its metadata name.
    ///
    /// # Arguments
    /// * `plugin` - The instance to store
    /// * `config` - Its validated configuration
    /// * `state` - Initial lifecycle state
    ///
    /// # Returns
    /// `PluginError::AlreadyRegistered` if the name is taken; the registry
    /// is then unchanged.
    pub fn register(
        &self,
        plugin: Arc<dyn Plugin>,
        config: PluginConfig,
        state: PluginState,
    ) -> Result<()> {
        let name = plugin.metadata().name.clone();
        let capabilities = capabilities_of(&plugin);

        let mut inner = self.write();
        if inner.entries.contains_key(&name) {
            return Err(PluginError::AlreadyRegistered(name));
        }

        inner.index(&name, &capabilities);
        inner.order.push(name.clone());
        info!(
            plugin = %name,
            version = %plugin.metadata().version,
            capabilities = ?capabilities,
            "Registered plugin"
        );
        inner.entries.insert(
            name,
            RegistryEntry {
                plugin,
                config,
                state,
                capabilities,
                retries: 0,
                last_error: None,
                registered_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Get a plugin instance by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.read().entries.get(name).map(|e| Arc::clone(&e.plugin))
    }

    /// Copy of the full entry for `name`.
    pub fn entry(&self, name: &str) -> Option<RegistryEntry> {
        self.read().entries.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().entries.contains_key(name)
    }

    /// Every plugin exposing `capability`, in registration order.
    pub fn get_by_type(&self, capability: Capability) -> Vec<Arc<dyn Plugin>> {
        let inner = self.read();
        inner
            .by_type
            .get(&capability)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| inner.entries.get(n))
                    .map(|e| Arc::clone(&e.plugin))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn names_by_type(&self, capability: Capability) -> Vec<String> {
        self.read()
            .by_type
            .get(&capability)
            .cloned()
            .unwrap_or_default()
    }

    pub fn state(&self, name: &str) -> Option<PluginState> {
        self.read().entries.get(name).map(|e| e.state)
    }

    /// Store `state` for `name`, returning the previous state.
    pub fn set_state(&self, name: &str, state: PluginState) -> Result<PluginState> {
        let mut inner = self.write();
        let entry = inner
            .entries
            .get_mut(name)
            .ok_or_else(|| PluginError::NotFound(format!("plugin '{}'", name)))?;
        let previous = std::mem::replace(&mut entry.state, state);
        debug!(plugin = name, from = %previous, to = %state, "State stored");
        Ok(previous)
    }

    /// Store `to` for `name` if `allowed(current)` holds, checking and
    /// writing under one write guard. Returns the state that was replaced.
    pub fn transition(
        &self,
        name: &str,
        to: PluginState,
        allowed: impl FnOnce(PluginState) -> bool,
    ) -> Result<PluginState> {
        let mut inner = self.write();
        let entry = inner
            .entries
            .get_mut(name)
            .ok_or_else(|| PluginError::NotFound(format!("plugin '{}'", name)))?;
        let from = entry.state;
        if !allowed(from) {
            return Err(PluginError::State {
                plugin: name.to_string(),
                from,
                to,
            });
        }
        entry.state = to;
        Ok(from)
    }

    pub fn config(&self, name: &str) -> Option<PluginConfig> {
        self.read().entries.get(name).map(|e| e.config.clone())
    }

    /// Apply `f` to the entry for `name` under the write lock.
    pub fn update<R>(&self, name: &str, f: impl FnOnce(&mut RegistryEntry) -> R) -> Result<R> {
        let mut inner = self.write();
        let entry = inner
            .entries
            .get_mut(name)
            .ok_or_else(|| PluginError::NotFound(format!("plugin '{}'", name)))?;
        Ok(f(entry))
    }

    /// Swap the instance and config behind `name`, keeping its position,
    /// state and counters. Returns the old instance.
    pub fn replace(
        &self,
        name: &str,
        plugin: Arc<dyn Plugin>,
        config: PluginConfig,
    ) -> Result<Arc<dyn Plugin>> {
        let capabilities = capabilities_of(&plugin);
        let mut inner = self.write();
        let entry = inner
            .entries
            .get_mut(name)
            .ok_or_else(|| PluginError::NotFound(format!("plugin '{}'", name)))?;
        let old = std::mem::replace(&mut entry.plugin, plugin);
        entry.config = config;
        entry.capabilities = capabilities.clone();
        entry.retries = 0;
        entry.last_error = None;

        inner.unindex(name);
        inner.index(name, &capabilities);
        info!(plugin = name, "Replaced plugin instance");
        Ok(old)
    }

    /// Remove `name` entirely. Returns the removed entry, if any.
    pub fn unregister(&self, name: &str) -> Option<RegistryEntry> {
        let mut inner = self.write();
        let entry = inner.entries.remove(name)?;
        inner.unindex(name);
        inner.order.retain(|n| n != name);
        info!(plugin = name, "Unregistered plugin");
        Some(entry)
    }

    /// Plugin names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.read().order.clone()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Copies of every entry, in registration order.
    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        let inner = self.read();
        inner
            .order
            .iter()
            .filter_map(|n| inner.entries.get(n).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::result::PluginResult;
    use crate::plugins::traits::{BackendProvider, Middleware};
    use crate::plugins::types::PluginMetadata;
    use crate::session::{ChatContext, Message, Metadata};
    use async_trait::async_trait;

    struct TestBackend {
        meta: PluginMetadata,
    }

    #[async_trait]
    impl Plugin for TestBackend {
        fn metadata(&self) -> &PluginMetadata {
            &self.meta
        }

        async fn initialize(&self, _config: &PluginConfig) -> PluginResult<()> {
            PluginResult::ok(())
        }

        fn as_backend(self: Arc<Self>) -> Option<Arc<dyn BackendProvider>> {
            Some(self)
        }
    }

    #[async_trait]
    impl BackendProvider for TestBackend {
        async fn chat(&self, _context: &ChatContext) -> PluginResult<Message> {
            PluginResult::ok(Message::assistant(self.meta.version.clone()))
        }

        async fn list_models(&self) -> PluginResult<Vec<String>> {
            PluginResult::ok(vec![])
        }
    }

    struct TestMiddleware {
        meta: PluginMetadata,
    }

    #[async_trait]
    impl Plugin for TestMiddleware {
        fn metadata(&self) -> &PluginMetadata {
            &self.meta
        }

        async fn initialize(&self, _config: &PluginConfig) -> PluginResult<()> {
            PluginResult::ok(())
        }

        fn as_middleware(self: Arc<Self>) -> Option<Arc<dyn Middleware>> {
            Some(self)
        }
    }

    #[async_trait]
    impl Middleware for TestMiddleware {
        async fn before_request(&self, request: Metadata) -> PluginResult<Metadata> {
            PluginResult::ok(request)
        }

        async fn after_response(
            &self,
            _request: &Metadata,
            response: Message,
        ) -> PluginResult<Message> {
            PluginResult::ok(response)
        }
    }

    fn backend(name: &str, version: &str) -> Arc<dyn Plugin> {
        Arc::new(TestBackend {
            meta: PluginMetadata::new(name, version, Capability::Backend),
        })
    }

    fn middleware(name: &str) -> Arc<dyn Plugin> {
        Arc::new(TestMiddleware {
            meta: PluginMetadata::new(name, "1.0.0", Capability::Middleware),
        })
    }

    #[test]
    fn test_registry_new_is_empty() {
        let registry = PluginRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.names().is_empty());
        assert!(registry.get_by_type(Capability::Backend).is_empty());
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = PluginRegistry::new();
        registry
            .register(backend("echo", "1.0.0"), PluginConfig::named("echo"), PluginState::Loaded)
            .unwrap();

        assert!(registry.contains("echo"));
        assert_eq!(registry.get("echo").unwrap().metadata().name, "echo");
        assert_eq!(registry.state("echo"), Some(PluginState::Loaded));
        assert_eq!(registry.config("echo").unwrap().name, "echo");
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_duplicate_rejected() {
        let registry = PluginRegistry::new();
        registry
            .register(backend("echo", "1.0.0"), PluginConfig::named("echo"), PluginState::Loaded)
            .unwrap();
        let err = registry
            .register(backend("echo", "2.0.0"), PluginConfig::named("echo"), PluginState::Loaded)
            .unwrap_err();
        assert!(matches!(err, PluginError::AlreadyRegistered(ref n) if n == "echo"));
        assert_eq!(registry.get("echo").unwrap().metadata().version, "1.0.0");
    }

    #[test]
    fn test_type_index_maintained() {
        let registry = PluginRegistry::new();
        registry
            .register(backend("b1", "1.0.0"), PluginConfig::named("b1"), PluginState::Active)
            .unwrap();
        registry
            .register(middleware("m1"), PluginConfig::named("m1"), PluginState::Active)
            .unwrap();
        registry
            .register(backend("b2", "1.0.0"), PluginConfig::named("b2"), PluginState::Active)
            .unwrap();

        assert_eq!(registry.names_by_type(Capability::Backend), vec!["b1", "b2"]);
        assert_eq!(registry.names_by_type(Capability::Middleware), vec!["m1"]);

        registry.unregister("b1").unwrap();
        assert_eq!(registry.names_by_type(Capability::Backend), vec!["b2"]);
        assert!(registry.get("b1").is_none());
        assert_eq!(registry.names(), vec!["m1", "b2"]);
    }

    #[test]
    fn test_set_state_returns_previous() {
        let registry = PluginRegistry::new();
        registry
            .register(backend("echo", "1.0.0"), PluginConfig::named("echo"), PluginState::Loaded)
            .unwrap();
        let prev = registry.set_state("echo", PluginState::Initializing).unwrap();
        assert_eq!(prev, PluginState::Loaded);
        assert_eq!(registry.state("echo"), Some(PluginState::Initializing));
        assert!(matches!(
            registry.set_state("ghost", PluginState::Active),
            Err(PluginError::NotFound(_))
        ));
    }

    #[test]
    fn test_transition_checks_and_writes_together() {
        let registry = PluginRegistry::new();
        registry
            .register(backend("echo", "1.0.0"), PluginConfig::named("echo"), PluginState::Active)
            .unwrap();

        let from = registry
            .transition("echo", PluginState::Paused, |s| s == PluginState::Active)
            .unwrap();
        assert_eq!(from, PluginState::Active);

        let err = registry
            .transition("echo", PluginState::Paused, |s| s == PluginState::Active)
            .unwrap_err();
        assert!(matches!(err, PluginError::State { from: PluginState::Paused, .. }));
        assert_eq!(registry.state("echo"), Some(PluginState::Paused));
        assert!(matches!(
            registry.transition("ghost", PluginState::Active, |_| true),
            Err(PluginError::NotFound(_))
        ));
    }

    #[test]
    fn test_replace_keeps_position_and_state() {
        let registry = PluginRegistry::new();
        registry
            .register(backend("a", "1.0.0"), PluginConfig::named("a"), PluginState::Active)
            .unwrap();
        registry
            .register(backend("echo", "1.0.0"), PluginConfig::named("echo"), PluginState::Active)
            .unwrap();
        registry
            .update("echo", |e| {
                e.retries = 2;
                e.last_error = Some("x".into());
            })
            .unwrap();

        let old = registry
            .replace("echo", backend("echo", "2.0.0"), PluginConfig::named("echo").with_priority(5))
            .unwrap();
        assert_eq!(old.metadata().version, "1.0.0");

        let entry = registry.entry("echo").unwrap();
        assert_eq!(entry.plugin.metadata().version, "2.0.0");
        assert_eq!(entry.config.priority, 5);
        assert_eq!(entry.state, PluginState::Active);
        assert_eq!(entry.retries, 0);
        assert!(entry.last_error.is_none());
        assert_eq!(registry.names(), vec!["a", "echo"]);
    }

    #[test]
    fn test_snapshot_in_registration_order() {
        let registry = PluginRegistry::new();
        for name in ["z", "a", "m"] {
            registry
                .register(backend(name, "1.0.0"), PluginConfig::named(name), PluginState::Loaded)
                .unwrap();
        }
        let names: Vec<String> = registry
            .snapshot()
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        assert_eq!(names, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_concurrent_readers() {
        let registry = Arc::new(PluginRegistry::new());
        registry
            .register(backend("echo", "1.0.0"), PluginConfig::named("echo"), PluginState::Active)
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.get_by_type(Capability::Backend).len())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 1);
        }
    }
}
