//! Plugin manager: the orchestration façade.
//!
//! Owns the [`PluginRegistry`], the [`PluginLoader`] and the
//! [`HookManager`]. Every lifecycle change goes through
//! [`PluginManager::transition`], which enforces the legal-transition table
//! and appends to a bounded transition log.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::ManagerConfig;
use crate::error::{PluginError, Result};
use crate::hooks::{
    callback, Clock, HookEvent, HookManager, HookMetricsSnapshot, HookSpec, PipelineOptions,
    PipelineOutcome, SystemClock,
};
use crate::session::ChatContext;

use super::deps::{dependency_order, DepNode};
use super::isolation::isolate;
use super::lifecycle::{can_transition, StateTransition};
use super::loader::{discover_sources, read_manifest, PluginLoader, PluginSource};
use super::registry::PluginRegistry;
use super::result::PluginResult;
use super::traits::{
    view, BackendProvider, CapabilityView, FeatureExtension, MessageProcessor, Middleware, Plugin,
};
use super::types::{Capability, HealthStatus, PluginConfig, PluginState, PluginStatus};

/// Transitions kept in memory; oldest are dropped first.
pub const TRANSITION_LOG_CAPACITY: usize = 1024;

/// One plugin that did not make it to `Active` during a batch load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadFailure {
    pub name: String,
    pub kind: &'static str,
    pub error: String,
}

/// Outcome of [`PluginManager::initialize`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadReport {
    /// Activated plugins, in activation order.
    pub loaded: Vec<String>,
    pub failed: Vec<LoadFailure>,
    /// Disabled in configuration.
    pub skipped: Vec<String>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failure(&self, name: &str) -> Option<&LoadFailure> {
        self.failed.iter().find(|f| f.name == name)
    }

    fn fail(&mut self, name: &str, err: &PluginError) {
        self.failed.push(LoadFailure {
            name: name.to_string(),
            kind: err.kind(),
            error: err.to_string(),
        });
    }
}

/// Health of one plugin as reported by [`PluginManager::health_check`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginHealth {
    pub name: String,
    pub state: PluginState,
    pub result: PluginResult<HealthStatus>,
}

pub struct PluginManager {
    config: ManagerConfig,
    registry: PluginRegistry,
    loader: PluginLoader,
    hooks: Arc<HookManager>,
    transitions: Mutex<VecDeque<StateTransition>>,
}

impl PluginManager {
    /// Build a manager from a validated config and a factory table.
    pub fn new(config: ManagerConfig, loader: PluginLoader) -> Self {
        Self::with_clock(config, loader, Arc::new(SystemClock))
    }

    /// Like [`PluginManager::new`], with breaker and rate-limit time taken
    /// from `clock`.
    pub fn with_clock(config: ManagerConfig, loader: PluginLoader, clock: Arc<dyn Clock>) -> Self {
        let hooks = Arc::new(HookManager::with_clock(config.hook_config(), clock));
        Self {
            config,
            registry: PluginRegistry::new(),
            loader,
            hooks,
            transitions: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    pub fn hooks(&self) -> &Arc<HookManager> {
        &self.hooks
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    pub fn state(&self, name: &str) -> Option<PluginState> {
        self.registry.state(name)
    }

    /// Move `name` to `to` if the lifecycle graph allows it.
    ///
    /// An illegal request returns `PluginError::State` and leaves the state
    /// unchanged.
    pub fn transition(&self, name: &str, to: PluginState) -> Result<()> {
        let from = self
            .registry
            .transition(name, to, |from| can_transition(from, to))?;
        self.log_transition(name, from, to);
        Ok(())
    }

    fn log_transition(&self, name: &str, from: PluginState, to: PluginState) {
        info!(plugin = name, from = %from, to = %to, "Plugin state changed");
        let mut log = self.transitions.lock().unwrap_or_else(|e| e.into_inner());
        if log.len() == TRANSITION_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(StateTransition::new(name, from, to));
    }

    /// Every recorded transition, oldest first.
    pub fn transition_log(&self) -> Vec<StateTransition> {
        let log = self.transitions.lock().unwrap_or_else(|e| e.into_inner());
        log.iter().cloned().collect()
    }

    pub fn transitions_for(&self, name: &str) -> Vec<StateTransition> {
        let log = self.transitions.lock().unwrap_or_else(|e| e.into_inner());
        log.iter().filter(|t| t.plugin == name).cloned().collect()
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Load every enabled plugin in `configs`, dependencies first.
    ///
    /// Never fails as a whole: each plugin that cannot be activated is
    /// recorded in the report and the rest carry on.
    pub async fn initialize(&self, configs: &[PluginConfig]) -> PluginResult<LoadReport> {
        let mut report = LoadReport::default();
        let mut candidates: Vec<(PluginConfig, Arc<dyn Plugin>)> = Vec::new();

        for config in configs {
            if !config.enabled {
                info!(plugin = %config.name, "Plugin disabled, skipping");
                report.skipped.push(config.name.clone());
                continue;
            }
            let source = PluginSource::parse(config.source_or_name());
            match self.instantiate(&source, config.clone()) {
                Ok(pair) => candidates.push(pair),
                Err(e) => {
                    error!(plugin = %config.name, error = %e, "Plugin failed to load");
                    report.fail(&config.name, &e);
                }
            }
        }

        let nodes: Vec<DepNode<'_>> = candidates
            .iter()
            .map(|(config, plugin)| DepNode {
                name: &config.name,
                priority: config.priority,
                dependencies: &plugin.metadata().dependencies,
            })
            .collect();
        let order = dependency_order(&nodes);

        for &i in &order.cyclic {
            let err = PluginError::Load(format!(
                "dependency cycle involving '{}'",
                candidates[i].0.name
            ));
            error!(plugin = %candidates[i].0.name, "Plugin is on a dependency cycle");
            report.fail(&candidates[i].0.name, &err);
        }
        for (i, blocker) in &order.blocked {
            let err = PluginError::Dependency {
                plugin: candidates[*i].0.name.clone(),
                dependency: blocker.clone(),
                reason: "dependency is on a cycle".to_string(),
            };
            report.fail(&candidates[*i].0.name, &err);
        }

        for &i in &order.order {
            let (config, plugin) = &candidates[i];
            match self.activate(Arc::clone(plugin), config.clone()).await {
                Ok(()) => report.loaded.push(config.name.clone()),
                Err(e) => {
                    error!(plugin = %config.name, error = %e, "Plugin failed to activate");
                    report.fail(&config.name, &e);
                }
            }
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Plugin initialization complete"
        );
        PluginResult::ok(report.clone())
            .with_metadata("loaded", Value::from(report.loaded.len()))
            .with_metadata("failed", Value::from(report.failed.len()))
    }

    /// Load one plugin: instantiate, validate, check dependencies, register,
    /// initialize and wire its hooks.
    ///
    /// # Errors
    /// - `PluginError::Config` if `config` is invalid
    /// - `PluginError::Load` if `source` cannot produce a valid plugin
    /// - `PluginError::Dependency` if a dependency is missing or not active
    /// - `PluginError::Execution` / `PluginError::Timeout` if initialization
    ///   fails; the plugin then stays registered in `Error`
    pub async fn load_plugin(&self, source: &PluginSource, config: PluginConfig) -> Result<()> {
        let (config, plugin) = self.instantiate(source, config)?;
        self.activate(plugin, config).await
    }

    fn instantiate(
        &self,
        source: &PluginSource,
        config: PluginConfig,
    ) -> Result<(PluginConfig, Arc<dyn Plugin>)> {
        config.validate()?;
        if self.registry.contains(&config.name) {
            return Err(PluginError::AlreadyRegistered(config.name));
        }
        let config = merge_manifest_settings(source, config)?;
        let plugin = self.loader.load_from_source(source, &config.name)?;
        Ok((config, plugin))
    }

    async fn activate(&self, plugin: Arc<dyn Plugin>, config: PluginConfig) -> Result<()> {
        self.check_dependencies(plugin.as_ref())?;

        let name = config.name.clone();
        self.registry
            .register(plugin, config, PluginState::Loaded)?;
        self.log_transition(&name, PluginState::Unloaded, PluginState::Loading);
        self.log_transition(&name, PluginState::Loading, PluginState::Loaded);

        self.initialize_registered(&name).await
    }

    /// Each dependency must be registered and `Active`.
    fn check_dependencies(&self, plugin: &dyn Plugin) -> Result<()> {
        let meta = plugin.metadata();
        for dep in &meta.dependencies {
            match self.registry.state(dep) {
                None => {
                    return Err(PluginError::Dependency {
                        plugin: meta.name.clone(),
                        dependency: dep.clone(),
                        reason: "not registered".to_string(),
                    })
                }
                Some(PluginState::Active) => {}
                Some(state) => {
                    return Err(PluginError::Dependency {
                        plugin: meta.name.clone(),
                        dependency: dep.clone(),
                        reason: format!("state is {}", state),
                    })
                }
            }
        }
        Ok(())
    }

    /// `Loaded|Error -> Initializing -> Active|Error`.
    async fn initialize_registered(&self, name: &str) -> Result<()> {
        let entry = self
            .registry
            .entry(name)
            .ok_or_else(|| PluginError::NotFound(format!("plugin '{}'", name)))?;
        self.transition(name, PluginState::Initializing)?;

        let timeout = entry.config.timeout();
        let result = isolate(name, timeout, entry.plugin.initialize(&entry.config)).await;

        if result.is_ok() {
            self.transition(name, PluginState::Active)?;
            self.registry.update(name, |e| {
                e.retries = 0;
                e.last_error = None;
            })?;
            for spec in hook_specs(&entry.plugin, &entry.config) {
                self.hooks.register(spec);
            }
            info!(
                plugin = name,
                elapsed_ms = result.elapsed().as_millis() as u64,
                "Plugin active"
            );
            return Ok(());
        }

        let err = init_error(name, timeout, &result);
        self.transition(name, PluginState::Error)?;
        let message = err.to_string();
        self.registry.update(name, |e| e.last_error = Some(message))?;
        warn!(plugin = name, error = %err, "Plugin initialization failed");
        Err(err)
    }

    /// Manually retry a plugin in `Error`, up to its `max_retries`.
    pub async fn retry_plugin(&self, name: &str) -> Result<()> {
        let entry = self
            .registry
            .entry(name)
            .ok_or_else(|| PluginError::NotFound(format!("plugin '{}'", name)))?;
        if entry.state != PluginState::Error {
            return Err(PluginError::State {
                plugin: name.to_string(),
                from: entry.state,
                to: PluginState::Initializing,
            });
        }
        if entry.retries >= entry.config.max_retries {
            return Err(PluginError::RetriesExhausted {
                plugin: name.to_string(),
                max_retries: entry.config.max_retries,
            });
        }
        self.check_dependencies(entry.plugin.as_ref())?;

        let attempt = self.registry.update(name, |e| {
            e.retries += 1;
            e.retries
        })?;
        info!(plugin = name, attempt = attempt, max = entry.config.max_retries, "Retrying plugin");
        self.initialize_registered(name).await
    }

    // ------------------------------------------------------------------
    // Unloading, pausing, reloading
    // ------------------------------------------------------------------

    /// `Active|Paused|Error -> Unloading -> Unloaded`, then drop it from the
    /// registry. A failing `shutdown` is logged and ignored.
    pub async fn unload_plugin(&self, name: &str) -> Result<()> {
        self.transition(name, PluginState::Unloading)?;

        let dependents: Vec<String> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|e| matches!(e.state, PluginState::Active | PluginState::Paused))
            .filter(|e| e.plugin.metadata().dependencies.iter().any(|d| d == name))
            .map(|e| e.name().to_string())
            .collect();
        if !dependents.is_empty() {
            warn!(plugin = name, dependents = ?dependents, "Unloading a plugin others depend on");
        }

        self.hooks.unregister_hooks(name);

        if let Some(entry) = self.registry.entry(name) {
            let result = isolate(name, entry.config.timeout(), entry.plugin.shutdown()).await;
            if let Some(err) = result.error() {
                warn!(plugin = name, error = err, "Plugin shutdown failed, unloading anyway");
            }
        }

        self.transition(name, PluginState::Unloaded)?;
        self.registry.unregister(name);
        Ok(())
    }

    /// `Active -> Paused`; the plugin's hooks stop firing.
    pub fn pause_plugin(&self, name: &str) -> Result<()> {
        self.transition(name, PluginState::Paused)?;
        self.hooks.set_plugin_enabled(name, false);
        Ok(())
    }

    /// `Paused -> Active`; the plugin's hooks fire again.
    pub fn resume_plugin(&self, name: &str) -> Result<()> {
        self.transition(name, PluginState::Active)?;
        self.hooks.set_plugin_enabled(name, true);
        Ok(())
    }

    /// Replace a running plugin with a fresh instance.
    ///
    /// The new instance is built and initialized first; only then are the
    /// registry entry and the hook registrations swapped. If anything fails
    /// before the swap the old instance keeps running. `config` defaults to
    /// the current one and `source` to the one the config names.
    pub async fn reload_plugin(
        &self,
        name: &str,
        source: Option<PluginSource>,
        config: Option<PluginConfig>,
    ) -> Result<()> {
        let entry = self
            .registry
            .entry(name)
            .ok_or_else(|| PluginError::NotFound(format!("plugin '{}'", name)))?;
        if !matches!(
            entry.state,
            PluginState::Active | PluginState::Paused | PluginState::Error
        ) {
            return Err(PluginError::State {
                plugin: name.to_string(),
                from: entry.state,
                to: PluginState::Initializing,
            });
        }

        let config = config.unwrap_or_else(|| entry.config.clone());
        config.validate()?;
        if config.name != name {
            return Err(PluginError::Config(format!(
                "reload of '{}' was given config for '{}'",
                name, config.name
            )));
        }
        let source = source.unwrap_or_else(|| PluginSource::parse(config.source_or_name()));
        let config = merge_manifest_settings(&source, config)?;
        let fresh = self.loader.load_from_source(&source, name)?;
        self.check_dependencies(fresh.as_ref())?;

        let timeout = config.timeout();
        let result = isolate(name, timeout, fresh.initialize(&config)).await;
        if result.is_fail() {
            let err = init_error(name, timeout, &result);
            warn!(plugin = name, error = %err, "Reload aborted, keeping current instance");
            return Err(err);
        }

        let specs = hook_specs(&fresh, &config);
        let old = self.registry.replace(name, fresh, config)?;
        self.hooks.replace_plugin_hooks(name, specs);

        match entry.state {
            PluginState::Paused => {
                self.hooks.set_plugin_enabled(name, false);
            }
            PluginState::Error => {
                self.transition(name, PluginState::Initializing)?;
                self.transition(name, PluginState::Active)?;
            }
            _ => {}
        }

        let shutdown = isolate(name, timeout, old.shutdown()).await;
        if let Some(err) = shutdown.error() {
            warn!(plugin = name, error = err, "Old instance shutdown failed after reload");
        }
        info!(plugin = name, "Plugin reloaded");
        Ok(())
    }

    /// Unload every plugin, dependents before their dependencies.
    /// Best-effort: failures are logged and the rest continue.
    pub async fn shutdown(&self) -> PluginResult<usize> {
        let entries = self.registry.snapshot();
        let nodes: Vec<DepNode<'_>> = entries
            .iter()
            .map(|e| DepNode {
                name: e.name(),
                priority: e.config.priority,
                dependencies: &e.plugin.metadata().dependencies,
            })
            .collect();
        let sorted = dependency_order(&nodes);
        let mut order: Vec<usize> = sorted.order;
        order.extend(sorted.cyclic);
        order.extend(sorted.blocked.into_iter().map(|(i, _)| i));

        let mut unloaded = 0;
        for &i in order.iter().rev() {
            let name = entries[i].name();
            match self.unload_plugin(name).await {
                Ok(()) => unloaded += 1,
                Err(e) => warn!(plugin = name, error = %e, "Failed to unload plugin during shutdown"),
            }
        }
        info!(unloaded = unloaded, "Plugin manager shut down");
        PluginResult::ok(unloaded)
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// `name` seen as `capability`, if it is registered, `Active` and
    /// exposes that capability.
    pub fn get_by_capability(&self, capability: Capability, name: &str) -> Option<CapabilityView> {
        let entry = self.registry.entry(name)?;
        if entry.state != PluginState::Active {
            return None;
        }
        view(&entry.plugin, capability)
    }

    pub fn backend(&self, name: &str) -> Option<Arc<dyn BackendProvider>> {
        self.get_by_capability(Capability::Backend, name)
            .and_then(CapabilityView::into_backend)
    }

    pub fn message_processor(&self, name: &str) -> Option<Arc<dyn MessageProcessor>> {
        self.get_by_capability(Capability::MessageProcessor, name)
            .and_then(CapabilityView::into_message_processor)
    }

    pub fn middleware(&self, name: &str) -> Option<Arc<dyn Middleware>> {
        self.get_by_capability(Capability::Middleware, name)
            .and_then(CapabilityView::into_middleware)
    }

    pub fn extension(&self, name: &str) -> Option<Arc<dyn FeatureExtension>> {
        self.get_by_capability(Capability::Extension, name)
            .and_then(CapabilityView::into_extension)
    }

    /// Names of `Active` plugins exposing `capability`, in registration
    /// order.
    pub fn active_with(&self, capability: Capability) -> Vec<String> {
        self.registry
            .names_by_type(capability)
            .into_iter()
            .filter(|n| self.registry.state(n) == Some(PluginState::Active))
            .collect()
    }

    // ------------------------------------------------------------------
    // Pipelines & monitoring
    // ------------------------------------------------------------------

    /// Run `event`'s hooks in the event's natural mode, best-effort.
    pub async fn run_pipeline(&self, event: &HookEvent, context: ChatContext) -> PipelineOutcome {
        self.hooks.run(event, context, PipelineOptions::default()).await
    }

    pub async fn run_pipeline_with(
        &self,
        event: &HookEvent,
        context: ChatContext,
        options: PipelineOptions,
    ) -> PipelineOutcome {
        self.hooks.run(event, context, options).await
    }

    pub fn metrics(&self, event: Option<&HookEvent>, plugin: Option<&str>) -> Vec<HookMetricsSnapshot> {
        self.hooks.metrics(event, plugin)
    }

    pub fn reset_circuit_breaker(&self, event: &HookEvent, plugin: &str) -> bool {
        self.hooks.reset_circuit_breaker(event, plugin)
    }

    /// Status of every registered plugin, in registration order.
    pub fn plugin_status(&self) -> Vec<PluginStatus> {
        self.registry
            .snapshot()
            .into_iter()
            .map(|e| {
                let meta = e.plugin.metadata();
                PluginStatus {
                    name: meta.name.clone(),
                    version: meta.version.clone(),
                    category: meta.category,
                    capabilities: e.capabilities.clone(),
                    state: e.state,
                    priority: e.config.priority,
                    dependencies: meta.dependencies.clone(),
                    retries: e.retries,
                    last_error: e.last_error.clone(),
                }
            })
            .collect()
    }

    /// Ask every running plugin for its health. Plugins that are not
    /// `Active` or `Paused` report a `Fail` naming their state.
    pub async fn health_check(&self) -> Vec<PluginHealth> {
        let mut out = Vec::new();
        for entry in self.registry.snapshot() {
            let name = entry.name().to_string();
            let result = match entry.state {
                PluginState::Active | PluginState::Paused => {
                    isolate(&name, entry.config.timeout(), entry.plugin.health_check()).await
                }
                other => PluginResult::fail(format!("plugin is {}", other)),
            };
            out.push(PluginHealth {
                name,
                state: entry.state,
                result,
            });
        }
        out
    }

    /// Configs for manifests found in the manager's plugin directories that
    /// `configured` does not already name.
    pub fn discovered_configs(&self, configured: &[PluginConfig]) -> Result<Vec<PluginConfig>> {
        let found = discover_sources(&self.config.plugin_dirs())?;
        Ok(found
            .into_iter()
            .filter(|d| !configured.iter().any(|c| c.name == d.manifest.name))
            .map(|d| {
                let mut config = PluginConfig::named(d.manifest.name.clone())
                    .with_source(d.path.display().to_string());
                config.environment = self.config.environment.clone();
                config
            })
            .collect())
    }
}

/// Manifest settings fill in keys the config section leaves unset.
fn merge_manifest_settings(source: &PluginSource, mut config: PluginConfig) -> Result<PluginConfig> {
    if let PluginSource::Manifest(path) = source {
        let manifest = read_manifest(path)?;
        for (key, value) in manifest.settings {
            config.settings.entry(key).or_insert(value);
        }
    }
    Ok(config)
}

fn init_error(name: &str, timeout: std::time::Duration, result: &PluginResult<()>) -> PluginError {
    match result.error_kind() {
        Some("timeout") => PluginError::Timeout {
            plugin: name.to_string(),
            timeout,
        },
        _ => PluginError::Execution {
            plugin: name.to_string(),
            message: result.error().unwrap_or("initialization failed").to_string(),
        },
    }
}

/// Hook registrations implied by a plugin's capabilities.
///
/// Message processors run on their declared events against the last
/// message; middleware wraps `before_request` / `after_response`;
/// extensions get every event they ask for. Priority, timeout and rate
/// limit come from the plugin's config.
fn hook_specs(plugin: &Arc<dyn Plugin>, config: &PluginConfig) -> Vec<HookSpec> {
    let name = config.name.as_str();
    let spec = |event: HookEvent, cb| {
        HookSpec::new(event, name, cb)
            .with_priority(config.priority)
            .with_timeout(config.timeout())
            .with_rate_limit(config.rate_limit)
    };
    let mut specs = Vec::new();

    if let Some(processor) = Arc::clone(plugin).as_message_processor() {
        for event in processor.events() {
            let processor = Arc::clone(&processor);
            specs.push(spec(
                event,
                callback(move |ctx: ChatContext| {
                    let processor = Arc::clone(&processor);
                    async move {
                        let Some(last) = ctx.last_message().cloned() else {
                            return PluginResult::ok(ctx);
                        };
                        let result = processor.process_message(last, &ctx).await;
                        result.map(|message| ctx.replace_last(message))
                    }
                }),
            ));
        }
    }

    if let Some(middleware) = Arc::clone(plugin).as_middleware() {
        let before = Arc::clone(&middleware);
        specs.push(spec(
            HookEvent::BeforeRequest,
            callback(move |ctx: ChatContext| {
                let before = Arc::clone(&before);
                async move {
                    let result = before.before_request(ctx.metadata().clone()).await;
                    result.map(|meta| ctx.with_metadata(meta))
                }
            }),
        ));
        specs.push(spec(
            HookEvent::AfterResponse,
            callback(move |ctx: ChatContext| {
                let after = Arc::clone(&middleware);
                async move {
                    let Some(last) = ctx.last_message().cloned() else {
                        return PluginResult::ok(ctx);
                    };
                    let result = after.after_response(ctx.metadata(), last).await;
                    result.map(|message| ctx.replace_last(message))
                }
            }),
        ));
    }

    if let Some(extension) = Arc::clone(plugin).as_extension() {
        for event in extension.hook_events() {
            let extension = Arc::clone(&extension);
            let bound = event.clone();
            specs.push(spec(
                event,
                callback(move |ctx: ChatContext| {
                    let extension = Arc::clone(&extension);
                    let event = bound.clone();
                    async move { extension.on_event(&event, ctx).await }
                }),
            ));
        }
    }

    specs
}
