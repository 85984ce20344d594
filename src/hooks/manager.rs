//! Ordered hook dispatch with fault isolation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::plugins::isolation::isolate;
use crate::plugins::result::{PluginResult, ERROR_KIND_KEY};
use crate::session::ChatContext;

use super::circuit::{BreakerConfig, CircuitBreaker, CircuitState, Clock, Permit, SystemClock};
use super::event::HookEvent;
use super::metrics::{HookMetrics, HookMetricsSnapshot};
use super::rate_limit::RateWindow;

/// Error text of a call skipped by an open breaker.
pub const BREAKER_OPEN_ERROR: &str = "circuit breaker open";
/// Error text of a call skipped by the rate limit.
pub const RATE_LIMITED_ERROR: &str = "rate limit exceeded";

/// A hook body: takes the current context, returns the next one.
pub type HookCallback =
    Arc<dyn Fn(ChatContext) -> BoxFuture<'static, PluginResult<ChatContext>> + Send + Sync>;

/// Box an async closure into a [`HookCallback`].
pub fn callback<F, Fut>(f: F) -> HookCallback
where
    F: Fn(ChatContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = PluginResult<ChatContext>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

// ---------------------------------------------------------------------------
// Registrations
// ---------------------------------------------------------------------------

/// What a caller hands to [`HookManager::register`].
#[derive(Clone)]
pub struct HookSpec {
    pub event: HookEvent,
    pub plugin: String,
    pub callback: HookCallback,
    pub priority: i32,
    /// Falls back to the manager's default timeout.
    pub timeout: Option<Duration>,
    /// Calls per minute.
    pub rate_limit: Option<u32>,
    pub enabled: bool,
}

impl HookSpec {
    pub fn new(event: HookEvent, plugin: impl Into<String>, callback: HookCallback) -> Self {
        Self {
            event,
            plugin: plugin.into(),
            callback,
            priority: 100,
            timeout: None,
            rate_limit: None,
            enabled: true,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_rate_limit(mut self, per_minute: Option<u32>) -> Self {
        self.rate_limit = per_minute;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

impl std::fmt::Debug for HookSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookSpec")
            .field("event", &self.event)
            .field("plugin", &self.plugin)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("rate_limit", &self.rate_limit)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// A stored registration. Shared by reference with in-flight dispatches;
/// only the enabled flag changes after creation.
pub struct HookRegistration {
    event: HookEvent,
    plugin: String,
    callback: HookCallback,
    priority: i32,
    timeout: Duration,
    rate_limit: Option<u32>,
    seq: u64,
    enabled: AtomicBool,
}

impl HookRegistration {
    pub fn event(&self) -> &HookEvent {
        &self.event
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn rate_limit(&self) -> Option<u32> {
        self.rate_limit
    }

    /// Registration order; breaks priority ties.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for HookRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistration")
            .field("event", &self.event)
            .field("plugin", &self.plugin)
            .field("priority", &self.priority)
            .field("seq", &self.seq)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Breaker, counters and rate window of one `(event, plugin)` pair.
#[derive(Debug)]
struct HookSlot {
    breaker: CircuitBreaker,
    metrics: HookMetrics,
    rate: Option<RateWindow>,
}

impl HookSlot {
    fn new(config: BreakerConfig, event: &HookEvent, plugin: &str, rate_limit: Option<u32>) -> Self {
        Self {
            breaker: CircuitBreaker::new(config, format!("{}/{}", event, plugin)),
            metrics: HookMetrics::default(),
            rate: rate_limit.map(RateWindow::new),
        }
    }
}

type SlotKey = (HookEvent, String);

// ---------------------------------------------------------------------------
// Pipeline results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    /// Sequential; each stage's output is the next stage's input.
    Transform,
    /// Every stage sees the same input; stages may overlap.
    Notify,
}

impl PipelineMode {
    pub fn for_event(event: &HookEvent) -> Self {
        if event.is_transform() {
            Self::Transform
        } else {
            Self::Notify
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Stop at the first `Fail`.
    pub fail_fast: bool,
    /// Overrides the event's natural mode.
    pub mode: Option<PipelineMode>,
}

impl PipelineOptions {
    pub fn fail_fast() -> Self {
        Self {
            fail_fast: true,
            mode: None,
        }
    }
}

/// One stage's result, in dispatch order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookExecution {
    pub plugin: String,
    pub priority: i32,
    pub result: PluginResult<ChatContext>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineOutcome {
    pub event: HookEvent,
    pub mode: PipelineMode,
    /// Final context (transform) or the unchanged input (notify).
    pub context: ChatContext,
    pub executions: Vec<HookExecution>,
    /// A fail-fast run stopped early.
    pub halted: bool,
}

impl PipelineOutcome {
    /// Best-effort pipelines succeed unless fail-fast stopped them.
    pub fn success(&self) -> bool {
        !self.halted
    }

    pub fn plugins(&self) -> Vec<&str> {
        self.executions.iter().map(|e| e.plugin.as_str()).collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = &HookExecution> {
        self.executions.iter().filter(|e| e.result.is_fail())
    }

    /// Collapse into a single result: the final context, or the error that
    /// halted the pipeline.
    pub fn into_result(self) -> PluginResult<ChatContext> {
        let failures = self.failures().count();
        if self.halted {
            let error = self
                .executions
                .iter()
                .rev()
                .find_map(|e| e.result.error().map(|err| format!("{}: {}", e.plugin, err)))
                .unwrap_or_else(|| "pipeline halted".to_string());
            return PluginResult::fail(error).with_metadata("failures", Value::from(failures));
        }
        PluginResult::ok(self.context).with_metadata("failures", Value::from(failures))
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookManagerConfig {
    /// In-flight callbacks across every pipeline.
    pub max_concurrency: usize,
    pub default_timeout: Duration,
    pub breaker: BreakerConfig,
}

impl Default for HookManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            default_timeout: Duration::from_secs(30),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Per-event ordered registrations plus the fault state guarding them.
///
/// Lock order is `registrations` then `slots`; neither is held across an
/// `.await`.
pub struct HookManager {
    registrations: RwLock<HashMap<HookEvent, Vec<Arc<HookRegistration>>>>,
    slots: Mutex<HashMap<SlotKey, HookSlot>>,
    semaphore: Arc<Semaphore>,
    config: HookManagerConfig,
    clock: Arc<dyn Clock>,
    next_seq: AtomicU64,
}

impl HookManager {
    pub fn new(config: HookManagerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: HookManagerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            registrations: RwLock::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            config,
            clock,
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &HookManagerConfig {
        &self.config
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Register `callback` for `(event, plugin)` with default settings.
    pub fn register_hook(
        &self,
        event: HookEvent,
        plugin: &str,
        callback: HookCallback,
        priority: i32,
    ) -> Arc<HookRegistration> {
        self.register(HookSpec::new(event, plugin, callback).with_priority(priority))
    }

    /// Add or replace the registration for `(spec.event, spec.plugin)`.
    /// A replacement keeps the original registration order.
    pub fn register(&self, spec: HookSpec) -> Arc<HookRegistration> {
        let mut regs = self.registrations.write().unwrap_or_else(|e| e.into_inner());
        let registration = self.insert_locked(&mut regs, spec);
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        self.ensure_slot(&mut slots, &registration);
        debug!(
            event = %registration.event,
            plugin = %registration.plugin,
            priority = registration.priority,
            "Hook registered"
        );
        registration
    }

    /// Remove every registration owned by `plugin`, with its breakers and
    /// counters. Returns how many registrations were removed.
    pub fn unregister_hooks(&self, plugin: &str) -> usize {
        let mut regs = self.registrations.write().unwrap_or_else(|e| e.into_inner());
        let removed = Self::remove_locked(&mut regs, plugin);
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.retain(|(_, owner), _| owner != plugin);
        if removed > 0 {
            debug!(plugin = plugin, removed = removed, "Hooks unregistered");
        }
        removed
    }

    /// Swap all of `plugin`'s registrations for `specs` in one step.
    /// Breakers and counters start fresh.
    pub fn replace_plugin_hooks(&self, plugin: &str, specs: Vec<HookSpec>) -> usize {
        let mut regs = self.registrations.write().unwrap_or_else(|e| e.into_inner());
        Self::remove_locked(&mut regs, plugin);
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.retain(|(_, owner), _| owner != plugin);

        let mut count = 0;
        for spec in specs.into_iter().filter(|s| s.plugin == plugin) {
            let registration = self.insert_locked(&mut regs, spec);
            self.ensure_slot(&mut slots, &registration);
            count += 1;
        }
        info!(plugin = plugin, hooks = count, "Hooks replaced");
        count
    }

    /// Enable or disable every registration of `plugin`. Returns how many
    /// registrations were touched.
    pub fn set_plugin_enabled(&self, plugin: &str, enabled: bool) -> usize {
        let regs = self.registrations.read().unwrap_or_else(|e| e.into_inner());
        let mut touched = 0;
        for reg in regs.values().flatten().filter(|r| r.plugin == plugin) {
            reg.enabled.store(enabled, Ordering::Release);
            touched += 1;
        }
        touched
    }

    /// Snapshot of the registrations for `event`, in dispatch order.
    pub fn registrations(&self, event: &HookEvent) -> Vec<Arc<HookRegistration>> {
        let regs = self.registrations.read().unwrap_or_else(|e| e.into_inner());
        regs.get(event).cloned().unwrap_or_default()
    }

    pub fn hook_count(&self) -> usize {
        let regs = self.registrations.read().unwrap_or_else(|e| e.into_inner());
        regs.values().map(Vec::len).sum()
    }

    /// Events with at least one registration, sorted.
    pub fn events(&self) -> Vec<HookEvent> {
        let regs = self.registrations.read().unwrap_or_else(|e| e.into_inner());
        let mut events: Vec<HookEvent> = regs
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(event, _)| event.clone())
            .collect();
        events.sort();
        events
    }

    /// Run `event`'s hooks as a transform pipeline.
    pub async fn execute_hooks(
        &self,
        event: &HookEvent,
        context: ChatContext,
        fail_fast: bool,
    ) -> PipelineOutcome {
        self.run(
            event,
            context,
            PipelineOptions {
                fail_fast,
                mode: Some(PipelineMode::Transform),
            },
        )
        .await
    }

    /// Run `event`'s hooks as a notify pipeline.
    pub async fn notify(
        &self,
        event: &HookEvent,
        context: ChatContext,
        fail_fast: bool,
    ) -> PipelineOutcome {
        self.run(
            event,
            context,
            PipelineOptions {
                fail_fast,
                mode: Some(PipelineMode::Notify),
            },
        )
        .await
    }

    /// Run `event`'s hooks in the mode the options (or the event) select.
    pub async fn run(
        &self,
        event: &HookEvent,
        context: ChatContext,
        options: PipelineOptions,
    ) -> PipelineOutcome {
        let mode = options.mode.unwrap_or_else(|| PipelineMode::for_event(event));
        let snapshot: Vec<Arc<HookRegistration>> = self
            .registrations(event)
            .into_iter()
            .filter(|r| r.is_enabled())
            .collect();

        let (context, executions, halted) = match mode {
            PipelineMode::Transform => self.run_sequential(&snapshot, context, options.fail_fast, true).await,
            PipelineMode::Notify if options.fail_fast => {
                self.run_sequential(&snapshot, context, true, false).await
            }
            PipelineMode::Notify => {
                let executions = join_all(snapshot.iter().map(|reg| {
                    let input = context.clone();
                    async move {
                        let result = self.dispatch(reg, input).await;
                        HookExecution {
                            plugin: reg.plugin.clone(),
                            priority: reg.priority,
                            result,
                        }
                    }
                }))
                .await;
                (context, executions, false)
            }
        };

        PipelineOutcome {
            event: event.clone(),
            mode,
            context,
            executions,
            halted,
        }
    }

    async fn run_sequential(
        &self,
        snapshot: &[Arc<HookRegistration>],
        input: ChatContext,
        fail_fast: bool,
        chain: bool,
    ) -> (ChatContext, Vec<HookExecution>, bool) {
        let mut context = input;
        let mut executions = Vec::with_capacity(snapshot.len());
        for reg in snapshot {
            let result = self.dispatch(reg, context.clone()).await;
            let failed = result.is_fail();
            if chain {
                if let Some(next) = result.data() {
                    context = next.clone();
                }
            }
            executions.push(HookExecution {
                plugin: reg.plugin.clone(),
                priority: reg.priority,
                result,
            });
            if failed && fail_fast {
                return (context, executions, true);
            }
        }
        (context, executions, false)
    }

    /// Breaker check, rate check, semaphore, isolated call, bookkeeping.
    async fn dispatch(&self, reg: &HookRegistration, context: ChatContext) -> PluginResult<ChatContext> {
        let key: SlotKey = (reg.event.clone(), reg.plugin.clone());

        let permit = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            match slots.get_mut(&key) {
                Some(slot) => {
                    let permit = slot.breaker.try_acquire(self.clock.now());
                    if permit.is_rejected() {
                        slot.metrics.record_rejected();
                        debug!(event = %reg.event, plugin = %reg.plugin, "Hook skipped, circuit open");
                        return PluginResult::fail(BREAKER_OPEN_ERROR)
                            .with_metadata(ERROR_KIND_KEY, Value::from("circuit_open"));
                    }
                    if let Some(window) = slot.rate.as_mut() {
                        if !window.try_admit(self.clock.now()) {
                            if permit == Permit::Probe {
                                slot.breaker.abandon_probe();
                            }
                            slot.metrics.record_rejected();
                            debug!(event = %reg.event, plugin = %reg.plugin, "Hook skipped, rate limited");
                            return PluginResult::fail(RATE_LIMITED_ERROR)
                                .with_metadata(ERROR_KIND_KEY, Value::from("rate_limited"));
                        }
                    }
                    Some(permit)
                }
                // Unregistered after the snapshot was taken.
                None => None,
            }
        };

        // Dropping this future between here and the bookkeeping below must
        // not leave the breaker waiting on a probe that will never report.
        let mut probe = ProbeGuard {
            manager: self,
            key: &key,
            armed: permit == Some(Permit::Probe),
        };

        let gate = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(gate) => gate,
            Err(_) => return PluginResult::fail("hook manager closed"),
        };

        let cb = Arc::clone(&reg.callback);
        let result = isolate(&reg.plugin, reg.timeout, async move { cb(context).await }).await;
        drop(gate);

        let failed = result.is_fail();
        if failed {
            warn!(
                event = %reg.event,
                plugin = %reg.plugin,
                error = result.error().unwrap_or_default(),
                elapsed_ms = result.elapsed().as_millis() as u64,
                "Hook failed"
            );
        }
        if permit.is_some() {
            probe.disarm();
            let now = self.clock.now();
            let elapsed = result.elapsed();
            self.with_slot(&key, |slot| {
                if failed {
                    slot.breaker.record_failure(now);
                } else {
                    slot.breaker.record_success();
                }
                slot.metrics.record_call(elapsed, failed);
            });
        }
        result
    }

    fn with_slot(&self, key: &SlotKey, f: impl FnOnce(&mut HookSlot)) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get_mut(key) {
            f(slot);
        }
    }

    /// Counters for every registration matching the filters, sorted by
    /// event then plugin.
    pub fn metrics(&self, event: Option<&HookEvent>, plugin: Option<&str>) -> Vec<HookMetricsSnapshot> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<HookMetricsSnapshot> = slots
            .iter()
            .filter(|((ev, _), _)| event.map_or(true, |want| ev == want))
            .filter(|((_, owner), _)| plugin.map_or(true, |want| owner == want))
            .map(|((ev, owner), slot)| HookMetricsSnapshot {
                event: ev.clone(),
                plugin: owner.clone(),
                calls: slot.metrics.calls(),
                failures: slot.metrics.failures(),
                rejected: slot.metrics.rejected(),
                average_latency_ms: slot.metrics.average_latency().as_secs_f64() * 1000.0,
                circuit_state: slot.breaker.state(),
                consecutive_failures: slot.breaker.consecutive_failures(),
            })
            .collect();
        out.sort_by(|a, b| a.event.cmp(&b.event).then_with(|| a.plugin.cmp(&b.plugin)));
        out
    }

    pub fn breaker_state(&self, event: &HookEvent, plugin: &str) -> Option<CircuitState> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .get(&(event.clone(), plugin.to_string()))
            .map(|slot| slot.breaker.state())
    }

    /// Force the breaker for `(event, plugin)` closed. Returns `false` if
    /// there is no such registration.
    pub fn reset_circuit_breaker(&self, event: &HookEvent, plugin: &str) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        match slots.get_mut(&(event.clone(), plugin.to_string())) {
            Some(slot) => {
                slot.breaker.reset();
                info!(event = %event, plugin = plugin, "Circuit breaker reset");
                true
            }
            None => false,
        }
    }

    fn insert_locked(
        &self,
        regs: &mut HashMap<HookEvent, Vec<Arc<HookRegistration>>>,
        spec: HookSpec,
    ) -> Arc<HookRegistration> {
        let list = regs.entry(spec.event.clone()).or_default();
        let existing = list.iter().position(|r| r.plugin == spec.plugin);
        let seq = match existing {
            Some(idx) => list.remove(idx).seq,
            None => self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let registration = Arc::new(HookRegistration {
            event: spec.event,
            plugin: spec.plugin,
            callback: spec.callback,
            priority: spec.priority,
            timeout: spec.timeout.unwrap_or(self.config.default_timeout),
            rate_limit: spec.rate_limit,
            seq,
            enabled: AtomicBool::new(spec.enabled),
        });
        list.push(Arc::clone(&registration));
        list.sort_by_key(|r| (r.priority, r.seq));
        registration
    }

    fn remove_locked(regs: &mut HashMap<HookEvent, Vec<Arc<HookRegistration>>>, plugin: &str) -> usize {
        let mut removed = 0;
        for list in regs.values_mut() {
            let before = list.len();
            list.retain(|r| r.plugin != plugin);
            removed += before - list.len();
        }
        regs.retain(|_, list| !list.is_empty());
        removed
    }

    fn ensure_slot(&self, slots: &mut HashMap<SlotKey, HookSlot>, reg: &HookRegistration) {
        let key = (reg.event.clone(), reg.plugin.clone());
        let slot = slots
            .entry(key)
            .or_insert_with(|| HookSlot::new(self.config.breaker, &reg.event, &reg.plugin, reg.rate_limit));
        let current = slot.rate.as_ref().map(RateWindow::per_minute);
        if current != reg.rate_limit {
            slot.rate = reg.rate_limit.map(RateWindow::new);
        }
    }
}

/// Returns an in-flight half-open probe to its breaker when dropped armed.
struct ProbeGuard<'a> {
    manager: &'a HookManager,
    key: &'a SlotKey,
    armed: bool,
}

impl ProbeGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(event = %self.key.0, plugin = %self.key.1, "Probe cancelled");
            self.manager.with_slot(self.key, |slot| slot.breaker.abandon_probe());
        }
    }
}

impl Default for HookManager {
    fn default() -> Self {
        Self::new(HookManagerConfig::default())
    }
}
