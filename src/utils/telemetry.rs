//! Telemetry exporter for hook metrics.
//!
//! Renders [`HookMetricsSnapshot`]s in Prometheus text exposition format or
//! JSON. Rendering only; serving the text is up to the caller.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::hooks::{CircuitState, HookMetricsSnapshot};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Telemetry output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryFormat {
    #[default]
    Prometheus,
    Json,
}

impl FromStr for TelemetryFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prometheus" | "prom" => Ok(Self::Prometheus),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown telemetry format '{}'", other)),
        }
    }
}

/// Telemetry configuration (the `manager.telemetry` section).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Whether telemetry export is enabled.
    #[serde(deserialize_with = "crate::utils::lenient::from_str_or_value")]
    pub enabled: bool,
    /// Output format (prometheus or json).
    pub format: TelemetryFormat,
    /// HTTP endpoint path for serving metrics.
    pub endpoint: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            format: TelemetryFormat::default(),
            endpoint: "/metrics".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Renderers
// ---------------------------------------------------------------------------

/// Dispatches to the correct renderer based on the configured format.
pub fn render(snapshots: &[HookMetricsSnapshot], format: TelemetryFormat) -> String {
    match format {
        TelemetryFormat::Prometheus => render_prometheus(snapshots),
        TelemetryFormat::Json => render_json(snapshots),
    }
}

fn circuit_gauge(state: CircuitState) -> u8 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::HalfOpen => 1,
        CircuitState::Open => 2,
    }
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Renders all metrics in Prometheus text exposition format.
///
/// Metric families emitted, each labelled by `event` and `plugin`:
/// - `chatplug_hook_calls_total` (counter)
/// - `chatplug_hook_failures_total` (counter)
/// - `chatplug_hook_rejected_total` (counter)
/// - `chatplug_hook_latency_ms_avg` (gauge)
/// - `chatplug_hook_circuit_state` (gauge: 0 closed, 1 half-open, 2 open)
pub fn render_prometheus(snapshots: &[HookMetricsSnapshot]) -> String {
    type Family = (&'static str, &'static str, &'static str, fn(&HookMetricsSnapshot) -> String);
    let families: [Family; 5] = [
        (
            "chatplug_hook_calls_total",
            "Total number of hook invocations.",
            "counter",
            |m| m.calls.to_string(),
        ),
        (
            "chatplug_hook_failures_total",
            "Total number of failed hook invocations.",
            "counter",
            |m| m.failures.to_string(),
        ),
        (
            "chatplug_hook_rejected_total",
            "Invocations rejected by the circuit breaker or rate limit.",
            "counter",
            |m| m.rejected.to_string(),
        ),
        (
            "chatplug_hook_latency_ms_avg",
            "Average hook latency in milliseconds.",
            "gauge",
            |m| format!("{:.3}", m.average_latency_ms),
        ),
        (
            "chatplug_hook_circuit_state",
            "Circuit breaker state (0 closed, 1 half-open, 2 open).",
            "gauge",
            |m| circuit_gauge(m.circuit_state).to_string(),
        ),
    ];

    // Deterministic ordering by (event, plugin).
    let rows: BTreeMap<(String, &str), &HookMetricsSnapshot> = snapshots
        .iter()
        .map(|m| ((m.event.to_string(), m.plugin.as_str()), m))
        .collect();

    let mut out = String::new();
    for (name, help, kind, value) in families {
        out.push_str(&format!("# HELP {} {}\n", name, help));
        out.push_str(&format!("# TYPE {} {}\n", name, kind));
        for ((event, plugin), m) in &rows {
            out.push_str(&format!(
                "{}{{event=\"{}\",plugin=\"{}\"}} {}\n",
                name,
                escape_label(event),
                escape_label(plugin),
                value(*m),
            ));
        }
    }
    out
}

/// Renders all metrics as a JSON string.
///
/// The output structure:
/// ```json
/// {
///   "hooks": {
///     "before_message": {
///       "contentFilter": {
///         "calls": 5,
///         "failures": 1,
///         "rejected": 0,
///         "success_rate": 0.8,
///         "average_latency_ms": 1.5,
///         "circuit_state": "closed",
///         "consecutive_failures": 0
///       }
///     }
///   },
///   "totals": { "calls": 5, "failures": 1, "rejected": 0 }
/// }
/// ```
pub fn render_json(snapshots: &[HookMetricsSnapshot]) -> String {
    let mut hooks: BTreeMap<String, BTreeMap<String, serde_json::Value>> = BTreeMap::new();
    let (mut calls, mut failures, mut rejected) = (0u64, 0u64, 0u64);

    for m in snapshots {
        calls += m.calls;
        failures += m.failures;
        rejected += m.rejected;
        hooks.entry(m.event.to_string()).or_default().insert(
            m.plugin.clone(),
            serde_json::json!({
                "calls": m.calls,
                "failures": m.failures,
                "rejected": m.rejected,
                "success_rate": m.success_rate(),
                "average_latency_ms": m.average_latency_ms,
                "circuit_state": m.circuit_state.to_string(),
                "consecutive_failures": m.consecutive_failures,
            }),
        );
    }

    let root = serde_json::json!({
        "hooks": hooks,
        "totals": { "calls": calls, "failures": failures, "rejected": rejected },
    });

    serde_json::to_string_pretty(&root).expect("metrics JSON serialization should never fail")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
