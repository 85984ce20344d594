//! Running counters per hook registration.

use std::time::Duration;

use serde::Serialize;

use super::circuit::CircuitState;
use super::event::HookEvent;

/// Mutable counters for one `(event, plugin)` pair.
#[derive(Debug, Clone, Default)]
pub struct HookMetrics {
    calls: u64,
    failures: u64,
    rejected: u64,
    total_latency: Duration,
}

impl HookMetrics {
    /// A callback ran to completion (successfully or not).
    pub fn record_call(&mut self, elapsed: Duration, failed: bool) {
        self.calls += 1;
        if failed {
            self.failures += 1;
        }
        self.total_latency += elapsed;
    }

    /// A call was skipped by the breaker or the rate limit.
    pub fn record_rejected(&mut self) {
        self.rejected += 1;
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn average_latency(&self) -> Duration {
        if self.calls == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos((self.total_latency.as_nanos() / u128::from(self.calls)) as u64)
        }
    }
}

/// Read-only copy of a registration's counters and breaker state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookMetricsSnapshot {
    pub event: HookEvent,
    pub plugin: String,
    pub calls: u64,
    pub failures: u64,
    pub rejected: u64,
    pub average_latency_ms: f64,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
}

impl HookMetricsSnapshot {
    pub fn success_rate(&self) -> f64 {
        if self.calls == 0 {
            1.0
        } else {
            (self.calls - self.failures) as f64 / self.calls as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_latency() {
        let mut m = HookMetrics::default();
        assert_eq!(m.average_latency(), Duration::ZERO);
        m.record_call(Duration::from_millis(10), false);
        m.record_call(Duration::from_millis(30), true);
        assert_eq!(m.calls(), 2);
        assert_eq!(m.failures(), 1);
        assert_eq!(m.average_latency(), Duration::from_millis(20));
    }

    #[test]
    fn test_rejected_not_counted_as_call() {
        let mut m = HookMetrics::default();
        m.record_rejected();
        assert_eq!(m.calls(), 0);
        assert_eq!(m.rejected(), 1);
    }
}
