//! Per-hook circuit breaker.
//!
//! Each `(event, plugin)` pair gets its own breaker. After
//! `failure_threshold` consecutive failures the breaker opens and the hook is
//! skipped. Once `cooldown_secs` have passed since the last failure, exactly
//! one probe call is let through (half-open): success closes the breaker,
//! failure re-opens it.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Time source for breaker cooldowns and rate windows.
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The monotonic system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Breaker tuning shared by every hook of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    #[serde(alias = "failureThreshold", deserialize_with = "crate::utils::lenient::from_str_or_value")]
    pub failure_threshold: u32,
    /// Seconds after the last failure before a probe is allowed.
    #[serde(alias = "cooldownSecs", alias = "resetTimeout", deserialize_with = "crate::utils::lenient::from_str_or_value")]
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 60,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

// ---------------------------------------------------------------------------
// Breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

/// Outcome of asking the breaker for permission to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Closed: call normally.
    Allowed,
    /// Half-open: this call is the single probe.
    Probe,
    /// Open (or a probe is already in flight): skip the call.
    Rejected,
}

impl Permit {
    pub fn is_rejected(self) -> bool {
        self == Self::Rejected
    }
}

/// Point-in-time view of a breaker, for status and telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
    label: String,
}

impl CircuitBreaker {
    /// `label` identifies the guarded hook in log output.
    pub fn new(config: BreakerConfig, label: impl Into<String>) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            probe_in_flight: false,
            label: label.into(),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
        }
    }

    pub fn try_acquire(&mut self, now: Instant) -> Permit {
        match self.state {
            CircuitState::Closed => Permit::Allowed,
            CircuitState::Open => {
                let cooled = self
                    .last_failure
                    .map(|at| now.saturating_duration_since(at) >= self.config.cooldown())
                    .unwrap_or(true);
                if !cooled {
                    return Permit::Rejected;
                }
                info!(hook = %self.label, "Circuit half-open, probing");
                self.state = CircuitState::HalfOpen;
                self.probe_in_flight = true;
                Permit::Probe
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    Permit::Rejected
                } else {
                    self.probe_in_flight = true;
                    Permit::Probe
                }
            }
        }
    }

    /// Give back a probe whose call never reported (skipped or cancelled).
    pub fn abandon_probe(&mut self) {
        self.probe_in_flight = false;
    }

    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            info!(
                hook = %self.label,
                previous_failures = self.consecutive_failures,
                "Circuit closed"
            );
        }
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.probe_in_flight = false;
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(now);
        self.probe_in_flight = false;

        match self.state {
            CircuitState::HalfOpen => {
                warn!(hook = %self.label, "Probe failed, circuit re-opened");
                self.state = CircuitState::Open;
            }
            CircuitState::Closed if self.consecutive_failures >= self.config.failure_threshold => {
                warn!(
                    hook = %self.label,
                    failures = self.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    "Circuit opened"
                );
                self.state = CircuitState::Open;
            }
            _ => {}
        }
    }

    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.last_failure = None;
        self.probe_in_flight = false;
    }
}
