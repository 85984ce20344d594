//! Sliding one-minute call window for rate-limited hooks.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// Admits at most `per_minute` calls in any trailing 60 seconds.
#[derive(Debug, Clone)]
pub struct RateWindow {
    per_minute: u32,
    calls: VecDeque<Instant>,
}

impl RateWindow {
    pub fn new(per_minute: u32) -> Self {
        Self {
            per_minute,
            calls: VecDeque::with_capacity(per_minute.min(1024) as usize),
        }
    }

    pub fn per_minute(&self) -> u32 {
        self.per_minute
    }

    /// Record a call at `now` if the window has room. Returns `false` when
    /// the limit is reached; the rejected call is not counted.
    pub fn try_admit(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.calls.front() {
            if now.saturating_duration_since(*oldest) >= WINDOW {
                self.calls.pop_front();
            } else {
                break;
            }
        }
        if self.calls.len() >= self.per_minute as usize {
            return false;
        }
        self.calls.push_back(now);
        true
    }
}
