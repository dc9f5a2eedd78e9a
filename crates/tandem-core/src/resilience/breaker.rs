//! Per-endpoint circuit breaker.
//!
//! State machine: Closed → Open → HalfOpen
//! - `failure_threshold` consecutive failures trip the breaker Open
//! - Open rejects immediately until `cool_down` has elapsed
//! - HalfOpen admits a single trial; success closes, failure re-opens
//!
//! Time comes from `tokio::time::Instant` so paused-clock tests can drive
//! the cool-down deterministically.

use crate::config::BreakerConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub trips: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    cool_down: Duration,
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// A HalfOpen trial has been admitted and has not reported back.
    trial_in_flight: bool,
    total_failures: u64,
    total_successes: u64,
    trips: u64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, threshold: u32, cool_down: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            cool_down,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
            total_failures: 0,
            total_successes: 0,
            trips: 0,
        }
    }

    pub fn from_config(name: impl Into<String>, cfg: &BreakerConfig) -> Self {
        Self::new(name, cfg.failure_threshold, cfg.cool_down())
    }

    /// Current state, moving Open to HalfOpen once the cool-down has elapsed.
    pub fn state(&mut self) -> BreakerState {
        if self.state == BreakerState::Open {
            if let Some(opened) = self.opened_at {
                if opened.elapsed() >= self.cool_down {
                    tracing::info!(endpoint = %self.name, "circuit breaker cool-down elapsed, transitioning to HalfOpen");
                    self.state = BreakerState::HalfOpen;
                    self.trial_in_flight = false;
                }
            }
        }
        self.state
    }

    /// Whether a call may go out now. In HalfOpen only the first caller is
    /// admitted until it reports success or failure.
    pub fn allow_request(&mut self) -> bool {
        match self.state() {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if self.trial_in_flight {
                    false
                } else {
                    self.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Time left before an Open breaker admits a trial.
    pub fn retry_after(&mut self) -> Option<Duration> {
        match (self.state(), self.opened_at) {
            (BreakerState::Open, Some(opened)) => Some(self.cool_down.saturating_sub(opened.elapsed())),
            _ => None,
        }
    }

    pub fn record_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_failures = 0;
        if self.state != BreakerState::Closed {
            tracing::info!(endpoint = %self.name, "circuit breaker recovered, transitioning to Closed");
        }
        self.state = BreakerState::Closed;
        self.opened_at = None;
        self.trial_in_flight = false;
    }

    pub fn record_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state() {
            BreakerState::Closed if self.consecutive_failures >= self.threshold => {
                self.trip();
                tracing::warn!(
                    endpoint = %self.name,
                    failures = self.consecutive_failures,
                    threshold = self.threshold,
                    trips = self.trips,
                    "circuit breaker tripped, transitioning to Open"
                );
            }
            BreakerState::HalfOpen => {
                self.trip();
                tracing::warn!(endpoint = %self.name, "trial failed in HalfOpen, transitioning back to Open");
            }
            _ => {}
        }
    }

    pub fn cancel_trial(&mut self) {
        self.trial_in_flight = false;
    }

    pub fn reset(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.trial_in_flight = false;
    }

    pub fn stats(&mut self) -> BreakerStats {
        BreakerStats {
            state: self.state(),
            consecutive_failures: self.consecutive_failures,
            total_failures: self.total_failures,
            total_successes: self.total_successes,
            trips: self.trips,
        }
    }

    fn trip(&mut self) {
        self.state = BreakerState::Open;
        self.opened_at = Some(Instant::now());
        self.trial_in_flight = false;
        self.trips += 1;
    }
}
