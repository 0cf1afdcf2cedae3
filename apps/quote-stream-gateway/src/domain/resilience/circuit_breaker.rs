//! Circuit breaker guarding batch transformation.
//!
//! When the transform collaborator fails often enough, the breaker opens and
//! batches go straight to fallback instead of hammering a failing service.
//!
//! # State Machine
//!
//! ```text
//! CLOSED → OPEN       (failure rate >= threshold over the sliding window)
//! OPEN → HALF_OPEN    (reset timeout elapsed)
//! HALF_OPEN → CLOSED  (enough probe successes)
//! HALF_OPEN → OPEN    (any probe failure)
//! ```
//!
//! Transitions live in [`BreakerCore::step`], a pure function of the current
//! core, an event and the caller-supplied instant. [`CircuitBreaker`] wraps it
//! with lifetime counters and logging. Nothing here reads the clock, so tests
//! drive time explicitly.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected until the reset timeout elapses.
    Open,
    /// Probing with live calls.
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding (0 closed, 1 half-open, 2 open).
    #[must_use]
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failure rate that opens the circuit (0.0-1.0).
    pub failure_rate_threshold: f64,
    /// Number of outcomes in the sliding window.
    pub sliding_window_size: usize,
    /// Outcomes required before the rate is evaluated.
    pub minimum_calls: usize,
    /// Time spent open before probing.
    pub reset_timeout: Duration,
    /// Probe successes required to close again.
    pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            sliding_window_size: 20,
            minimum_calls: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_success_threshold: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Build from a percentage threshold (0-100).
    #[must_use]
    pub fn from_percent(threshold_pct: u8, reset_timeout: Duration) -> Self {
        Self {
            failure_rate_threshold: f64::from(threshold_pct.min(100)) / 100.0,
            reset_timeout,
            ..Self::default()
        }
    }
}

/// Input driving a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    /// A guarded call succeeded.
    Success,
    /// A guarded call failed.
    Failure,
    /// No call; only time moved.
    Tick,
}

// =============================================================================
// Pure Core
// =============================================================================

/// Transition state of the breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerCore {
    state: CircuitState,
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    half_open_successes: u32,
    consecutive_failures: u32,
}

impl Default for BreakerCore {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::new(),
            opened_at: None,
            half_open_successes: 0,
            consecutive_failures: 0,
        }
    }
}

impl BreakerCore {
    /// Current state, without applying time-based transitions.
    #[must_use]
    pub const fn state(&self) -> CircuitState {
        self.state
    }

    /// Failures since the last success.
    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Failure rate over the sliding window (0.0 when empty).
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|failed| **failed).count();
        #[allow(clippy::cast_precision_loss)]
        let rate = failures as f64 / self.window.len() as f64;
        rate
    }

    /// Apply one event at `now` and return the next core.
    #[must_use]
    pub fn step(mut self, event: BreakerEvent, now: Instant, config: &CircuitBreakerConfig) -> Self {
        if self.state == CircuitState::Open
            && self
                .opened_at
                .is_some_and(|opened| now.saturating_duration_since(opened) >= config.reset_timeout)
        {
            self.state = CircuitState::HalfOpen;
            self.half_open_successes = 0;
        }

        match (self.state, event) {
            (_, BreakerEvent::Tick) => {}
            (CircuitState::Closed, BreakerEvent::Success) => {
                self.consecutive_failures = 0;
                self.push_outcome(false, config);
            }
            (CircuitState::Closed, BreakerEvent::Failure) => {
                self.consecutive_failures += 1;
                self.push_outcome(true, config);
                if self.window.len() >= config.minimum_calls
                    && self.failure_rate() >= config.failure_rate_threshold
                {
                    self.trip(now);
                }
            }
            (CircuitState::Open, BreakerEvent::Success) => {}
            (CircuitState::Open, BreakerEvent::Failure) => {
                self.consecutive_failures += 1;
            }
            (CircuitState::HalfOpen, BreakerEvent::Success) => {
                self.consecutive_failures = 0;
                self.half_open_successes += 1;
                if self.half_open_successes >= config.half_open_success_threshold {
                    self = Self::default();
                }
            }
            (CircuitState::HalfOpen, BreakerEvent::Failure) => {
                self.consecutive_failures += 1;
                self.trip(now);
            }
        }

        self
    }

    fn push_outcome(&mut self, failed: bool, config: &CircuitBreakerConfig) {
        self.window.push_back(failed);
        while self.window.len() > config.sliding_window_size.max(1) {
            self.window.pop_front();
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.half_open_successes = 0;
    }
}

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Point-in-time view for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Whether calls are being rejected.
    pub is_open: bool,
    /// Failures since the last success.
    pub consecutive_failure_count: u32,
    /// Time of the most recent failure.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Lifetime successes.
    pub success_count: u64,
    /// Failure rate over the sliding window.
    pub failure_rate: f64,
    /// Lifetime state transitions.
    pub transitions: u64,
}

/// Circuit breaker with lifetime counters.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    core: BreakerCore,
    last_failure_at: Option<DateTime<Utc>>,
    success_count: u64,
    transitions: u64,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            core: BreakerCore::default(),
            last_failure_at: None,
            success_count: 0,
            transitions: 0,
        }
    }

    /// State at `now`, applying the open → half-open timeout.
    pub fn state(&mut self, now: Instant) -> CircuitState {
        self.apply(BreakerEvent::Tick, now);
        self.core.state()
    }

    /// Whether a call may proceed at `now`.
    pub fn permits(&mut self, now: Instant) -> bool {
        self.state(now) != CircuitState::Open
    }

    /// Record a successful call.
    pub fn record_success(&mut self, now: Instant) {
        self.success_count += 1;
        self.apply(BreakerEvent::Success, now);
    }

    /// Record a failed call.
    pub fn record_failure(&mut self, now: Instant) {
        self.last_failure_at = Some(Utc::now());
        self.apply(BreakerEvent::Failure, now);
    }

    /// Snapshot at `now`.
    pub fn snapshot(&mut self, now: Instant) -> CircuitBreakerSnapshot {
        let state = self.state(now);
        CircuitBreakerSnapshot {
            state,
            is_open: state == CircuitState::Open,
            consecutive_failure_count: self.core.consecutive_failures(),
            last_failure_at: self.last_failure_at,
            success_count: self.success_count,
            failure_rate: self.core.failure_rate(),
            transitions: self.transitions,
        }
    }

    fn apply(&mut self, event: BreakerEvent, now: Instant) {
        let previous = self.core.state();
        self.core = std::mem::take(&mut self.core).step(event, now, &self.config);
        let current = self.core.state();

        if previous != current {
            self.transitions += 1;
            match current {
                CircuitState::Open => tracing::warn!(
                    name = %self.name,
                    from = %previous,
                    failure_rate = self.core.failure_rate(),
                    "Circuit breaker opened"
                ),
                CircuitState::HalfOpen => tracing::info!(
                    name = %self.name,
                    from = %previous,
                    "Circuit breaker probing"
                ),
                CircuitState::Closed => tracing::info!(
                    name = %self.name,
                    from = %previous,
                    "Circuit breaker closed"
                ),
            }
        }
    }
}
