//! Upstream circuit breaker with lock-free atomics.
//!
//! CLOSED -> OPEN once `failure_threshold` consecutive failures land (each within
//! `failure_window` of the previous one). OPEN -> HALF_OPEN after `open_duration`, either lazily
//! on the next [`allow_request`](CircuitBreaker::allow_request) or from the probe tick.
//! HALF_OPEN lets `probe_count` trial requests through; a trial success closes the breaker, a
//! trial failure re-opens it.

use crate::clock::{millis, Clock};
use crate::config::CircuitConfig;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Current state of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Fails fast until the open duration elapses.
    Open,
    /// Probe mode allowing a limited number of trial calls.
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(label)
    }
}

/// What [`CircuitBreaker::acquire`] granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Breaker closed; no bookkeeping to undo.
    Closed,
    /// One of the half-open trial slots. Must be followed by a recorded outcome or a release.
    Probe,
    /// Breaker open (or half-open with every trial slot taken).
    Denied,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub consecutive_failures: usize,
    /// Clock reading when the breaker last opened; `None` while closed.
    pub opened_at: Option<u64>,
}

#[derive(Debug)]
struct BreakerState {
    state: AtomicU8,
    consecutive_failures: AtomicUsize,
    last_failure_at: AtomicU64,
    opened_at: AtomicU64,
    probes_in_flight: AtomicUsize,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicUsize::new(0),
            last_failure_at: AtomicU64::new(0),
            opened_at: AtomicU64::new(0),
            probes_in_flight: AtomicUsize::new(0),
        }
    }

    fn current(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        self.state
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Breaker guarding upstream calls for one bucket.
/// Clones share state, so every handle observes the same lifecycle.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    state: Arc<BreakerState>,
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<Arc<str>>, config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { name: name.into(), state: Arc::new(BreakerState::new()), config, clock }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// May an upstream call go out right now? Takes a trial slot when half-open.
    pub fn allow_request(&self) -> bool {
        self.acquire() != Permit::Denied
    }

    /// Like [`allow_request`](Self::allow_request) but says whether a trial slot was taken.
    pub fn acquire(&self) -> Permit {
        loop {
            match self.state.current() {
                CircuitState::Closed => return Permit::Closed,
                CircuitState::Open => {
                    if !self.cooldown_elapsed() {
                        return Permit::Denied;
                    }
                    // Whoever wins the transition still competes for a slot below.
                    if self.state.transition(CircuitState::Open, CircuitState::HalfOpen) {
                        tracing::info!(bucket = %self.name, "circuit breaker → half-open");
                    }
                }
                CircuitState::HalfOpen => {
                    let taken = self.state.probes_in_flight.fetch_add(1, Ordering::AcqRel);
                    if taken >= self.config.probe_count {
                        self.give_back_probe();
                        return Permit::Denied;
                    }
                    if self.state.current() != CircuitState::HalfOpen {
                        // The trial window closed under us.
                        self.give_back_probe();
                        continue;
                    }
                    tracing::debug!(
                        bucket = %self.name,
                        in_flight = taken + 1,
                        max = self.config.probe_count,
                        "circuit breaker: half-open trial request"
                    );
                    return Permit::Probe;
                }
            }
        }
    }

    /// Give back a trial slot that was granted but never used.
    pub fn release_probe(&self) {
        if self.state.current() == CircuitState::HalfOpen {
            self.give_back_probe();
        }
    }

    fn give_back_probe(&self) {
        let _ = self.state.probes_in_flight.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |n| n.checked_sub(1),
        );
    }

    /// Record a successful upstream call. Returns the new state if this caused a transition.
    pub fn record_success(&self) -> Option<CircuitState> {
        match self.state.current() {
            CircuitState::HalfOpen => {
                if self.state.transition(CircuitState::HalfOpen, CircuitState::Closed) {
                    self.state.probes_in_flight.store(0, Ordering::Release);
                    self.state.consecutive_failures.store(0, Ordering::Release);
                    self.state.opened_at.store(0, Ordering::Release);
                    tracing::info!(bucket = %self.name, "circuit breaker → closed");
                    return Some(CircuitState::Closed);
                }
                None
            }
            CircuitState::Closed => {
                self.state.consecutive_failures.store(0, Ordering::Release);
                None
            }
            CircuitState::Open => None,
        }
    }

    /// Record a failed upstream call. Returns the new state if this caused a transition.
    pub fn record_failure(&self) -> Option<CircuitState> {
        let now = self.clock.now_millis();
        let previous = self.state.last_failure_at.swap(now, Ordering::AcqRel);
        let window = millis(self.config.failure_window);
        let failures = if window > 0 && now.saturating_sub(previous) > window {
            self.state.consecutive_failures.store(1, Ordering::Release);
            1
        } else {
            self.state.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
        };

        match self.state.current() {
            CircuitState::HalfOpen => {
                if self.state.transition(CircuitState::HalfOpen, CircuitState::Open) {
                    self.state.probes_in_flight.store(0, Ordering::Release);
                    self.state.opened_at.store(now, Ordering::Release);
                    tracing::warn!(bucket = %self.name, failures, "circuit breaker: probe failed");
                    return Some(CircuitState::Open);
                }
                None
            }
            CircuitState::Closed => {
                if failures >= self.config.failure_threshold
                    && self.state.transition(CircuitState::Closed, CircuitState::Open)
                {
                    self.state.probes_in_flight.store(0, Ordering::Release);
                    self.state.opened_at.store(now, Ordering::Release);
                    tracing::error!(
                        bucket = %self.name,
                        failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker → open"
                    );
                    return Some(CircuitState::Open);
                }
                None
            }
            CircuitState::Open => None,
        }
    }

    /// Move OPEN -> HALF_OPEN once the open duration has elapsed, without taking a trial slot.
    /// Returns `true` if this call made the transition.
    pub fn tick(&self) -> bool {
        if self.state.current() != CircuitState::Open || !self.cooldown_elapsed() {
            return false;
        }
        // Opening already zeroed the trial counter.
        if self.state.transition(CircuitState::Open, CircuitState::HalfOpen) {
            tracing::info!(bucket = %self.name, "circuit breaker → half-open");
            return true;
        }
        false
    }

    pub fn state(&self) -> CircuitState {
        self.state.current()
    }

    pub fn status(&self) -> CircuitStatus {
        let state = self.state.current();
        CircuitStatus {
            state,
            consecutive_failures: self.state.consecutive_failures.load(Ordering::Acquire),
            opened_at: match state {
                CircuitState::Closed => None,
                _ => Some(self.state.opened_at.load(Ordering::Acquire)),
            },
        }
    }

    /// Time left before an open breaker allows a probe; zero unless open.
    pub fn remaining_open(&self) -> Duration {
        if self.state.current() != CircuitState::Open {
            return Duration::ZERO;
        }
        let opened_at = self.state.opened_at.load(Ordering::Acquire);
        let reopen_at = opened_at.saturating_add(millis(self.config.open_duration));
        Duration::from_millis(reopen_at.saturating_sub(self.clock.now_millis()))
    }

    /// Force the breaker closed and clear its counters.
    pub fn reset(&self) {
        self.state.state.store(STATE_CLOSED, Ordering::Release);
        self.state.consecutive_failures.store(0, Ordering::Release);
        self.state.opened_at.store(0, Ordering::Release);
        self.state.probes_in_flight.store(0, Ordering::Release);
        tracing::info!(bucket = %self.name, "circuit breaker reset");
    }

    fn cooldown_elapsed(&self) -> bool {
        let opened_at = self.state.opened_at.load(Ordering::Acquire);
        self.clock.now_millis().saturating_sub(opened_at) >= millis(self.config.open_duration)
    }
}
