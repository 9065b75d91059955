//! Per-subject circuit breaker.
//!
//! State machine: `closed` + N consecutive failures opens the circuit;
//! only time moves `open` to `half_open`; one half-open success closes, one
//! failure re-opens with an exponentially growing cooldown.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};
use crate::telemetry::{ControlEvent, GateEvent, SharedSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// First cooldown after opening.
    pub recovery_delay: Duration,
    /// Cooldown ceiling under repeated half-open failures.
    pub max_backoff: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_delay: Duration::from_secs(30),
            max_backoff: Duration::from_secs(300),
        }
    }
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    cooldown_until_ms: u64,
    /// Times the circuit has opened without an intervening close; drives
    /// the exponential cooldown.
    open_streak: u32,
}

/// One breaker, scoped to a subject (or any other label).
pub struct SubjectBreaker {
    scope: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    sink: SharedSink,
}

impl SubjectBreaker {
    pub fn new(scope: impl Into<String>, config: BreakerConfig, sink: SharedSink) -> Self {
        Self {
            scope: scope.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                cooldown_until_ms: 0,
                open_streak: 0,
            }),
            clock: Arc::new(MonotonicClock::default()),
            sink,
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Current state, applying the time-driven `open → half_open`
    /// transition first.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.advance(&mut inner);
        inner.state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn cooldown_until_ms(&self) -> Option<u64> {
        let inner = self.lock();
        (inner.state == CircuitState::Open).then_some(inner.cooldown_until_ms)
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        self.advance(&mut inner);
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.open_streak = 0;
                inner.cooldown_until_ms = 0;
                tracing::info!(scope = %self.scope, "circuit closed after successful probe");
                self.sink
                    .emit(ControlEvent::Gate(GateEvent::BreakerClosed { scope: self.scope.clone() }));
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        self.advance(&mut inner);
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                inner.consecutive_failures += 1;
                self.open(&mut inner);
            }
            CircuitState::Open => {
                inner.consecutive_failures += 1;
            }
        }
    }

    fn open(&self, inner: &mut Inner) {
        inner.state = CircuitState::Open;
        inner.open_streak += 1;
        let exponent = inner.open_streak.saturating_sub(1).min(16);
        let cooldown = self
            .config
            .recovery_delay
            .checked_mul(2u32.saturating_pow(exponent))
            .unwrap_or(self.config.max_backoff)
            .min(self.config.max_backoff);
        inner.cooldown_until_ms = self.clock.now_millis() + cooldown.as_millis() as u64;
        tracing::warn!(
            scope = %self.scope,
            failures = inner.consecutive_failures,
            cooldown_ms = cooldown.as_millis() as u64,
            "circuit opened"
        );
        self.sink.emit(ControlEvent::Gate(GateEvent::BreakerOpened {
            scope: self.scope.clone(),
            failures: inner.consecutive_failures,
            cooldown_ms: cooldown.as_millis() as u64,
        }));
    }

    fn advance(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open
            && self.clock.now_millis() >= inner.cooldown_until_ms
        {
            inner.state = CircuitState::HalfOpen;
            tracing::info!(scope = %self.scope, "circuit half-open, probing");
            self.sink
                .emit(ControlEvent::Gate(GateEvent::BreakerHalfOpen { scope: self.scope.clone() }));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}
