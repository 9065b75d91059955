//! Per-token scheduling records and their circuit breakers.
//!
//! Token breakers differ from the subject breakers on the ingest side:
//! successes pay failures down one at a time, and a successful probe after
//! cooldown closes the circuit outright with the counter cleared.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use crate::backpressure::CircuitState;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for TokenBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, cooldown: Duration::from_secs(300) }
    }
}

/// Scheduling state for one `(token, platform)` pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenRecord {
    pub token_id: String,
    pub platform: String,
    pub active: bool,
    /// Reserved for a weighted selection variant; the default selector
    /// ignores it.
    pub weight: u32,
    pub registered_at_ms: u64,
    pub last_scheduled_at_ms: Option<u64>,
    pub total_scheduled: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub avg_completion_ms: f64,
    pub cooldown_until_ms: Option<u64>,
    pub circuit_state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at_ms: Option<u64>,
}

/// Breaker movement worth announcing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenTransition {
    Opened { failures: u32, cooldown_ms: u64 },
    HalfOpen,
    Closed,
}

impl TokenRecord {
    pub fn new(token_id: impl Into<String>, platform: impl Into<String>, now_ms: u64) -> Self {
        Self {
            token_id: token_id.into(),
            platform: platform.into(),
            active: true,
            weight: 1,
            registered_at_ms: now_ms,
            last_scheduled_at_ms: None,
            total_scheduled: 0,
            total_completed: 0,
            total_failed: 0,
            avg_completion_ms: 0.0,
            cooldown_until_ms: None,
            circuit_state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at_ms: None,
        }
    }

    /// Move `open → half_open` once the cooldown has elapsed.
    pub fn refresh(&mut self, now_ms: u64) -> Option<TokenTransition> {
        if self.circuit_state == CircuitState::Open
            && self.cooldown_until_ms.is_some_and(|until| now_ms >= until)
        {
            self.circuit_state = CircuitState::HalfOpen;
            return Some(TokenTransition::HalfOpen);
        }
        None
    }

    /// Selection predicate: active, out of cooldown, circuit not open.
    pub fn eligible(&mut self, now_ms: u64) -> bool {
        self.refresh(now_ms);
        self.active
            && self.cooldown_until_ms.map_or(true, |until| until <= now_ms)
            && self.circuit_state != CircuitState::Open
    }

    /// Selection key: least recently, then least frequently used wins.
    pub fn selection_key(&self) -> (u64, u64) {
        (self.last_scheduled_at_ms.unwrap_or(0), self.total_scheduled)
    }

    pub fn mark_scheduled(&mut self, now_ms: u64) {
        self.last_scheduled_at_ms = Some(now_ms);
        self.total_scheduled += 1;
    }

    pub fn record_success(
        &mut self,
        duration: Duration,
        now_ms: u64,
    ) -> Option<TokenTransition> {
        self.refresh(now_ms);
        self.total_completed += 1;
        let sample = duration.as_millis() as f64;
        let n = self.total_completed as f64;
        self.avg_completion_ms += (sample - self.avg_completion_ms) / n;

        match self.circuit_state {
            CircuitState::HalfOpen => {
                self.circuit_state = CircuitState::Closed;
                self.failure_count = 0;
                self.cooldown_until_ms = None;
                Some(TokenTransition::Closed)
            }
            CircuitState::Closed => {
                self.failure_count = self.failure_count.saturating_sub(1);
                if self.failure_count <= 1 {
                    self.cooldown_until_ms = None;
                }
                None
            }
            CircuitState::Open => None,
        }
    }

    pub fn record_failure(
        &mut self,
        config: &TokenBreakerConfig,
        now_ms: u64,
    ) -> Option<TokenTransition> {
        self.refresh(now_ms);
        self.total_failed += 1;
        self.failure_count += 1;
        self.last_failure_at_ms = Some(now_ms);

        let should_open = match self.circuit_state {
            CircuitState::Closed => self.failure_count >= config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if should_open {
            self.circuit_state = CircuitState::Open;
            let cooldown_ms = config.cooldown.as_millis() as u64;
            self.cooldown_until_ms = Some(now_ms + cooldown_ms);
            Some(TokenTransition::Opened { failures: self.failure_count, cooldown_ms })
        } else {
            None
        }
    }
}
