//! Crate-wide error taxonomy.
//!
//! Every public error enum maps onto one of five kinds, and callers branch
//! on the kind rather than the concrete variant:
//!
//! - `Validation` — payload or config violates schema or bounds; never retried.
//! - `Transient` — an external call failed; retried locally with backoff, then escalated.
//! - `Capacity` — admission denied; surfaced with retry-after semantics, never retried here.
//! - `Policy` — dropped by a mitigation lever; counted, not retried.
//! - `Fatal` — invariant violation; surfaces through health, fails the process.

use std::time::Duration;

/// Classification shared by every component error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Transient,
    Capacity,
    Policy,
    Fatal,
}

impl ErrorKind {
    /// Whether a local retry of the failed operation can ever help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

/// Errors that expose their taxonomy kind.
pub trait Kinded {
    fn kind(&self) -> ErrorKind;

    /// Suggested wait before the caller tries again, when the kind carries one.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Why a message was shed by the admission pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// The subject's breaker is open.
    CircuitBreaker,
    /// Lost the sampling coin flip at the current degradation level.
    Sampling,
    /// Shed because its priority class is dropped at the current level.
    PriorityShed,
    /// The priority queue is past its overflow allowance.
    QueueFull,
    /// The controller is shutting down.
    ShuttingDown,
}

impl DropReason {
    /// Stable label used in telemetry and counters.
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::CircuitBreaker => "circuit_breaker",
            DropReason::Sampling => "sampling",
            DropReason::PriorityShed => "priority_shed",
            DropReason::QueueFull => "queue_full",
            DropReason::ShuttingDown => "shutting_down",
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
