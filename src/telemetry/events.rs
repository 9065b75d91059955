//! Typed events emitted by the control plane.

use serde::Serialize;
use std::fmt;

use crate::backpressure::DegradationLevel;
use crate::error::DropReason;
use crate::slo::SloSeverity;

/// Union of every event the components emit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ControlEvent {
    Gate(GateEvent),
    Strategy(StrategyEvent),
    Etl(EtlEvent),
    Scheduler(SchedulerEvent),
    Limit(LimitEvent),
    Slo(SloEvent),
}

/// Backpressure controller events, including the per-subject breakers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateEvent {
    DegradationChanged {
        old: DegradationLevel,
        new: DegradationLevel,
        /// `max_i r_i` at the moment of the transition.
        pressure: f64,
    },
    MessageDropped {
        #[serde(serialize_with = "ser_drop_reason")]
        reason: DropReason,
        subject: String,
    },
    BreakerOpened {
        scope: String,
        failures: u32,
        cooldown_ms: u64,
    },
    BreakerHalfOpen {
        scope: String,
    },
    BreakerClosed {
        scope: String,
    },
}

/// Strategy analyzer events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyEvent {
    /// Emitted on every reevaluation.
    Updated {
        level: DegradationLevel,
        primary_reason: Option<String>,
    },
    /// Emitted only when the degradation level moved.
    Changed {
        old_level: DegradationLevel,
        new_level: DegradationLevel,
    },
}

/// Batch pipeline events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EtlEvent {
    BatchFlushed {
        records: usize,
        invalid: usize,
        duration_ms: u64,
    },
    BatchRetry {
        attempt: u32,
        delay_ms: u64,
    },
    DeadLettered {
        records: usize,
        reason: String,
    },
    DataQuality {
        invalid: usize,
        total: usize,
    },
}

/// Fair-share scheduler events. Token breakers reuse [`GateEvent`] breaker
/// variants with a `platform:token` scope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulerEvent {
    JobScheduled {
        token_id: String,
        platform: String,
        jitter_ms: u64,
    },
    TokenCooledDown {
        token_id: String,
        platform: String,
        retry_after_secs: u64,
    },
}

/// Rate limiter events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LimitEvent {
    Denied {
        key: String,
        tier: String,
        retry_after_secs: u64,
    },
    /// The backing store failed; admission failed open.
    StoreFailure {
        detail: String,
    },
}

/// SLO evaluator events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SloEvent {
    Recorded {
        metric: String,
        service: String,
        actual_pct: f64,
        budget_remaining: f64,
    },
    Breach {
        metric: String,
        service: String,
        severity: SloSeverity,
        actual_pct: f64,
    },
}

fn ser_drop_reason<S: serde::Serializer>(reason: &DropReason, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(reason.as_str())
}

impl ControlEvent {
    /// JSON rendering used by forwarding sinks.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }
}

impl fmt::Display for ControlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlEvent::Gate(e) => write!(f, "Gate::{}", e),
            ControlEvent::Strategy(e) => write!(f, "Strategy::{}", e),
            ControlEvent::Etl(e) => write!(f, "Etl::{}", e),
            ControlEvent::Scheduler(e) => write!(f, "Scheduler::{}", e),
            ControlEvent::Limit(e) => write!(f, "Limit::{}", e),
            ControlEvent::Slo(e) => write!(f, "Slo::{}", e),
        }
    }
}

macro_rules! impl_display_as_json {
    ($($ty:ty),+ $(,)?) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match serde_json::to_string(self) {
                    Ok(s) => f.write_str(&s),
                    Err(_) => f.write_str("<unserializable>"),
                }
            }
        }
    )+};
}

impl_display_as_json!(GateEvent, StrategyEvent, EtlEvent, SchedulerEvent, LimitEvent, SloEvent);
