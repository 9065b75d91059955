//! Strategy data model: reasons, levers, impact, predictions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::backpressure::DegradationLevel;

/// What a reason points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonKind {
    Memory,
    Cpu,
    Queue,
    Rate,
    SloBudget,
    Network,
}

impl ReasonKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonKind::Memory => "memory",
            ReasonKind::Cpu => "cpu",
            ReasonKind::Queue => "queue",
            ReasonKind::Rate => "rate",
            ReasonKind::SloBudget => "slo_budget",
            ReasonKind::Network => "network",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ReasonSeverity {
    /// Ranking weight for primary-reason selection.
    pub fn weight(&self) -> f64 {
        match self {
            ReasonSeverity::Low => 1.0,
            ReasonSeverity::Medium => 2.0,
            ReasonSeverity::High => 3.0,
            ReasonSeverity::Critical => 4.0,
        }
    }

    /// Band by utilization ratio of the threshold.
    pub fn from_utilization(ratio: f64) -> Self {
        if ratio > 0.95 {
            ReasonSeverity::Critical
        } else if ratio > 0.85 {
            ReasonSeverity::High
        } else if ratio > 0.70 {
            ReasonSeverity::Medium
        } else {
            ReasonSeverity::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Stable,
    Increasing,
    Decreasing,
}

impl Trend {
    /// Compare the ends of a sample ring: ±10 % of the first sample.
    pub fn from_ring(samples: &[f64]) -> Self {
        let (Some(first), Some(last)) = (samples.first(), samples.last()) else {
            return Trend::Stable;
        };
        let delta = last - first;
        let band = 0.1 * first;
        if delta > band {
            Trend::Increasing
        } else if delta < -band {
            Trend::Decreasing
        } else {
            Trend::Stable
        }
    }
}

/// One ranked cause of the current posture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reason {
    pub kind: ReasonKind,
    pub severity: ReasonSeverity,
    pub utilization_pct: f64,
    pub trend: Trend,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Reason {
    pub fn rank(&self) -> f64 {
        self.severity.weight() * self.utilization_pct
    }
}

/// Current mitigation tunings with effectiveness estimates. The
/// effectiveness scores are saturating heuristics exposed as hints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeverSnapshot {
    pub sampling_rate: f64,
    pub batch_size: usize,
    pub open_circuits: Vec<String>,
    pub sampling_effectiveness: f64,
    pub batching_effectiveness: f64,
    pub queueing_effectiveness: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SloImpact {
    /// Worst budget-consumption fraction across active violations, clamped
    /// to [0, 1].
    pub budget_consumption: f64,
    pub risk: RiskLevel,
    pub violated_slos: Vec<String>,
    #[serde(with = "duration_secs")]
    pub projected_recovery: Duration,
}

/// Forward-looking hints, not guarantees.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    /// `decreasing reasons / total reasons`; 1.0 when nothing is wrong.
    pub recovery_probability: f64,
    #[serde(with = "opt_duration_secs")]
    pub time_to_next_level: Option<Duration>,
    pub recommended_actions: Vec<String>,
}

/// Fully-labelled posture produced by each reevaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveStrategy {
    pub evaluated_at: DateTime<Utc>,
    pub level: DegradationLevel,
    pub pressure: f64,
    pub reasons: Vec<Reason>,
    pub primary_reason: Option<Reason>,
    pub levers: LeverSnapshot,
    pub slo_impact: SloImpact,
    pub prediction: Prediction,
}

/// Recorded on every degradation-level change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyHistoryEntry {
    pub at: DateTime<Utc>,
    pub old_level: DegradationLevel,
    pub new_level: DegradationLevel,
    pub pressure: f64,
    pub primary: Option<ReasonKind>,
}

/// Aggregates over the most recent history entries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub window: usize,
    pub escalations: usize,
    pub deescalations: usize,
    pub avg_pressure: f64,
    pub most_common_primary: Option<ReasonKind>,
}

/// Live notifications for stream subscribers.
#[derive(Debug, Clone)]
pub enum StrategyNotice {
    Updated(std::sync::Arc<ActiveStrategy>),
    Changed {
        old_level: DegradationLevel,
        new_level: DegradationLevel,
        strategy: std::sync::Arc<ActiveStrategy>,
    },
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }
}

mod opt_duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_bands_by_utilization() {
        assert_eq!(ReasonSeverity::from_utilization(0.96), ReasonSeverity::Critical);
        assert_eq!(ReasonSeverity::from_utilization(0.90), ReasonSeverity::High);
        assert_eq!(ReasonSeverity::from_utilization(0.80), ReasonSeverity::Medium);
        assert_eq!(ReasonSeverity::from_utilization(0.50), ReasonSeverity::Low);
    }

    #[test]
    fn trend_compares_ring_ends_with_ten_percent_band() {
        assert_eq!(Trend::from_ring(&[1.0, 1.05]), Trend::Stable);
        assert_eq!(Trend::from_ring(&[1.0, 1.2]), Trend::Increasing);
        assert_eq!(Trend::from_ring(&[1.0, 0.85]), Trend::Decreasing);
        assert_eq!(Trend::from_ring(&[]), Trend::Stable);
        assert_eq!(Trend::from_ring(&[0.5]), Trend::Stable);
    }

    #[test]
    fn rank_multiplies_weight_by_utilization() {
        let reason = Reason {
            kind: ReasonKind::Memory,
            severity: ReasonSeverity::High,
            utilization_pct: 90.0,
            trend: Trend::Stable,
            detail: None,
        };
        assert_eq!(reason.rank(), 270.0);
    }
}
