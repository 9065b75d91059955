//! Strategy analyzer.
//!
//! Turns the raw backpressure snapshot into a richly-labelled active
//! strategy: ranked reasons with trends, lever effectiveness, SLO impact,
//! and recovery predictions. Holds read-only views of the other components;
//! owns only its trend rings and history.

mod types;

pub use types::{
    ActiveStrategy, LeverSnapshot, PerformanceStats, Prediction, Reason, ReasonKind,
    ReasonSeverity, RiskLevel, SloImpact, StrategyHistoryEntry, StrategyNotice, Trend,
};

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backpressure::{BackpressureMetrics, BackpressureState, ResourceKind};
use crate::slo::SloMeasurement;
use crate::telemetry::{ControlEvent, SharedSink, StrategyEvent};

/// Samples kept per resource for trend detection.
const TREND_RING: usize = 10;
/// History entries kept.
const HISTORY_BOUND: usize = 1000;
/// History entries aggregated by [`StrategyAnalyzer::performance_stats`].
const STATS_WINDOW: usize = 50;

struct AnalyzerState {
    rings: HashMap<ResourceKind, VecDeque<f64>>,
    current: Option<Arc<ActiveStrategy>>,
    history: VecDeque<StrategyHistoryEntry>,
    last_level: crate::backpressure::DegradationLevel,
}

pub struct StrategyAnalyzer {
    state: Mutex<AnalyzerState>,
    notices: tokio::sync::broadcast::Sender<StrategyNotice>,
    sink: SharedSink,
}

impl StrategyAnalyzer {
    pub fn new(sink: SharedSink) -> Self {
        let (notices, _) = tokio::sync::broadcast::channel(64);
        Self {
            state: Mutex::new(AnalyzerState {
                rings: HashMap::new(),
                current: None,
                history: VecDeque::new(),
                last_level: crate::backpressure::DegradationLevel::None,
            }),
            notices,
            sink,
        }
    }

    /// Live feed of `Updated` / `Changed` notices; the stream surface's
    /// source. Subscription lifetime belongs to the receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StrategyNotice> {
        self.notices.subscribe()
    }

    pub fn current(&self) -> Option<Arc<ActiveStrategy>> {
        self.lock().current.clone()
    }

    pub fn history(&self, limit: usize) -> Vec<StrategyHistoryEntry> {
        let state = self.lock();
        state.history.iter().rev().take(limit).cloned().collect()
    }

    /// Aggregates over the last 50 history entries.
    pub fn performance_stats(&self) -> PerformanceStats {
        let state = self.lock();
        let window: Vec<&StrategyHistoryEntry> =
            state.history.iter().rev().take(STATS_WINDOW).collect();
        let escalations = window.iter().filter(|e| e.new_level > e.old_level).count();
        let deescalations = window.iter().filter(|e| e.new_level < e.old_level).count();
        let avg_pressure = if window.is_empty() {
            0.0
        } else {
            window.iter().map(|e| e.pressure).sum::<f64>() / window.len() as f64
        };
        let mut counts: HashMap<ReasonKind, usize> = HashMap::new();
        for entry in &window {
            if let Some(kind) = entry.primary {
                *counts.entry(kind).or_default() += 1;
            }
        }
        let most_common_primary =
            counts.into_iter().max_by_key(|(_, n)| *n).map(|(kind, _)| kind);
        PerformanceStats {
            window: window.len(),
            escalations,
            deescalations,
            avg_pressure,
            most_common_primary,
        }
    }

    /// One reevaluation against the latest snapshot, controller counters,
    /// and the set of SLO series currently in breach.
    pub fn evaluate(
        &self,
        snapshot: &BackpressureState,
        metrics: &BackpressureMetrics,
        violations: &[SloMeasurement],
    ) -> Arc<ActiveStrategy> {
        let mut state = self.lock();

        // Feed the trend rings before reading them.
        for (kind, ratio) in &snapshot.ratios {
            let ring = state.rings.entry(*kind).or_default();
            ring.push_back(*ratio);
            while ring.len() > TREND_RING {
                ring.pop_front();
            }
        }

        let mut reasons = Vec::new();
        for (kind, ratio) in &snapshot.ratios {
            if *ratio < 0.8 {
                continue;
            }
            let ring: Vec<f64> = state.rings[kind].iter().copied().collect();
            reasons.push(Reason {
                kind: resource_reason(*kind),
                severity: ReasonSeverity::from_utilization(*ratio),
                utilization_pct: ratio * 100.0,
                trend: Trend::from_ring(&ring),
                detail: None,
            });
        }

        if !snapshot.open_circuits.is_empty() {
            reasons.push(Reason {
                kind: ReasonKind::Network,
                severity: ReasonSeverity::High,
                utilization_pct: 100.0,
                trend: Trend::Stable,
                detail: Some(format!("open circuits: {}", snapshot.open_circuits.join(", "))),
            });
        }

        let mut worst_consumption: f64 = 0.0;
        for violation in violations {
            let consumption = budget_consumption(violation);
            worst_consumption = worst_consumption.max(consumption);
            reasons.push(Reason {
                kind: ReasonKind::SloBudget,
                severity: consumption_severity(consumption),
                utilization_pct: consumption * 100.0,
                trend: Trend::Stable,
                detail: Some(format!("{}/{}", violation.service, violation.metric)),
            });
        }

        let primary_reason = reasons
            .iter()
            .max_by(|a, b| a.rank().partial_cmp(&b.rank()).unwrap_or(std::cmp::Ordering::Equal))
            .cloned();

        let sampled = metrics.dropped_sampling as f64;
        let queue_depth = snapshot.queue_depth as f64;
        let levers = LeverSnapshot {
            sampling_rate: snapshot.sampling_rate,
            batch_size: snapshot.batch_size,
            open_circuits: snapshot.open_circuits.clone(),
            sampling_effectiveness: 1.0 - sampled / (sampled + 1000.0),
            batching_effectiveness: 1.0 - 1.0 / snapshot.batch_size.max(1) as f64,
            queueing_effectiveness: 1.0 - queue_depth / (queue_depth + 1000.0),
        };

        let any_critical = reasons.iter().any(|r| r.severity == ReasonSeverity::Critical);
        let any_high = reasons.iter().any(|r| r.severity >= ReasonSeverity::High);
        let any_medium = reasons.iter().any(|r| r.severity >= ReasonSeverity::Medium);
        let risk = if worst_consumption > 0.8 || any_critical {
            RiskLevel::Critical
        } else if worst_consumption > 0.6 || any_high {
            RiskLevel::High
        } else if worst_consumption > 0.3 || any_medium {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };
        let recovery_multiplier = if violations.is_empty() { 1 } else { 2 };
        let slo_impact = SloImpact {
            budget_consumption: worst_consumption,
            risk,
            violated_slos: violations
                .iter()
                .map(|v| format!("{}/{}", v.service, v.metric))
                .collect(),
            projected_recovery: Duration::from_secs(
                reasons.len() as u64 * 30 * recovery_multiplier,
            ),
        };

        let total = reasons.len();
        let decreasing = reasons.iter().filter(|r| r.trend == Trend::Decreasing).count();
        let any_increasing = reasons.iter().any(|r| r.trend == Trend::Increasing);
        let prediction = Prediction {
            recovery_probability: if total == 0 {
                1.0
            } else {
                decreasing as f64 / total as f64
            },
            time_to_next_level: any_increasing.then(|| Duration::from_secs(300)),
            recommended_actions: recommended_actions(&reasons),
        };

        let strategy = Arc::new(ActiveStrategy {
            evaluated_at: Utc::now(),
            level: snapshot.level,
            pressure: snapshot.pressure,
            reasons,
            primary_reason,
            levers,
            slo_impact,
            prediction,
        });

        let old_level = state.last_level;
        if old_level != snapshot.level {
            state.history.push_back(StrategyHistoryEntry {
                at: strategy.evaluated_at,
                old_level,
                new_level: snapshot.level,
                pressure: snapshot.pressure,
                primary: strategy.primary_reason.as_ref().map(|r| r.kind),
            });
            while state.history.len() > HISTORY_BOUND {
                state.history.pop_front();
            }
            state.last_level = snapshot.level;
            self.sink.emit(ControlEvent::Strategy(StrategyEvent::Changed {
                old_level,
                new_level: snapshot.level,
            }));
            let _ = self.notices.send(StrategyNotice::Changed {
                old_level,
                new_level: snapshot.level,
                strategy: strategy.clone(),
            });
        }

        self.sink.emit(ControlEvent::Strategy(StrategyEvent::Updated {
            level: snapshot.level,
            primary_reason: strategy.primary_reason.as_ref().map(|r| r.kind.as_str().to_string()),
        }));
        let _ = self.notices.send(StrategyNotice::Updated(strategy.clone()));

        state.current = Some(strategy.clone());
        strategy
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AnalyzerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn resource_reason(kind: ResourceKind) -> ReasonKind {
    match kind {
        ResourceKind::Memory => ReasonKind::Memory,
        ResourceKind::Queue => ReasonKind::Queue,
        ResourceKind::Rate => ReasonKind::Rate,
        ResourceKind::Cpu => ReasonKind::Cpu,
    }
}

/// Fraction of the error budget the violation has eaten, clamped to [0, 1].
///
/// `error_budget_remaining = actual − (100 − target)`, so the allowed error
/// rate is recoverable as `actual − remaining` whenever the budget is not
/// already exhausted.
fn budget_consumption(violation: &SloMeasurement) -> f64 {
    let observed = (100.0 - violation.actual_pct).max(0.0);
    if violation.error_budget_remaining <= 0.0 {
        return 1.0;
    }
    let allowed = violation.actual_pct - violation.error_budget_remaining;
    if allowed <= 0.0 {
        return if observed > 0.0 { 1.0 } else { 0.0 };
    }
    (observed / allowed).clamp(0.0, 1.0)
}

fn consumption_severity(consumption: f64) -> ReasonSeverity {
    if consumption > 0.9 {
        ReasonSeverity::Critical
    } else if consumption > 0.7 {
        ReasonSeverity::High
    } else if consumption > 0.5 {
        ReasonSeverity::Medium
    } else {
        ReasonSeverity::Low
    }
}

fn recommended_actions(reasons: &[Reason]) -> Vec<String> {
    let mut actions = Vec::new();
    for reason in reasons {
        let action = match reason.kind {
            ReasonKind::Memory => "lower buffer sizes or scale memory",
            ReasonKind::Cpu => "scale out workers or reduce batch work",
            ReasonKind::Queue => "raise drain rate or shed low-priority traffic",
            ReasonKind::Rate => "throttle producers at the edge",
            ReasonKind::SloBudget => "pause non-critical publishing until budget recovers",
            ReasonKind::Network => "inspect subjects with open circuits",
        };
        if !actions.iter().any(|a| a == action) {
            actions.push(action.to_string());
        }
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::{DegradationLevel, ResourceReadings};
    use chrono::Utc;

    fn snapshot(ratios: [f64; 4], level: DegradationLevel) -> BackpressureState {
        let kinds = ResourceKind::ALL;
        BackpressureState {
            readings: ResourceReadings::default(),
            ratios: kinds.iter().zip(ratios).map(|(k, r)| (*k, r)).collect(),
            pressure: ratios.iter().copied().fold(0.0, f64::max),
            level,
            sampling_rate: level.levers().sampling_rate,
            batch_size: level.levers().batch_size,
            queue_depth: 42,
            open_circuits: Vec::new(),
            shutting_down: false,
        }
    }

    fn metrics() -> BackpressureMetrics {
        BackpressureMetrics {
            accepted: 0,
            published: 0,
            dropped_circuit: 0,
            dropped_sampling: 1000,
            dropped_priority: 0,
            dropped_queue_full: 0,
            dropped_shutdown: 0,
            publish_failures: 0,
            requeued: 0,
            dead_lettered: 0,
            dead_letter_failures: 0,
            queue_depth: 42,
            level: DegradationLevel::Medium,
            sampling_rate: 0.7,
            batch_size: 10,
            open_circuits: Vec::new(),
        }
    }

    fn violation(actual_pct: f64, budget_remaining: f64) -> SloMeasurement {
        SloMeasurement {
            metric: "publish_success_rate".into(),
            service: "scheduler".into(),
            success_count: 0,
            total_count: 100,
            window_secs: 300,
            measured_at: Utc::now(),
            actual_pct,
            error_budget_remaining: budget_remaining,
            breach: true,
            severity: None,
            alert_fired: false,
        }
    }

    #[test]
    fn quiet_system_produces_no_reasons() {
        let analyzer = StrategyAnalyzer::new(SharedSink::null());
        let strategy = analyzer.evaluate(
            &snapshot([0.1, 0.2, 0.1, 0.3], DegradationLevel::None),
            &metrics(),
            &[],
        );
        assert!(strategy.reasons.is_empty());
        assert!(strategy.primary_reason.is_none());
        assert_eq!(strategy.prediction.recovery_probability, 1.0);
        assert_eq!(strategy.prediction.time_to_next_level, None);
        assert_eq!(strategy.slo_impact.risk, RiskLevel::Low);
    }

    #[test]
    fn hot_resources_become_ranked_reasons() {
        let analyzer = StrategyAnalyzer::new(SharedSink::null());
        let strategy = analyzer.evaluate(
            &snapshot([0.97, 0.82, 0.1, 0.9], DegradationLevel::Low),
            &metrics(),
            &[],
        );
        assert_eq!(strategy.reasons.len(), 3);
        let primary = strategy.primary_reason.as_ref().unwrap();
        assert_eq!(primary.kind, ReasonKind::Memory);
        assert_eq!(primary.severity, ReasonSeverity::Critical);
        assert_eq!(strategy.slo_impact.risk, RiskLevel::Critical);
    }

    #[test]
    fn open_circuits_inject_a_network_reason() {
        let analyzer = StrategyAnalyzer::new(SharedSink::null());
        let mut snap = snapshot([0.1, 0.1, 0.1, 0.1], DegradationLevel::None);
        snap.open_circuits = vec!["kpi.metrics.acme.low".into()];
        let strategy = analyzer.evaluate(&snap, &metrics(), &[]);
        assert_eq!(strategy.reasons.len(), 1);
        assert_eq!(strategy.reasons[0].kind, ReasonKind::Network);
        assert_eq!(strategy.reasons[0].severity, ReasonSeverity::High);
    }

    #[test]
    fn slo_violations_inject_budget_reasons_and_double_recovery() {
        let analyzer = StrategyAnalyzer::new(SharedSink::null());
        let strategy = analyzer.evaluate(
            &snapshot([0.85, 0.1, 0.1, 0.1], DegradationLevel::Low),
            &metrics(),
            &[violation(95.0, 0.0)],
        );
        assert!(strategy.reasons.iter().any(|r| r.kind == ReasonKind::SloBudget));
        assert_eq!(strategy.slo_impact.budget_consumption, 1.0);
        // two reasons, 30 s each, doubled under an SLO violation
        assert_eq!(strategy.slo_impact.projected_recovery, Duration::from_secs(120));
    }

    #[test]
    fn trend_ring_detects_growth_and_feeds_prediction() {
        let analyzer = StrategyAnalyzer::new(SharedSink::null());
        for step in 0..6 {
            let memory = 0.8 + 0.03 * step as f64;
            analyzer.evaluate(
                &snapshot([memory, 0.1, 0.1, 0.1], DegradationLevel::Low),
                &metrics(),
                &[],
            );
        }
        let strategy = analyzer.current().unwrap();
        let memory_reason =
            strategy.reasons.iter().find(|r| r.kind == ReasonKind::Memory).unwrap();
        assert_eq!(memory_reason.trend, Trend::Increasing);
        assert_eq!(strategy.prediction.time_to_next_level, Some(Duration::from_secs(300)));
    }

    #[test]
    fn level_changes_append_history_and_broadcast() {
        let analyzer = StrategyAnalyzer::new(SharedSink::null());
        let mut rx = analyzer.subscribe();

        analyzer.evaluate(&snapshot([0.5, 0.1, 0.1, 0.1], DegradationLevel::None), &metrics(), &[]);
        analyzer.evaluate(&snapshot([0.9, 0.1, 0.1, 0.1], DegradationLevel::Low), &metrics(), &[]);
        analyzer.evaluate(&snapshot([0.9, 0.1, 0.1, 0.1], DegradationLevel::Low), &metrics(), &[]);

        let history = analyzer.history(10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].old_level, DegradationLevel::None);
        assert_eq!(history[0].new_level, DegradationLevel::Low);

        // first evaluation: Updated only
        assert!(matches!(rx.try_recv().unwrap(), StrategyNotice::Updated(_)));
        // second: Changed then Updated
        assert!(matches!(rx.try_recv().unwrap(), StrategyNotice::Changed { .. }));
        assert!(matches!(rx.try_recv().unwrap(), StrategyNotice::Updated(_)));
    }

    #[test]
    fn performance_stats_aggregate_recent_history() {
        let analyzer = StrategyAnalyzer::new(SharedSink::null());
        analyzer.evaluate(&snapshot([0.9, 0.1, 0.1, 0.1], DegradationLevel::Low), &metrics(), &[]);
        analyzer.evaluate(
            &snapshot([1.2, 0.1, 0.1, 0.1], DegradationLevel::Medium),
            &metrics(),
            &[],
        );
        analyzer.evaluate(&snapshot([0.5, 0.1, 0.1, 0.1], DegradationLevel::None), &metrics(), &[]);

        let stats = analyzer.performance_stats();
        assert_eq!(stats.window, 3);
        assert_eq!(stats.escalations, 2);
        assert_eq!(stats.deescalations, 1);
        assert!(stats.avg_pressure > 0.0);
        assert_eq!(stats.most_common_primary, Some(ReasonKind::Memory));
    }

    #[test]
    fn lever_effectiveness_uses_saturating_forms() {
        let analyzer = StrategyAnalyzer::new(SharedSink::null());
        let strategy = analyzer.evaluate(
            &snapshot([0.9, 0.1, 0.1, 0.1], DegradationLevel::Low),
            &metrics(),
            &[],
        );
        // 1000 sampled drops: 1 − 1000/2000
        assert!((strategy.levers.sampling_effectiveness - 0.5).abs() < 1e-9);
        // batch size 5 at low: 1 − 1/5
        assert!((strategy.levers.batching_effectiveness - 0.8).abs() < 1e-9);
    }

    #[test]
    fn budget_consumption_recovers_allowed_error_rate() {
        // target 99: actual 98.5 → observed 1.5 allowed 1.0 → saturated
        assert_eq!(budget_consumption(&violation(98.5, 97.5)), 1.0);
        // target 99: actual 99.5 → observed 0.5 allowed 1.0 → half consumed
        assert!((budget_consumption(&violation(99.5, 98.5)) - 0.5).abs() < 1e-9);
        // exhausted budget is fully consumed
        assert_eq!(budget_consumption(&violation(90.0, 0.0)), 1.0);
    }
}
