//! SLO evaluator.
//!
//! Records per-metric success/total observations, computes achievement and
//! error-budget arithmetic, and raises debounced breach alerts that the
//! backpressure and strategy layers consume.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::clock::{Clock, MonotonicClock};
use crate::error::{ErrorKind, Kinded};
use crate::telemetry::{ControlEvent, SharedSink, SloEvent};

/// Measurement series older than this are pruned.
const SERIES_TTL_DAYS: i64 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SloSeverity {
    Warning,
    Critical,
}

impl SloSeverity {
    /// Breach alerts re-fire no sooner than this.
    pub fn debounce_ms(&self) -> u64 {
        match self {
            SloSeverity::Critical => 60_000,
            SloSeverity::Warning => 300_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SloConfig {
    pub name: String,
    pub service: String,
    #[serde(default)]
    pub description: String,
    /// Target achievement percentage, in (0, 100].
    pub target_pct: f64,
    pub evaluation_window_secs: u64,
    pub error_budget_window_secs: u64,
    pub warning_threshold_pct: f64,
    pub critical_threshold_pct: f64,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SloConfigError {
    #[error("target must be in (0, 100], got {target}")]
    BadTarget { target: f64 },
    #[error("critical threshold {critical} must not exceed warning threshold {warning}")]
    InvertedThresholds { warning: f64, critical: f64 },
    #[error("windows must be non-zero")]
    ZeroWindow,
}

impl Kinded for SloConfigError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

impl SloConfig {
    pub fn new(name: impl Into<String>, service: impl Into<String>, target_pct: f64) -> Self {
        Self {
            name: name.into(),
            service: service.into(),
            description: String::new(),
            target_pct,
            evaluation_window_secs: 300,
            error_budget_window_secs: 24 * 3600,
            warning_threshold_pct: target_pct - 1.0,
            critical_threshold_pct: target_pct - 2.0,
        }
    }

    pub fn with_thresholds(mut self, warning_pct: f64, critical_pct: f64) -> Self {
        self.warning_threshold_pct = warning_pct;
        self.critical_threshold_pct = critical_pct;
        self
    }

    pub fn validate(&self) -> Result<(), SloConfigError> {
        if !(self.target_pct > 0.0 && self.target_pct <= 100.0) {
            return Err(SloConfigError::BadTarget { target: self.target_pct });
        }
        if self.critical_threshold_pct > self.warning_threshold_pct {
            return Err(SloConfigError::InvertedThresholds {
                warning: self.warning_threshold_pct,
                critical: self.critical_threshold_pct,
            });
        }
        if self.evaluation_window_secs == 0 || self.error_budget_window_secs == 0 {
            return Err(SloConfigError::ZeroWindow);
        }
        Ok(())
    }
}

/// One recorded observation with its derived arithmetic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SloMeasurement {
    pub metric: String,
    pub service: String,
    pub success_count: u64,
    pub total_count: u64,
    pub window_secs: u64,
    pub measured_at: DateTime<Utc>,
    /// `100 * success / total`, or 100 when the window saw no traffic.
    pub actual_pct: f64,
    /// `max(0, actual − (100 − target))`.
    pub error_budget_remaining: f64,
    pub breach: bool,
    pub severity: Option<SloSeverity>,
    pub alert_fired: bool,
}

/// Latest measurement per series plus day-scale aggregates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SloStatus {
    pub latest: SloMeasurement,
    pub measurements_24h: usize,
    pub breaches_24h: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreachAlert {
    pub metric: String,
    pub service: String,
    pub severity: SloSeverity,
    pub actual_pct: f64,
    pub fired_at: DateTime<Utc>,
}

struct Series {
    measurements: Vec<SloMeasurement>,
}

/// Evaluator state. Cheap to share; all methods take `&self`.
pub struct SloEvaluator {
    configs: RwLock<HashMap<String, SloConfig>>,
    series: RwLock<HashMap<(String, String), Series>>,
    /// Last alert instant (clock millis) per `(service, metric, severity)`.
    debounce: RwLock<HashMap<(String, String, SloSeverity), u64>>,
    clock: Arc<dyn Clock>,
    sink: SharedSink,
}

impl SloEvaluator {
    pub fn new(sink: SharedSink) -> Self {
        Self {
            configs: RwLock::new(HashMap::new()),
            series: RwLock::new(HashMap::new()),
            debounce: RwLock::new(HashMap::new()),
            clock: Arc::new(MonotonicClock::default()),
            sink,
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub async fn upsert_config(&self, config: SloConfig) -> Result<(), SloConfigError> {
        config.validate()?;
        self.configs.write().await.insert(config.name.clone(), config);
        Ok(())
    }

    pub async fn config(&self, name: &str) -> Option<SloConfig> {
        self.configs.read().await.get(name).cloned()
    }

    /// Record an observation and derive its arithmetic. Metrics without a
    /// registered config get the platform default (99 / 98 / 97).
    pub async fn record(
        &self,
        metric: &str,
        service: &str,
        success: u64,
        total: u64,
        window_secs: u64,
    ) -> SloMeasurement {
        let config = self.config(metric).await.unwrap_or_else(|| {
            SloConfig::new(metric, service, 99.0).with_thresholds(98.0, 97.0)
        });

        let actual_pct = if total == 0 {
            100.0
        } else {
            100.0 * success.min(total) as f64 / total as f64
        };
        let error_budget_remaining = (actual_pct - (100.0 - config.target_pct)).max(0.0);
        let severity = if actual_pct < config.critical_threshold_pct {
            Some(SloSeverity::Critical)
        } else if actual_pct < config.warning_threshold_pct {
            Some(SloSeverity::Warning)
        } else {
            None
        };
        let measurement = SloMeasurement {
            metric: metric.to_string(),
            service: service.to_string(),
            success_count: success,
            total_count: total,
            window_secs,
            measured_at: Utc::now(),
            actual_pct,
            error_budget_remaining,
            breach: actual_pct < config.target_pct,
            severity,
            alert_fired: false,
        };

        {
            let mut series = self.series.write().await;
            let entry = series
                .entry((metric.to_string(), service.to_string()))
                .or_insert_with(|| Series { measurements: Vec::new() });
            entry.measurements.push(measurement.clone());
            let ttl_floor = Utc::now() - ChronoDuration::days(SERIES_TTL_DAYS);
            entry.measurements.retain(|m| m.measured_at >= ttl_floor);
        }

        self.sink.emit(ControlEvent::Slo(SloEvent::Recorded {
            metric: metric.to_string(),
            service: service.to_string(),
            actual_pct,
            budget_remaining: error_budget_remaining,
        }));
        measurement
    }

    /// Latest measurement per series, optionally narrowed to one service,
    /// with 24 h aggregates.
    pub async fn status(&self, service: Option<&str>) -> Vec<SloStatus> {
        let series = self.series.read().await;
        let day_floor = Utc::now() - ChronoDuration::hours(24);
        let mut statuses: Vec<SloStatus> = series
            .iter()
            .filter(|((_, svc), _)| service.map_or(true, |s| s == svc))
            .filter_map(|(_, s)| {
                let latest = s.measurements.last()?.clone();
                let day: Vec<&SloMeasurement> =
                    s.measurements.iter().filter(|m| m.measured_at >= day_floor).collect();
                Some(SloStatus {
                    measurements_24h: day.len(),
                    breaches_24h: day.iter().filter(|m| m.breach).count(),
                    latest,
                })
            })
            .collect();
        statuses.sort_by(|a, b| {
            (&a.latest.service, &a.latest.metric).cmp(&(&b.latest.service, &b.latest.metric))
        });
        statuses
    }

    /// Observed error rate over the window divided by the allowed error
    /// rate. Above 1.0 means the budget burns faster than the target
    /// permits.
    pub async fn burn_rate(&self, metric: &str, service: &str, hours: u64) -> f64 {
        let allowed = {
            let target = self
                .config(metric)
                .await
                .map(|c| c.target_pct)
                .unwrap_or(99.0);
            (100.0 - target) / 100.0
        };
        let floor = Utc::now() - ChronoDuration::hours(hours as i64);
        let series = self.series.read().await;
        let Some(entry) = series.get(&(metric.to_string(), service.to_string())) else {
            return 0.0;
        };
        let window: Vec<&SloMeasurement> = entry
            .measurements
            .iter()
            .filter(|m| m.measured_at >= floor && m.total_count > 0)
            .collect();
        if window.is_empty() {
            return 0.0;
        }
        let avg_error: f64 = window
            .iter()
            .map(|m| 1.0 - m.success_count.min(m.total_count) as f64 / m.total_count as f64)
            .sum::<f64>()
            / window.len() as f64;
        if allowed <= 0.0 {
            if avg_error > 0.0 {
                f64::INFINITY
            } else {
                0.0
            }
        } else {
            avg_error / allowed
        }
    }

    /// Latest measurements currently in breach; the strategy layer's input.
    pub async fn violations(&self) -> Vec<SloMeasurement> {
        let series = self.series.read().await;
        series
            .values()
            .filter_map(|s| s.measurements.last())
            .filter(|m| m.breach)
            .cloned()
            .collect()
    }

    /// Scan latest measurements and fire alerts for those with a severity,
    /// debounced per `(service, metric, severity)`.
    pub async fn check_breaches(&self) -> Vec<BreachAlert> {
        let now_ms = self.clock.now_millis();
        let mut fired = Vec::new();

        let mut series = self.series.write().await;
        let mut debounce = self.debounce.write().await;
        for entry in series.values_mut() {
            let Some(latest) = entry.measurements.last_mut() else { continue };
            let Some(severity) = latest.severity else { continue };

            let key = (latest.service.clone(), latest.metric.clone(), severity);
            let suppressed = debounce
                .get(&key)
                .is_some_and(|last| now_ms.saturating_sub(*last) < severity.debounce_ms());
            if suppressed {
                continue;
            }
            debounce.insert(key, now_ms);
            latest.alert_fired = true;
            let alert = BreachAlert {
                metric: latest.metric.clone(),
                service: latest.service.clone(),
                severity,
                actual_pct: latest.actual_pct,
                fired_at: Utc::now(),
            };
            self.sink.emit(ControlEvent::Slo(SloEvent::Breach {
                metric: alert.metric.clone(),
                service: alert.service.clone(),
                severity,
                actual_pct: alert.actual_pct,
            }));
            tracing::warn!(
                metric = %alert.metric,
                service = %alert.service,
                severity = ?alert.severity,
                actual_pct = alert.actual_pct,
                "slo breach alert"
            );
            fired.push(alert);
        }
        fired
    }
}
