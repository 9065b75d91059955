//! Metric event data model and wire schema.
//!
//! Events are JSON on the wire with camelCase field names. Free-form data
//! survives only inside `metadata`; everything else is typed here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::error::{ErrorKind, Kinded};

/// Producer-assigned severity class. Ordering is total: `Low < Medium <
/// High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Subject token for this class. `Medium` maps to `normal` on the wire.
    pub fn subject_class(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

/// Typed metric value at the producer boundary.
///
/// The wire carries a bare finite number; a decoded event reads back as a
/// gauge. The variant distinction exists for producers that want their
/// intent visible in code, not on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(into = "f64", try_from = "f64")]
pub enum MetricValue {
    Count(u64),
    Rate(f64),
    Gauge(f64),
}

impl MetricValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            MetricValue::Count(n) => *n as f64,
            MetricValue::Rate(x) | MetricValue::Gauge(x) => *x,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.as_f64().is_finite()
    }
}

impl From<MetricValue> for f64 {
    fn from(value: MetricValue) -> f64 {
        value.as_f64()
    }
}

impl TryFrom<f64> for MetricValue {
    type Error = EventError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() {
            return Err(EventError::NonFiniteValue { value });
        }
        Ok(MetricValue::Gauge(value))
    }
}

/// Options applied when validating incoming events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaOptions {
    /// Admit negative gauge values (some KPIs are deltas).
    pub allow_negative: bool,
}

impl Default for SchemaOptions {
    fn default() -> Self {
        Self { allow_negative: false }
    }
}

/// The universal ingestion record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricEvent {
    /// Globally unique id; the dedup key within the duplicate window.
    pub id: String,
    pub model_name: String,
    pub metric_name: String,
    pub value: MetricValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EventError {
    #[error("event id must be non-empty")]
    EmptyId,
    #[error("modelName must be non-empty")]
    EmptyModelName,
    #[error("metricName must be non-empty alphanumeric/underscore, got {name:?}")]
    BadMetricName { name: String },
    #[error("value must be finite, got {value}")]
    NonFiniteValue { value: f64 },
    #[error("value must be non-negative, got {value}")]
    NegativeValue { value: f64 },
    #[error("source must be non-empty")]
    EmptySource,
}

impl Kinded for EventError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

impl MetricEvent {
    /// New event with a generated id and the current timestamp.
    pub fn new(
        model_name: impl Into<String>,
        metric_name: impl Into<String>,
        value: MetricValue,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            model_name: model_name.into(),
            metric_name: metric_name.into(),
            value,
            platform: None,
            campaign_id: None,
            metadata: BTreeMap::new(),
            timestamp: Utc::now(),
            source: source.into(),
            priority: Priority::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_campaign(mut self, campaign_id: impl Into<String>) -> Self {
        self.campaign_id = Some(campaign_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Routing subject: `kpi.metrics.<model>.<priority-class>`. Model names
    /// are lowered and any token-unsafe character becomes `_`.
    pub fn subject(&self) -> String {
        format!(
            "kpi.metrics.{}.{}",
            sanitize_token(&self.model_name),
            self.priority.subject_class()
        )
    }

    /// Wire-schema validation. Violations are `Validation` kind and never
    /// retried.
    pub fn validate(&self, options: &SchemaOptions) -> Result<(), EventError> {
        if self.id.trim().is_empty() {
            return Err(EventError::EmptyId);
        }
        if self.model_name.trim().is_empty() {
            return Err(EventError::EmptyModelName);
        }
        if self.metric_name.is_empty()
            || !self.metric_name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(EventError::BadMetricName { name: self.metric_name.clone() });
        }
        let value = self.value.as_f64();
        if !value.is_finite() {
            return Err(EventError::NonFiniteValue { value });
        }
        if value < 0.0 && !options.allow_negative {
            return Err(EventError::NegativeValue { value });
        }
        if self.source.trim().is_empty() {
            return Err(EventError::EmptySource);
        }
        Ok(())
    }
}

fn sanitize_token(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
