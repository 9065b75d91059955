//! Typed configuration for the whole control plane.
//!
//! Loaded once and validated before anything starts; there is no other
//! process-wide state. Every component receives its slice explicitly from
//! the composition root.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::backpressure::BackpressureConfig;
use crate::error::{ErrorKind, Kinded};
use crate::etl::EtlConfig;
use crate::event::SchemaOptions;
use crate::ratelimit::RateLimitConfig;
use crate::scheduler::SchedulerConfig;
use crate::slo::{SloConfig, SloConfigError};

/// Cadence of the background workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerConfig {
    /// Resource sampling and ladder recomputation.
    pub monitor_interval: Duration,
    /// Priority-queue dispatch.
    pub drain_interval: Duration,
    /// Strategy reevaluation (trend rings feed off this).
    pub trend_interval: Duration,
    /// SLO breach scan.
    pub breach_interval: Duration,
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(1),
            drain_interval: Duration::from_millis(100),
            trend_interval: Duration::from_secs(10),
            breach_interval: Duration::from_secs(30),
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CoreConfig {
    pub schema: SchemaOptions,
    pub backpressure: BackpressureConfig,
    pub etl: EtlConfig,
    pub scheduler: SchedulerConfig,
    pub tickers: TickerConfig,
    /// Rate-limit table applied at startup, keyed `(platform, endpoint)`.
    pub rate_limits: Vec<RateLimitConfig>,
    /// SLO registry applied at startup, keyed by name.
    pub slos: Vec<SloConfig>,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("backpressure.max_queue_size must be positive")]
    ZeroQueueBound,
    #[error("backpressure.publish_retry_limit must be positive")]
    ZeroRetryLimit,
    #[error("etl.batch_size must be positive")]
    ZeroBatchSize,
    #[error("etl.retry_attempts must be positive")]
    ZeroRetryAttempts,
    #[error("etl.max_concurrent_batches must be positive")]
    ZeroConcurrency,
    #[error("scheduler jitter bounds inverted: min {min_ms}ms > max {max_ms}ms")]
    InvertedJitter { min_ms: u64, max_ms: u64 },
    #[error("duplicate rate limit for {platform}/{endpoint}")]
    DuplicateRateLimit { platform: String, endpoint: String },
    #[error("duplicate slo {name}")]
    DuplicateSlo { name: String },
    #[error("slo {name}: {source}")]
    BadSlo {
        name: String,
        #[source]
        source: SloConfigError,
    },
    #[error("ticker intervals must be non-zero")]
    ZeroTicker,
}

impl Kinded for ConfigError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

impl CoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backpressure.max_queue_size == 0 {
            return Err(ConfigError::ZeroQueueBound);
        }
        if self.backpressure.publish_retry_limit == 0 {
            return Err(ConfigError::ZeroRetryLimit);
        }
        if self.etl.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.etl.retry_attempts == 0 {
            return Err(ConfigError::ZeroRetryAttempts);
        }
        if self.etl.max_concurrent_batches == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.scheduler.jitter_min > self.scheduler.jitter_max {
            return Err(ConfigError::InvertedJitter {
                min_ms: self.scheduler.jitter_min.as_millis() as u64,
                max_ms: self.scheduler.jitter_max.as_millis() as u64,
            });
        }
        if self.tickers.monitor_interval.is_zero()
            || self.tickers.drain_interval.is_zero()
            || self.tickers.trend_interval.is_zero()
            || self.tickers.breach_interval.is_zero()
        {
            return Err(ConfigError::ZeroTicker);
        }

        let mut limit_keys = std::collections::HashSet::new();
        for limit in &self.rate_limits {
            if !limit_keys.insert((limit.platform.clone(), limit.endpoint.clone())) {
                return Err(ConfigError::DuplicateRateLimit {
                    platform: limit.platform.clone(),
                    endpoint: limit.endpoint.clone(),
                });
            }
        }

        let mut slo_names = std::collections::HashSet::new();
        for slo in &self.slos {
            if !slo_names.insert(slo.name.clone()) {
                return Err(ConfigError::DuplicateSlo { name: slo.name.clone() });
            }
            slo.validate()
                .map_err(|source| ConfigError::BadSlo { name: slo.name.clone(), source })?;
        }
        Ok(())
    }
}
