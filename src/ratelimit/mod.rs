//! Multi-window rate limiter.
//!
//! Sliding-window counting across burst / minute / hour / day tiers, per
//! `(token, platform, endpoint)`. Admission is atomic per key; a backing
//! store failure fails **open** (the scheduler's breakers are the safety
//! net) and bumps an error counter.

mod window;

pub use window::{AdmitOutcome, MemoryWindowStore, Tier, TierSpec, TierUsage, WindowStore};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::clock::{Clock, MonotonicClock};
use crate::telemetry::{ControlEvent, LimitEvent, SharedSink};

/// Limits for one `(platform, endpoint)`. A missing tier means no limit on
/// that tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub platform: String,
    pub endpoint: String,
    #[serde(default)]
    pub per_minute: Option<u32>,
    #[serde(default)]
    pub per_hour: Option<u32>,
    #[serde(default)]
    pub per_day: Option<u32>,
    #[serde(default)]
    pub burst_limit: Option<u32>,
    #[serde(default = "default_burst_window_secs")]
    pub burst_window_secs: u64,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_burst_window_secs() -> u64 {
    10
}

fn default_active() -> bool {
    true
}

impl RateLimitConfig {
    pub fn new(platform: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            endpoint: endpoint.into(),
            per_minute: None,
            per_hour: None,
            per_day: None,
            burst_limit: None,
            burst_window_secs: default_burst_window_secs(),
            active: true,
        }
    }

    pub fn per_minute(mut self, limit: u32) -> Self {
        self.per_minute = Some(limit);
        self
    }

    pub fn per_hour(mut self, limit: u32) -> Self {
        self.per_hour = Some(limit);
        self
    }

    pub fn per_day(mut self, limit: u32) -> Self {
        self.per_day = Some(limit);
        self
    }

    pub fn burst(mut self, limit: u32, window: Duration) -> Self {
        self.burst_limit = Some(limit);
        self.burst_window_secs = window.as_secs().max(1);
        self
    }

    /// Configured tiers in evaluation order: burst, minute, hour, day.
    fn tier_specs(&self) -> Vec<TierSpec> {
        let mut specs = Vec::with_capacity(4);
        if let Some(limit) = self.burst_limit {
            specs.push(TierSpec {
                tier: Tier::Burst,
                limit,
                window_ms: self.burst_window_secs * 1_000,
            });
        }
        if let Some(limit) = self.per_minute {
            specs.push(TierSpec { tier: Tier::Minute, limit, window_ms: 60_000 });
        }
        if let Some(limit) = self.per_hour {
            specs.push(TierSpec { tier: Tier::Hour, limit, window_ms: 3_600_000 });
        }
        if let Some(limit) = self.per_day {
            specs.push(TierSpec { tier: Tier::Day, limit, window_ms: 86_400_000 });
        }
        specs
    }
}

/// Admission decision for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Denied { tier: Tier, retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateDecision::Denied { retry_after, .. } => Some(*retry_after),
            RateDecision::Allowed { .. } => None,
        }
    }
}

/// Sliding-window limiter over a pluggable [`WindowStore`].
pub struct MultiWindowLimiter<S = MemoryWindowStore> {
    store: S,
    configs: RwLock<HashMap<(String, String), RateLimitConfig>>,
    clock: Arc<dyn Clock>,
    sink: SharedSink,
    request_seq: AtomicU64,
    store_failures: AtomicU64,
}

impl MultiWindowLimiter<MemoryWindowStore> {
    pub fn in_memory(sink: SharedSink) -> Self {
        Self::new(MemoryWindowStore::new(), sink)
    }
}

impl<S: WindowStore> MultiWindowLimiter<S> {
    pub fn new(store: S, sink: SharedSink) -> Self {
        Self {
            store,
            configs: RwLock::new(HashMap::new()),
            clock: Arc::new(MonotonicClock::default()),
            sink,
            request_seq: AtomicU64::new(0),
            store_failures: AtomicU64::new(0),
        }
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub async fn upsert_config(&self, config: RateLimitConfig) {
        let key = (config.platform.clone(), config.endpoint.clone());
        self.configs.write().await.insert(key, config);
    }

    pub async fn set_active(&self, platform: &str, endpoint: &str, active: bool) -> bool {
        let mut configs = self.configs.write().await;
        match configs.get_mut(&(platform.to_string(), endpoint.to_string())) {
            Some(config) => {
                config.active = active;
                true
            }
            None => false,
        }
    }

    pub async fn config(&self, platform: &str, endpoint: &str) -> Option<RateLimitConfig> {
        self.configs.read().await.get(&(platform.to_string(), endpoint.to_string())).cloned()
    }

    /// Times the backing store failed and admission failed open.
    pub fn store_failures(&self) -> u64 {
        self.store_failures.load(Ordering::Relaxed)
    }

    /// Atomic admission across every configured tier of the key.
    pub async fn check(&self, token: &str, platform: &str, endpoint: &str) -> RateDecision {
        let specs = {
            let configs = self.configs.read().await;
            match configs.get(&(platform.to_string(), endpoint.to_string())) {
                Some(config) if config.active => config.tier_specs(),
                _ => return RateDecision::Allowed { remaining: u32::MAX },
            }
        };
        if specs.is_empty() {
            return RateDecision::Allowed { remaining: u32::MAX };
        }

        let key = limiter_key(token, platform, endpoint);
        let now_ms = self.clock.now_millis();
        let request_id = self.request_seq.fetch_add(1, Ordering::Relaxed);

        match self.store.admit(&key, &specs, now_ms, request_id).await {
            Ok(AdmitOutcome::Allowed { remaining }) => RateDecision::Allowed { remaining },
            Ok(AdmitOutcome::Denied { tier, retry_after_secs }) => {
                self.sink.emit(ControlEvent::Limit(LimitEvent::Denied {
                    key: key.clone(),
                    tier: tier.as_str().to_string(),
                    retry_after_secs,
                }));
                RateDecision::Denied { tier, retry_after: Duration::from_secs(retry_after_secs) }
            }
            Err(e) => {
                // Never fail closed on infrastructure faults.
                self.store_failures.fetch_add(1, Ordering::Relaxed);
                self.sink.emit(ControlEvent::Limit(LimitEvent::StoreFailure {
                    detail: e.to_string(),
                }));
                tracing::error!(%key, error = %e, "window store failed; admitting open");
                RateDecision::Allowed { remaining: 0 }
            }
        }
    }

    /// Per-tier occupancy for one key.
    pub async fn usage(
        &self,
        token: &str,
        platform: &str,
        endpoint: &str,
    ) -> Vec<TierUsage> {
        let specs = {
            let configs = self.configs.read().await;
            match configs.get(&(platform.to_string(), endpoint.to_string())) {
                Some(config) => config.tier_specs(),
                None => return Vec::new(),
            }
        };
        let key = limiter_key(token, platform, endpoint);
        match self.store.usage(&key, &specs, self.clock.now_millis()).await {
            Ok(usage) => usage,
            Err(e) => {
                tracing::error!(%key, error = %e, "window store usage read failed");
                Vec::new()
            }
        }
    }

    /// Administrative reset. Narrows by platform and endpoint when given.
    pub async fn reset(
        &self,
        token: &str,
        platform: Option<&str>,
        endpoint: Option<&str>,
    ) -> u64 {
        let prefix = match (platform, endpoint) {
            (Some(p), Some(e)) => limiter_key(token, p, e),
            (Some(p), None) => format!("{token}:{p}:"),
            _ => format!("{token}:"),
        };
        match self.store.reset_prefix(&prefix).await {
            Ok(cleared) => cleared,
            Err(e) => {
                tracing::error!(%prefix, error = %e, "window store reset failed");
                0
            }
        }
    }
}

fn limiter_key(token: &str, platform: &str, endpoint: &str) -> String {
    format!("{token}:{platform}:{endpoint}")
}

/// Admission seam consumers depend on instead of a concrete limiter, so
/// tests and alternative backends slot in.
#[async_trait::async_trait]
pub trait RateGate: Send + Sync {
    async fn check(&self, token: &str, platform: &str, endpoint: &str) -> RateDecision;
}

#[async_trait::async_trait]
impl<S: WindowStore> RateGate for MultiWindowLimiter<S> {
    async fn check(&self, token: &str, platform: &str, endpoint: &str) -> RateDecision {
        MultiWindowLimiter::check(self, token, platform, endpoint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter_with_clock(clock: ManualClock) -> MultiWindowLimiter {
        MultiWindowLimiter::in_memory(SharedSink::null()).with_clock(clock)
    }

    #[tokio::test]
    async fn unconfigured_endpoints_are_unlimited() {
        let limiter = MultiWindowLimiter::in_memory(SharedSink::null());
        let decision = limiter.check("t", "instagram", "post").await;
        assert_eq!(decision, RateDecision::Allowed { remaining: u32::MAX });
    }

    #[tokio::test]
    async fn minute_tier_denies_the_sixth_call() {
        let clock = ManualClock::new();
        let limiter = limiter_with_clock(clock.clone());
        limiter
            .upsert_config(RateLimitConfig::new("instagram", "post").per_minute(5))
            .await;

        for _ in 0..5 {
            clock.advance(1_000);
            assert!(limiter.check("t", "instagram", "post").await.is_allowed());
        }
        let denied = limiter.check("t", "instagram", "post").await;
        match denied {
            RateDecision::Denied { tier, retry_after } => {
                assert_eq!(tier, Tier::Minute);
                assert!(retry_after >= Duration::from_secs(55));
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("expected denial, got {other:?}"),
        }

        // One second past the first call's 60-s mark the window frees up.
        clock.set(61_001);
        assert!(limiter.check("t", "instagram", "post").await.is_allowed());
    }

    #[tokio::test]
    async fn tiers_evaluate_burst_first() {
        let clock = ManualClock::new();
        let limiter = limiter_with_clock(clock.clone());
        limiter
            .upsert_config(
                RateLimitConfig::new("instagram", "post")
                    .burst(1, Duration::from_secs(10))
                    .per_minute(100),
            )
            .await;

        assert!(limiter.check("t", "instagram", "post").await.is_allowed());
        let denied = limiter.check("t", "instagram", "post").await;
        assert!(matches!(denied, RateDecision::Denied { tier: Tier::Burst, .. }));
    }

    #[tokio::test]
    async fn keys_are_isolated_per_token() {
        let clock = ManualClock::new();
        let limiter = limiter_with_clock(clock.clone());
        limiter
            .upsert_config(RateLimitConfig::new("instagram", "post").per_minute(1))
            .await;

        assert!(limiter.check("t1", "instagram", "post").await.is_allowed());
        assert!(limiter.check("t2", "instagram", "post").await.is_allowed());
        assert!(!limiter.check("t1", "instagram", "post").await.is_allowed());
    }

    #[tokio::test]
    async fn inactive_configs_admit_everything() {
        let limiter = MultiWindowLimiter::in_memory(SharedSink::null());
        limiter
            .upsert_config(RateLimitConfig::new("instagram", "post").per_minute(0))
            .await;
        assert!(!limiter.check("t", "instagram", "post").await.is_allowed());

        assert!(limiter.set_active("instagram", "post", false).await);
        assert!(limiter.check("t", "instagram", "post").await.is_allowed());
    }

    #[tokio::test]
    async fn reset_restores_capacity() {
        let limiter = MultiWindowLimiter::in_memory(SharedSink::null());
        limiter
            .upsert_config(RateLimitConfig::new("instagram", "post").per_minute(1))
            .await;
        assert!(limiter.check("t", "instagram", "post").await.is_allowed());
        assert!(!limiter.check("t", "instagram", "post").await.is_allowed());

        assert_eq!(limiter.reset("t", None, None).await, 1);
        assert!(limiter.check("t", "instagram", "post").await.is_allowed());
    }

    #[tokio::test]
    async fn usage_reports_counts_and_limits() {
        let limiter = MultiWindowLimiter::in_memory(SharedSink::null());
        limiter
            .upsert_config(RateLimitConfig::new("instagram", "post").per_minute(5))
            .await;
        limiter.check("t", "instagram", "post").await;
        limiter.check("t", "instagram", "post").await;

        let usage = limiter.usage("t", "instagram", "post").await;
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].tier, Tier::Minute);
        assert_eq!(usage[0].count, 2);
        assert_eq!(usage[0].limit, 5);
    }
}
