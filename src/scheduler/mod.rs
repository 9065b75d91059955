//! Fair-share scheduler.
//!
//! Spreads outbound publish jobs across many per-account tokens so no token
//! starves and none exceeds its rate limits. Selection is weighted
//! round-robin in the "least recently and least frequently used" sense;
//! scheduled jobs carry a large human-pacing jitter.

mod token;

pub use token::{CircuitState, TokenBreakerConfig, TokenRecord, TokenTransition};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backpressure::{BackpressureController, DegradationLevel};
use crate::clock::{Clock, MonotonicClock};
use crate::jitter::Jitter;
use crate::ratelimit::{RateDecision, RateGate};
use crate::telemetry::{ControlEvent, GateEvent, SchedulerEvent, SharedSink};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub jitter_min: Duration,
    pub jitter_max: Duration,
    pub breaker: TokenBreakerConfig,
    /// A token unscheduled for this long counts as starved.
    pub starvation_threshold: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            jitter_min: Duration::from_secs(30 * 60),
            jitter_max: Duration::from_secs(90 * 60),
            breaker: TokenBreakerConfig::default(),
            starvation_threshold: Duration::from_secs(2 * 3600),
        }
    }
}

/// Outbound-load gate the scheduler consults before rate limits.
pub trait LoadAdmission: Send + Sync {
    fn admit_outbound(&self, platform: &str, respect_breaker: bool) -> bool;
}

impl LoadAdmission for BackpressureController {
    fn admit_outbound(&self, platform: &str, respect_breaker: bool) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        let state = self.state();
        if state.level >= DegradationLevel::Critical {
            return false;
        }
        if respect_breaker {
            let scope = format!("publish.{platform}");
            if state.open_circuits.iter().any(|c| c == &scope) {
                return false;
            }
        }
        true
    }
}

/// Admit everything; for deployments that run the scheduler standalone.
pub struct NoLoadGate;

impl LoadAdmission for NoLoadGate {
    fn admit_outbound(&self, _platform: &str, _respect_breaker: bool) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleOptions {
    /// Consult the load gate's breaker view for the platform.
    pub respect_breaker: bool,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self { respect_breaker: true }
    }
}

/// A publish job bound to a token, delayed by jitter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledJob {
    pub token_id: String,
    pub platform: String,
    pub endpoint: String,
    pub queue_name: String,
    pub scheduled_at: DateTime<Utc>,
    pub jitter_ms: u64,
    pub estimated_execution_at: DateTime<Utc>,
}

/// Starvation report for one platform.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FairnessReport {
    pub platform: String,
    pub active_tokens: usize,
    pub starved: usize,
    pub max_starvation_minutes: u64,
    pub healthy: bool,
}

struct Registry {
    records: HashMap<(String, String), TokenRecord>,
    /// Registration order; the stable tie-breaker.
    order: Vec<(String, String)>,
}

pub struct FairShareScheduler {
    config: SchedulerConfig,
    registry: Mutex<Registry>,
    load_gate: Arc<dyn LoadAdmission>,
    rate_gate: Arc<dyn RateGate>,
    clock: Arc<dyn Clock>,
    sink: SharedSink,
}

impl FairShareScheduler {
    pub fn new(
        config: SchedulerConfig,
        load_gate: Arc<dyn LoadAdmission>,
        rate_gate: Arc<dyn RateGate>,
        sink: SharedSink,
    ) -> Self {
        Self {
            config,
            registry: Mutex::new(Registry { records: HashMap::new(), order: Vec::new() }),
            load_gate,
            rate_gate,
            clock: Arc::new(MonotonicClock::default()),
            sink,
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Register or reactivate a token. Existing counters survive.
    pub fn upsert_token(&self, token_id: &str, platform: &str) {
        let mut registry = self.lock();
        let key = (token_id.to_string(), platform.to_string());
        if !registry.records.contains_key(&key) {
            registry.order.push(key.clone());
            let record = TokenRecord::new(token_id, platform, self.clock.now_millis());
            registry.records.insert(key, record);
        }
    }

    pub fn set_active(&self, token_id: &str, platform: &str, active: bool) -> bool {
        let mut registry = self.lock();
        match registry.records.get_mut(&(token_id.to_string(), platform.to_string())) {
            Some(record) => {
                record.active = active;
                true
            }
            None => false,
        }
    }

    pub fn token(&self, token_id: &str, platform: &str) -> Option<TokenRecord> {
        self.lock().records.get(&(token_id.to_string(), platform.to_string())).cloned()
    }

    pub fn tokens(&self, platform: &str) -> Vec<TokenRecord> {
        let registry = self.lock();
        registry
            .order
            .iter()
            .filter(|(_, p)| p == platform)
            .filter_map(|key| registry.records.get(key).cloned())
            .collect()
    }

    /// Weighted round-robin pick: least recently, then least frequently
    /// used among eligible tokens; ties broken by registration order. The
    /// winner is stamped inside the same critical section.
    pub fn next_token(&self, platform: &str) -> Option<String> {
        let now_ms = self.clock.now_millis();
        let mut registry = self.lock();
        let Registry { records, order } = &mut *registry;

        let mut best: Option<(u64, u64, usize)> = None;
        let mut winner: Option<(String, String)> = None;
        for (index, key) in order.iter().enumerate() {
            if key.1 != platform {
                continue;
            }
            let Some(record) = records.get_mut(key) else { continue };
            if !record.eligible(now_ms) {
                continue;
            }
            let (last, count) = record.selection_key();
            let candidate = (last, count, index);
            if best.map_or(true, |b| candidate < b) {
                best = Some(candidate);
                winner = Some(key.clone());
            }
        }

        let key = winner?;
        let record = records.get_mut(&key)?;
        record.mark_scheduled(now_ms);
        Some(record.token_id.clone())
    }

    /// Build a jittered job for a token, consulting load then rate
    /// admission. A rate denial cools the token down and yields `None`.
    pub async fn schedule(
        &self,
        token_id: &str,
        platform: &str,
        endpoint: &str,
        options: ScheduleOptions,
    ) -> Option<ScheduledJob> {
        if !self.load_gate.admit_outbound(platform, options.respect_breaker) {
            tracing::debug!(platform, token_id, "outbound load gate refused job");
            return None;
        }

        match self.rate_gate.check(token_id, platform, endpoint).await {
            RateDecision::Allowed { .. } => {}
            RateDecision::Denied { retry_after, .. } => {
                let retry_after_secs = retry_after.as_secs();
                {
                    let mut registry = self.lock();
                    if let Some(record) = registry
                        .records
                        .get_mut(&(token_id.to_string(), platform.to_string()))
                    {
                        record.cooldown_until_ms =
                            Some(self.clock.now_millis() + retry_after.as_millis() as u64);
                    }
                }
                self.sink.emit(ControlEvent::Scheduler(SchedulerEvent::TokenCooledDown {
                    token_id: token_id.to_string(),
                    platform: platform.to_string(),
                    retry_after_secs,
                }));
                return None;
            }
        }

        let jitter = Jitter::range(self.config.jitter_min, self.config.jitter_max)
            .apply(Duration::ZERO);
        let scheduled_at = Utc::now();
        let job = ScheduledJob {
            token_id: token_id.to_string(),
            platform: platform.to_string(),
            endpoint: endpoint.to_string(),
            queue_name: format!("publish:{platform}:{token_id}"),
            scheduled_at,
            jitter_ms: jitter.as_millis() as u64,
            estimated_execution_at: scheduled_at
                + chrono::Duration::milliseconds(jitter.as_millis() as i64),
        };
        self.sink.emit(ControlEvent::Scheduler(SchedulerEvent::JobScheduled {
            token_id: job.token_id.clone(),
            platform: job.platform.clone(),
            jitter_ms: job.jitter_ms,
        }));
        Some(job)
    }

    pub fn record_success(&self, token_id: &str, platform: &str, duration: Duration) {
        let now_ms = self.clock.now_millis();
        let transition = {
            let mut registry = self.lock();
            registry
                .records
                .get_mut(&(token_id.to_string(), platform.to_string()))
                .and_then(|record| record.record_success(duration, now_ms))
        };
        self.emit_transition(token_id, platform, transition);
    }

    pub fn record_failure(&self, token_id: &str, platform: &str, error: &str) {
        let now_ms = self.clock.now_millis();
        let transition = {
            let mut registry = self.lock();
            registry
                .records
                .get_mut(&(token_id.to_string(), platform.to_string()))
                .and_then(|record| record.record_failure(&self.config.breaker, now_ms))
        };
        if transition.is_some() {
            tracing::warn!(token_id, platform, error, "token circuit opened");
        }
        self.emit_transition(token_id, platform, transition);
    }

    fn emit_transition(
        &self,
        token_id: &str,
        platform: &str,
        transition: Option<TokenTransition>,
    ) {
        let scope = format!("{platform}:{token_id}");
        let event = match transition {
            Some(TokenTransition::Opened { failures, cooldown_ms }) => {
                GateEvent::BreakerOpened { scope, failures, cooldown_ms }
            }
            Some(TokenTransition::HalfOpen) => GateEvent::BreakerHalfOpen { scope },
            Some(TokenTransition::Closed) => GateEvent::BreakerClosed { scope },
            None => return,
        };
        self.sink.emit(ControlEvent::Gate(event));
    }

    /// Starved = active tokens whose last grant is older than the
    /// starvation threshold (registration time stands in for tokens never
    /// scheduled).
    pub fn check_fairness(&self, platform: &str) -> FairnessReport {
        let now_ms = self.clock.now_millis();
        let threshold_ms = self.config.starvation_threshold.as_millis() as u64;
        let registry = self.lock();

        let mut active_tokens = 0;
        let mut starved = 0;
        let mut max_gap_ms: u64 = 0;
        for record in registry.records.values() {
            if record.platform != platform || !record.active {
                continue;
            }
            active_tokens += 1;
            let reference = record.last_scheduled_at_ms.unwrap_or(record.registered_at_ms);
            let gap = now_ms.saturating_sub(reference);
            max_gap_ms = max_gap_ms.max(gap);
            if gap > threshold_ms {
                starved += 1;
            }
        }
        let max_starvation_minutes = max_gap_ms / 60_000;
        FairnessReport {
            platform: platform.to_string(),
            active_tokens,
            starved,
            max_starvation_minutes,
            healthy: starved == 0 && max_starvation_minutes < 120,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::Tier;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubRateGate {
        deny: AtomicBool,
        retry_after: Duration,
    }

    impl StubRateGate {
        fn allowing() -> Self {
            Self { deny: AtomicBool::new(false), retry_after: Duration::from_secs(45) }
        }

        fn set_deny(&self, deny: bool) {
            self.deny.store(deny, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RateGate for StubRateGate {
        async fn check(&self, _token: &str, _platform: &str, _endpoint: &str) -> RateDecision {
            if self.deny.load(Ordering::SeqCst) {
                RateDecision::Denied { tier: Tier::Minute, retry_after: self.retry_after }
            } else {
                RateDecision::Allowed { remaining: 10 }
            }
        }
    }

    fn scheduler_with(
        clock: ManualClock,
        rate_gate: Arc<StubRateGate>,
    ) -> FairShareScheduler {
        FairShareScheduler::new(
            SchedulerConfig::default(),
            Arc::new(NoLoadGate),
            rate_gate,
            SharedSink::null(),
        )
        .with_clock(clock)
    }

    #[test]
    fn selection_rotates_across_eligible_tokens() {
        let clock = ManualClock::new();
        let scheduler = scheduler_with(clock.clone(), Arc::new(StubRateGate::allowing()));
        for token in ["a", "b", "c"] {
            scheduler.upsert_token(token, "instagram");
        }

        let mut picks = Vec::new();
        for step in 0..6 {
            clock.set(1_000 * (step + 1));
            picks.push(scheduler.next_token("instagram").unwrap());
        }
        assert_eq!(picks, ["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn never_scheduled_tokens_win_over_recent_ones() {
        let clock = ManualClock::new();
        let scheduler = scheduler_with(clock.clone(), Arc::new(StubRateGate::allowing()));
        scheduler.upsert_token("veteran", "instagram");
        clock.set(5_000);
        assert_eq!(scheduler.next_token("instagram").unwrap(), "veteran");

        scheduler.upsert_token("fresh", "instagram");
        clock.set(10_000);
        assert_eq!(scheduler.next_token("instagram").unwrap(), "fresh");
    }

    #[test]
    fn inactive_and_open_circuit_tokens_are_skipped() {
        let clock = ManualClock::new();
        let scheduler = scheduler_with(clock.clone(), Arc::new(StubRateGate::allowing()));
        scheduler.upsert_token("dead", "instagram");
        scheduler.upsert_token("broken", "instagram");
        scheduler.upsert_token("ok", "instagram");

        scheduler.set_active("dead", "instagram", false);
        for _ in 0..5 {
            scheduler.record_failure("broken", "instagram", "api 500");
        }

        clock.set(1_000);
        assert_eq!(scheduler.next_token("instagram").unwrap(), "ok");
        assert_eq!(scheduler.next_token("instagram").unwrap(), "ok");
    }

    #[tokio::test]
    async fn schedule_builds_a_jittered_job() {
        let clock = ManualClock::new();
        let scheduler = scheduler_with(clock.clone(), Arc::new(StubRateGate::allowing()));
        scheduler.upsert_token("t1", "instagram");

        let job = scheduler
            .schedule("t1", "instagram", "post", ScheduleOptions::default())
            .await
            .unwrap();
        assert_eq!(job.queue_name, "publish:instagram:t1");
        assert!(job.jitter_ms >= 30 * 60 * 1000);
        assert!(job.jitter_ms <= 90 * 60 * 1000);
        assert!(job.estimated_execution_at > job.scheduled_at);
    }

    #[tokio::test]
    async fn rate_denial_cools_the_token_down() {
        let clock = ManualClock::new();
        let gate = Arc::new(StubRateGate::allowing());
        let scheduler = scheduler_with(clock.clone(), gate.clone());
        scheduler.upsert_token("t1", "instagram");

        gate.set_deny(true);
        let job = scheduler
            .schedule("t1", "instagram", "post", ScheduleOptions::default())
            .await;
        assert!(job.is_none());

        let record = scheduler.token("t1", "instagram").unwrap();
        assert_eq!(record.cooldown_until_ms, Some(45_000));
        assert!(scheduler.next_token("instagram").is_none(), "cooling token is ineligible");

        clock.set(45_000);
        assert_eq!(scheduler.next_token("instagram").unwrap(), "t1");
    }

    #[tokio::test]
    async fn breaker_cycle_matches_the_token_contract() {
        let clock = ManualClock::new();
        let scheduler = scheduler_with(clock.clone(), Arc::new(StubRateGate::allowing()));
        scheduler.upsert_token("t", "p");

        for _ in 0..5 {
            scheduler.record_failure("t", "p", "timeout");
        }
        let record = scheduler.token("t", "p").unwrap();
        assert_eq!(record.circuit_state, CircuitState::Open);
        assert_eq!(record.cooldown_until_ms, Some(300_000));
        assert!(scheduler.next_token("p").is_none());

        clock.set(300_000);
        scheduler.record_success("t", "p", Duration::from_millis(500));
        let record = scheduler.token("t", "p").unwrap();
        assert_eq!(record.circuit_state, CircuitState::Closed);
        assert_eq!(record.failure_count, 0);
        assert_eq!(scheduler.next_token("p").unwrap(), "t");
    }

    #[test]
    fn fairness_flags_starved_tokens() {
        let clock = ManualClock::new();
        let scheduler = scheduler_with(clock.clone(), Arc::new(StubRateGate::allowing()));
        scheduler.upsert_token("busy", "instagram");
        scheduler.upsert_token("idle", "instagram");

        clock.set(1_000);
        // keep "busy" fresh, leave "idle" unscheduled
        assert_eq!(scheduler.next_token("instagram").unwrap(), "busy");

        clock.set(3 * 3600 * 1000);
        assert_eq!(scheduler.next_token("instagram").unwrap(), "idle");
        // idle was just granted; busy is now ~3 h stale
        let report = scheduler.check_fairness("instagram");
        assert_eq!(report.active_tokens, 2);
        assert_eq!(report.starved, 1);
        assert!(report.max_starvation_minutes >= 179);
        assert!(!report.healthy);
    }

    #[test]
    fn fairness_is_healthy_under_rotation() {
        let clock = ManualClock::new();
        let scheduler = scheduler_with(clock.clone(), Arc::new(StubRateGate::allowing()));
        scheduler.upsert_token("a", "instagram");
        scheduler.upsert_token("b", "instagram");
        clock.set(1_000);
        scheduler.next_token("instagram");
        scheduler.next_token("instagram");

        let report = scheduler.check_fairness("instagram");
        assert_eq!(report.starved, 0);
        assert!(report.healthy);
    }

    #[test]
    fn no_starvation_under_steady_scheduling() {
        // with N eligible tokens, any token waits at most N grants
        let clock = ManualClock::new();
        let scheduler = scheduler_with(clock.clone(), Arc::new(StubRateGate::allowing()));
        let tokens = ["a", "b", "c", "d"];
        for token in tokens {
            scheduler.upsert_token(token, "x");
        }

        let mut gaps: HashMap<String, u64> = HashMap::new();
        let mut last_pick: HashMap<String, u64> = HashMap::new();
        for step in 0..40u64 {
            clock.set((step + 1) * 1_000);
            let pick = scheduler.next_token("x").unwrap();
            if let Some(prev) = last_pick.get(&pick) {
                let gap = (step + 1) * 1_000 - prev;
                let entry = gaps.entry(pick.clone()).or_default();
                *entry = (*entry).max(gap);
            }
            last_pick.insert(pick, (step + 1) * 1_000);
        }
        for (token, gap) in gaps {
            assert!(gap <= tokens.len() as u64 * 1_000, "{token} starved: {gap}ms");
        }
    }
}
