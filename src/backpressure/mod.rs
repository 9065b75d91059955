//! Backpressure controller.
//!
//! Keeps the system inside a stable operating region by watching four
//! normalized resource ratios and working four mitigation levers: sampling,
//! priority queueing, adaptive batching, and per-subject circuit breakers.
//! The monitoring ticker is the single writer of [`BackpressureState`];
//! everyone else reads atomic snapshots.

mod breaker;
mod level;
mod queue;

pub use breaker::{BreakerConfig, CircuitState, SubjectBreaker};
pub use level::{
    DegradationLevel, LeverSettings, ResourceKind, ResourceReadings, ResourceThresholds,
};
pub use queue::{PriorityQueue, QueuedMessage};

use arc_swap::ArcSwap;
use bytes::Bytes;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::clock::{Clock, MonotonicClock};
use crate::delay_queue::DelayQueue;
use crate::error::DropReason;
use crate::event::Priority;
use crate::gateway::{GatewayError, StreamGateway, DEAD_LETTER_SUBJECT};
use crate::telemetry::{ControlEvent, GateEvent, SharedSink};

/// Controller tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackpressureConfig {
    pub thresholds: ResourceThresholds,
    /// Nominal queue bound; admission tolerates 20 % overflow.
    pub max_queue_size: usize,
    pub breaker: BreakerConfig,
    /// Publish retries before a queued message is dead-lettered.
    pub publish_retry_limit: u32,
    /// Base for the `2^n` requeue delay.
    pub retry_base: Duration,
    /// Ceiling for requeue delays and breaker cooldowns.
    pub max_backoff: Duration,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            thresholds: ResourceThresholds::default(),
            max_queue_size: 10_000,
            breaker: BreakerConfig::default(),
            publish_retry_limit: 3,
            retry_base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
        }
    }
}

/// Resource signals the monitor ticker samples from outside the controller.
/// Queue depth is the controller's own and is filled in internally.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ExternalSignals {
    pub memory_mb: f64,
    pub publish_rate: f64,
    pub cpu_pct: f64,
}

/// The controller's authoritative snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackpressureState {
    pub readings: ResourceReadings,
    pub ratios: Vec<(ResourceKind, f64)>,
    pub pressure: f64,
    pub level: DegradationLevel,
    pub sampling_rate: f64,
    pub batch_size: usize,
    pub queue_depth: usize,
    pub open_circuits: Vec<String>,
    pub shutting_down: bool,
}

impl BackpressureState {
    fn idle() -> Self {
        let level = DegradationLevel::None;
        let levers = level.levers();
        Self {
            readings: ResourceReadings::default(),
            ratios: ResourceKind::ALL.iter().map(|k| (*k, 0.0)).collect(),
            pressure: 0.0,
            level,
            sampling_rate: levers.sampling_rate,
            batch_size: levers.batch_size,
            queue_depth: 0,
            open_circuits: Vec::new(),
            shutting_down: false,
        }
    }
}

/// Outcome of one admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Fast path: went straight through the gateway.
    Published { seq: u64 },
    /// Accepted into the priority queue (or the retry queue).
    Enqueued,
    Dropped { reason: DropReason },
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Admission::Dropped { .. })
    }
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    published: AtomicU64,
    dropped_circuit: AtomicU64,
    dropped_sampling: AtomicU64,
    dropped_priority: AtomicU64,
    dropped_queue_full: AtomicU64,
    dropped_shutdown: AtomicU64,
    publish_failures: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    dead_letter_failures: AtomicU64,
}

/// Counter snapshot plus current lever positions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackpressureMetrics {
    pub accepted: u64,
    pub published: u64,
    pub dropped_circuit: u64,
    pub dropped_sampling: u64,
    pub dropped_priority: u64,
    pub dropped_queue_full: u64,
    pub dropped_shutdown: u64,
    pub publish_failures: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub dead_letter_failures: u64,
    pub queue_depth: usize,
    pub level: DegradationLevel,
    pub sampling_rate: f64,
    pub batch_size: usize,
    pub open_circuits: Vec<String>,
}

pub struct BackpressureController {
    config: BackpressureConfig,
    gateway: Arc<dyn StreamGateway>,
    snapshot: ArcSwap<BackpressureState>,
    queue: Mutex<PriorityQueue>,
    breakers: Mutex<HashMap<String, Arc<SubjectBreaker>>>,
    requeue: DelayQueue<QueuedMessage>,
    clock: Arc<dyn Clock>,
    sink: SharedSink,
    counters: Counters,
    shutting_down: AtomicBool,
}

impl BackpressureController {
    pub fn new(
        config: BackpressureConfig,
        gateway: Arc<dyn StreamGateway>,
        sink: SharedSink,
    ) -> Self {
        Self {
            config,
            gateway,
            snapshot: ArcSwap::from_pointee(BackpressureState::idle()),
            queue: Mutex::new(PriorityQueue::new()),
            breakers: Mutex::new(HashMap::new()),
            requeue: DelayQueue::new(),
            clock: Arc::new(MonotonicClock::default()),
            sink,
            counters: Counters::default(),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn with_clock<C: Clock + Clone + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Latest snapshot; cheap, lock-free.
    pub fn state(&self) -> Arc<BackpressureState> {
        self.snapshot.load_full()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Get or create the breaker for a subject.
    pub fn breaker(&self, subject: &str) -> Arc<SubjectBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        breakers
            .entry(subject.to_string())
            .or_insert_with(|| {
                Arc::new(SubjectBreaker::new(subject, self.config.breaker, self.sink.clone()))
            })
            .clone()
    }

    fn existing_breaker(&self, subject: &str) -> Option<Arc<SubjectBreaker>> {
        self.breakers.lock().unwrap_or_else(|p| p.into_inner()).get(subject).cloned()
    }

    fn open_circuits(&self) -> Vec<String> {
        let breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        breakers
            .values()
            .filter(|b| b.is_open())
            .map(|b| b.scope().to_string())
            .collect()
    }

    /// Admission pipeline. Evaluation order: shutdown, fast path, circuit
    /// breaker, per-class shedding/sampling, queue bound.
    pub async fn publish(&self, subject: &str, payload: Bytes, priority: Priority) -> Admission {
        if self.is_shutting_down() {
            return self.reject(subject, DropReason::ShuttingDown);
        }

        let (pressure, level, sampling_rate) = {
            let state = self.snapshot.load();
            (state.pressure, state.level, state.sampling_rate)
        };
        let msg_id = uuid::Uuid::new_v4().to_string();

        if pressure < 0.7 {
            return self.fast_path(subject, payload, priority, msg_id).await;
        }

        if self.existing_breaker(subject).is_some_and(|b| b.is_open()) {
            return self.reject(subject, DropReason::CircuitBreaker);
        }

        // One probabilistic lever per priority class: critical traffic is
        // never shed, low traffic is shed by the priority rule at
        // high/critical levels, everything else runs the sampler.
        match (level, priority) {
            (_, Priority::Critical) => {}
            (DegradationLevel::Critical, Priority::Low) => {
                return self.reject(subject, DropReason::PriorityShed);
            }
            (DegradationLevel::High, Priority::Low) => {
                if rand::rng().random::<f64>() < 0.7 {
                    return self.reject(subject, DropReason::PriorityShed);
                }
            }
            _ => {
                if rand::rng().random::<f64>() >= sampling_rate {
                    return self.reject(subject, DropReason::Sampling);
                }
            }
        }

        let overflow_bound = (self.config.max_queue_size as f64 * 1.2) as usize;
        {
            let mut queue = self.lock_queue();
            if queue.len() > overflow_bound {
                drop(queue);
                return self.reject(subject, DropReason::QueueFull);
            }
            queue.push(QueuedMessage {
                subject: subject.to_string(),
                payload,
                msg_id,
                priority,
                enqueued_at_ms: self.clock.now_millis(),
                enqueued_at: Utc::now(),
                retry_count: 0,
            });
        }
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        Admission::Enqueued
    }

    async fn fast_path(
        &self,
        subject: &str,
        payload: Bytes,
        priority: Priority,
        msg_id: String,
    ) -> Admission {
        match self.gateway.publish(subject, payload.clone(), &msg_id).await {
            Ok(ack) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                if let Some(breaker) = self.existing_breaker(subject) {
                    breaker.record_success();
                }
                Admission::Published { seq: ack.seq }
            }
            Err(GatewayError::DuplicateId { seq, .. }) => {
                // the caller's intent is satisfied; the event exists
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                Admission::Published { seq }
            }
            Err(e) => {
                tracing::debug!(subject, error = %e, "fast-path publish failed, deferring");
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                self.breaker(subject).record_failure();
                self.requeue_message(QueuedMessage {
                    subject: subject.to_string(),
                    payload,
                    msg_id,
                    priority,
                    enqueued_at_ms: self.clock.now_millis(),
                    enqueued_at: Utc::now(),
                    retry_count: 1,
                })
                .await;
                Admission::Enqueued
            }
        }
    }

    fn reject(&self, subject: &str, reason: DropReason) -> Admission {
        let counter = match reason {
            DropReason::CircuitBreaker => &self.counters.dropped_circuit,
            DropReason::Sampling => &self.counters.dropped_sampling,
            DropReason::PriorityShed => &self.counters.dropped_priority,
            DropReason::QueueFull => &self.counters.dropped_queue_full,
            DropReason::ShuttingDown => &self.counters.dropped_shutdown,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.sink.emit(ControlEvent::Gate(GateEvent::MessageDropped {
            reason,
            subject: subject.to_string(),
        }));
        tracing::debug!(subject, reason = %reason, "message dropped");
        Admission::Dropped { reason }
    }

    /// One monitoring tick: fold in external signals, recompute the ladder,
    /// refresh the snapshot, and announce level transitions.
    pub fn monitor_tick(&self, signals: ExternalSignals) {
        let queue_depth = self.lock_queue().len();
        let readings = ResourceReadings {
            memory_mb: signals.memory_mb,
            queue_depth: queue_depth as f64,
            publish_rate: signals.publish_rate,
            cpu_pct: signals.cpu_pct,
        };
        let ratios = readings.ratios(&self.config.thresholds);
        let pressure = readings.pressure(&self.config.thresholds);
        let level = DegradationLevel::from_pressure(pressure);
        let levers = level.levers();

        let old = self.snapshot.load().level;
        self.snapshot.store(Arc::new(BackpressureState {
            readings,
            ratios: ratios.to_vec(),
            pressure,
            level,
            sampling_rate: levers.sampling_rate,
            batch_size: levers.batch_size,
            queue_depth,
            open_circuits: self.open_circuits(),
            shutting_down: self.is_shutting_down(),
        }));

        if old != level {
            if level > old {
                tracing::warn!(%old, new = %level, pressure, "degradation level raised");
            } else {
                tracing::info!(%old, new = %level, pressure, "degradation level lowered");
            }
            self.sink.emit(ControlEvent::Gate(GateEvent::DegradationChanged {
                old,
                new: level,
                pressure,
            }));
        }
    }

    /// One dispatcher tick: fold due retries back in, then drain up to the
    /// current batch size, grouped by subject.
    pub async fn drain_tick(&self) -> usize {
        while let Some(message) = self.requeue.pop_ready() {
            self.lock_queue().push(message);
        }

        let batch_size = self.snapshot.load().batch_size;
        let drained = self.lock_queue().drain(batch_size);
        if drained.is_empty() {
            return 0;
        }
        self.dispatch(drained).await
    }

    /// Publish a drained batch, one gateway batch per subject, preserving
    /// the drain order within each subject.
    async fn dispatch(&self, drained: Vec<QueuedMessage>) -> usize {
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<QueuedMessage>> = HashMap::new();
        for message in drained {
            if !groups.contains_key(&message.subject) {
                order.push(message.subject.clone());
            }
            groups.entry(message.subject.clone()).or_default().push(message);
        }

        let mut published = 0;
        for subject in order {
            let Some(messages) = groups.remove(&subject) else { continue };
            let entries: Vec<(String, Bytes)> =
                messages.iter().map(|m| (m.msg_id.clone(), m.payload.clone())).collect();
            let outcomes = match self.gateway.batch_publish(&subject, entries).await {
                Ok(outcomes) => outcomes,
                Err(e) => {
                    // whole-batch transport failure: treat every entry as failed
                    tracing::warn!(%subject, error = %e, "batch publish failed");
                    messages.iter().map(|_| Err(e.clone())).collect()
                }
            };

            let breaker = self.breaker(&subject);
            for (message, outcome) in messages.into_iter().zip(outcomes) {
                match outcome {
                    Ok(_) | Err(GatewayError::DuplicateId { .. }) => {
                        published += 1;
                        self.counters.published.fetch_add(1, Ordering::Relaxed);
                        breaker.record_success();
                    }
                    Err(e) => {
                        tracing::debug!(
                            subject = %message.subject,
                            retry_count = message.retry_count,
                            error = %e,
                            "queued publish failed"
                        );
                        self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                        breaker.record_failure();
                        let mut retry = message;
                        retry.retry_count += 1;
                        if retry.retry_count > self.config.publish_retry_limit {
                            self.dead_letter(retry, "publish retries exhausted").await;
                        } else {
                            self.requeue_message(retry).await;
                        }
                    }
                }
            }
        }
        published
    }

    async fn requeue_message(&self, message: QueuedMessage) {
        let exponent = message.retry_count.min(16);
        let delay = Duration::from_millis(
            (1u64 << exponent).saturating_mul(self.config.retry_base.as_millis() as u64),
        )
        .min(self.config.max_backoff);
        self.counters.requeued.fetch_add(1, Ordering::Relaxed);
        if let Err(message) = self.requeue.push(message, delay) {
            // retry queue already closed by shutdown: escalate immediately
            self.dead_letter(message, "retry queue closed").await;
        }
    }

    async fn dead_letter(&self, message: QueuedMessage, reason: &str) {
        let payload_json = serde_json::from_slice::<serde_json::Value>(&message.payload)
            .unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(&message.payload).into_owned())
            });
        let wrapped = serde_json::json!({
            "originalSubject": message.subject,
            "originalTimestamp": message.enqueued_at.to_rfc3339(),
            "reason": reason,
            "retryCount": message.retry_count,
            "payload": payload_json,
        });
        match self
            .gateway
            .publish(
                DEAD_LETTER_SUBJECT,
                Bytes::from(wrapped.to_string()),
                &uuid::Uuid::new_v4().to_string(),
            )
            .await
        {
            Ok(_) | Err(GatewayError::DuplicateId { .. }) => {
                self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.dead_letter_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    subject = %message.subject,
                    error = %e,
                    "dead-letter publish failed; message lost"
                );
            }
        }
    }

    pub fn metrics(&self) -> BackpressureMetrics {
        let state = self.snapshot.load();
        BackpressureMetrics {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            published: self.counters.published.load(Ordering::Relaxed),
            dropped_circuit: self.counters.dropped_circuit.load(Ordering::Relaxed),
            dropped_sampling: self.counters.dropped_sampling.load(Ordering::Relaxed),
            dropped_priority: self.counters.dropped_priority.load(Ordering::Relaxed),
            dropped_queue_full: self.counters.dropped_queue_full.load(Ordering::Relaxed),
            dropped_shutdown: self.counters.dropped_shutdown.load(Ordering::Relaxed),
            publish_failures: self.counters.publish_failures.load(Ordering::Relaxed),
            requeued: self.counters.requeued.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            dead_letter_failures: self.counters.dead_letter_failures.load(Ordering::Relaxed),
            queue_depth: self.lock_queue().len(),
            level: state.level,
            sampling_rate: state.sampling_rate,
            batch_size: state.batch_size,
            open_circuits: state.open_circuits.clone(),
        }
    }

    /// Two-phase shutdown: stop intake, then drain until empty or the
    /// deadline passes. Deferred retries are pulled forward rather than
    /// stranded. Idempotent; returns whether everything drained.
    pub async fn shutdown(&self, deadline: Duration) -> bool {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return self.lock_queue().is_empty() && self.requeue.is_empty();
        }
        tracing::info!("backpressure controller draining for shutdown");

        let cutoff = Instant::now() + deadline;
        loop {
            for message in self.requeue.drain_all() {
                self.lock_queue().push(message);
            }
            if self.lock_queue().is_empty() {
                break;
            }
            if Instant::now() >= cutoff {
                tracing::warn!(
                    remaining = self.lock_queue().len(),
                    "shutdown deadline reached with messages still queued"
                );
                break;
            }
            self.drain_tick().await;
            tokio::task::yield_now().await;
        }
        self.requeue.close();
        self.lock_queue().is_empty() && self.requeue.is_empty()
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, PriorityQueue> {
        self.queue.lock().unwrap_or_else(|p| p.into_inner())
    }
}
