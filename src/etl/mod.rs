//! Streaming ETL pipeline.
//!
//! Consumes metric events from the gateway through a buffered,
//! bounded-concurrency batch pipeline with retries, exponential backoff,
//! and a dead-letter escape, delivering validated records to the storage
//! collaborator and live pushes to the broadcast collaborator.

mod sink;
mod validator;

pub use sink::{
    MemoryBroadcaster, MemoryStorageSink, NullBroadcaster, SinkError, StorageSink,
    UpdateBroadcaster,
};
pub use validator::{RecordValidator, SchemaValidator, ValidationOutcome};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::backoff::Backoff;
use crate::event::MetricEvent;
use crate::gateway::{ConsumerConfig, Envelope, StreamGateway, DEAD_LETTER_SUBJECT};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::slo::SloEvaluator;
use crate::telemetry::{ControlEvent, EtlEvent, SharedSink};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtlConfig {
    pub stream: String,
    pub consumer: String,
    pub filter_subject: Option<String>,
    /// Buffer flushes when it holds this many records...
    pub batch_size: usize,
    /// ...or when the oldest unflushed record is this old.
    pub batch_timeout: Duration,
    pub max_concurrent_batches: usize,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub fetch_batch: usize,
    pub fetch_wait: Duration,
    /// SLO series fed with per-run validation outcomes.
    pub slo_metric: String,
    pub slo_service: String,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            stream: "KPI_METRICS".to_string(),
            consumer: "metrics-etl".to_string(),
            filter_subject: Some("kpi.metrics.>".to_string()),
            batch_size: 100,
            batch_timeout: Duration::from_secs(5),
            max_concurrent_batches: 4,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            fetch_batch: 100,
            fetch_wait: Duration::from_millis(500),
            slo_metric: "ingest_validation".to_string(),
            slo_service: "etl".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EtlHealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EtlHealthReport {
    pub status: EtlHealthStatus,
    pub backlog: usize,
    pub avg_processing_ms: u64,
    pub error_rate: f64,
    pub conditions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EtlMetrics {
    pub consumed: u64,
    pub flushed_records: u64,
    pub invalid_records: u64,
    pub batches: u64,
    pub batch_retries: u64,
    pub dead_lettered: u64,
    pub dropped_batches: u64,
    pub decode_failures: u64,
    pub backlog: usize,
}

#[derive(Default)]
struct Counters {
    consumed: AtomicU64,
    flushed_records: AtomicU64,
    invalid_records: AtomicU64,
    batches: AtomicU64,
    batch_retries: AtomicU64,
    dead_lettered: AtomicU64,
    dropped_batches: AtomicU64,
    decode_failures: AtomicU64,
    total_processing_ms: AtomicU64,
}

struct Buffer {
    entries: Vec<(MetricEvent, Envelope)>,
    oldest_at: Option<Instant>,
}

pub struct EtlPipeline {
    config: EtlConfig,
    gateway: Arc<dyn StreamGateway>,
    validator: Arc<dyn RecordValidator>,
    storage: Arc<dyn StorageSink>,
    broadcaster: Arc<dyn UpdateBroadcaster>,
    slo: Option<Arc<SloEvaluator>>,
    sink: SharedSink,
    sleeper: Arc<dyn Sleeper>,
    buffer: Mutex<Buffer>,
    permits: Arc<Semaphore>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    counters: Counters,
}

impl EtlPipeline {
    pub fn new(
        config: EtlConfig,
        gateway: Arc<dyn StreamGateway>,
        validator: Arc<dyn RecordValidator>,
        storage: Arc<dyn StorageSink>,
        broadcaster: Arc<dyn UpdateBroadcaster>,
        slo: Option<Arc<SloEvaluator>>,
        sink: SharedSink,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_batches.max(1)));
        Self {
            config,
            gateway,
            validator,
            storage,
            broadcaster,
            slo,
            sink,
            sleeper: Arc::new(TokioSleeper),
            buffer: Mutex::new(Buffer { entries: Vec::new(), oldest_at: None }),
            permits,
            handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            counters: Counters::default(),
        }
    }

    /// Swap the sleeper so retry waits collapse in tests.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Create the durable consumer this pipeline reads through.
    pub async fn init(&self) -> Result<(), crate::gateway::GatewayError> {
        let mut consumer = ConsumerConfig::new(&self.config.consumer);
        if let Some(filter) = &self.config.filter_subject {
            consumer = consumer.with_filter(filter.clone());
        }
        self.gateway.create_consumer(&self.config.stream, consumer).await
    }

    /// One fetch-and-buffer pass. Returns how many envelopes arrived.
    pub async fn ingest_once(self: &Arc<Self>) -> usize {
        let envelopes = match self
            .gateway
            .fetch(
                &self.config.stream,
                &self.config.consumer,
                self.config.fetch_batch,
                self.config.fetch_wait,
            )
            .await
        {
            Ok(envelopes) => envelopes,
            Err(e) => {
                tracing::warn!(stream = %self.config.stream, error = %e, "fetch failed");
                return 0;
            }
        };
        let fetched = envelopes.len();

        for envelope in envelopes {
            match envelope.decode::<MetricEvent>() {
                Ok(event) => {
                    self.counters.consumed.fetch_add(1, Ordering::Relaxed);
                    let mut buffer = self.lock_buffer();
                    if buffer.entries.is_empty() {
                        buffer.oldest_at = Some(Instant::now());
                    }
                    buffer.entries.push((event, envelope));
                }
                Err(e) => {
                    // redelivery gives the producer side a chance to fix
                    // encoding bugs; the gateway dead-letters after the
                    // delivery budget
                    self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(subject = %envelope.subject, error = %e, "decode failed");
                    if let Err(nak_err) = self.gateway.nak(&envelope).await {
                        tracing::warn!(error = %nak_err, "nak failed");
                    }
                }
            }
        }

        if self.lock_buffer().entries.len() >= self.config.batch_size {
            self.spawn_flush().await;
        }
        fetched
    }

    /// Flush a partial buffer whose oldest record has waited long enough.
    pub async fn flush_due(self: &Arc<Self>) {
        let due = {
            let buffer = self.lock_buffer();
            !buffer.entries.is_empty()
                && buffer
                    .oldest_at
                    .is_some_and(|at| at.elapsed() >= self.config.batch_timeout)
        };
        if due {
            self.spawn_flush().await;
        }
    }

    /// Force a flush of whatever is buffered.
    pub async fn flush_now(self: &Arc<Self>) {
        self.spawn_flush().await;
    }

    /// Continuous worker loop; exits on [`stop`](Self::stop).
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            stream = %self.config.stream,
            consumer = %self.config.consumer,
            "etl worker started"
        );
        while self.running.load(Ordering::Acquire) {
            self.ingest_once().await;
            self.flush_due().await;
        }
        tracing::info!(consumer = %self.config.consumer, "etl worker stopped");
    }

    /// Graceful stop: cut the loop, flush the tail, wait for in-flight
    /// batches.
    pub async fn stop(self: &Arc<Self>) {
        self.running.store(false, Ordering::Release);
        self.spawn_flush().await;
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.handles.lock().unwrap_or_else(|p| p.into_inner()));
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn spawn_flush(self: &Arc<Self>) {
        let batch = {
            let mut buffer = self.lock_buffer();
            if buffer.entries.is_empty() {
                return;
            }
            buffer.oldest_at = None;
            std::mem::take(&mut buffer.entries)
        };

        // waits here when max_concurrent_batches are already in flight
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let pipeline = self.clone();
        let handle = tokio::spawn(async move {
            pipeline.process_batch(batch).await;
            drop(permit);
        });
        let mut handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    async fn process_batch(&self, batch: Vec<(MetricEvent, Envelope)>) {
        let started = Instant::now();
        let (events, envelopes): (Vec<MetricEvent>, Vec<Envelope>) = batch.into_iter().unzip();
        let outcome = self.validator.validate(events);
        let total = outcome.total();
        let invalid = outcome.invalid.len();
        self.counters.invalid_records.fetch_add(invalid as u64, Ordering::Relaxed);
        for (record, error) in &outcome.invalid {
            tracing::debug!(id = %record.id, error = %error, "record failed validation");
        }

        let write_ok = self.write_with_retries(&outcome.valid).await;

        if write_ok {
            for envelope in &envelopes {
                if let Err(e) = self.gateway.ack(envelope).await {
                    tracing::warn!(seq = envelope.seq, error = %e, "ack failed");
                }
            }
            self.counters.flushed_records.fetch_add(outcome.valid.len() as u64, Ordering::Relaxed);
            if !outcome.valid.is_empty() {
                self.broadcaster.metric_update(&outcome.valid).await;
            }
            if total > 0 && invalid as f64 / total as f64 > 0.1 {
                self.broadcaster.data_quality_alert(invalid, total).await;
                self.sink.emit(ControlEvent::Etl(EtlEvent::DataQuality { invalid, total }));
            }
            self.sink.emit(ControlEvent::Etl(EtlEvent::BatchFlushed {
                records: outcome.valid.len(),
                invalid,
                duration_ms: started.elapsed().as_millis() as u64,
            }));
        } else {
            self.escalate_to_dead_letter(&outcome, &envelopes).await;
        }

        if let Some(slo) = &self.slo {
            let success = if write_ok { outcome.valid.len() as u64 } else { 0 };
            slo.record(
                &self.config.slo_metric,
                &self.config.slo_service,
                success,
                total as u64,
                self.config.batch_timeout.as_secs().max(1),
            )
            .await;
        }

        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_processing_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Whole-batch write with exponential retry. Empty batches trivially
    /// succeed.
    async fn write_with_retries(&self, valid: &[MetricEvent]) -> bool {
        if valid.is_empty() {
            return true;
        }
        let backoff = Backoff::exponential(self.config.retry_delay);
        for attempt in 1..=self.config.retry_attempts.max(1) {
            match self.storage.write_batch(valid.to_vec()).await {
                Ok(()) => return true,
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "batch write failed");
                    if attempt < self.config.retry_attempts {
                        let delay = backoff.delay(attempt as usize);
                        self.counters.batch_retries.fetch_add(1, Ordering::Relaxed);
                        self.sink.emit(ControlEvent::Etl(EtlEvent::BatchRetry {
                            attempt,
                            delay_ms: delay.as_millis() as u64,
                        }));
                        self.sleeper.sleep(delay).await;
                    }
                }
            }
        }
        false
    }

    /// Retry chain exhausted: republish every record to the dead letter.
    /// Loss is accepted only if the dead-letter publish itself fails, and
    /// then it is counted.
    async fn escalate_to_dead_letter(
        &self,
        outcome: &ValidationOutcome,
        envelopes: &[Envelope],
    ) {
        let mut all_dead_lettered = true;
        let records: Vec<&MetricEvent> = outcome
            .valid
            .iter()
            .chain(outcome.invalid.iter().map(|(r, _)| r))
            .collect();
        for record in &records {
            let wrapped = serde_json::json!({
                "originalSubject": record.subject(),
                "originalTimestamp": record.timestamp.to_rfc3339(),
                "reason": "storage write retries exhausted",
                "payload": record,
            });
            let publish = self
                .gateway
                .publish(
                    DEAD_LETTER_SUBJECT,
                    Bytes::from(wrapped.to_string()),
                    &uuid::Uuid::new_v4().to_string(),
                )
                .await;
            match publish {
                Ok(_) | Err(crate::gateway::GatewayError::DuplicateId { .. }) => {}
                Err(e) => {
                    all_dead_lettered = false;
                    tracing::error!(id = %record.id, error = %e, "dead-letter publish failed");
                }
            }
        }

        if all_dead_lettered {
            self.counters.dead_lettered.fetch_add(records.len() as u64, Ordering::Relaxed);
            self.sink.emit(ControlEvent::Etl(EtlEvent::DeadLettered {
                records: records.len(),
                reason: "storage write retries exhausted".to_string(),
            }));
        } else {
            self.counters.dropped_batches.fetch_add(1, Ordering::Relaxed);
            tracing::error!(records = records.len(), "batch dropped after dead-letter failure");
        }

        // settle the originals either way; the retry chain has terminated
        for envelope in envelopes {
            if let Err(e) = self.gateway.ack(envelope).await {
                tracing::warn!(seq = envelope.seq, error = %e, "ack failed");
            }
        }
    }

    pub fn metrics(&self) -> EtlMetrics {
        EtlMetrics {
            consumed: self.counters.consumed.load(Ordering::Relaxed),
            flushed_records: self.counters.flushed_records.load(Ordering::Relaxed),
            invalid_records: self.counters.invalid_records.load(Ordering::Relaxed),
            batches: self.counters.batches.load(Ordering::Relaxed),
            batch_retries: self.counters.batch_retries.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            dropped_batches: self.counters.dropped_batches.load(Ordering::Relaxed),
            decode_failures: self.counters.decode_failures.load(Ordering::Relaxed),
            backlog: self.lock_buffer().entries.len(),
        }
    }

    /// Degraded on any of {deep backlog, slow batches, high error rate};
    /// unhealthy when two or more hold.
    pub fn health(&self) -> EtlHealthReport {
        let backlog = self.lock_buffer().entries.len();
        let batches = self.counters.batches.load(Ordering::Relaxed);
        let avg_processing_ms = if batches == 0 {
            0
        } else {
            self.counters.total_processing_ms.load(Ordering::Relaxed) / batches
        };
        let consumed = self.counters.consumed.load(Ordering::Relaxed);
        let failed = self.counters.invalid_records.load(Ordering::Relaxed)
            + self.counters.dead_lettered.load(Ordering::Relaxed);
        let error_rate = if consumed == 0 { 0.0 } else { failed as f64 / consumed as f64 };

        let mut conditions = Vec::new();
        if backlog > 10 * self.config.batch_size {
            conditions.push("backlog".to_string());
        }
        if avg_processing_ms > 5_000 {
            conditions.push("slow_processing".to_string());
        }
        if error_rate > 0.1 {
            conditions.push("error_rate".to_string());
        }
        let status = match conditions.len() {
            0 => EtlHealthStatus::Healthy,
            1 => EtlHealthStatus::Degraded,
            _ => EtlHealthStatus::Unhealthy,
        };
        EtlHealthReport { status, backlog, avg_processing_ms, error_rate, conditions }
    }

    fn lock_buffer(&self) -> std::sync::MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(|p| p.into_inner())
    }
}
