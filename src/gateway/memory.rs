//! In-memory reference gateway.
//!
//! Single-process stand-in for a durable stream server, faithful to the
//! contract: dedup windows, retention trimming, durable cursors, ack-wait
//! redelivery, and the dead-letter escape. Used by the test suite and by
//! deployments that run the control plane against local state.

use super::{
    subject_matches, AckPolicy, ConsumerConfig, DeliverPolicy, Envelope, GatewayError, PublishAck,
    RetentionPolicy, StreamConfig, StreamGateway, StreamInfo, DEAD_LETTER_SUBJECT, HEALTH_SUBJECT,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};

/// Aggregate publish latency, exposed for dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LatencySnapshot {
    pub samples: u64,
    pub total_micros: u64,
    pub max_micros: u64,
}

impl LatencySnapshot {
    pub fn mean_micros(&self) -> u64 {
        if self.samples == 0 {
            0
        } else {
            self.total_micros / self.samples
        }
    }
}

struct StoredMessage {
    seq: u64,
    subject: String,
    msg_id: String,
    payload: Bytes,
    published_at: DateTime<Utc>,
    stored_at: Instant,
}

struct PendingDelivery {
    ack_deadline: Instant,
}

struct ConsumerState {
    config: ConsumerConfig,
    /// Next new sequence to deliver.
    cursor: u64,
    pending: HashMap<u64, PendingDelivery>,
    redeliver: VecDeque<u64>,
    /// Deliveries so far per in-flight sequence; cleared on ack or
    /// dead-letter routing.
    attempts: HashMap<u64, u32>,
}

struct StreamState {
    config: StreamConfig,
    messages: VecDeque<StoredMessage>,
    next_seq: u64,
    bytes: u64,
    dedup: HashMap<String, (u64, Instant)>,
    consumers: HashMap<String, ConsumerState>,
    /// Consumers that acked a given seq; drives interest retention.
    acked_by: HashMap<u64, HashSet<String>>,
}

impl StreamState {
    fn new(config: StreamConfig) -> Self {
        Self {
            config,
            messages: VecDeque::new(),
            next_seq: 1,
            bytes: 0,
            dedup: HashMap::new(),
            consumers: HashMap::new(),
            acked_by: HashMap::new(),
        }
    }

    fn remove_message(&mut self, seq: u64) {
        if let Ok(idx) = self.messages.binary_search_by(|m| m.seq.cmp(&seq)) {
            if let Some(msg) = self.messages.remove(idx) {
                self.bytes = self.bytes.saturating_sub(msg.payload.len() as u64);
            }
            self.acked_by.remove(&seq);
        }
    }

    fn trim_to_limits(&mut self) {
        loop {
            let over = self.messages.len() as u64 > self.config.max_msgs
                || self.bytes > self.config.max_bytes
                || self
                    .messages
                    .front()
                    .is_some_and(|m| m.stored_at.elapsed() > self.config.max_age);
            if !over {
                break;
            }
            match self.messages.pop_front() {
                Some(msg) => {
                    self.bytes = self.bytes.saturating_sub(msg.payload.len() as u64);
                    self.acked_by.remove(&msg.seq);
                }
                None => break,
            }
        }
    }

    fn prune_dedup(&mut self) {
        let window = self.config.duplicate_window;
        self.dedup.retain(|_, (_, at)| at.elapsed() <= window);
    }
}

struct State {
    streams: HashMap<String, StreamState>,
    latency: LatencySnapshot,
}

/// In-memory [`StreamGateway`].
#[derive(Clone)]
pub struct MemoryGateway {
    state: Arc<Mutex<State>>,
    published: Arc<Notify>,
    batch_permits: Arc<Semaphore>,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGateway {
    /// Empty gateway; callers create streams explicitly.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                streams: HashMap::new(),
                latency: LatencySnapshot::default(),
            })),
            published: Arc::new(Notify::new()),
            batch_permits: Arc::new(Semaphore::new(50)),
        }
    }

    /// Gateway pre-provisioned with the platform's default streams.
    pub fn with_default_streams() -> Self {
        let gateway = Self::new();
        {
            let mut state = gateway.lock();
            for config in super::default_streams() {
                state.streams.insert(config.name.clone(), StreamState::new(config));
            }
        }
        gateway
    }

    pub fn publish_stats(&self) -> LatencySnapshot {
        self.lock().latency
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn publish_locked(
        state: &mut State,
        subject: &str,
        payload: Bytes,
        msg_id: &str,
    ) -> Result<PublishAck, GatewayError> {
        let stream = state
            .streams
            .values_mut()
            .find(|s| s.config.subjects.iter().any(|p| subject_matches(p, subject)))
            .ok_or_else(|| GatewayError::NoMatchingStream { subject: subject.to_string() })?;

        stream.prune_dedup();
        if let Some((seq, _)) = stream.dedup.get(msg_id) {
            return Err(GatewayError::DuplicateId {
                stream: stream.config.name.clone(),
                seq: *seq,
            });
        }

        let seq = stream.next_seq;
        stream.next_seq += 1;
        stream.bytes += payload.len() as u64;
        stream.dedup.insert(msg_id.to_string(), (seq, Instant::now()));
        stream.messages.push_back(StoredMessage {
            seq,
            subject: subject.to_string(),
            msg_id: msg_id.to_string(),
            payload,
            published_at: Utc::now(),
            stored_at: Instant::now(),
        });
        stream.trim_to_limits();

        Ok(PublishAck { stream: stream.config.name.clone(), seq })
    }

    /// Wrap an exhausted message for the dead-letter subject.
    fn dead_letter_payload(message: &StoredMessage, reason: &str) -> Bytes {
        let payload_json = serde_json::from_slice::<serde_json::Value>(&message.payload)
            .unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(&message.payload).into_owned())
            });
        let wrapped = serde_json::json!({
            "originalSubject": message.subject,
            "originalTimestamp": message.published_at.to_rfc3339(),
            "reason": reason,
            "payload": payload_json,
        });
        Bytes::from(wrapped.to_string())
    }
}

#[async_trait]
impl StreamGateway for MemoryGateway {
    async fn create_stream(&self, config: StreamConfig) -> Result<(), GatewayError> {
        let mut state = self.lock();
        match state.streams.get(&config.name) {
            Some(existing) if existing.config == config => Ok(()),
            Some(existing) => Err(GatewayError::ConfigConflict {
                name: config.name.clone(),
                detail: format!(
                    "requested subjects {:?}, existing {:?}",
                    config.subjects, existing.config.subjects
                ),
            }),
            None => {
                state.streams.insert(config.name.clone(), StreamState::new(config));
                Ok(())
            }
        }
    }

    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        msg_id: &str,
    ) -> Result<PublishAck, GatewayError> {
        let started = Instant::now();
        let result = {
            let mut state = self.lock();
            let ack = Self::publish_locked(&mut state, subject, payload, msg_id);
            if ack.is_ok() {
                let micros = started.elapsed().as_micros() as u64;
                state.latency.samples += 1;
                state.latency.total_micros += micros;
                state.latency.max_micros = state.latency.max_micros.max(micros);
            }
            ack
        };
        if result.is_ok() {
            self.published.notify_waiters();
        }
        result
    }

    async fn batch_publish(
        &self,
        subject: &str,
        entries: Vec<(String, Bytes)>,
    ) -> Result<Vec<Result<PublishAck, GatewayError>>, GatewayError> {
        let outcomes = futures::stream::iter(entries)
            .map(|(msg_id, payload)| {
                let gateway = self.clone();
                let subject = subject.to_string();
                async move {
                    let _permit = gateway.batch_permits.clone().acquire_owned().await;
                    gateway.publish(&subject, payload, &msg_id).await
                }
            })
            .buffered(50)
            .collect::<Vec<_>>()
            .await;
        Ok(outcomes)
    }

    async fn create_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<(), GatewayError> {
        let mut state = self.lock();
        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| GatewayError::StreamNotFound { name: stream.to_string() })?;

        match stream_state.consumers.get(&config.name) {
            Some(existing) if existing.config == config => return Ok(()),
            Some(_) => {
                return Err(GatewayError::ConfigConflict {
                    name: format!("{stream}/{}", config.name),
                    detail: "consumer exists with a different shape".to_string(),
                })
            }
            None => {}
        }

        let cursor = match config.deliver_policy {
            DeliverPolicy::All => {
                stream_state.messages.front().map_or(stream_state.next_seq, |m| m.seq)
            }
            DeliverPolicy::Last => {
                stream_state.messages.back().map_or(stream_state.next_seq, |m| m.seq)
            }
            DeliverPolicy::New => stream_state.next_seq,
        };
        stream_state.consumers.insert(
            config.name.clone(),
            ConsumerState {
                config,
                cursor,
                pending: HashMap::new(),
                redeliver: VecDeque::new(),
                attempts: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        batch: usize,
        max_wait: Duration,
    ) -> Result<Vec<Envelope>, GatewayError> {
        let deadline = Instant::now() + max_wait;
        loop {
            let (envelopes, dead_letters) = {
                let mut state = self.lock();
                let stream_state = state
                    .streams
                    .get_mut(stream)
                    .ok_or_else(|| GatewayError::StreamNotFound { name: stream.to_string() })?;
                let mut consumer_state =
                    stream_state.consumers.remove(consumer).ok_or_else(|| {
                        GatewayError::ConsumerNotFound {
                            stream: stream.to_string(),
                            name: consumer.to_string(),
                        }
                    })?;
                let result = collect_deliverables(stream_state, &mut consumer_state, batch);
                stream_state.consumers.insert(consumer.to_string(), consumer_state);
                result
            };

            // Dead letters route through normal subject matching so the
            // dead-letter stream's own retention applies.
            for payload in dead_letters {
                let msg_id = uuid::Uuid::new_v4().to_string();
                let mut state = self.lock();
                let _ = Self::publish_locked(&mut state, DEAD_LETTER_SUBJECT, payload, &msg_id);
            }

            if !envelopes.is_empty() {
                return Ok(envelopes);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, self.published.notified()).await;
        }
    }

    async fn ack(&self, envelope: &Envelope) -> Result<(), GatewayError> {
        let mut state = self.lock();
        let stream_state = state
            .streams
            .get_mut(&envelope.stream)
            .ok_or_else(|| GatewayError::StreamNotFound { name: envelope.stream.clone() })?;
        let retention = stream_state.config.retention;
        let interested = match retention {
            RetentionPolicy::Interest => stream_state
                .consumers
                .values()
                .filter(|c| filter_accepts(&c.config, &envelope.subject))
                .count(),
            _ => 0,
        };
        let consumer_state =
            stream_state.consumers.get_mut(&envelope.consumer).ok_or_else(|| {
                GatewayError::ConsumerNotFound {
                    stream: envelope.stream.clone(),
                    name: envelope.consumer.clone(),
                }
            })?;

        let acked: Vec<u64> = match consumer_state.config.ack_policy {
            AckPolicy::Explicit => vec![envelope.seq],
            AckPolicy::All => consumer_state
                .pending
                .keys()
                .copied()
                .filter(|seq| *seq <= envelope.seq)
                .collect(),
            AckPolicy::None => Vec::new(),
        };
        for seq in &acked {
            consumer_state.pending.remove(seq);
            consumer_state.attempts.remove(seq);
        }

        let consumer_name = envelope.consumer.clone();
        for seq in acked {
            match retention {
                RetentionPolicy::WorkQueue => stream_state.remove_message(seq),
                RetentionPolicy::Interest => {
                    let entry = stream_state.acked_by.entry(seq).or_default();
                    entry.insert(consumer_name.clone());
                    if entry.len() >= interested {
                        stream_state.remove_message(seq);
                    }
                }
                RetentionPolicy::Limits => {}
            }
        }
        Ok(())
    }

    async fn nak(&self, envelope: &Envelope) -> Result<(), GatewayError> {
        {
            let mut state = self.lock();
            let stream_state = state
                .streams
                .get_mut(&envelope.stream)
                .ok_or_else(|| GatewayError::StreamNotFound { name: envelope.stream.clone() })?;
            let consumer_state =
                stream_state.consumers.get_mut(&envelope.consumer).ok_or_else(|| {
                    GatewayError::ConsumerNotFound {
                        stream: envelope.stream.clone(),
                        name: envelope.consumer.clone(),
                    }
                })?;
            if consumer_state.pending.remove(&envelope.seq).is_some() {
                consumer_state.redeliver.push_back(envelope.seq);
            }
        }
        self.published.notify_waiters();
        Ok(())
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, GatewayError> {
        let state = self.lock();
        let stream_state = state
            .streams
            .get(stream)
            .ok_or_else(|| GatewayError::StreamNotFound { name: stream.to_string() })?;
        Ok(StreamInfo {
            name: stream_state.config.name.clone(),
            messages: stream_state.messages.len() as u64,
            bytes: stream_state.bytes,
            first_seq: stream_state.messages.front().map_or(0, |m| m.seq),
            last_seq: stream_state.next_seq.saturating_sub(1),
            consumers: stream_state.consumers.len(),
        })
    }

    async fn health_check(&self) -> Result<Duration, GatewayError> {
        const DEADLINE: Duration = Duration::from_secs(2);
        let started = Instant::now();
        let probe = async {
            let msg_id = uuid::Uuid::new_v4().to_string();
            self.publish(HEALTH_SUBJECT, Bytes::from_static(b"ping"), &msg_id).await
        };
        match tokio::time::timeout(DEADLINE, probe).await {
            Ok(Ok(_)) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(GatewayError::HealthTimeout { deadline: DEADLINE }),
        }
    }
}

fn filter_accepts(config: &ConsumerConfig, subject: &str) -> bool {
    config.filter_subject.as_deref().map_or(true, |f| subject_matches(f, subject))
}

/// Pull redeliveries first, then new messages, honoring `max_ack_pending`
/// and the delivery budget. Returns envelopes plus dead-letter payloads for
/// messages past their budget.
fn collect_deliverables(
    stream_state: &mut StreamState,
    consumer_state: &mut ConsumerState,
    batch: usize,
) -> (Vec<Envelope>, Vec<Bytes>) {
    let stream_name = stream_state.config.name.clone();
    let consumer_name = consumer_state.config.name.clone();
    let now = Instant::now();

    // Expired ack-waits become redeliveries.
    let expired: Vec<u64> = consumer_state
        .pending
        .iter()
        .filter(|(_, p)| p.ack_deadline <= now)
        .map(|(seq, _)| *seq)
        .collect();
    for seq in expired {
        consumer_state.pending.remove(&seq);
        consumer_state.redeliver.push_back(seq);
    }

    let config = consumer_state.config.clone();
    let mut envelopes = Vec::new();
    let mut dead_letters = Vec::new();

    // Redeliveries, oldest first.
    while envelopes.len() < batch {
        let Some(seq) = consumer_state.redeliver.pop_front() else { break };
        let Ok(idx) = stream_state.messages.binary_search_by(|m| m.seq.cmp(&seq)) else {
            consumer_state.attempts.remove(&seq);
            continue; // trimmed by retention while queued
        };
        let message = &stream_state.messages[idx];
        let attempt = consumer_state.attempts.get(&seq).copied().unwrap_or(0) + 1;
        if attempt > config.max_deliver {
            dead_letters
                .push(MemoryGateway::dead_letter_payload(message, "max deliveries exhausted"));
            consumer_state.attempts.remove(&seq);
            continue;
        }
        envelopes.push(Envelope {
            stream: stream_name.clone(),
            consumer: consumer_name.clone(),
            subject: message.subject.clone(),
            seq,
            msg_id: message.msg_id.clone(),
            payload: message.payload.clone(),
            published_at: message.published_at,
            delivery_count: attempt,
        });
        consumer_state.attempts.insert(seq, attempt);
        if config.ack_policy != AckPolicy::None {
            consumer_state
                .pending
                .insert(seq, PendingDelivery { ack_deadline: now + config.ack_wait });
        }
    }

    // New messages from the cursor.
    while envelopes.len() < batch && consumer_state.pending.len() < config.max_ack_pending {
        let cursor = consumer_state.cursor;
        let Some(message) = stream_state
            .messages
            .iter()
            .find(|m| m.seq >= cursor && filter_accepts(&config, &m.subject))
        else {
            break;
        };
        let seq = message.seq;
        envelopes.push(Envelope {
            stream: stream_name.clone(),
            consumer: consumer_name.clone(),
            subject: message.subject.clone(),
            seq,
            msg_id: message.msg_id.clone(),
            payload: message.payload.clone(),
            published_at: message.published_at,
            delivery_count: 1,
        });
        consumer_state.cursor = seq + 1;
        consumer_state.attempts.insert(seq, 1);
        if config.ack_policy != AckPolicy::None {
            consumer_state
                .pending
                .insert(seq, PendingDelivery { ack_deadline: now + config.ack_wait });
        }
    }

    (envelopes, dead_letters)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_gateway() -> MemoryGateway {
        MemoryGateway::with_default_streams()
    }

    fn payload(text: &str) -> Bytes {
        Bytes::from(text.to_string())
    }

    #[tokio::test]
    async fn publish_assigns_monotonic_sequences() {
        let gateway = test_gateway();
        let a = gateway
            .publish("kpi.metrics.acme.normal", payload("a"), "id-a")
            .await
            .unwrap();
        let b = gateway
            .publish("kpi.metrics.acme.normal", payload("b"), "id-b")
            .await
            .unwrap();
        assert_eq!(a.stream, "KPI_METRICS");
        assert_eq!(b.seq, a.seq + 1);
    }

    #[tokio::test]
    async fn duplicate_id_within_window_is_suppressed() {
        let gateway = test_gateway();
        let subject = "kpi.metrics.marketing.normal";
        let first = gateway.publish(subject, payload("v"), "m_1").await.unwrap();
        let before = gateway.stream_info("KPI_METRICS").await.unwrap().messages;

        let second = gateway.publish(subject, payload("v"), "m_1").await;
        match second {
            Err(GatewayError::DuplicateId { seq, .. }) => assert_eq!(seq, first.seq),
            other => panic!("expected DuplicateId, got {other:?}"),
        }
        let after = gateway.stream_info("KPI_METRICS").await.unwrap().messages;
        assert_eq!(before, after, "duplicate must not grow the stream");
    }

    #[tokio::test]
    async fn unmatched_subject_is_rejected() {
        let gateway = test_gateway();
        let result = gateway.publish("unrelated.subject", payload("x"), "id").await;
        assert!(matches!(result, Err(GatewayError::NoMatchingStream { .. })));
    }

    #[tokio::test]
    async fn create_stream_is_idempotent_but_conflicts_on_reshape() {
        let gateway = MemoryGateway::new();
        let config = StreamConfig::new("S", vec!["s.>".into()]);
        gateway.create_stream(config.clone()).await.unwrap();
        gateway.create_stream(config.clone()).await.unwrap();

        let reshaped = StreamConfig::new("S", vec!["other.>".into()]);
        assert!(matches!(
            gateway.create_stream(reshaped).await,
            Err(GatewayError::ConfigConflict { .. })
        ));
    }

    #[tokio::test]
    async fn retention_trims_by_max_msgs() {
        let gateway = MemoryGateway::new();
        gateway
            .create_stream(StreamConfig::new("S", vec!["s.>".into()]).with_max_msgs(3))
            .await
            .unwrap();
        for i in 0..5 {
            gateway.publish("s.x", payload(&format!("{i}")), &format!("id-{i}")).await.unwrap();
        }
        let info = gateway.stream_info("S").await.unwrap();
        assert_eq!(info.messages, 3);
        assert_eq!(info.first_seq, 3);
        assert_eq!(info.last_seq, 5);
    }

    #[tokio::test]
    async fn batch_publish_preserves_order_and_reports_partial_failures() {
        let gateway = test_gateway();
        let subject = "kpi.metrics.acme.normal";
        gateway.publish(subject, payload("pre"), "dup").await.unwrap();

        let entries = vec![
            ("one".to_string(), payload("1")),
            ("dup".to_string(), payload("2")),
            ("three".to_string(), payload("3")),
        ];
        let outcomes = gateway.batch_publish(subject, entries).await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].is_ok());
        assert!(matches!(outcomes[1], Err(GatewayError::DuplicateId { .. })));
        assert!(outcomes[2].is_ok());
        let seqs: Vec<u64> =
            outcomes.iter().filter_map(|o| o.as_ref().ok().map(|a| a.seq)).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn fetch_delivers_then_ack_settles() {
        let gateway = test_gateway();
        let subject = "kpi.metrics.acme.normal";
        gateway.publish(subject, payload("x"), "id-1").await.unwrap();
        gateway
            .create_consumer("KPI_METRICS", ConsumerConfig::new("etl"))
            .await
            .unwrap();

        let batch = gateway
            .fetch("KPI_METRICS", "etl", 10, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].delivery_count, 1);
        gateway.ack(&batch[0]).await.unwrap();

        let empty = gateway
            .fetch("KPI_METRICS", "etl", 10, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn nak_triggers_redelivery_with_increasing_count() {
        let gateway = test_gateway();
        let subject = "kpi.metrics.acme.normal";
        gateway.publish(subject, payload("x"), "id-1").await.unwrap();
        gateway
            .create_consumer("KPI_METRICS", ConsumerConfig::new("etl"))
            .await
            .unwrap();

        let first = gateway
            .fetch("KPI_METRICS", "etl", 1, Duration::from_millis(50))
            .await
            .unwrap();
        gateway.nak(&first[0]).await.unwrap();

        let second = gateway
            .fetch("KPI_METRICS", "etl", 1, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(second[0].seq, first[0].seq);
        assert_eq!(second[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn exhausted_deliveries_route_to_dead_letter() {
        let gateway = test_gateway();
        let subject = "kpi.metrics.acme.normal";
        gateway.publish(subject, payload("{\"k\":1}"), "id-1").await.unwrap();
        gateway
            .create_consumer(
                "KPI_METRICS",
                ConsumerConfig::new("etl").with_max_deliver(2),
            )
            .await
            .unwrap();

        for _ in 0..2 {
            let batch = gateway
                .fetch("KPI_METRICS", "etl", 1, Duration::from_millis(50))
                .await
                .unwrap();
            assert_eq!(batch.len(), 1);
            gateway.nak(&batch[0]).await.unwrap();
        }
        // Third attempt exceeds the budget: nothing delivered, message dead-lettered.
        let batch = gateway
            .fetch("KPI_METRICS", "etl", 1, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(batch.is_empty());

        let dlq = gateway.stream_info("KPI_DEADLETTER").await.unwrap();
        assert_eq!(dlq.messages, 1);

        gateway
            .create_consumer("KPI_DEADLETTER", ConsumerConfig::new("operator"))
            .await
            .unwrap();
        let dead = gateway
            .fetch("KPI_DEADLETTER", "operator", 1, Duration::from_millis(50))
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&dead[0].payload).unwrap();
        assert_eq!(body["originalSubject"], subject);
        assert_eq!(body["reason"], "max deliveries exhausted");
        assert!(body["originalTimestamp"].is_string());
    }

    #[tokio::test]
    async fn ack_wait_expiry_makes_message_redeliverable() {
        let gateway = test_gateway();
        let subject = "kpi.metrics.acme.normal";
        gateway.publish(subject, payload("x"), "id-1").await.unwrap();
        gateway
            .create_consumer(
                "KPI_METRICS",
                ConsumerConfig::new("etl").with_ack_wait(Duration::from_millis(10)),
            )
            .await
            .unwrap();

        let first = gateway
            .fetch("KPI_METRICS", "etl", 1, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = gateway
            .fetch("KPI_METRICS", "etl", 1, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn deliver_policy_new_skips_history() {
        let gateway = test_gateway();
        let subject = "kpi.metrics.acme.normal";
        gateway.publish(subject, payload("old"), "id-old").await.unwrap();
        gateway
            .create_consumer(
                "KPI_METRICS",
                ConsumerConfig::new("tail").with_deliver_policy(DeliverPolicy::New),
            )
            .await
            .unwrap();
        gateway.publish(subject, payload("new"), "id-new").await.unwrap();

        let batch = gateway
            .fetch("KPI_METRICS", "tail", 10, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].msg_id, "id-new");
    }

    #[tokio::test]
    async fn consumer_filter_restricts_subjects() {
        let gateway = test_gateway();
        gateway.publish("kpi.metrics.acme.low", payload("a"), "a").await.unwrap();
        gateway.publish("kpi.metrics.acme.high", payload("b"), "b").await.unwrap();
        gateway
            .create_consumer(
                "KPI_METRICS",
                ConsumerConfig::new("high-only").with_filter("kpi.metrics.*.high"),
            )
            .await
            .unwrap();

        let batch = gateway
            .fetch("KPI_METRICS", "high-only", 10, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].subject, "kpi.metrics.acme.high");
    }

    #[tokio::test]
    async fn health_check_round_trips() {
        let gateway = test_gateway();
        let latency = gateway.health_check().await.unwrap();
        assert!(latency < Duration::from_secs(2));
        assert!(gateway.publish_stats().samples >= 1);
    }

    #[tokio::test]
    async fn work_queue_retention_drops_acked_messages() {
        let gateway = MemoryGateway::new();
        gateway
            .create_stream(
                StreamConfig::new("WQ", vec!["wq.>".into()])
                    .with_retention(RetentionPolicy::WorkQueue),
            )
            .await
            .unwrap();
        gateway.publish("wq.job", payload("j"), "id-1").await.unwrap();
        gateway.create_consumer("WQ", ConsumerConfig::new("worker")).await.unwrap();

        let batch = gateway.fetch("WQ", "worker", 1, Duration::from_millis(50)).await.unwrap();
        gateway.ack(&batch[0]).await.unwrap();
        assert_eq!(gateway.stream_info("WQ").await.unwrap().messages, 0);
    }
}
