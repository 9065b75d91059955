//! JetStream-backed [`StreamGateway`] (companion crate).
//!
//! Bring your own `async_nats::Client`; streams and consumers are created
//! or verified against the requested shape, publishes dedup through
//! `Nats-Msg-Id`, and messages that exhaust their delivery budget are
//! relayed from the max-deliveries advisory onto the dead-letter subject.
//!
//! ```rust,no_run
//! use floodgate::gateway::{StreamGateway, default_streams};
//! use floodgate_nats::JetStreamGateway;
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let client = async_nats::connect("nats://127.0.0.1:4222").await?;
//! let gateway = JetStreamGateway::new(client);
//! for stream in default_streams() {
//!     gateway.create_stream(stream).await?;
//! }
//! # Ok(()) }
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use floodgate::gateway::{
    AckPolicy, ConsumerConfig, DeliverPolicy, Envelope, GatewayError, PublishAck,
    RetentionPolicy, StorageKind, StreamConfig, StreamGateway, StreamInfo, DEAD_LETTER_SUBJECT,
    HEALTH_SUBJECT,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// JetStream adapter over an established client connection.
pub struct JetStreamGateway {
    client: async_nats::Client,
    context: async_nats::jetstream::Context,
    /// Reply subjects for in-flight deliveries, keyed by
    /// `(stream, consumer, seq)`. Entries settle on ack or nak.
    replies: Mutex<HashMap<(String, String, u64), String>>,
}

impl JetStreamGateway {
    pub fn new(client: async_nats::Client) -> Self {
        let context = async_nats::jetstream::new(client.clone());
        Self { client, context, replies: Mutex::new(HashMap::new()) }
    }

    /// Relay max-deliveries advisories onto the dead-letter subject. Run
    /// this once per deployment; it returns only on subscription loss.
    pub async fn run_dead_letter_relay(&self, stream: &str) -> Result<(), GatewayError> {
        let advisory = format!("$JS.EVENT.ADVISORY.CONSUMER.MAX_DELIVERIES.{stream}.*");
        let mut subscription = self
            .client
            .subscribe(advisory)
            .await
            .map_err(|e| GatewayError::Transport { detail: e.to_string() })?;

        while let Some(message) = subscription.next().await {
            let advisory: serde_json::Value = match serde_json::from_slice(&message.payload) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(error = %e, "unparseable max-deliveries advisory");
                    continue;
                }
            };
            let wrapped = serde_json::json!({
                "originalSubject": advisory.get("stream").cloned().unwrap_or_default(),
                "originalTimestamp": Utc::now().to_rfc3339(),
                "reason": "max deliveries exhausted",
                "advisory": advisory,
            });
            let msg_id = uuid_like(&message.payload);
            if let Err(e) = self
                .publish(DEAD_LETTER_SUBJECT, Bytes::from(wrapped.to_string()), &msg_id)
                .await
            {
                tracing::error!(error = %e, "dead-letter relay publish failed");
            }
        }
        Err(GatewayError::Transport { detail: "advisory subscription closed".to_string() })
    }

    fn take_reply(&self, envelope: &Envelope) -> Option<String> {
        self.replies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&(envelope.stream.clone(), envelope.consumer.clone(), envelope.seq))
    }
}

fn stream_config(config: &StreamConfig) -> async_nats::jetstream::stream::Config {
    use async_nats::jetstream::stream;
    stream::Config {
        name: config.name.clone(),
        subjects: config.subjects.clone(),
        max_age: config.max_age,
        max_bytes: clamp_i64(config.max_bytes),
        max_messages: clamp_i64(config.max_msgs),
        retention: match config.retention {
            RetentionPolicy::Limits => stream::RetentionPolicy::Limits,
            RetentionPolicy::Interest => stream::RetentionPolicy::Interest,
            RetentionPolicy::WorkQueue => stream::RetentionPolicy::WorkQueue,
        },
        storage: match config.storage {
            StorageKind::File => stream::StorageType::File,
            StorageKind::Memory => stream::StorageType::Memory,
        },
        duplicate_window: config.duplicate_window,
        ..Default::default()
    }
}

fn consumer_config(config: &ConsumerConfig) -> async_nats::jetstream::consumer::pull::Config {
    use async_nats::jetstream::consumer;
    consumer::pull::Config {
        durable_name: Some(config.name.clone()),
        filter_subject: config.filter_subject.clone().unwrap_or_default(),
        deliver_policy: match config.deliver_policy {
            DeliverPolicy::All => consumer::DeliverPolicy::All,
            DeliverPolicy::Last => consumer::DeliverPolicy::Last,
            DeliverPolicy::New => consumer::DeliverPolicy::New,
        },
        ack_policy: match config.ack_policy {
            AckPolicy::Explicit => consumer::AckPolicy::Explicit,
            AckPolicy::All => consumer::AckPolicy::All,
            AckPolicy::None => consumer::AckPolicy::None,
        },
        max_deliver: config.max_deliver as i64,
        ack_wait: config.ack_wait,
        max_ack_pending: clamp_i64(config.max_ack_pending as u64),
        ..Default::default()
    }
}

fn clamp_i64(value: u64) -> i64 {
    value.min(i64::MAX as u64) as i64
}

/// Shapes match when every field the platform controls agrees.
fn shapes_match(
    requested: &async_nats::jetstream::stream::Config,
    existing: &async_nats::jetstream::stream::Config,
) -> bool {
    requested.subjects == existing.subjects
        && requested.max_age == existing.max_age
        && requested.max_bytes == existing.max_bytes
        && requested.max_messages == existing.max_messages
        && requested.retention == existing.retention
        && requested.duplicate_window == existing.duplicate_window
}

fn published_at(nanos: i128) -> DateTime<Utc> {
    let secs = (nanos / 1_000_000_000) as i64;
    let nsecs = (nanos.rem_euclid(1_000_000_000)) as u32;
    Utc.timestamp_opt(secs, nsecs).single().unwrap_or_else(Utc::now)
}

fn uuid_like(payload: &[u8]) -> String {
    // advisories carry their own uniqueness; hash them into a dedup key
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    payload.hash(&mut hasher);
    format!("advisory-{:016x}", hasher.finish())
}

fn transport<E: std::fmt::Display>(error: E) -> GatewayError {
    GatewayError::Transport { detail: error.to_string() }
}

#[async_trait]
impl StreamGateway for JetStreamGateway {
    async fn create_stream(&self, config: StreamConfig) -> Result<(), GatewayError> {
        let requested = stream_config(&config);
        match self.context.get_stream(&config.name).await {
            Ok(mut existing) => {
                let info = existing.info().await.map_err(transport)?;
                if shapes_match(&requested, &info.config) {
                    Ok(())
                } else {
                    Err(GatewayError::ConfigConflict {
                        name: config.name.clone(),
                        detail: format!(
                            "requested subjects {:?}, existing {:?}",
                            requested.subjects, info.config.subjects
                        ),
                    })
                }
            }
            Err(_) => {
                self.context.create_stream(requested).await.map_err(transport)?;
                tracing::info!(stream = %config.name, "stream created");
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
        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", msg_id);
        let ack = self
            .context
            .publish_with_headers(subject.to_string(), headers, payload)
            .await
            .map_err(transport)?
            .await
            .map_err(transport)?;
        if ack.duplicate {
            return Err(GatewayError::DuplicateId { stream: ack.stream, seq: ack.sequence });
        }
        Ok(PublishAck { stream: ack.stream, seq: ack.sequence })
    }

    async fn batch_publish(
        &self,
        subject: &str,
        entries: Vec<(String, Bytes)>,
    ) -> Result<Vec<Result<PublishAck, GatewayError>>, GatewayError> {
        let outcomes = futures::stream::iter(entries)
            .map(|(msg_id, payload)| async move {
                self.publish(subject, payload, &msg_id).await
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
        let js_stream = self
            .context
            .get_stream(stream)
            .await
            .map_err(|_| GatewayError::StreamNotFound { name: stream.to_string() })?;
        js_stream
            .get_or_create_consumer(&config.name, consumer_config(&config))
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        batch: usize,
        max_wait: Duration,
    ) -> Result<Vec<Envelope>, GatewayError> {
        let js_stream = self
            .context
            .get_stream(stream)
            .await
            .map_err(|_| GatewayError::StreamNotFound { name: stream.to_string() })?;
        let js_consumer: async_nats::jetstream::consumer::PullConsumer = js_stream
            .get_consumer(consumer)
            .await
            .map_err(|_| GatewayError::ConsumerNotFound {
                stream: stream.to_string(),
                name: consumer.to_string(),
            })?;

        let mut messages = js_consumer
            .fetch()
            .max_messages(batch)
            .expires(max_wait)
            .messages()
            .await
            .map_err(transport)?;

        let mut envelopes = Vec::new();
        while let Some(message) = messages.next().await {
            let message = message.map_err(transport)?;
            let info = message.info().map_err(transport)?;
            let msg_id = message
                .headers
                .as_ref()
                .and_then(|h| h.get("Nats-Msg-Id"))
                .map(|v| v.to_string())
                .unwrap_or_default();
            let envelope = Envelope {
                stream: stream.to_string(),
                consumer: consumer.to_string(),
                subject: message.subject.to_string(),
                seq: info.stream_sequence,
                msg_id,
                payload: message.payload.clone(),
                published_at: published_at(info.published.unix_timestamp_nanos()),
                delivery_count: info.delivered.max(0) as u32,
            };
            if let Some(reply) = message.reply.as_ref() {
                self.replies.lock().unwrap_or_else(|p| p.into_inner()).insert(
                    (stream.to_string(), consumer.to_string(), info.stream_sequence),
                    reply.to_string(),
                );
            }
            envelopes.push(envelope);
        }
        Ok(envelopes)
    }

    async fn ack(&self, envelope: &Envelope) -> Result<(), GatewayError> {
        let Some(reply) = self.take_reply(envelope) else {
            return Ok(()); // already settled or delivered without a reply
        };
        self.client
            .publish(reply, Bytes::from_static(b"+ACK"))
            .await
            .map_err(transport)
    }

    async fn nak(&self, envelope: &Envelope) -> Result<(), GatewayError> {
        let Some(reply) = self.take_reply(envelope) else {
            return Ok(());
        };
        self.client
            .publish(reply, Bytes::from_static(b"-NAK"))
            .await
            .map_err(transport)
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, GatewayError> {
        let mut js_stream = self
            .context
            .get_stream(stream)
            .await
            .map_err(|_| GatewayError::StreamNotFound { name: stream.to_string() })?;
        let info = js_stream.info().await.map_err(transport)?;
        Ok(StreamInfo {
            name: info.config.name.clone(),
            messages: info.state.messages,
            bytes: info.state.bytes,
            first_seq: info.state.first_sequence,
            last_seq: info.state.last_sequence,
            consumers: info.state.consumer_count,
        })
    }

    async fn health_check(&self) -> Result<Duration, GatewayError> {
        const DEADLINE: Duration = Duration::from_secs(2);
        let started = std::time::Instant::now();
        let msg_id =
            format!("health-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
        let probe = self.publish(HEALTH_SUBJECT, Bytes::from_static(b"ping"), &msg_id);
        match tokio::time::timeout(DEADLINE, probe).await {
            Ok(Ok(_)) | Ok(Err(GatewayError::DuplicateId { .. })) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(GatewayError::HealthTimeout { deadline: DEADLINE }),
        }
    }
}
