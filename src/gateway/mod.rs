//! Stream gateway contract.
//!
//! A stream is a named, append-only, retention-bounded log; a subject is a
//! routing key matched by a stream's subject patterns. The gateway owns
//! persisted event bytes and consumer cursors. Adapters implement
//! [`StreamGateway`]; the in-memory reference lives in [`memory`], the
//! JetStream adapter in the `floodgate-nats` crate.

mod memory;

pub use memory::MemoryGateway;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::error::{ErrorKind, Kinded};

/// Terminal subject for messages that exhausted their retry chain.
pub const DEAD_LETTER_SUBJECT: &str = "kpi.deadletter";

/// Subject used by [`StreamGateway::health_check`] round-trips.
pub const HEALTH_SUBJECT: &str = "kpi.health.ping";

/// How a stream sheds messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Age/bytes/msgs limits, whichever trips first.
    #[default]
    Limits,
    /// Messages are dropped once every consumer acked them.
    Interest,
    /// Messages are dropped once any consumer acked them.
    WorkQueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    #[default]
    File,
    Memory,
}

/// Shape of a stream. Creation is idempotent: an existing stream with the
/// same shape is a no-op, a differing shape is a config conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    pub max_age: Duration,
    pub max_bytes: u64,
    pub max_msgs: u64,
    pub retention: RetentionPolicy,
    pub storage: StorageKind,
    /// Window within which publishing the same message id is a no-op.
    pub duplicate_window: Duration,
}

impl StreamConfig {
    pub fn new(name: impl Into<String>, subjects: Vec<String>) -> Self {
        Self {
            name: name.into(),
            subjects,
            max_age: Duration::from_secs(7 * 24 * 3600),
            max_bytes: 50 * 1024 * 1024 * 1024,
            max_msgs: u64::MAX,
            retention: RetentionPolicy::Limits,
            storage: StorageKind::File,
            duplicate_window: Duration::from_secs(120),
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_max_msgs(mut self, max_msgs: u64) -> Self {
        self.max_msgs = max_msgs;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_duplicate_window(mut self, window: Duration) -> Self {
        self.duplicate_window = window;
        self
    }
}

/// The stream set every deployment starts with.
pub fn default_streams() -> Vec<StreamConfig> {
    const GIB: u64 = 1024 * 1024 * 1024;
    vec![
        StreamConfig::new(
            "KPI_METRICS",
            vec!["kpi.metrics.>".into(), "kpi.events.>".into()],
        )
        .with_max_age(Duration::from_secs(7 * 24 * 3600))
        .with_max_bytes(50 * GIB),
        StreamConfig::new("KPI_ALERTS", vec!["kpi.alerts.>".into()])
            .with_max_age(Duration::from_secs(30 * 24 * 3600))
            .with_max_bytes(10 * GIB),
        StreamConfig::new("KPI_INSIGHTS", vec!["kpi.insights.>".into()])
            .with_max_age(Duration::from_secs(90 * 24 * 3600))
            .with_max_bytes(20 * GIB),
        StreamConfig::new("KPI_DEADLETTER", vec![DEAD_LETTER_SUBJECT.into()])
            .with_max_age(Duration::from_secs(30 * 24 * 3600))
            .with_max_bytes(GIB),
        StreamConfig::new("KPI_HEALTH", vec!["kpi.health.>".into()])
            .with_max_age(Duration::from_secs(60))
            .with_max_msgs(1_000),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    #[default]
    All,
    Last,
    New,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    #[default]
    Explicit,
    All,
    None,
}

/// Durable cursor on a stream, identified by `(stream, name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub name: String,
    pub filter_subject: Option<String>,
    pub deliver_policy: DeliverPolicy,
    pub ack_policy: AckPolicy,
    /// Delivery attempts before the message is routed to the dead letter.
    pub max_deliver: u32,
    pub ack_wait: Duration,
    pub max_ack_pending: usize,
}

impl ConsumerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter_subject: None,
            deliver_policy: DeliverPolicy::default(),
            ack_policy: AckPolicy::default(),
            max_deliver: 3,
            ack_wait: Duration::from_secs(30),
            max_ack_pending: 1_000,
        }
    }

    pub fn with_filter(mut self, subject: impl Into<String>) -> Self {
        self.filter_subject = Some(subject.into());
        self
    }

    pub fn with_deliver_policy(mut self, policy: DeliverPolicy) -> Self {
        self.deliver_policy = policy;
        self
    }

    pub fn with_max_deliver(mut self, attempts: u32) -> Self {
        self.max_deliver = attempts.max(1);
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }
}

/// Successful publish outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub stream: String,
    pub seq: u64,
}

/// A delivered message plus the bookkeeping a consumer needs to ack it.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub stream: String,
    pub consumer: String,
    pub subject: String,
    pub seq: u64,
    pub msg_id: String,
    pub payload: Bytes,
    pub published_at: DateTime<Utc>,
    /// 1 on first delivery.
    pub delivery_count: u32,
}

impl Envelope {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, GatewayError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| GatewayError::Decode { subject: self.subject.clone(), detail: e.to_string() })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub name: String,
    pub messages: u64,
    pub bytes: u64,
    pub first_seq: u64,
    pub last_seq: u64,
    pub consumers: usize,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    /// The message id was seen inside the duplicate window; `seq` is the
    /// sequence of the original. Callers treat this as success.
    #[error("duplicate message id in stream {stream} (original seq {seq})")]
    DuplicateId { stream: String, seq: u64 },
    #[error("stream {name} not found")]
    StreamNotFound { name: String },
    #[error("consumer {name} not found on stream {stream}")]
    ConsumerNotFound { stream: String, name: String },
    #[error("no stream matches subject {subject}")]
    NoMatchingStream { subject: String },
    #[error("stream {name} exists with a different shape: {detail}")]
    ConfigConflict { name: String, detail: String },
    #[error("payload on {subject} failed to decode: {detail}")]
    Decode { subject: String, detail: String },
    #[error("transport failure: {detail}")]
    Transport { detail: String },
    #[error("health check missed its {deadline:?} deadline")]
    HealthTimeout { deadline: Duration },
    #[error("gateway is closed")]
    Closed,
}

impl Kinded for GatewayError {
    fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::DuplicateId { .. } => ErrorKind::Policy,
            GatewayError::StreamNotFound { .. }
            | GatewayError::ConsumerNotFound { .. }
            | GatewayError::NoMatchingStream { .. }
            | GatewayError::Decode { .. } => ErrorKind::Validation,
            GatewayError::ConfigConflict { .. } => ErrorKind::Fatal,
            GatewayError::Transport { .. }
            | GatewayError::HealthTimeout { .. }
            | GatewayError::Closed => ErrorKind::Transient,
        }
    }
}

/// Durable, deduplicated publish/consume of events into named streams.
#[async_trait]
pub trait StreamGateway: Send + Sync {
    /// Idempotent create. Same shape: no-op. Different shape: conflict.
    async fn create_stream(&self, config: StreamConfig) -> Result<(), GatewayError>;

    /// Publish one payload; `msg_id` is the dedup key.
    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        msg_id: &str,
    ) -> Result<PublishAck, GatewayError>;

    /// Publish many payloads with bounded in-flight concurrency. Outcomes
    /// preserve the caller's order; a partial failure never reorders.
    async fn batch_publish(
        &self,
        subject: &str,
        entries: Vec<(String, Bytes)>,
    ) -> Result<Vec<Result<PublishAck, GatewayError>>, GatewayError>;

    /// Idempotent durable consumer creation.
    async fn create_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<(), GatewayError>;

    /// Pull up to `batch` messages, waiting at most `max_wait` for the
    /// first. Messages past their delivery budget are routed to the dead
    /// letter instead of being returned.
    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        batch: usize,
        max_wait: Duration,
    ) -> Result<Vec<Envelope>, GatewayError>;

    async fn ack(&self, envelope: &Envelope) -> Result<(), GatewayError>;

    /// Negative-ack: make the message eligible for redelivery.
    async fn nak(&self, envelope: &Envelope) -> Result<(), GatewayError>;

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, GatewayError>;

    /// Publish a synthetic message and assert the ack round-trip under a
    /// deadline. Returns the observed latency.
    async fn health_check(&self) -> Result<Duration, GatewayError>;
}

/// Glob match over dotted subjects: `*` matches exactly one token, a
/// trailing `>` matches one or more remaining tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.').peekable();
    let mut subject_tokens = subject.split('.').peekable();

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (None, None) => return true,
            (Some(">"), Some(_)) => return pattern_tokens.peek().is_none(),
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            _ => return false,
        }
    }
}
