#![forbid(unsafe_code)]

//! # Floodgate
//!
//! Adaptive ingestion-and-publishing control plane for a KPI/social-posting
//! platform: durable metric streams, a backpressure controller with
//! pluggable mitigation levers, fair-share scheduling over per-account
//! tokens, multi-window rate limits, and SLO-aware degradation decisions.
//!
//! ## Components
//!
//! - [`gateway`] — deduplicated publish/consume into named streams with
//!   retention, ack policies, and a dead-letter subject.
//! - [`backpressure`] — resource-ratio ladder driving sampling, priority
//!   queueing, adaptive batching, and per-subject circuit breakers.
//! - [`strategy`] — turns controller state into a ranked, trend-annotated
//!   active strategy with predictions and a live subscription feed.
//! - [`etl`] — buffered, bounded-concurrency batch pipeline with retries
//!   and a dead-letter escape, feeding the storage collaborator.
//! - [`scheduler`] — weighted round-robin token selection with jitter and
//!   token-level circuit breakers.
//! - [`ratelimit`] — burst/minute/hour/day sliding windows with atomic
//!   per-key admission.
//! - [`slo`] — error-budget arithmetic, burn rates, debounced breach
//!   alerts.
//! - [`load`] — the consumer-facing load-header contract as a pure
//!   function plus a `tower` layer.
//! - [`core`] — the composition root that wires everything and owns the
//!   background tickers.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use bytes::Bytes;
//! use floodgate::config::CoreConfig;
//! use floodgate::core::{ControlPlane, StaticSignals};
//! use floodgate::etl::{MemoryBroadcaster, MemoryStorageSink};
//! use floodgate::event::{MetricEvent, MetricValue};
//! use floodgate::gateway::MemoryGateway;
//! use floodgate::telemetry::SharedSink;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let plane = ControlPlane::start(
//!         CoreConfig::default(),
//!         Arc::new(MemoryGateway::new()),
//!         MemoryStorageSink::new(),
//!         MemoryBroadcaster::new(),
//!         StaticSignals::new(),
//!         SharedSink::null(),
//!     )
//!     .await?;
//!
//!     let event = MetricEvent::new("marketing", "post_reach", MetricValue::Count(250), "demo");
//!     let payload = Bytes::from(serde_json::to_vec(&event)?);
//!     plane.controller().publish(&event.subject(), payload, event.priority).await;
//!
//!     plane.shutdown(Duration::from_secs(5)).await;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod backpressure;
pub mod clock;
pub mod config;
pub mod core;
pub mod delay_queue;
pub mod error;
pub mod etl;
pub mod event;
pub mod gateway;
pub mod jitter;
pub mod load;
pub mod ratelimit;
pub mod scheduler;
pub mod sleeper;
pub mod slo;
pub mod strategy;
pub mod telemetry;

// Re-exports
pub use backoff::{Backoff, MAX_BACKOFF};
pub use backpressure::{
    Admission, BackpressureConfig, BackpressureController, BackpressureMetrics,
    BackpressureState, CircuitState, DegradationLevel, ExternalSignals, ResourceThresholds,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ConfigError, CoreConfig, TickerConfig};
pub use crate::core::{ControlPlane, SignalSource, StartError, StaticSignals};
pub use delay_queue::{DelayKey, DelayQueue};
pub use error::{DropReason, ErrorKind, Kinded};
pub use etl::{EtlConfig, EtlHealthStatus, EtlPipeline, RecordValidator, StorageSink};
pub use event::{MetricEvent, MetricValue, Priority, SchemaOptions};
pub use gateway::{
    ConsumerConfig, Envelope, GatewayError, MemoryGateway, PublishAck, StreamConfig,
    StreamGateway,
};
pub use jitter::Jitter;
pub use load::{LoadHeadersLayer, LoadLevel, LoadSnapshot, RecommendedAction};
pub use ratelimit::{MultiWindowLimiter, RateDecision, RateLimitConfig, Tier, WindowStore};
pub use scheduler::{FairShareScheduler, ScheduledJob, SchedulerConfig, TokenRecord};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use slo::{SloConfig, SloEvaluator, SloMeasurement, SloSeverity};
pub use strategy::{ActiveStrategy, StrategyAnalyzer, StrategyNotice};
pub use telemetry::{ControlEvent, SharedSink, TelemetrySink};

pub mod prelude;
