//! Convenience re-exports for typical embedders.
//!
//! ```rust
//! use floodgate::prelude::*;
//! ```

pub use crate::backpressure::{
    Admission, BackpressureConfig, BackpressureController, BackpressureState, DegradationLevel,
};
pub use crate::config::CoreConfig;
pub use crate::core::{ControlPlane, SignalSource, StaticSignals};
pub use crate::error::{DropReason, ErrorKind, Kinded};
pub use crate::etl::{EtlConfig, EtlPipeline, StorageSink, UpdateBroadcaster};
pub use crate::event::{MetricEvent, MetricValue, Priority};
pub use crate::gateway::{MemoryGateway, StreamConfig, StreamGateway};
pub use crate::load::{LoadHeadersLayer, LoadSnapshot};
pub use crate::ratelimit::{MultiWindowLimiter, RateDecision, RateLimitConfig};
pub use crate::scheduler::{FairShareScheduler, ScheduleOptions, ScheduledJob};
pub use crate::slo::{SloConfig, SloEvaluator};
pub use crate::strategy::{ActiveStrategy, StrategyAnalyzer};
pub use crate::telemetry::{ControlEvent, SharedSink};
