//! Control-plane telemetry.
//!
//! Every component emits typed [`ControlEvent`]s describing its decisions:
//! level transitions, drops, breaker movement, flushes, breaches. Events
//! flow through [`TelemetrySink`] implementations (a `tower::Service`) which
//! can log, buffer, or broadcast them to live subscribers.

pub mod events;
pub mod sinks;

pub use events::{
    ControlEvent, EtlEvent, GateEvent, LimitEvent, SchedulerEvent, SloEvent, StrategyEvent,
};
pub use sinks::{
    emit_best_effort, LogSink, MemorySink, NullSink, SharedSink, StreamingSink, TelemetrySink,
};
