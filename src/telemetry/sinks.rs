//! Telemetry sinks.
//!
//! A sink is a `tower::Service<ControlEvent>`. Components never call a sink
//! directly; they hold a [`SharedSink`] handle whose `emit` is synchronous
//! and non-blocking, with a worker task draining the buffered events into
//! the real sink.

use super::events::ControlEvent;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::Service;

/// A telemetry sink that consumes control events.
pub trait TelemetrySink:
    tower::Service<ControlEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: ControlEvent)
where
    S: tower::Service<ControlEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready) = sink.ready_oneshot().await {
        let _ = ready.call(event).await;
    }
}

/// Cloneable handle components use to emit without blocking.
///
/// Events are buffered on a bounded channel; when the buffer is full the
/// event is counted as dropped rather than stalling a hot path.
#[derive(Clone, Debug)]
pub struct SharedSink {
    inner: SinkInner,
    dropped: Arc<AtomicU64>,
}

#[derive(Clone, Debug)]
enum SinkInner {
    Null,
    Channel(tokio::sync::mpsc::Sender<ControlEvent>),
}

impl SharedSink {
    /// Discard everything. Needs no runtime; the default for tests.
    pub fn null() -> Self {
        Self { inner: SinkInner::Null, dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Drain buffered events into `sink` from a worker task. Must be called
    /// inside a tokio runtime.
    pub fn new<S>(sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        Self::with_capacity(sink, 1024)
    }

    pub fn with_capacity<S>(sink: S, capacity: usize) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<ControlEvent>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                emit_best_effort(sink.clone(), event).await;
            }
        });
        Self { inner: SinkInner::Channel(tx), dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Fire-and-forget emit. Never blocks, never fails.
    pub fn emit(&self, event: ControlEvent) {
        match &self.inner {
            SinkInner::Null => {}
            SinkInner::Channel(tx) => {
                if tx.try_send(event).is_err() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Events lost to a full buffer since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// A no-op sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<ControlEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: ControlEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Logs every event through `tracing`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<ControlEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: ControlEvent) -> Self::Future {
        tracing::info!(event = %event, "control_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Stores events in a bounded in-memory ring; oldest events are evicted.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<ControlEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<ControlEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<ControlEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: ControlEvent) -> Self::Future {
        let mut guard = self.events.lock().unwrap_or_else(|p| p.into_inner());
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Broadcasts events to live subscribers; the live strategy stream rides on
/// this. Events sent with no subscribers are counted, not errors.
#[derive(Clone, Debug)]
pub struct StreamingSink {
    sender: Arc<tokio::sync::broadcast::Sender<ControlEvent>>,
    unobserved: Arc<AtomicU64>,
}

impl StreamingSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { sender: Arc::new(sender), unobserved: Arc::new(AtomicU64::new(0)) }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ControlEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn unobserved(&self) -> u64 {
        self.unobserved.load(Ordering::Relaxed)
    }
}

impl Service<ControlEvent> for StreamingSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: ControlEvent) -> Self::Future {
        if self.sender.send(event).is_err() {
            self.unobserved.fetch_add(1, Ordering::Relaxed);
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for StreamingSink {
    type SinkError = Infallible;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::DegradationLevel;
    use crate::telemetry::events::GateEvent;

    fn sample_event() -> ControlEvent {
        ControlEvent::Gate(GateEvent::DegradationChanged {
            old: DegradationLevel::None,
            new: DegradationLevel::Low,
            pressure: 0.8,
        })
    }

    #[tokio::test]
    async fn memory_sink_stores_and_evicts() {
        let sink = MemorySink::with_capacity(2);
        for _ in 0..3 {
            emit_best_effort(sink.clone(), sample_event()).await;
        }
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.evicted(), 1);
    }

    #[tokio::test]
    async fn streaming_sink_reaches_subscribers() {
        let sink = StreamingSink::new(16);
        let mut rx = sink.subscribe();
        emit_best_effort(sink.clone(), sample_event()).await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received, sample_event());
    }

    #[tokio::test]
    async fn streaming_sink_counts_unobserved_events() {
        let sink = StreamingSink::new(16);
        emit_best_effort(sink.clone(), sample_event()).await;
        assert_eq!(sink.unobserved(), 1);
    }

    #[tokio::test]
    async fn shared_sink_drains_into_backing_sink() {
        let memory = MemorySink::new();
        let shared = SharedSink::new(memory.clone());
        shared.emit(sample_event());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(memory.len(), 1);
    }

    #[tokio::test]
    async fn null_shared_sink_discards_quietly() {
        let shared = SharedSink::null();
        shared.emit(sample_event());
        assert_eq!(shared.dropped(), 0);
    }
}
