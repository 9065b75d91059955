//! Storage and broadcast seams of the batch pipeline.
//!
//! The pipeline never talks to a database or a socket server directly; it
//! writes validated records through [`StorageSink`] and pushes live updates
//! through [`UpdateBroadcaster`]. In-memory implementations back the test
//! suite and double as reference semantics.

use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::error::{ErrorKind, Kinded};
use crate::event::MetricEvent;

#[derive(Debug, Error, Clone, PartialEq)]
#[error("storage write failed: {detail}")]
pub struct SinkError {
    pub detail: String,
}

impl Kinded for SinkError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Transient
    }
}

/// Batched write target for validated records.
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn write_batch(&self, records: Vec<MetricEvent>) -> Result<(), SinkError>;
}

/// Receives live pushes after successful flushes.
#[async_trait]
pub trait UpdateBroadcaster: Send + Sync {
    async fn metric_update(&self, records: &[MetricEvent]);
    async fn data_quality_alert(&self, invalid: usize, total: usize);
}

/// In-memory sink with injectable failures.
#[derive(Default)]
pub struct MemoryStorageSink {
    records: Mutex<Vec<MetricEvent>>,
    fail_next: AtomicI64,
}

impl MemoryStorageSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` writes.
    pub fn fail_next(&self, n: i64) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<MetricEvent> {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StorageSink for MemoryStorageSink {
    async fn write_batch(&self, records: Vec<MetricEvent>) -> Result<(), SinkError> {
        if self.fail_next.fetch_sub(1, Ordering::SeqCst) > 0 {
            return Err(SinkError { detail: "injected failure".to_string() });
        }
        self.records.lock().unwrap_or_else(|p| p.into_inner()).extend(records);
        Ok(())
    }
}

/// Drops every push; for pipelines with no live consumers.
pub struct NullBroadcaster;

#[async_trait]
impl UpdateBroadcaster for NullBroadcaster {
    async fn metric_update(&self, _records: &[MetricEvent]) {}

    async fn data_quality_alert(&self, _invalid: usize, _total: usize) {}
}

/// Records every push; the test suite's observer.
#[derive(Default)]
pub struct MemoryBroadcaster {
    updates: Mutex<Vec<MetricEvent>>,
    alerts: Mutex<Vec<(usize, usize)>>,
}

impl MemoryBroadcaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn updates(&self) -> Vec<MetricEvent> {
        self.updates.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn alerts(&self) -> Vec<(usize, usize)> {
        self.alerts.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl UpdateBroadcaster for MemoryBroadcaster {
    async fn metric_update(&self, records: &[MetricEvent]) {
        self.updates.lock().unwrap_or_else(|p| p.into_inner()).extend_from_slice(records);
    }

    async fn data_quality_alert(&self, invalid: usize, total: usize) {
        self.alerts.lock().unwrap_or_else(|p| p.into_inner()).push((invalid, total));
    }
}
