//! Abstraction for delay-bearing loops.
//!
//! Retry paths, dispatcher backoff, and the delay queue all sleep through
//! this trait so tests can run without real time passing.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[async_trait]
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    async fn sleep(&self, duration: Duration);
}

/// Production sleeper on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Test sleeper that returns immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, _duration: Duration) {}
}

/// Test sleeper that records every requested delay without sleeping.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    requested: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.requested.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn call_at(&self, index: usize) -> Option<Duration> {
        self.requested.lock().unwrap_or_else(|p| p.into_inner()).get(index).copied()
    }

    pub fn total(&self) -> Duration {
        self.requested.lock().unwrap_or_else(|p| p.into_inner()).iter().sum()
    }

    pub fn clear(&self) {
        self.requested.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

#[async_trait]
impl Sleeper for TrackingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.requested.lock().unwrap_or_else(|p| p.into_inner()).push(duration);
    }
}
