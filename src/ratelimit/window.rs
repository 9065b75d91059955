//! Sliding-window storage seam.
//!
//! The limiter keeps its math in [`super`]; state lives behind
//! [`WindowStore`] so a deployment can swap the in-memory store for a
//! sorted-set pipeline on a shared cache. The store owns atomicity: one
//! `admit` call evicts, counts, and records across every tier of a key, or
//! denies without recording anywhere.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Rate-limit tier, evaluated in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    Burst,
    Minute,
    Hour,
    Day,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Burst => "burst",
            Tier::Minute => "minute",
            Tier::Hour => "hour",
            Tier::Day => "day",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tier to evaluate: its limit and window width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierSpec {
    pub tier: Tier,
    pub limit: u32,
    pub window_ms: u64,
}

/// Outcome of an atomic admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// Admitted; `remaining` is the tightest tier's leftover capacity.
    Allowed { remaining: u32 },
    /// Denied at `tier`; nothing was recorded anywhere.
    Denied { tier: Tier, retry_after_secs: u64 },
}

/// Per-tier occupancy for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierUsage {
    pub tier: Tier,
    pub count: u32,
    pub limit: u32,
    pub oldest_entry_ms: Option<u64>,
}

#[async_trait]
pub trait WindowStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Evaluate `tiers` in order for `key`. Each tier is evicted to
    /// `now_ms − window_ms`, counted, and checked; the first full tier
    /// denies. When every tier passes, one `(now_ms, request_id)` entry is
    /// recorded in all of them. The whole call is atomic per key.
    async fn admit(
        &self,
        key: &str,
        tiers: &[TierSpec],
        now_ms: u64,
        request_id: u64,
    ) -> Result<AdmitOutcome, Self::Error>;

    /// Evict and count without recording.
    async fn usage(
        &self,
        key: &str,
        tiers: &[TierSpec],
        now_ms: u64,
    ) -> Result<Vec<TierUsage>, Self::Error>;

    /// Clear every key starting with `prefix`. Returns how many keys went.
    async fn reset_prefix(&self, prefix: &str) -> Result<u64, Self::Error>;
}

type TierWindows = HashMap<Tier, VecDeque<(u64, u64)>>;

/// In-memory store: one mutex per key-map keeps admission atomic.
#[derive(Clone, Default)]
pub struct MemoryWindowStore {
    keys: Arc<Mutex<HashMap<String, TierWindows>>>,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn evict(entries: &mut VecDeque<(u64, u64)>, now_ms: u64, window_ms: u64) {
    let floor = now_ms.saturating_sub(window_ms);
    while entries.front().is_some_and(|(ts, _)| *ts < floor) {
        entries.pop_front();
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    type Error = std::convert::Infallible;

    async fn admit(
        &self,
        key: &str,
        tiers: &[TierSpec],
        now_ms: u64,
        request_id: u64,
    ) -> Result<AdmitOutcome, Self::Error> {
        let mut keys = self.keys.lock().await;
        let windows = keys.entry(key.to_string()).or_default();

        let mut remaining = u32::MAX;
        for spec in tiers {
            let entries = windows.entry(spec.tier).or_default();
            evict(entries, now_ms, spec.window_ms);
            let count = entries.len() as u32;
            if count >= spec.limit {
                let window_end = entries
                    .front()
                    .map(|(ts, _)| ts + spec.window_ms)
                    .unwrap_or(now_ms);
                let retry_after_secs = window_end.saturating_sub(now_ms).div_ceil(1000);
                return Ok(AdmitOutcome::Denied { tier: spec.tier, retry_after_secs });
            }
            remaining = remaining.min(spec.limit - count - 1);
        }

        for spec in tiers {
            windows
                .entry(spec.tier)
                .or_default()
                .push_back((now_ms, request_id));
        }
        Ok(AdmitOutcome::Allowed { remaining })
    }

    async fn usage(
        &self,
        key: &str,
        tiers: &[TierSpec],
        now_ms: u64,
    ) -> Result<Vec<TierUsage>, Self::Error> {
        let mut keys = self.keys.lock().await;
        let windows = keys.entry(key.to_string()).or_default();
        Ok(tiers
            .iter()
            .map(|spec| {
                let entries = windows.entry(spec.tier).or_default();
                evict(entries, now_ms, spec.window_ms);
                TierUsage {
                    tier: spec.tier,
                    count: entries.len() as u32,
                    limit: spec.limit,
                    oldest_entry_ms: entries.front().map(|(ts, _)| *ts),
                }
            })
            .collect())
    }

    async fn reset_prefix(&self, prefix: &str) -> Result<u64, Self::Error> {
        let mut keys = self.keys.lock().await;
        let before = keys.len();
        keys.retain(|key, _| !key.starts_with(prefix));
        Ok((before - keys.len()) as u64)
    }
}
