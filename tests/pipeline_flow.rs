//! Whole-plane flow: admission → stream → ETL → storage, plus the header
//! contract and shutdown guarantees.

use bytes::Bytes;
use floodgate::config::CoreConfig;
use floodgate::core::{ControlPlane, StaticSignals};
use floodgate::etl::{MemoryBroadcaster, MemoryStorageSink};
use floodgate::event::{MetricEvent, MetricValue, Priority};
use floodgate::gateway::MemoryGateway;
use floodgate::load::{LoadLevel, RecommendedAction, HEADER_RETRY_AFTER};
use floodgate::telemetry::SharedSink;
use floodgate::ExternalSignals;
use std::sync::Arc;
use std::time::Duration;

fn quick_config() -> CoreConfig {
    let mut config = CoreConfig::default();
    config.tickers.monitor_interval = Duration::from_millis(10);
    config.tickers.drain_interval = Duration::from_millis(10);
    config.tickers.trend_interval = Duration::from_millis(20);
    config.tickers.breach_interval = Duration::from_millis(50);
    config.etl.batch_size = 5;
    config.etl.batch_timeout = Duration::from_millis(30);
    config.etl.fetch_wait = Duration::from_millis(10);
    config.backpressure.thresholds.max_memory_mb = 100.0;
    config
}

struct Plane {
    plane: Arc<ControlPlane>,
    storage: Arc<MemoryStorageSink>,
    broadcaster: Arc<MemoryBroadcaster>,
    signals: Arc<StaticSignals>,
}

async fn start() -> Plane {
    let storage = MemoryStorageSink::new();
    let broadcaster = MemoryBroadcaster::new();
    let signals = StaticSignals::new();
    let plane = ControlPlane::start(
        quick_config(),
        Arc::new(MemoryGateway::new()),
        storage.clone(),
        broadcaster.clone(),
        signals.clone(),
        SharedSink::null(),
    )
    .await
    .unwrap();
    Plane { plane, storage, broadcaster, signals }
}

fn sample_event(n: u64) -> MetricEvent {
    MetricEvent::new("marketing", "post_reach", MetricValue::Count(n), "webhook")
        .with_priority(Priority::Medium)
        .with_platform("instagram")
}

#[tokio::test]
async fn accepted_events_reach_storage_and_broadcast() {
    let harness = start().await;

    for n in 0..10 {
        let event = sample_event(n);
        let payload = Bytes::from(serde_json::to_vec(&event).unwrap());
        let admission = harness
            .plane
            .controller()
            .publish(&event.subject(), payload, event.priority)
            .await;
        assert!(admission.is_accepted());
    }

    for _ in 0..200 {
        if harness.storage.len() == 10 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(harness.storage.len(), 10);
    assert_eq!(harness.broadcaster.updates().len(), 10);

    assert!(harness.plane.shutdown(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn load_headers_follow_the_monitoring_signal() {
    let harness = start().await;

    let calm = harness.plane.load_snapshot();
    assert_eq!(calm.level, LoadLevel::Optimal);
    assert_eq!(calm.action, RecommendedAction::Continue);
    assert_eq!(calm.headers().len(), 5, "exactly the four load headers plus suggestions");

    // drive memory past 2x the threshold and wait for a monitor tick
    harness.signals.set(ExternalSignals {
        memory_mb: 250.0,
        publish_rate: 0.0,
        cpu_pct: 0.0,
    });
    let mut snapshot = harness.plane.load_snapshot();
    for _ in 0..100 {
        snapshot = harness.plane.load_snapshot();
        if snapshot.level == LoadLevel::Critical {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(snapshot.level, LoadLevel::Critical);
    assert_eq!(snapshot.action, RecommendedAction::TryLater);
    assert!(snapshot.headers().iter().any(|(k, _)| *k == HEADER_RETRY_AFTER));

    harness.plane.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn strategy_stream_reports_the_escalation() {
    let harness = start().await;
    let mut notices = harness.plane.analyzer().subscribe();

    harness.signals.set(ExternalSignals {
        memory_mb: 250.0,
        publish_rate: 0.0,
        cpu_pct: 0.0,
    });

    // the trend ticker publishes an update reflecting the new level
    let mut saw_critical = false;
    for _ in 0..100 {
        match tokio::time::timeout(Duration::from_millis(50), notices.recv()).await {
            Ok(Ok(notice)) => {
                let strategy = match notice {
                    floodgate::StrategyNotice::Updated(s) => s,
                    floodgate::StrategyNotice::Changed { strategy, .. } => strategy,
                };
                if strategy.level == floodgate::DegradationLevel::Critical {
                    saw_critical = true;
                    assert!(!strategy.reasons.is_empty());
                    break;
                }
            }
            _ => continue,
        }
    }
    assert!(saw_critical, "no strategy notice reflected the escalation");

    harness.plane.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn shutdown_drains_accepted_messages_and_is_idempotent() {
    let harness = start().await;

    // push the plane off the fast path so messages queue
    harness.signals.set(ExternalSignals {
        memory_mb: 120.0,
        publish_rate: 0.0,
        cpu_pct: 0.0,
    });
    for _ in 0..100 {
        if harness.plane.controller().state().level > floodgate::DegradationLevel::None {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut enqueued = 0;
    for n in 0..20 {
        let event = sample_event(n).with_priority(Priority::Critical);
        let payload = Bytes::from(serde_json::to_vec(&event).unwrap());
        if harness
            .plane
            .controller()
            .publish(&event.subject(), payload, Priority::Critical)
            .await
            == floodgate::Admission::Enqueued
        {
            enqueued += 1;
        }
    }
    assert!(enqueued > 0, "expected queued messages under load");

    assert!(harness.plane.shutdown(Duration::from_secs(2)).await);
    assert!(harness.plane.shutdown(Duration::from_secs(2)).await, "second shutdown is a no-op");

    // everything accepted before shutdown is in the stream
    let info = harness
        .plane
        .gateway()
        .stream_info("KPI_METRICS")
        .await
        .unwrap();
    assert!(info.messages >= enqueued, "accepted messages were lost in shutdown");
}
