//! Duplicate suppression across the gateway surface.

use bytes::Bytes;
use floodgate::gateway::{GatewayError, MemoryGateway, StreamGateway};
use floodgate::{MetricEvent, MetricValue};

#[tokio::test]
async fn duplicate_publish_within_window_persists_exactly_one_event() {
    let gateway = MemoryGateway::with_default_streams();
    let subject = "kpi.metrics.marketing.normal";

    let event = MetricEvent::new("marketing", "engagement", MetricValue::Rate(2.5), "webhook")
        .with_id("m_1");
    let payload = Bytes::from(serde_json::to_vec(&event).unwrap());

    let first = gateway.publish(subject, payload.clone(), "m_1").await.unwrap();
    let after_first = gateway.stream_info("KPI_METRICS").await.unwrap().messages;

    let second = gateway.publish(subject, payload, "m_1").await;
    match second {
        Err(GatewayError::DuplicateId { seq, .. }) => {
            assert_eq!(seq, first.seq, "duplicate reports the original sequence")
        }
        other => panic!("expected DuplicateId, got {other:?}"),
    }

    let after_second = gateway.stream_info("KPI_METRICS").await.unwrap().messages;
    assert_eq!(after_second, after_first, "message count grew past the original publish");
    assert_eq!(after_second, 1);
}

#[tokio::test]
async fn distinct_ids_are_both_persisted() {
    let gateway = MemoryGateway::with_default_streams();
    let subject = "kpi.metrics.marketing.normal";

    gateway.publish(subject, Bytes::from_static(b"{}"), "m_1").await.unwrap();
    gateway.publish(subject, Bytes::from_static(b"{}"), "m_2").await.unwrap();

    assert_eq!(gateway.stream_info("KPI_METRICS").await.unwrap().messages, 2);
}

#[tokio::test]
async fn dedup_window_applies_per_stream() {
    let gateway = MemoryGateway::with_default_streams();

    gateway
        .publish("kpi.metrics.acme.normal", Bytes::from_static(b"{}"), "shared-id")
        .await
        .unwrap();
    // same id on a different stream is a different dedup scope
    gateway
        .publish("kpi.alerts.acme", Bytes::from_static(b"{}"), "shared-id")
        .await
        .unwrap();

    assert_eq!(gateway.stream_info("KPI_METRICS").await.unwrap().messages, 1);
    assert_eq!(gateway.stream_info("KPI_ALERTS").await.unwrap().messages, 1);
}
