//! Degradation ladder behavior under a rising memory signal.

use bytes::Bytes;
use floodgate::backpressure::{
    BackpressureConfig, BackpressureController, DegradationLevel, ExternalSignals,
    ResourceThresholds,
};
use floodgate::gateway::MemoryGateway;
use floodgate::telemetry::SharedSink;
use floodgate::Priority;
use std::sync::Arc;

fn controller() -> BackpressureController {
    BackpressureController::new(
        BackpressureConfig {
            thresholds: ResourceThresholds {
                max_memory_mb: 100.0,
                max_queue: 100.0,
                max_rate: 100.0,
                max_cpu_pct: 80.0,
            },
            ..Default::default()
        },
        Arc::new(MemoryGateway::with_default_streams()),
        SharedSink::null(),
    )
}

fn memory(memory_mb: f64) -> ExternalSignals {
    ExternalSignals { memory_mb, publish_rate: 0.0, cpu_pct: 0.0 }
}

#[tokio::test]
async fn staircase_of_levels_and_sampling_rates() {
    let controller = controller();
    let expectations = [
        (50.0, DegradationLevel::None, 1.0),
        (70.0, DegradationLevel::Low, 0.9),
        (100.0, DegradationLevel::Medium, 0.7),
        (130.0, DegradationLevel::Medium, 0.7),
        (170.0, DegradationLevel::High, 0.5),
        (210.0, DegradationLevel::Critical, 0.2),
    ];

    for (memory_mb, level, sampling_rate) in expectations {
        controller.monitor_tick(memory(memory_mb));
        let state = controller.state();
        assert_eq!(state.level, level, "memory at {memory_mb} MB");
        assert_eq!(state.sampling_rate, sampling_rate, "memory at {memory_mb} MB");
    }
}

#[tokio::test]
async fn strictly_rising_pressure_never_lowers_the_level() {
    let controller = controller();
    let mut last = DegradationLevel::None;
    for step in 0..40 {
        controller.monitor_tick(memory(40.0 + step as f64 * 5.0));
        let level = controller.state().level;
        assert!(level >= last, "level regressed at step {step}");
        last = level;
    }
    assert_eq!(last, DegradationLevel::Critical);
}

#[tokio::test]
async fn sampled_drop_fraction_stays_near_the_lever_setting() {
    let controller = controller();
    // medium level: sampling rate 0.7, expected drop fraction 0.3
    controller.monitor_tick(memory(100.0));

    let total = 10_000;
    for _ in 0..total {
        controller
            .publish("kpi.metrics.acme.normal", Bytes::from_static(b"{}"), Priority::Medium)
            .await;
    }
    let observed = controller.metrics().dropped_sampling as f64 / total as f64;
    assert!(
        (observed - 0.3).abs() < 0.1,
        "observed sampling-drop fraction {observed} strays past 10 points from 0.3"
    );
}

#[tokio::test]
async fn recovery_lowers_the_level_and_restores_the_fast_path() {
    let controller = controller();
    controller.monitor_tick(memory(210.0));
    assert_eq!(controller.state().level, DegradationLevel::Critical);

    controller.monitor_tick(memory(30.0));
    assert_eq!(controller.state().level, DegradationLevel::None);

    let admission = controller
        .publish("kpi.metrics.acme.normal", Bytes::from_static(b"{}"), Priority::Medium)
        .await;
    assert!(matches!(admission, floodgate::Admission::Published { .. }));
}
