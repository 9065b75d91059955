//! Token breaker cycle and fair-share guarantees.

use floodgate::clock::ManualClock;
use floodgate::ratelimit::{MultiWindowLimiter, RateLimitConfig};
use floodgate::scheduler::{
    CircuitState, FairShareScheduler, NoLoadGate, ScheduleOptions, SchedulerConfig,
};
use floodgate::telemetry::SharedSink;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn scheduler(clock: ManualClock) -> FairShareScheduler {
    let limiter = Arc::new(MultiWindowLimiter::in_memory(SharedSink::null()));
    FairShareScheduler::new(
        SchedulerConfig::default(),
        Arc::new(NoLoadGate),
        limiter,
        SharedSink::null(),
    )
    .with_clock(clock)
}

#[tokio::test]
async fn five_failures_open_the_token_and_block_selection() {
    let clock = ManualClock::new();
    let scheduler = scheduler(clock.clone());
    scheduler.upsert_token("t", "instagram");

    for _ in 0..5 {
        scheduler.record_failure("t", "instagram", "platform 500");
    }
    let record = scheduler.token("t", "instagram").unwrap();
    assert_eq!(record.circuit_state, CircuitState::Open);
    assert_eq!(record.cooldown_until_ms, Some(5 * 60 * 1_000));
    assert!(scheduler.next_token("instagram").is_none());

    // after the cooldown one success walks half-open back to closed
    clock.set(5 * 60 * 1_000);
    scheduler.record_success("t", "instagram", Duration::from_millis(420));
    let record = scheduler.token("t", "instagram").unwrap();
    assert_eq!(record.circuit_state, CircuitState::Closed);
    assert_eq!(record.failure_count, 0);
    assert_eq!(scheduler.next_token("instagram").as_deref(), Some("t"));
}

#[tokio::test]
async fn selection_gap_is_bounded_by_the_eligible_token_count() {
    let clock = ManualClock::new();
    let scheduler = scheduler(clock.clone());
    let tokens = ["a", "b", "c", "d", "e"];
    for token in tokens {
        scheduler.upsert_token(token, "x");
    }

    // one grant per simulated second
    let mut last_grant: HashMap<String, u64> = HashMap::new();
    for second in 1..=100u64 {
        clock.set(second * 1_000);
        let pick = scheduler.next_token("x").expect("eligible tokens exist");
        if let Some(previous) = last_grant.insert(pick.clone(), second) {
            assert!(
                second - previous <= tokens.len() as u64,
                "{pick} waited {} grants",
                second - previous
            );
        }
    }
    // every token got work
    assert_eq!(last_grant.len(), tokens.len());
}

#[tokio::test]
async fn rate_limited_tokens_cool_down_and_rotation_continues() {
    let clock = ManualClock::new();
    let limiter = Arc::new(MultiWindowLimiter::in_memory(SharedSink::null()));
    limiter
        .upsert_config(RateLimitConfig::new("instagram", "post").per_minute(1))
        .await;
    let scheduler = FairShareScheduler::new(
        SchedulerConfig::default(),
        Arc::new(NoLoadGate),
        limiter,
        SharedSink::null(),
    )
    .with_clock(clock.clone());
    scheduler.upsert_token("t1", "instagram");
    scheduler.upsert_token("t2", "instagram");

    // t1 consumes its minute budget
    assert!(scheduler
        .schedule("t1", "instagram", "post", ScheduleOptions::default())
        .await
        .is_some());
    assert!(scheduler
        .schedule("t1", "instagram", "post", ScheduleOptions::default())
        .await
        .is_none());
    let cooled = scheduler.token("t1", "instagram").unwrap();
    assert!(cooled.cooldown_until_ms.is_some());

    // rotation proceeds on the untouched token
    assert!(scheduler
        .schedule("t2", "instagram", "post", ScheduleOptions::default())
        .await
        .is_some());
}

#[tokio::test]
async fn scheduled_jobs_carry_queue_name_and_human_scale_jitter() {
    let clock = ManualClock::new();
    let scheduler = scheduler(clock.clone());
    scheduler.upsert_token("tok-9", "tiktok");

    let job = scheduler
        .schedule("tok-9", "tiktok", "post", ScheduleOptions::default())
        .await
        .unwrap();
    assert_eq!(job.queue_name, "publish:tiktok:tok-9");
    assert!(job.jitter_ms >= 30 * 60 * 1_000, "jitter under 30 minutes");
    assert!(job.jitter_ms <= 90 * 60 * 1_000, "jitter over 90 minutes");
}
