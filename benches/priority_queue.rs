//! Enqueue/drain hot path of the dispatch queue.

use bytes::Bytes;
use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use floodgate::backpressure::{PriorityQueue, QueuedMessage};
use floodgate::event::Priority;

fn message(priority: Priority, n: u64) -> QueuedMessage {
    QueuedMessage {
        subject: "kpi.metrics.acme.normal".to_string(),
        payload: Bytes::from_static(b"{\"value\":1}"),
        msg_id: format!("m-{n}"),
        priority,
        enqueued_at_ms: n,
        enqueued_at: Utc::now(),
        retry_count: 0,
    }
}

fn priorities(n: u64) -> Priority {
    match n % 4 {
        0 => Priority::Low,
        1 => Priority::Medium,
        2 => Priority::High,
        _ => Priority::Critical,
    }
}

fn bench_enqueue(c: &mut Criterion) {
    c.bench_function("enqueue_10k_mixed", |b| {
        b.iter(|| {
            let mut queue = PriorityQueue::new();
            for n in 0..10_000u64 {
                queue.push(black_box(message(priorities(n), n)));
            }
            queue
        })
    });
}

fn bench_drain(c: &mut Criterion) {
    c.bench_function("drain_10k_in_batches_of_50", |b| {
        b.iter_batched(
            || {
                let mut queue = PriorityQueue::new();
                for n in 0..10_000u64 {
                    queue.push(message(priorities(n), n));
                }
                queue
            },
            |mut queue| {
                while !queue.is_empty() {
                    black_box(queue.drain(50));
                }
            },
            criterion::BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, bench_enqueue, bench_drain);
criterion_main!(benches);
