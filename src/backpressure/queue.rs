//! Priority queue for accepted-but-deferred messages.
//!
//! Ordering contract: higher priority strictly precedes lower; within a
//! priority class, FIFO by enqueue time. A sequence number breaks enqueue
//! timestamp ties so ordering stays stable under a coarse clock.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;

use crate::event::Priority;

/// A message accepted by admission and waiting for dispatch.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub subject: String,
    pub payload: Bytes,
    pub msg_id: String,
    pub priority: Priority,
    /// Monotonic enqueue instant; the FIFO key within a priority class.
    pub enqueued_at_ms: u64,
    /// Wall-clock enqueue time, carried into dead-letter annotations.
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
}

struct HeapEntry {
    message: QueuedMessage,
    seq: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.message
            .priority
            .cmp(&other.message.priority)
            .then_with(|| other.message.enqueued_at_ms.cmp(&self.message.enqueued_at_ms))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Heap keyed by `(priority desc, enqueued_at asc)`. Not synchronized; the
/// controller guards it with a single mutex and keeps critical sections
/// small.
#[derive(Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<HeapEntry>,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: QueuedMessage) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapEntry { message, seq });
    }

    pub fn pop(&mut self) -> Option<QueuedMessage> {
        self.heap.pop().map(|e| e.message)
    }

    /// Up to `batch` messages in dispatch order.
    pub fn drain(&mut self, batch: usize) -> Vec<QueuedMessage> {
        let mut out = Vec::with_capacity(batch.min(self.heap.len()));
        while out.len() < batch {
            match self.heap.pop() {
                Some(entry) => out.push(entry.message),
                None => break,
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(priority: Priority, enqueued_at_ms: u64, tag: &str) -> QueuedMessage {
        QueuedMessage {
            subject: "kpi.metrics.acme.normal".to_string(),
            payload: Bytes::from(tag.to_string()),
            msg_id: tag.to_string(),
            priority,
            enqueued_at_ms,
            enqueued_at: Utc::now(),
            retry_count: 0,
        }
    }

    #[test]
    fn higher_priority_always_wins() {
        let mut queue = PriorityQueue::new();
        queue.push(message(Priority::Low, 1, "low"));
        queue.push(message(Priority::Critical, 100, "critical"));
        queue.push(message(Priority::Medium, 2, "medium"));

        assert_eq!(queue.pop().unwrap().msg_id, "critical");
        assert_eq!(queue.pop().unwrap().msg_id, "medium");
        assert_eq!(queue.pop().unwrap().msg_id, "low");
    }

    #[test]
    fn equal_priority_is_fifo_by_enqueue_time() {
        let mut queue = PriorityQueue::new();
        queue.push(message(Priority::High, 30, "third"));
        queue.push(message(Priority::High, 10, "first"));
        queue.push(message(Priority::High, 20, "second"));

        assert_eq!(queue.pop().unwrap().msg_id, "first");
        assert_eq!(queue.pop().unwrap().msg_id, "second");
        assert_eq!(queue.pop().unwrap().msg_id, "third");
    }

    #[test]
    fn identical_timestamps_preserve_push_order() {
        let mut queue = PriorityQueue::new();
        for tag in ["a", "b", "c", "d"] {
            queue.push(message(Priority::Medium, 5, tag));
        }
        let order: Vec<String> = queue.drain(10).into_iter().map(|m| m.msg_id).collect();
        assert_eq!(order, ["a", "b", "c", "d"]);
    }

    #[test]
    fn drain_respects_batch_size() {
        let mut queue = PriorityQueue::new();
        for i in 0..10 {
            queue.push(message(Priority::Medium, i, &format!("m{i}")));
        }
        let first = queue.drain(3);
        assert_eq!(first.len(), 3);
        assert_eq!(queue.len(), 7);
        assert_eq!(queue.drain(100).len(), 7);
        assert!(queue.is_empty());
    }

    #[test]
    fn late_critical_preempts_queued_low() {
        let mut queue = PriorityQueue::new();
        for i in 0..100 {
            queue.push(message(Priority::Low, i, &format!("low{i}")));
        }
        queue.push(message(Priority::Critical, 1_000, "critical"));
        assert_eq!(queue.drain(1)[0].msg_id, "critical");
    }
}
