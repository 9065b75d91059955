//! Deadline-ordered delay queue.
//!
//! Every deferred action in the crate rides on this one primitive: the
//! dispatcher's publish requeues, batch retry waits, and token cooldown
//! probes. Entries come out in deadline order; cancellation is first-class.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Handle returned by [`DelayQueue::push`]; cancels its entry on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DelayKey(u64);

struct Entry<T> {
    deadline: Instant,
    seq: u64,
    key: DelayKey,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the earliest deadline wins.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner<T> {
    heap: Mutex<HeapState<T>>,
    notify: Notify,
    closed: AtomicBool,
    next_seq: AtomicU64,
}

struct HeapState<T> {
    entries: BinaryHeap<Entry<T>>,
    cancelled: std::collections::HashSet<u64>,
}

/// Deadline-ordered queue of deferred items.
pub struct DelayQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for DelayQueue<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Send> Default for DelayQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> DelayQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                heap: Mutex::new(HeapState {
                    entries: BinaryHeap::new(),
                    cancelled: std::collections::HashSet::new(),
                }),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Schedule `item` to surface after `delay`. A closed queue refuses the
    /// entry and hands it back so the caller can escalate.
    pub fn push(&self, item: T, delay: Duration) -> Result<DelayKey, T> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(item);
        }
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let key = DelayKey(seq);
        {
            let mut state = self.inner.heap.lock().unwrap_or_else(|p| p.into_inner());
            state.entries.push(Entry { deadline: Instant::now() + delay, seq, key, item });
        }
        self.inner.notify.notify_waiters();
        Ok(key)
    }

    /// Cancel a pending entry. Returns false when the entry already
    /// surfaced or was cancelled before.
    pub fn cancel(&self, key: DelayKey) -> bool {
        let mut state = self.inner.heap.lock().unwrap_or_else(|p| p.into_inner());
        if state.entries.iter().any(|e| e.key == key) {
            state.cancelled.insert(key.0);
            drop(state);
            self.inner.notify.notify_waiters();
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        let state = self.inner.heap.lock().unwrap_or_else(|p| p.into_inner());
        state.entries.len() - state.cancelled.len().min(state.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting entries and wake all waiters. Pending entries still
    /// drain through [`pop`](Self::pop); once empty, `pop` returns `None`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Non-blocking pop: the next entry whose deadline has passed, if any.
    pub fn pop_ready(&self) -> Option<T> {
        let mut state = self.inner.heap.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            match state.entries.peek() {
                Some(head) if state.cancelled.contains(&head.seq) => {
                    let seq = head.seq;
                    state.entries.pop();
                    state.cancelled.remove(&seq);
                }
                Some(head) if head.deadline <= Instant::now() => {
                    return state.entries.pop().map(|e| e.item);
                }
                _ => return None,
            }
        }
    }

    /// Drain every entry regardless of deadline. Used by shutdown paths
    /// that must not strand deferred work.
    pub fn drain_all(&self) -> Vec<T> {
        let mut state = self.inner.heap.lock().unwrap_or_else(|p| p.into_inner());
        let mut items = Vec::with_capacity(state.entries.len());
        while let Some(entry) = state.entries.pop() {
            if !state.cancelled.remove(&entry.seq) {
                items.push(entry.item);
            }
        }
        items
    }

    /// Wait for the next entry whose deadline has passed. Returns `None`
    /// once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let wait_until = {
                let mut state = self.inner.heap.lock().unwrap_or_else(|p| p.into_inner());
                // discard cancelled heads eagerly
                while let Some(seq) = state.entries.peek().map(|head| head.seq) {
                    if state.cancelled.remove(&seq) {
                        state.entries.pop();
                    } else {
                        break;
                    }
                }
                match state.entries.peek() {
                    Some(head) if head.deadline <= Instant::now() => {
                        let entry = state.entries.pop().map(|e| e.item);
                        return entry;
                    }
                    Some(head) => Some(head.deadline),
                    None => None,
                }
            };

            match wait_until {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
                        _ = self.inner.notify.notified() => {}
                    }
                }
                None => {
                    if self.inner.closed.load(Ordering::Acquire) {
                        return None;
                    }
                    self.inner.notify.notified().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entries_surface_in_deadline_order() {
        let queue = DelayQueue::new();
        queue.push("slow", Duration::from_millis(60)).unwrap();
        queue.push("fast", Duration::from_millis(10)).unwrap();
        queue.push("mid", Duration::from_millis(30)).unwrap();

        assert_eq!(queue.pop().await, Some("fast"));
        assert_eq!(queue.pop().await, Some("mid"));
        assert_eq!(queue.pop().await, Some("slow"));
    }

    #[tokio::test]
    async fn equal_deadlines_surface_in_push_order() {
        let queue = DelayQueue::new();
        queue.push(1, Duration::ZERO).unwrap();
        queue.push(2, Duration::ZERO).unwrap();
        queue.push(3, Duration::ZERO).unwrap();

        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, Some(3));
    }

    #[tokio::test]
    async fn cancelled_entries_never_surface() {
        let queue = DelayQueue::new();
        let doomed = queue.push("doomed", Duration::from_millis(5)).unwrap();
        queue.push("kept", Duration::from_millis(10)).unwrap();

        assert!(queue.cancel(doomed));
        assert!(!queue.cancel(doomed));
        assert_eq!(queue.pop().await, Some("kept"));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let queue = DelayQueue::new();
        queue.push("left-behind", Duration::from_millis(5)).unwrap();
        queue.close();

        assert_eq!(queue.push("rejected", Duration::ZERO), Err("rejected"));
        assert_eq!(queue.pop().await, Some("left-behind"));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn pop_wakes_on_late_push() {
        let queue: DelayQueue<&str> = DelayQueue::new();
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push("late", Duration::ZERO).unwrap();
        assert_eq!(popper.await.unwrap(), Some("late"));
    }

    #[tokio::test]
    async fn len_ignores_cancelled_entries() {
        let queue = DelayQueue::new();
        let a = queue.push('a', Duration::from_secs(5)).unwrap();
        queue.push('b', Duration::from_secs(5)).unwrap();
        assert_eq!(queue.len(), 2);
        queue.cancel(a);
        assert_eq!(queue.len(), 1);
    }
}
