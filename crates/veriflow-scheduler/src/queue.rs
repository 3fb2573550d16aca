//! Priority queue with delayed readiness.
//!
//! Tasks enter with a `ready_at` time and a priority weight. `pop_ready`
//! promotes everything whose time has come and hands back the
//! highest-weight entry, FIFO within a weight. The queue stores only task
//! ids; task state lives in the scheduler's registry.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{futures::Notified, Mutex, Notify};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Entry {
    ready_at: DateTime<Utc>,
    weight: i32,
    seq: u64,
    task_id: Uuid,
}

/// Min-heap ordering on `ready_at` (earliest first).
#[derive(Debug)]
struct DelayedEntry(Entry);

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.seq == other.0.seq
    }
}

impl Eq for DelayedEntry {}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .ready_at
            .cmp(&self.0.ready_at)
            .then(other.0.seq.cmp(&self.0.seq))
    }
}

/// Max-heap ordering on weight, FIFO (sequence) within a weight.
#[derive(Debug)]
struct ReadyEntry(Entry);

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.seq == other.0.seq
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .weight
            .cmp(&other.0.weight)
            .then(other.0.seq.cmp(&self.0.seq))
    }
}

#[derive(Debug, Default)]
struct Inner {
    delayed: BinaryHeap<DelayedEntry>,
    ready: BinaryHeap<ReadyEntry>,
    seq: u64,
}

/// Delay-aware priority queue feeding the worker pool.
#[derive(Debug)]
pub struct TaskQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    /// Enqueue a task id, waking the dispatcher.
    pub async fn push(&self, task_id: Uuid, ready_at: DateTime<Utc>, weight: i32) {
        {
            let mut inner = self.inner.lock().await;
            inner.seq += 1;
            let seq = inner.seq;
            inner.delayed.push(DelayedEntry(Entry {
                ready_at,
                weight,
                seq,
                task_id,
            }));
        }
        self.notify.notify_one();
    }

    /// Pop the highest-priority task whose `ready_at` has passed.
    pub async fn pop_ready(&self, now: DateTime<Utc>) -> Option<Uuid> {
        let mut inner = self.inner.lock().await;
        Self::promote(&mut inner, now);
        inner.ready.pop().map(|e| e.0.task_id)
    }

    /// Time until the next delayed entry becomes ready. `None` when the
    /// queue is empty; zero when something is already ready.
    pub async fn next_wakeup(&self, now: DateTime<Utc>) -> Option<Duration> {
        let mut inner = self.inner.lock().await;
        Self::promote(&mut inner, now);

        if !inner.ready.is_empty() {
            return Some(Duration::ZERO);
        }

        inner.delayed.peek().map(|e| {
            e.0.ready_at
                .signed_duration_since(now)
                .to_std()
                .unwrap_or(Duration::ZERO)
        })
    }

    /// Future resolved the next time an entry is pushed.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    fn promote(inner: &mut Inner, now: DateTime<Utc>) {
        while let Some(next) = inner.delayed.peek() {
            if next.0.ready_at > now {
                break;
            }
            if let Some(entry) = inner.delayed.pop() {
                inner.ready.push(ReadyEntry(entry.0));
            }
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
