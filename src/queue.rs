//! Deferred admission queue.
//!
//! For callers that would rather queue excess work than reject it: a bounded
//! priority queue plus a background drain loop. `enqueue` never blocks and
//! never grows past `max_size` — beyond that it fails fast with
//! [`AdmissionError::QueueFull`] so backpressure reaches the producer
//! immediately. The drainer dequeues highest-priority-first (FIFO among
//! equals) and survives handler failures; an item is removed from the queue
//! before its handler runs, so overlapping drain cycles can never deliver it
//! twice.

use crate::clock::{Clock, SystemClock};
use crate::error::AdmissionError;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// One queued unit of work.
#[derive(Debug)]
pub struct QueueItem<T> {
    /// Higher dequeues first.
    pub priority: i32,
    pub enqueued_at_ms: u64,
    /// Admission order; breaks priority ties FIFO.
    seq: u64,
    pub payload: T,
}

impl<T> PartialEq for QueueItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for QueueItem<T> {}

impl<T> PartialOrd for QueueItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for QueueItem<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: highest priority first, then lowest seq (oldest) first.
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct QueueInner<T> {
    heap: Mutex<BinaryHeap<QueueItem<T>>>,
    max_size: usize,
    seq: AtomicU64,
    clock: Arc<dyn Clock>,
}

/// Bounded priority queue. Clones share the same queue.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for PriorityQueue<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> PriorityQueue<T> {
    pub fn new(max_size: usize) -> Self {
        Self::with_clock(max_size, Arc::new(SystemClock))
    }

    pub fn with_clock(max_size: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                heap: Mutex::new(BinaryHeap::new()),
                max_size,
                seq: AtomicU64::new(0),
                clock,
            }),
        }
    }

    /// Admit one item, failing fast when the queue is at capacity.
    pub fn enqueue(&self, priority: i32, payload: T) -> Result<(), AdmissionError> {
        let mut heap = self.inner.heap.lock().expect("queue poisoned");
        if heap.len() >= self.inner.max_size {
            return Err(AdmissionError::QueueFull {
                depth: heap.len(),
                max: self.inner.max_size,
            });
        }
        heap.push(QueueItem {
            priority,
            enqueued_at_ms: self.inner.clock.now_millis(),
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
            payload,
        });
        Ok(())
    }

    /// Remove and return the highest-priority item.
    pub fn dequeue(&self) -> Option<QueueItem<T>> {
        self.inner.heap.lock().expect("queue poisoned").pop()
    }

    /// Current depth, for backpressure signaling upstream.
    pub fn depth(&self) -> usize {
        self.inner.heap.lock().expect("queue poisoned").len()
    }
}

impl<T: Send + 'static> PriorityQueue<T> {
    /// Start a background loop that drains the queue every `interval`,
    /// invoking `handler` per item. A handler failure is logged and never
    /// halts the loop. Stop it with [`DrainerHandle::shutdown`].
    pub fn spawn_drainer<H, Fut, E>(&self, interval: Duration, mut handler: H) -> DrainerHandle
    where
        H: FnMut(QueueItem<T>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send,
        E: std::fmt::Display,
    {
        let queue = self.clone();
        let stop = Arc::new(Notify::new());
        let stop_signal = stop.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_signal.notified() => break,
                    _ = ticker.tick() => {
                        while let Some(item) = queue.dequeue() {
                            let priority = item.priority;
                            if let Err(e) = handler(item).await {
                                tracing::warn!(
                                    priority,
                                    error = %e,
                                    "queue handler failed; item dropped, drain continues"
                                );
                            }
                        }
                    }
                }
            }
        });
        DrainerHandle { stop, task }
    }
}

/// Handle to stop a running drain loop.
#[derive(Debug)]
pub struct DrainerHandle {
    stop: Arc<Notify>,
    task: tokio::task::JoinHandle<()>,
}

impl DrainerHandle {
    /// Signal the loop to stop and wait for it to finish its current cycle.
    pub async fn shutdown(self) {
        self.stop.notify_one();
        let _ = self.task.await;
    }
}
