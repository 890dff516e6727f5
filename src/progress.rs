//! Progress events and the bus that fans them out to subscribers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use flume::{Receiver, Sender};
use serde::Serialize;
use tokio::time::Instant;

use crate::engine::TaskId;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Enqueued,
    Started,
    /// Same name and hash already exist remotely.
    DuplicateSkipped,
    RapidUploaded,
    Transferring,
    Paused,
    Resumed,
    Retrying,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    pub phase: Phase,
    pub path: String,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// Bytes per second over the last sampling window.
    pub speed: u64,
    pub elapsed_ms: u64,
    pub retry: u32,
    pub max_retry: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressEvent {
    pub fn new(task_id: TaskId, phase: Phase, path: impl Into<String>) -> Self {
        Self {
            task_id,
            phase,
            path: path.into(),
            bytes_transferred: 0,
            total_bytes: 0,
            speed: 0,
            elapsed_ms: 0,
            retry: 0,
            max_retry: 0,
            error: None,
        }
    }

    pub fn bytes(mut self, transferred: u64, total: u64) -> Self {
        self.bytes_transferred = transferred;
        self.total_bytes = total;
        self
    }

    pub fn retry(mut self, retry: u32, max_retry: u32) -> Self {
        self.retry = retry;
        self.max_retry = max_retry;
        self
    }

    pub fn error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Broadcast channel with a bounded replay log: a new subscriber first sees
/// the last `capacity` events, then live ones.
pub struct ProgressBus {
    subscribers: DashMap<u64, Sender<ProgressEvent>>,
    replay: Mutex<VecDeque<ProgressEvent>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl ProgressBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            replay: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            next_id: AtomicU64::new(0),
        }
    }

    fn replay(&self) -> MutexGuard<'_, VecDeque<ProgressEvent>> {
        self.replay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn publish(&self, event: ProgressEvent) {
        // Subscribing also takes this lock, so no event is seen twice or missed.
        let mut replay = self.replay();
        self.subscribers
            .retain(|_, sender| sender.send(event.clone()).is_ok());

        if self.capacity > 0 {
            if replay.len() >= self.capacity {
                replay.pop_front();
            }
            replay.push_back(event);
        }
    }

    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = flume::unbounded();
        let replay = self.replay();
        for event in replay.iter() {
            let _ = tx.send(event.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id, tx);
        log::debug!("Progress subscriber {id} joined, {} replayed", replay.len());

        Subscription {
            id,
            bus: Arc::clone(self),
            receiver: rx,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.remove(&id);
    }
}

pub struct Subscription {
    id: u64,
    bus: Arc<ProgressBus>,
    receiver: Receiver<ProgressEvent>,
}

impl Subscription {
    pub async fn recv(&self) -> Option<ProgressEvent> {
        self.receiver.recv_async().await.ok()
    }

    /// Everything received so far, without waiting.
    pub fn drain(&self) -> Vec<ProgressEvent> {
        self.receiver.drain().collect()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

/// Transfer speed over a sliding window of (time, total bytes) samples.
pub struct SpeedMeter {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
}

impl SpeedMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
        }
    }

    /// Records the running total and returns the current speed in B/s.
    pub fn update(&mut self, now: Instant, total_bytes: u64) -> u64 {
        self.samples.push_back((now, total_bytes));
        while self
            .samples
            .front()
            .is_some_and(|(at, _)| now.duration_since(*at) > self.window)
        {
            self.samples.pop_front();
        }

        let Some(&(first_at, first_bytes)) = self.samples.front() else {
            return 0;
        };
        let elapsed = now.duration_since(first_at);
        if elapsed.is_zero() {
            return 0;
        }
        (total_bytes.saturating_sub(first_bytes) as f64 / elapsed.as_secs_f64()) as u64
    }
}
