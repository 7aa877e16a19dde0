//! A deduplicating work queue of resource keys.
//!
//! Keys are plain `namespace/name` strings. A key can be pending at most once
//! at a time; re-enqueueing a key that is currently being processed parks it
//! in a dirty set and it is queued again when the processor calls
//! [`WorkQueue::mark_done`]. This keeps event storms from growing the queue
//! and guarantees a worker only ever sees the latest state for a key.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::sync::Notify;
use tracing::trace;

/// First retry delay handed out by [`WorkQueue::requeue_with_backoff`].
pub const BASE_DELAY: Duration = Duration::from_millis(5);
/// Upper bound on the retry delay.
pub const MAX_DELAY: Duration = Duration::from_secs(1000);

#[derive(Default)]
struct QueueState {
    /// Keys awaiting processing, in arrival order
    pending: VecDeque<String>,
    /// Membership set for `pending`
    members: HashSet<String>,
    /// Keys currently held by a worker
    processing: HashSet<String>,
    /// Keys re-enqueued while being processed; queued again on `mark_done`
    dirty: HashSet<String>,
    /// Consecutive failure counts driving the backoff delay
    failures: HashMap<String, u32>,
}

pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    shutdown: AtomicBool,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Add a key to the queue.
    ///
    /// A no-op merge if the key is already pending; deferred if the key is
    /// currently being processed.
    pub fn enqueue(&self, key: String) {
        let queued = {
            let mut state = self.state.lock().unwrap();
            if state.processing.contains(&key) {
                trace!(%key, "key in flight, deferring");
                state.dirty.insert(key);
                false
            } else if state.members.insert(key.clone()) {
                state.pending.push_back(key);
                true
            } else {
                false
            }
        };
        if queued {
            self.notify.notify_one();
        }
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn dequeue(&self) -> Option<String> {
        loop {
            if self.is_shut_down() {
                return None;
            }
            // Register interest before checking, so an enqueue racing the
            // check still wakes this waiter
            let notified = self.notify.notified();
            if let Some(key) = self.try_dequeue() {
                return Some(key);
            }
            notified.await;
        }
    }

    fn try_dequeue(&self) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        let key = state.pending.pop_front()?;
        state.members.remove(&key);
        state.processing.insert(key.clone());
        Some(key)
    }

    /// Finish processing a key, successfully or as a permanent failure.
    ///
    /// Clears the failure history and re-queues the key if it was enqueued
    /// again while in flight.
    pub fn mark_done(&self, key: &str) {
        let requeue = {
            let mut state = self.state.lock().unwrap();
            state.processing.remove(key);
            state.failures.remove(key);
            state.dirty.remove(key)
        };
        if requeue {
            self.enqueue(key.to_string());
        }
    }

    /// Hand a key back after a transient failure.
    ///
    /// The key is re-queued after an exponentially growing delay, capped at
    /// [`MAX_DELAY`], so a persistently failing key degrades to a slow retry
    /// cadence instead of a tight loop.
    pub fn requeue_with_backoff(self: &Arc<Self>, key: String) {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.processing.remove(&key);
            state.dirty.remove(&key);
            let attempts = state.failures.entry(key.clone()).or_insert(0);
            let exponent = (*attempts).min(32);
            *attempts += 1;
            (BASE_DELAY * 2u32.saturating_pow(exponent)).min(MAX_DELAY)
        };
        trace!(%key, ?delay, "requeueing with backoff");

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(key);
        });
    }

    /// Stop the queue and wake all blocked workers.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Number of keys awaiting processing.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
