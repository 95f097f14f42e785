use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Notify, OwnedMutexGuard};

use super::events::ChangeEvent;
use crate::web::metrics::Metrics;

const LOCK_SWEEP_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PushError {
    #[error("change queue is full")]
    Full,
    #[error("change queue is closed")]
    Closed,
}

struct QueueState {
    items: VecDeque<ChangeEvent>,
    busy_lanes: HashSet<String>,
    closed: bool,
}

/// Bounded FIFO of change events shared by the ingest handlers and the
/// dispatcher workers. Pushes never block; callers that can wait a little
/// use [`ChangeQueue::push_timeout`].
///
/// A popped event leases its lane until [`ChangeQueue::complete`] is
/// called, and later events of a leased lane are not handed out. Events of
/// one conversation are therefore processed one at a time in pop order.
pub struct ChangeQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    items_available: Notify,
    space_available: Notify,
}

impl ChangeQueue {
    pub fn new(capacity: usize) -> Self {
        Metrics::set_queue_capacity(capacity);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(LOCK_SWEEP_THRESHOLD)),
                busy_lanes: HashSet::new(),
                closed: false,
            }),
            capacity,
            items_available: Notify::new(),
            space_available: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn push(&self, event: ChangeEvent) -> Result<(), PushError> {
        self.push_inner(event).map_err(|(err, _)| err)
    }

    /// Waits up to `timeout` for room before reporting the queue as full.
    pub async fn push_timeout(&self, event: ChangeEvent, timeout: Duration) -> Result<(), PushError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut event = event;
        loop {
            let space = self.space_available.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            match self.push_inner(event) {
                Ok(()) => return Ok(()),
                Err((PushError::Full, Some(rejected))) => event = rejected,
                Err((err, _)) => return Err(err),
            }

            if tokio::time::timeout_at(deadline, space).await.is_err() {
                return Err(PushError::Full);
            }
        }
    }

    /// Puts a popped event back at the head of the queue and releases its
    /// lane in the same step, so it runs again before any later event of
    /// its conversation. Retries are not subject to the capacity bound so a
    /// full queue cannot lose work already accepted. The lane is released
    /// even when the queue is closed.
    pub fn requeue(&self, event: ChangeEvent) -> Result<(), PushError> {
        let change_type = event.change_type.as_str();
        {
            let mut state = self.state.lock();
            state.busy_lanes.remove(&event.lane());
            if state.closed {
                drop(state);
                self.items_available.notify_one();
                return Err(PushError::Closed);
            }
            state.items.push_front(event);
        }
        Metrics::increment_queue_length(change_type);
        self.items_available.notify_one();
        Ok(())
    }

    fn push_inner(&self, event: ChangeEvent) -> Result<(), (PushError, Option<ChangeEvent>)> {
        let change_type = event.change_type.as_str();
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err((PushError::Closed, None));
            }
            if state.items.len() >= self.capacity {
                return Err((PushError::Full, Some(event)));
            }
            state.items.push_back(event);
        }
        Metrics::increment_queue_length(change_type);
        self.items_available.notify_one();
        Ok(())
    }

    /// Oldest event whose lane is free, or `None` once the queue is closed
    /// and drained. The event's lane stays leased until
    /// [`ChangeQueue::complete`].
    pub async fn pop(&self) -> Option<ChangeEvent> {
        loop {
            let available = self.items_available.notified();
            tokio::pin!(available);
            available.as_mut().enable();

            {
                let mut state = self.state.lock();
                let ready = state
                    .items
                    .iter()
                    .position(|event| !state.busy_lanes.contains(&event.lane()));
                if let Some(event) = ready.and_then(|index| state.items.remove(index)) {
                    state.busy_lanes.insert(event.lane());
                    drop(state);
                    Metrics::decrement_queue_length(event.change_type.as_str());
                    self.space_available.notify_one();
                    return Some(event);
                }
                if state.closed && state.items.is_empty() {
                    return None;
                }
            }

            available.await;
        }
    }

    /// Releases the lane leased by a popped event.
    pub fn complete(&self, lane: &str) {
        let released = self.state.lock().busy_lanes.remove(lane);
        if released {
            self.items_available.notify_one();
        }
    }

    /// Stops accepting pushes. Queued events stay poppable so workers can
    /// drain them.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.items_available.notify_waiters();
        self.space_available.notify_waiters();
    }

    /// Removes everything still queued, for abandoning work after the
    /// shutdown grace period.
    pub fn drain(&self) -> Vec<ChangeEvent> {
        let drained: Vec<ChangeEvent> = self.state.lock().items.drain(..).collect();
        for event in &drained {
            Metrics::decrement_queue_length(event.change_type.as_str());
        }
        drained
    }
}

/// One async mutex per conversation lane. Both sync directions take the
/// lane of the remote conversation, so work on one link never interleaves.
pub struct LinkLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LinkLocks {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lock(&self, lane: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock();
            if locks.len() >= LOCK_SWEEP_THRESHOLD {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks
                .entry(lane.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }
}

impl Default for LinkLocks {
    fn default() -> Self {
        Self::new()
    }
}
