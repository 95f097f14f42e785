use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::engine::SyncEngine;
use super::events::{ChangeEvent, DiscardReason, SyncError, SyncOutcome};
use super::logic::backoff_delay;
use super::queue::{ChangeQueue, LinkLocks};
use crate::config::Config;
use crate::web::metrics::Metrics;

/// What to do with an event after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Done(SyncOutcome),
    Retry(Duration),
}

/// Pulls change events off the queue and runs them through the engine on a
/// fixed pool of workers. Events of one conversation never run
/// concurrently; failures are retried with backoff up to a bound.
pub struct Dispatcher {
    config: Arc<Config>,
    queue: Arc<ChangeQueue>,
    engine: Arc<SyncEngine>,
    locks: Arc<LinkLocks>,
    reauth: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<Config>,
        queue: Arc<ChangeQueue>,
        engine: Arc<SyncEngine>,
        locks: Arc<LinkLocks>,
        reauth: Arc<Notify>,
    ) -> Self {
        Self {
            config,
            queue,
            engine,
            locks,
            reauth,
        }
    }

    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let count = self.config.queue.worker_count.max(1);
        info!("starting change workers count={}", count);
        (0..count)
            .map(|index| {
                let dispatcher = self.clone();
                tokio::spawn(async move { dispatcher.worker(index).await })
            })
            .collect()
    }

    async fn worker(self: Arc<Self>, index: usize) {
        while let Some(event) = self.queue.pop().await {
            self.process(event).await;
        }
        debug!("change worker stopped index={}", index);
    }

    /// Runs one attempt on a popped event. A finished event releases its
    /// lane; a retried one keeps it until it is back at the queue head.
    pub async fn process(self: &Arc<Self>, mut event: ChangeEvent) {
        match self.attempt(&mut event).await {
            Disposition::Done(outcome) => {
                self.record(&event, outcome);
                self.queue.complete(&event.lane());
            }
            Disposition::Retry(delay) => self.requeue_later(event, delay),
        }
    }

    /// Missing the deadline stops the wait, not the change: once the lane
    /// lock is held the change runs to completion on its own task, so a
    /// local write always lands together with its correspondence row and
    /// the next attempt waits for it on the lane lock.
    pub async fn attempt(&self, event: &mut ChangeEvent) -> Disposition {
        let lane = event.lane();
        let deadline = tokio::time::Instant::now() + self.config.operation_timeout();
        let result = match tokio::time::timeout_at(deadline, self.locks.lock(&lane)).await {
            Ok(guard) => {
                let engine = self.engine.clone();
                let current = event.clone();
                let run = tokio::spawn(async move {
                    let _guard = guard;
                    engine.handle_remote(&current).await
                });
                tokio::time::timeout_at(deadline, run).await
            }
            Err(elapsed) => Err(elapsed),
        };

        match result {
            Ok(Ok(Ok(outcome))) => Disposition::Done(outcome),
            Ok(Ok(Err(err))) => self.on_error(event, err),
            Ok(Err(err)) => {
                warn!(
                    "change task failed lane={} delivery_id={} error={}",
                    lane, event.delivery_id, err
                );
                Disposition::Done(SyncOutcome::Discarded(DiscardReason::Error))
            }
            Err(_) => {
                if event.timeout_requeues < self.config.limits.max_timeout_requeues {
                    event.timeout_requeues += 1;
                    warn!(
                        "change timed out, requeueing lane={} delivery_id={} requeues={}",
                        lane, event.delivery_id, event.timeout_requeues
                    );
                    Disposition::Retry(Duration::ZERO)
                } else {
                    warn!(
                        "change timed out, giving up lane={} delivery_id={}",
                        lane, event.delivery_id
                    );
                    Disposition::Done(SyncOutcome::Discarded(DiscardReason::Timeout))
                }
            }
        }
    }

    fn on_error(&self, event: &mut ChangeEvent, err: SyncError) -> Disposition {
        let limits = &self.config.limits;
        match err {
            SyncError::NotFound(detail) => {
                if event.vanished_retried {
                    debug!(
                        "change target vanished delivery_id={} detail={}",
                        event.delivery_id, detail
                    );
                    return Disposition::Done(SyncOutcome::Discarded(DiscardReason::Vanished));
                }
                event.vanished_retried = true;
                Disposition::Retry(Duration::from_millis(limits.vanished_retry_delay_ms))
            }
            SyncError::BadRequest(detail) => {
                warn!(
                    "change rejected delivery_id={} detail={}",
                    event.delivery_id, detail
                );
                Disposition::Done(SyncOutcome::Discarded(DiscardReason::BadRequest))
            }
            SyncError::PolicyRejection(detail) => {
                debug!(
                    "change refused by policy delivery_id={} detail={}",
                    event.delivery_id, detail
                );
                Disposition::Done(SyncOutcome::Discarded(DiscardReason::Policy))
            }
            err if err.is_retryable() || matches!(err, SyncError::Unauthorized(_)) => {
                if matches!(err, SyncError::Unauthorized(_)) {
                    self.reauth.notify_one();
                }
                if event.attempts >= limits.max_retry_attempts {
                    warn!(
                        "change failed after retries delivery_id={} attempts={} error={}",
                        event.delivery_id, event.attempts, err
                    );
                    return Disposition::Done(SyncOutcome::Discarded(DiscardReason::Error));
                }
                let delay = match err {
                    SyncError::RateLimited { retry_after } => retry_after,
                    _ => backoff_delay(
                        Duration::from_millis(limits.retry_base_delay_ms),
                        event.attempts,
                        Duration::from_secs(self.config.subscriptions.max_backoff_secs),
                    ),
                };
                event.attempts += 1;
                debug!(
                    "change will be retried delivery_id={} attempt={} delay_ms={} error={}",
                    event.delivery_id,
                    event.attempts,
                    delay.as_millis(),
                    err
                );
                Disposition::Retry(delay)
            }
            err => {
                warn!(
                    "change failed delivery_id={} error={}",
                    event.delivery_id, err
                );
                Disposition::Done(SyncOutcome::Discarded(DiscardReason::Error))
            }
        }
    }

    fn requeue_later(self: &Arc<Self>, event: ChangeEvent, delay: Duration) {
        if delay.is_zero() {
            if self.queue.requeue(event.clone()).is_err() {
                self.record(&event, SyncOutcome::Discarded(DiscardReason::QueueClosed));
            }
            return;
        }
        let dispatcher = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if dispatcher.queue.requeue(event.clone()).is_err() {
                dispatcher.record(&event, SyncOutcome::Discarded(DiscardReason::QueueClosed));
            }
        });
    }

    pub fn record(&self, event: &ChangeEvent, outcome: SyncOutcome) {
        Metrics::observe_processed_change_event(event.change_type.as_str(), outcome.discarded_reason());
        debug!(
            "change processed change_type={} lane={} delivery_id={} discarded={}",
            event.change_type,
            event.lane(),
            event.delivery_id,
            outcome.discarded_reason()
        );
    }

    /// Records everything still queued as abandoned.
    pub fn abandon_queued(&self) -> usize {
        let abandoned = self.queue.drain();
        for event in &abandoned {
            self.record(event, SyncOutcome::Discarded(DiscardReason::QueueClosed));
        }
        abandoned.len()
    }
}
