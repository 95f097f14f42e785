use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::DatabaseManager;
use crate::mattermost::{LocalApi, LocalHookEvent};
use crate::msteams::{
    ChangeNotification, ContentDecryptor, DecryptError, NotificationBatch, RemoteApi,
    ResourceLocator,
};
use crate::web::metrics::Metrics;

pub mod backfill;
pub mod dispatcher;
pub mod engine;
pub mod events;
pub mod logic;
pub mod message_flow;
pub mod outbound;
pub mod provisioning;
pub mod queue;
pub mod subscriptions;
pub mod user_sync;

#[cfg(test)]
pub(crate) mod testing;

use self::backfill::Backfill;
use self::dispatcher::Dispatcher;
use self::engine::SyncEngine;
use self::events::{ChangeEvent, ChangeType, DiscardReason, SyncError, SyncOutcome};
use self::logic::backoff_delay;
use self::message_flow::MessageFlow;
use self::provisioning::LinkProvisioner;
use self::queue::{ChangeQueue, LinkLocks, PushError};
use self::subscriptions::{LifecycleEvent, SubscriptionManager};
use self::user_sync::UserSyncHandler;

const MAINTENANCE_INTERVAL_SECS: u64 = 60;

/// A local hook event waiting in its channel's lane.
struct PendingLocal {
    event: LocalHookEvent,
    deferrals: u32,
}

/// How a webhook delivery was handled; the web layer maps it to a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted(usize),
    Duplicate,
    Unauthorized,
    QueueFull,
    ShuttingDown,
}

pub struct BridgeCore {
    config: Arc<Config>,
    db: Arc<DatabaseManager>,
    queue: Arc<ChangeQueue>,
    engine: Arc<SyncEngine>,
    dispatcher: Arc<Dispatcher>,
    subscriptions: Arc<SubscriptionManager>,
    provisioning: Arc<LinkProvisioner>,
    backfill: Arc<Backfill>,
    decryptor: Option<ContentDecryptor>,
    accepting: AtomicBool,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    local_lanes: Mutex<HashMap<String, mpsc::UnboundedSender<PendingLocal>>>,
}

impl BridgeCore {
    pub fn new(
        config: Arc<Config>,
        db: Arc<DatabaseManager>,
        remote: Arc<dyn RemoteApi>,
        local: Arc<dyn LocalApi>,
    ) -> Result<Self> {
        let decryptor = config
            .remote
            .encryption_key_bytes()?
            .map(|key| ContentDecryptor::new(&key))
            .transpose()
            .context("invalid remote encryption key")?;

        let queue = Arc::new(ChangeQueue::new(config.queue.queue_capacity));
        let locks = Arc::new(LinkLocks::new());
        let users = Arc::new(UserSyncHandler::new(
            db.clone(),
            local.clone(),
            remote.clone(),
            config.clone(),
        ));
        let flow = Arc::new(MessageFlow::new(remote.clone(), local.clone(), config.clone()));
        let engine = Arc::new(SyncEngine::new(
            config.clone(),
            db.clone(),
            remote.clone(),
            local.clone(),
            users.clone(),
            flow,
            locks.clone(),
        ));
        let subscriptions = Arc::new(SubscriptionManager::new(
            config.clone(),
            db.clone(),
            remote.clone(),
            users,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            config.clone(),
            queue.clone(),
            engine.clone(),
            locks,
            subscriptions.reauth_signal(),
        ));
        let provisioning = Arc::new(LinkProvisioner::new(
            config.clone(),
            db.clone(),
            local,
            subscriptions.clone(),
        ));
        let backfill = Arc::new(Backfill::new(config.clone(), db.clone(), remote, queue.clone()));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            db,
            queue,
            engine,
            dispatcher,
            subscriptions,
            provisioning,
            backfill,
            decryptor,
            accepting: AtomicBool::new(true),
            started: AtomicBool::new(false),
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            local_lanes: Mutex::new(HashMap::new()),
        })
    }

    pub fn provisioning(&self) -> Arc<LinkProvisioner> {
        self.provisioning.clone()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.started.load(Ordering::SeqCst) && self.is_accepting()
    }

    pub fn hook_token(&self) -> &str {
        &self.config.local.hook_token
    }

    pub async fn start(&self) -> Result<()> {
        self.engine.identify().await;
        Metrics::set_queue_capacity(self.queue.capacity());
        if let Err(err) = self.provisioning.refresh_gauge().await {
            warn!("linked channel gauge not refreshed error={}", err);
        }

        *self.workers.lock() = self.dispatcher.spawn_workers();

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(
            self.subscriptions.clone().run(self.shutdown_tx.subscribe()),
        ));
        tasks.push(self.spawn_maintenance());
        if self.config.bridge.backfill_on_start {
            tasks.push(self.spawn_backfill());
        }
        self.tasks.lock().extend(tasks);

        self.started.store(true, Ordering::SeqCst);
        info!(
            "bridge core started workers={} queue_capacity={}",
            self.config.queue.worker_count,
            self.queue.capacity()
        );
        Ok(())
    }

    fn spawn_backfill(&self) -> JoinHandle<()> {
        let backfill = self.backfill.clone();
        tokio::spawn(async move {
            if let Err(err) = backfill.run().await {
                warn!("backfill failed error={}", err);
            }
        })
    }

    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let kv = self.db.kv();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(MAINTENANCE_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = ticker.tick() => match kv.purge_expired().await {
                        Ok(0) => {}
                        Ok(purged) => debug!("expired store entries purged count={}", purged),
                        Err(err) => warn!("store purge failed error={}", err),
                    },
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Validates a change delivery and enqueues its records. Nothing is
    /// enqueued unless every record authenticates.
    pub async fn ingest_changes(&self, batch: NotificationBatch) -> Result<IngestOutcome, SyncError> {
        if !self.is_accepting() {
            return Ok(IngestOutcome::ShuttingDown);
        }

        let mut events = Vec::with_capacity(batch.value.len());
        for notification in &batch.value {
            let Some(record) = self
                .subscriptions
                .authenticate(&notification.subscription_id, notification.client_state.as_deref())
                .await?
            else {
                warn!(
                    "change delivery rejected subscription_id={}",
                    notification.subscription_id
                );
                return Ok(IngestOutcome::Unauthorized);
            };
            match self.prepare(notification, record.encrypted) {
                Ok(Some(event)) => events.push((event, notification.is_versioned())),
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        "change delivery failed decryption subscription_id={} error={}",
                        notification.subscription_id, err
                    );
                    return Ok(IngestOutcome::Unauthorized);
                }
            }
        }

        let markers = self.db.marker_store();
        let window = self.config.delivery_dedup_window();
        let push_timeout = Duration::from_millis(self.config.queue.push_timeout_ms);
        let mut accepted = 0;
        for (event, versioned) in events {
            // Unversioned updates skip delivery dedup; the engine drops
            // versions it has already applied.
            if versioned && !markers.record_delivery(&event.delivery_id, window).await? {
                debug!("duplicate delivery dropped delivery_id={}", event.delivery_id);
                continue;
            }
            let delivery_id = event.delivery_id.clone();
            let change_type = event.change_type;
            match self.queue.push_timeout(event, push_timeout).await {
                Ok(()) => {
                    Metrics::observe_change_event(change_type.as_str());
                    accepted += 1;
                }
                Err(err) => {
                    if versioned {
                        markers.forget_delivery(&delivery_id).await?;
                    }
                    return Ok(match err {
                        PushError::Full => {
                            warn!("change queue full, asking for redelivery delivery_id={}", delivery_id);
                            IngestOutcome::QueueFull
                        }
                        PushError::Closed => IngestOutcome::ShuttingDown,
                    });
                }
            }
        }

        Ok(if accepted == 0 {
            IngestOutcome::Duplicate
        } else {
            IngestOutcome::Accepted(accepted)
        })
    }

    /// Turns one notification into a change event. Records that cannot be
    /// acted on are counted and skipped.
    fn prepare(
        &self,
        notification: &ChangeNotification,
        encrypted: bool,
    ) -> Result<Option<ChangeEvent>, DecryptError> {
        let raw_change_type = notification.change_type.as_deref().unwrap_or_default();
        let Some(change_type) = ChangeType::parse(raw_change_type) else {
            Metrics::observe_processed_change_event(
                "unknown",
                DiscardReason::InvalidChangeType.as_str(),
            );
            debug!("unknown change type skipped change_type={}", raw_change_type);
            return Ok(None);
        };
        let Some(locator) = notification.resource.as_deref().and_then(ResourceLocator::parse) else {
            Metrics::observe_processed_change_event(
                change_type.as_str(),
                DiscardReason::BadRequest.as_str(),
            );
            debug!(
                "unparseable change resource skipped resource={}",
                notification.resource.as_deref().unwrap_or_default()
            );
            return Ok(None);
        };

        let container = locator.container.clone();
        let mut event = ChangeEvent::new(
            change_type,
            locator,
            notification.subscription_id.clone(),
            notification.delivery_id(),
        );
        if let (true, Some(content), Some(decryptor)) = (
            encrypted,
            notification.encrypted_content.as_ref(),
            self.decryptor.as_ref(),
        ) {
            match decryptor.decrypt_message(content, container) {
                Ok(message) => event = event.with_message(message),
                Err(err @ (DecryptError::Signature | DecryptError::DataKey)) => return Err(err),
                Err(err) => debug!(
                    "inline content unusable, message will be fetched delivery_id={} error={}",
                    event.delivery_id, err
                ),
            }
        }
        Ok(Some(event))
    }

    pub async fn ingest_lifecycle(&self, batch: NotificationBatch) -> Result<IngestOutcome, SyncError> {
        if !self.is_accepting() {
            return Ok(IngestOutcome::ShuttingDown);
        }

        let mut handled = 0;
        for notification in &batch.value {
            let Some(raw_event) = notification.lifecycle_event.as_deref() else {
                continue;
            };
            if self
                .subscriptions
                .authenticate(&notification.subscription_id, notification.client_state.as_deref())
                .await?
                .is_none()
            {
                warn!(
                    "lifecycle notification rejected subscription_id={}",
                    notification.subscription_id
                );
                return Ok(IngestOutcome::Unauthorized);
            }
            let event = LifecycleEvent::parse(raw_event);
            self.subscriptions
                .handle_lifecycle(&notification.subscription_id, &event)
                .await?;
            if event == LifecycleEvent::Missed {
                let task = self.spawn_backfill();
                self.tasks.lock().push(task);
            }
            handled += 1;
        }
        Ok(IngestOutcome::Accepted(handled))
    }

    /// Queues a local event behind earlier events of the same channel and
    /// returns at once. Each channel lane is drained by a single task.
    pub async fn submit_local_event(self: &Arc<Self>, event: LocalHookEvent) {
        let lane = self.local_lane(&event).await;
        self.enqueue_local(lane, PendingLocal { event, deferrals: 0 });
    }

    async fn local_lane(&self, event: &LocalHookEvent) -> String {
        if let Some(post) = event.post.as_ref() {
            return post.channel_id.clone();
        }
        let Some(reaction) = event.reaction.as_ref() else {
            return String::new();
        };
        match self.engine.local.get_post(&reaction.post_id).await {
            Ok(post) => post.channel_id,
            Err(err) => {
                debug!(
                    "reaction post not readable, lane keyed by post post_id={} error={}",
                    reaction.post_id, err
                );
                format!("post:{}", reaction.post_id)
            }
        }
    }

    fn enqueue_local(self: &Arc<Self>, lane: String, pending: PendingLocal) {
        let mut lanes = self.local_lanes.lock();
        let pending = match lanes.get(&lane) {
            Some(sender) => match sender.send(pending) {
                Ok(()) => return,
                Err(mpsc::error::SendError(pending)) => pending,
            },
            None => pending,
        };
        let (sender, receiver) = mpsc::unbounded_channel();
        if sender.send(pending).is_err() {
            return;
        }
        lanes.insert(lane.clone(), sender);
        drop(lanes);

        let core = self.clone();
        tokio::spawn(async move { core.drain_local_lane(lane, receiver).await });
    }

    /// Runs the lane's events one by one and retires the lane once it is
    /// empty. Emptiness is checked under the lane map lock, which senders
    /// also hold, so no event is left behind.
    async fn drain_local_lane(
        self: Arc<Self>,
        lane: String,
        mut receiver: mpsc::UnboundedReceiver<PendingLocal>,
    ) {
        loop {
            let pending = match receiver.try_recv() {
                Ok(pending) => pending,
                Err(_) => {
                    let mut lanes = self.local_lanes.lock();
                    match receiver.try_recv() {
                        Ok(pending) => pending,
                        Err(_) => {
                            lanes.remove(&lane);
                            return;
                        }
                    }
                }
            };
            self.run_local(&lane, pending).await;
        }
    }

    /// An edit or reaction can still overtake its post when the hooks
    /// themselves arrive out of order. Such an event goes to the back of its
    /// lane after a backoff, a bounded number of times.
    async fn run_local(self: &Arc<Self>, lane: &str, pending: PendingLocal) {
        let limits = &self.config.limits;
        let result = self.handle_local_event(&pending.event).await;
        match result {
            Err(SyncError::CorrespondenceMissing(local_id))
                if pending.deferrals < limits.max_retry_attempts =>
            {
                let delay = backoff_delay(
                    Duration::from_millis(limits.retry_base_delay_ms),
                    pending.deferrals,
                    Duration::from_secs(self.config.subscriptions.max_backoff_secs),
                );
                debug!(
                    "local event deferred until its post is mirrored lane={} local_id={} deferrals={}",
                    lane,
                    local_id,
                    pending.deferrals + 1
                );
                let core = self.clone();
                let lane = lane.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    core.enqueue_local(
                        lane,
                        PendingLocal {
                            event: pending.event,
                            deferrals: pending.deferrals + 1,
                        },
                    );
                });
            }
            _ => {}
        }
    }

    /// Mirrors one local event, retrying transient failures. The author is
    /// told when it finally fails.
    pub async fn handle_local_event(&self, event: &LocalHookEvent) -> Result<SyncOutcome, SyncError> {
        let limits = &self.config.limits;
        let mut attempts = 0;
        loop {
            let result = tokio::time::timeout(
                self.config.operation_timeout(),
                self.engine.handle_local(event),
            )
            .await
            .unwrap_or_else(|_| Err(SyncError::deadline_exceeded("local event")));

            let err = match result {
                Ok(outcome) => {
                    debug!(
                        "local event processed event={} discarded={}",
                        event.event.as_str(),
                        outcome.discarded_reason()
                    );
                    return Ok(outcome);
                }
                Err(err) => err,
            };

            let unauthorized = matches!(err, SyncError::Unauthorized(_));
            if unauthorized {
                self.subscriptions.reauth_signal().notify_one();
            }
            if (err.is_retryable() || unauthorized) && attempts < limits.max_retry_attempts {
                let delay = match &err {
                    SyncError::RateLimited { retry_after } => *retry_after,
                    _ => backoff_delay(
                        Duration::from_millis(limits.retry_base_delay_ms),
                        attempts,
                        Duration::from_secs(self.config.subscriptions.max_backoff_secs),
                    ),
                };
                attempts += 1;
                warn!(
                    "local event failed, retrying event={} attempt={} delay_ms={} error={}",
                    event.event.as_str(),
                    attempts,
                    delay.as_millis(),
                    err
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            match err {
                SyncError::CorrespondenceMissing(_) => debug!(
                    "local event has no mirrored post yet event={} error={}",
                    event.event.as_str(),
                    err
                ),
                SyncError::PolicyRejection(_) => warn!(
                    "local event not mirrored event={} error={}",
                    event.event.as_str(),
                    err
                ),
                _ => {
                    warn!(
                        "local event not mirrored event={} error={}",
                        event.event.as_str(),
                        err
                    );
                    self.engine.notify_local_failure(event, &err).await;
                }
            }
            return Err(err);
        }
    }

    /// Stops intake, lets workers drain for the grace period, then
    /// abandons whatever is left.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        self.queue.close();

        let mut workers = std::mem::take(&mut *self.workers.lock());
        let grace = Duration::from_secs(self.config.limits.shutdown_grace_secs);
        let drained = tokio::time::timeout(grace, futures::future::join_all(workers.iter_mut()))
            .await
            .is_ok();
        if !drained {
            warn!("change workers did not drain within grace_secs={}", grace.as_secs());
            for worker in &workers {
                worker.abort();
            }
        }

        let abandoned = self.dispatcher.abandon_queued();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("bridge core stopped abandoned={}", abandoned);
    }
}
