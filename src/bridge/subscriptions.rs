use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::{Mutex, Notify, watch};
use tracing::{debug, info, warn};

use super::events::SyncError;
use super::logic::backoff_delay;
use super::user_sync::UserSyncHandler;
use crate::config::Config;
use crate::db::models::{LinkKind, SubscriptionKind, SubscriptionRecord};
use crate::db::DatabaseManager;
use crate::msteams::resource::{
    CHATS_SUBSCRIPTION_RESOURCE, channel_subscription_resource, same_resource,
    user_chats_subscription_resource,
};
use crate::msteams::{RemoteApi, RemoteContainer, RemoteError, RemoteSubscription, SubscriptionRequest};
use crate::web::metrics::Metrics;

const MIN_TIMER_DELAY: Duration = Duration::from_secs(1);
const FAILURE_BASE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredSubscription {
    pub kind: SubscriptionKind,
    pub resource: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: usize,
    pub refreshed: usize,
    pub recreated: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

/// Lifecycle notifications the remote side sends about a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    ReauthorizationRequired,
    SubscriptionRemoved,
    Missed,
    Other(String),
}

impl LifecycleEvent {
    pub fn parse(value: &str) -> Self {
        match value {
            "reauthorizationRequired" => LifecycleEvent::ReauthorizationRequired,
            "subscriptionRemoved" | "removed" => LifecycleEvent::SubscriptionRemoved,
            "missed" => LifecycleEvent::Missed,
            other => LifecycleEvent::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            LifecycleEvent::ReauthorizationRequired => "reauthorizationRequired",
            LifecycleEvent::SubscriptionRemoved => "subscriptionRemoved",
            LifecycleEvent::Missed => "missed",
            LifecycleEvent::Other(other) => other,
        }
    }
}

/// Keeps the remote webhook subscriptions in line with the links the
/// bridge holds. Reconciliation runs on startup, on a timer ahead of the
/// earliest expiry, and whenever a lifecycle event or a failed
/// authentication asks for repair.
pub struct SubscriptionManager {
    config: Arc<Config>,
    db: Arc<DatabaseManager>,
    remote: Arc<dyn RemoteApi>,
    users: Arc<UserSyncHandler>,
    reauth: Arc<Notify>,
    repair: Notify,
    reconciling: Mutex<()>,
}

impl SubscriptionManager {
    pub fn new(
        config: Arc<Config>,
        db: Arc<DatabaseManager>,
        remote: Arc<dyn RemoteApi>,
        users: Arc<UserSyncHandler>,
    ) -> Self {
        Self {
            config,
            db,
            remote,
            users,
            reauth: Arc::new(Notify::new()),
            repair: Notify::new(),
            reconciling: Mutex::new(()),
        }
    }

    /// Signal raised by the dispatcher when the remote side rejects our
    /// credentials.
    pub fn reauth_signal(&self) -> Arc<Notify> {
        self.reauth.clone()
    }

    pub fn request_repair(&self) {
        self.repair.notify_one();
    }

    pub async fn desired(&self) -> Result<Vec<DesiredSubscription>, SyncError> {
        if !self.config.bridge.sync_direction.allows_remote_to_local() {
            return Ok(Vec::new());
        }

        let mut desired = Vec::new();
        for link in self.db.link_store().list().await? {
            if link.kind != LinkKind::Channel {
                continue;
            }
            if let RemoteContainer::Channel {
                team_id,
                channel_id,
            } = &link.remote
            {
                desired.push(DesiredSubscription {
                    kind: SubscriptionKind::Channel,
                    resource: channel_subscription_resource(team_id, channel_id),
                });
            }
        }

        if self.config.bridge.sync_direct_messages {
            desired.push(DesiredSubscription {
                kind: SubscriptionKind::Chats,
                resource: CHATS_SUBSCRIPTION_RESOURCE.to_string(),
            });
            if self.config.bridge.user_chat_subscriptions {
                for remote_user_id in self.users.connected_remote_users().await? {
                    desired.push(DesiredSubscription {
                        kind: SubscriptionKind::UserChats,
                        resource: user_chats_subscription_resource(&remote_user_id),
                    });
                }
            }
        }

        desired.dedup_by(|a, b| same_resource(&a.resource, &b.resource));
        Ok(desired)
    }

    /// One reconciliation pass. On success the remote subscriptions owned
    /// by the bridge equal the desired set and every stored record is
    /// current.
    pub async fn reconcile(&self) -> Result<ReconcileReport, SyncError> {
        let _guard = self.reconciling.lock().await;
        let result = self.reconcile_locked().await;
        Metrics::observe_reconcile(if result.is_ok() { "success" } else { "failure" });
        if let Err(err) = self.users.refresh_user_gauges().await {
            debug!("user gauges not refreshed error={}", err);
        }
        result
    }

    async fn reconcile_locked(&self) -> Result<ReconcileReport, SyncError> {
        let desired = self.desired().await?;
        let changes_url = self.config.bridge.changes_url();
        let mut owned: Vec<RemoteSubscription> = self
            .remote
            .list_subscriptions()
            .await?
            .into_iter()
            .filter(|subscription| subscription.notification_url == changes_url)
            .collect();

        let store = self.db.subscription_store();
        let mut report = ReconcileReport::default();
        let mut kept_ids = Vec::new();

        for wanted in &desired {
            let found = owned
                .iter()
                .position(|subscription| same_resource(&subscription.resource, &wanted.resource));
            let id = match found.map(|index| owned.swap_remove(index)) {
                Some(existing) => self.converge(wanted, existing, &mut report).await?,
                None => {
                    let record = self.create(wanted).await?;
                    report.created += 1;
                    record.subscription_id
                }
            };
            kept_ids.push(id);
        }

        for stray in owned {
            match self.remote.delete_subscription(&stray.id).await {
                Ok(()) | Err(RemoteError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
            store.delete(&stray.id).await?;
            report.deleted += 1;
            info!(
                "remote subscription deleted subscription_id={} resource={}",
                stray.id, stray.resource
            );
        }

        for record in store.list().await? {
            if !kept_ids.contains(&record.subscription_id) {
                store.delete(&record.subscription_id).await?;
                debug!(
                    "stale subscription record dropped subscription_id={}",
                    record.subscription_id
                );
            }
        }

        debug!(
            "subscriptions reconciled created={} refreshed={} recreated={} deleted={} unchanged={}",
            report.created, report.refreshed, report.recreated, report.deleted, report.unchanged
        );
        Ok(report)
    }

    /// Brings one present-and-desired subscription up to date. Returns the
    /// id it ends up with, which differs when it had to be recreated.
    async fn converge(
        &self,
        wanted: &DesiredSubscription,
        existing: RemoteSubscription,
        report: &mut ReconcileReport,
    ) -> Result<String, SyncError> {
        let store = self.db.subscription_store();
        let Some(mut record) = store.get(&existing.id).await? else {
            // Without its client state no delivery could be authenticated.
            warn!(
                "remote subscription has no record, recreating subscription_id={}",
                existing.id
            );
            return self.recreate(wanted, &existing.id, report).await;
        };

        let now = Utc::now();
        let margin = ChronoDuration::seconds(self.config.subscriptions.refresh_margin_secs as i64);
        if existing.expires_at - now > margin {
            if record.expires_at != existing.expires_at {
                record.expires_at = existing.expires_at;
                record.updated_at = now;
                store.put(&record).await?;
            }
            report.unchanged += 1;
            return Ok(existing.id);
        }

        match self.remote.refresh_subscription(&existing.id, self.next_expiry()).await {
            Ok(expires_at) => {
                record.expires_at = expires_at;
                record.updated_at = Utc::now();
                store.put(&record).await?;
                report.refreshed += 1;
                info!(
                    "remote subscription refreshed subscription_id={} expires_at={}",
                    existing.id, expires_at
                );
                Ok(existing.id)
            }
            Err(RemoteError::NotFound(_)) => self.recreate(wanted, &existing.id, report).await,
            Err(err) => {
                let threshold =
                    ChronoDuration::seconds(self.config.subscriptions.recreate_threshold_secs as i64);
                if existing.expires_at - now > threshold {
                    return Err(err.into());
                }
                warn!(
                    "subscription refresh failed near expiry, recreating subscription_id={} error={}",
                    existing.id, err
                );
                self.recreate(wanted, &existing.id, report).await
            }
        }
    }

    async fn recreate(
        &self,
        wanted: &DesiredSubscription,
        old_id: &str,
        report: &mut ReconcileReport,
    ) -> Result<String, SyncError> {
        match self.remote.delete_subscription(old_id).await {
            Ok(()) | Err(RemoteError::NotFound(_)) => {}
            Err(err) => debug!(
                "old subscription not deleted subscription_id={} error={}",
                old_id, err
            ),
        }
        self.db.subscription_store().delete(old_id).await?;
        let record = self.create(wanted).await?;
        report.recreated += 1;
        Ok(record.subscription_id)
    }

    async fn create(&self, wanted: &DesiredSubscription) -> Result<SubscriptionRecord, SyncError> {
        let remote_config = &self.config.remote;
        let encrypted = remote_config.encrypted_resource_data();
        let request = SubscriptionRequest {
            resource: wanted.resource.clone(),
            change_type: self.config.bridge.enabled_change_types.join(","),
            notification_url: self.config.bridge.changes_url(),
            lifecycle_notification_url: self.config.bridge.lifecycle_url(),
            client_state: new_client_state(&remote_config.webhook_secret),
            expires_at: self.next_expiry(),
            encryption_certificate: encrypted.then(|| remote_config.certificate.clone()).flatten(),
            encryption_certificate_id: encrypted
                .then(|| remote_config.certificate_id.clone())
                .flatten(),
        };

        let created = self.remote.create_subscription(&request).await?;
        let now = Utc::now();
        let record = SubscriptionRecord {
            subscription_id: created.id.clone(),
            kind: wanted.kind,
            resource: wanted.resource.clone(),
            expires_at: created.expires_at,
            client_state: request.client_state,
            certificate_thumbprint: request.encryption_certificate_id,
            encrypted,
            created_at: now,
            updated_at: now,
        };
        self.db.subscription_store().put(&record).await?;
        info!(
            "remote subscription created subscription_id={} kind={} resource={}",
            record.subscription_id,
            record.kind.as_str(),
            record.resource
        );
        Ok(record)
    }

    fn next_expiry(&self) -> chrono::DateTime<Utc> {
        Utc::now() + ChronoDuration::seconds(self.config.subscriptions.expiry_secs as i64)
    }

    /// Looks up the subscription a delivery claims to come from and checks
    /// its client state. `None` means the delivery must be rejected.
    pub async fn authenticate(
        &self,
        subscription_id: &str,
        client_state: Option<&str>,
    ) -> Result<Option<SubscriptionRecord>, SyncError> {
        let Some(record) = self.db.subscription_store().get(subscription_id).await? else {
            return Ok(None);
        };
        let matches = client_state
            .map(|state| constant_time_eq(state.as_bytes(), record.client_state.as_bytes()))
            .unwrap_or(false);
        Ok(matches.then_some(record))
    }

    pub async fn handle_lifecycle(
        &self,
        subscription_id: &str,
        event: &LifecycleEvent,
    ) -> Result<(), SyncError> {
        Metrics::observe_lifecycle_event(event.as_str().to_string());
        info!(
            "subscription lifecycle event subscription_id={} event={}",
            subscription_id,
            event.as_str()
        );
        match event {
            LifecycleEvent::ReauthorizationRequired => {
                self.remote.force_reauthenticate().await;
                let store = self.db.subscription_store();
                match self
                    .remote
                    .refresh_subscription(subscription_id, self.next_expiry())
                    .await
                {
                    Ok(expires_at) => {
                        if let Some(mut record) = store.get(subscription_id).await? {
                            record.expires_at = expires_at;
                            record.updated_at = Utc::now();
                            store.put(&record).await?;
                        }
                    }
                    Err(err) => {
                        warn!(
                            "reauthorization refresh failed subscription_id={} error={}",
                            subscription_id, err
                        );
                        self.request_repair();
                    }
                }
            }
            LifecycleEvent::SubscriptionRemoved => {
                self.db.subscription_store().delete(subscription_id).await?;
                self.request_repair();
            }
            LifecycleEvent::Missed => self.request_repair(),
            LifecycleEvent::Other(_) => {}
        }
        Ok(())
    }

    /// Time until the earliest stored subscription enters its refresh
    /// margin, bounded by the reconcile interval.
    pub async fn next_delay(&self) -> Duration {
        let interval = Duration::from_secs(self.config.subscriptions.reconcile_interval_secs);
        let margin = ChronoDuration::seconds(self.config.subscriptions.refresh_margin_secs as i64);
        let earliest = match self.db.subscription_store().list().await {
            Ok(records) => records.into_iter().map(|record| record.expires_at).min(),
            Err(err) => {
                debug!("subscription records not listed error={}", err);
                None
            }
        };
        let until_refresh = earliest
            .and_then(|expires_at| (expires_at - margin - Utc::now()).to_std().ok())
            .unwrap_or(MIN_TIMER_DELAY);
        until_refresh.min(interval).max(MIN_TIMER_DELAY)
    }

    /// Reconciler loop. Stops when `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let max_backoff = Duration::from_secs(self.config.subscriptions.max_backoff_secs);
        let mut failures: u32 = 0;
        loop {
            let delay = match self.reconcile().await {
                Ok(_) => {
                    failures = 0;
                    self.next_delay().await
                }
                Err(err) => {
                    let delay = backoff_delay(FAILURE_BASE_DELAY, failures, max_backoff);
                    failures = failures.saturating_add(1);
                    warn!(
                        "subscription reconcile failed failures={} retry_in_ms={} error={}",
                        failures,
                        delay.as_millis(),
                        err
                    );
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.repair.notified() => debug!("subscription repair requested"),
                _ = self.reauth.notified() => {
                    info!("remote credentials rejected, reauthenticating");
                    self.remote.force_reauthenticate().await;
                }
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        debug!("subscription manager stopped");
    }
}

/// Fresh per-subscription nonce, keyed by the shared webhook secret.
fn new_client_state(webhook_secret: &str) -> String {
    let nonce = uuid::Uuid::new_v4();
    match <Hmac<Sha256> as Mac>::new_from_slice(webhook_secret.as_bytes()) {
        Ok(mut mac) => {
            mac.update(nonce.as_bytes());
            URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
        }
        Err(_) => nonce.simple().to_string(),
    }
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.iter()
        .zip(right)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
