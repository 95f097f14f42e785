use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use super::events::{ChangeEvent, ChangeType, SyncError};
use super::queue::{ChangeQueue, PushError};
use crate::config::Config;
use crate::db::DatabaseManager;
use crate::db::models::ConversationLink;
use crate::msteams::{RemoteApi, RemoteError, RemoteMessage, ResourceLocator};

const REPLAY_OVERLAP_SECS: i64 = 60;

enum ReplayError {
    QueueClosed,
    Sync(SyncError),
}

impl From<RemoteError> for ReplayError {
    fn from(err: RemoteError) -> Self {
        ReplayError::Sync(err.into())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    pub links: usize,
    pub enqueued: usize,
    pub failed_links: usize,
}

/// Replays remote history the bridge has not seen: everything modified
/// since the link's last applied change (or since it was made) is fed
/// through the queue like a regular notification. Anything already
/// mirrored is recognised by its correspondence and skipped.
pub struct Backfill {
    config: Arc<Config>,
    db: Arc<DatabaseManager>,
    remote: Arc<dyn RemoteApi>,
    queue: Arc<ChangeQueue>,
}

impl Backfill {
    pub fn new(
        config: Arc<Config>,
        db: Arc<DatabaseManager>,
        remote: Arc<dyn RemoteApi>,
        queue: Arc<ChangeQueue>,
    ) -> Self {
        Self {
            config,
            db,
            remote,
            queue,
        }
    }

    pub async fn run(&self) -> Result<BackfillReport, SyncError> {
        let mut report = BackfillReport::default();
        if !self.config.bridge.sync_direction.allows_remote_to_local() {
            return Ok(report);
        }

        let markers = self.db.marker_store();
        for link in self.db.link_store().list().await? {
            if link.kind.is_direct() && !self.config.bridge.sync_direct_messages {
                continue;
            }
            report.links += 1;
            let checkpoint = markers.last_received_change(&link.link_id).await?;
            match self.replay_link(&link, checkpoint).await {
                Ok(count) => report.enqueued += count,
                Err(ReplayError::QueueClosed) => {
                    debug!("backfill stopped, change queue closed");
                    break;
                }
                Err(ReplayError::Sync(err)) => {
                    report.failed_links += 1;
                    warn!(
                        "backfill failed for link link_id={} error={}",
                        link.link_id, err
                    );
                }
            }
        }

        info!(
            "backfill finished links={} enqueued={} failed_links={}",
            report.links, report.enqueued, report.failed_links
        );
        Ok(report)
    }

    async fn replay_link(
        &self,
        link: &ConversationLink,
        checkpoint: Option<DateTime<Utc>>,
    ) -> Result<usize, ReplayError> {
        let since = replay_start(link.created_at, checkpoint);
        let mut messages = self.remote.list_messages_since(&link.remote, since).await?;
        // Parents before replies.
        messages.sort_by_key(|message| message.created_at);

        let mut enqueued = 0;
        for message in messages {
            let event = replay_event(message);
            debug!(
                "replaying remote change link_id={} change_type={} delivery_id={}",
                link.link_id, event.change_type, event.delivery_id
            );
            match self
                .queue
                .push_timeout(event, self.config.operation_timeout())
                .await
            {
                Ok(()) => enqueued += 1,
                Err(PushError::Full) => {
                    return Err(ReplayError::Sync(SyncError::TransportTransient(
                        "change queue full during backfill".to_string(),
                    )));
                }
                Err(PushError::Closed) => return Err(ReplayError::QueueClosed),
            }
        }
        Ok(enqueued)
    }
}

fn replay_start(link_created_at: DateTime<Utc>, checkpoint: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match checkpoint {
        Some(checkpoint) => {
            (checkpoint - ChronoDuration::seconds(REPLAY_OVERLAP_SECS)).max(link_created_at)
        }
        None => link_created_at,
    }
}

fn replay_event(message: RemoteMessage) -> ChangeEvent {
    let change_type = if message.deleted_at.is_some() {
        ChangeType::Deleted
    } else if message.last_modified_at > message.created_at {
        ChangeType::Updated
    } else {
        ChangeType::Created
    };
    let delivery_id = format!(
        "replay:{}:{}:{}",
        message.container.key(),
        message.id,
        message.last_modified_at.timestamp_millis()
    );
    ChangeEvent::new(
        change_type,
        ResourceLocator::for_message(&message),
        "backfill",
        delivery_id,
    )
    .with_message(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::testing::{Harness, channel, remote_message};
    use crate::config::SyncDirection;
    use crate::msteams::RemoteContainer;

    fn backfill(harness: &Harness) -> Backfill {
        Backfill::new(
            harness.config.clone(),
            harness.db.clone(),
            harness.remote.clone(),
            harness.queue.clone(),
        )
    }

    #[tokio::test]
    async fn replays_parent_before_reply() {
        let harness = Harness::new();
        harness.link_channel().await;
        let mut parent = remote_message(channel(), "m1", "r-jane", "A");
        let mut reply = remote_message(channel(), "m2", "r-jane", "B");
        reply.reply_to_id = Some("m1".to_string());
        let now = Utc::now();
        parent.created_at = now - ChronoDuration::minutes(2);
        parent.last_modified_at = now - ChronoDuration::seconds(10);
        reply.created_at = now - ChronoDuration::minutes(1);
        reply.last_modified_at = reply.created_at;
        harness.remote.add_message(reply);
        harness.remote.add_message(parent);

        let report = backfill(&harness).run().await.unwrap();
        assert_eq!(report.enqueued, 2);

        let events = harness.queue.drain();
        assert_eq!(events[0].locator.changed_message_id(), "m1");
        assert_eq!(events[0].change_type, ChangeType::Updated);
        assert_eq!(events[1].locator.changed_message_id(), "m2");
        assert_eq!(events[1].locator.message_id, "m1");
        assert_eq!(events[1].change_type, ChangeType::Created);
        assert!(events.iter().all(|event| event.message.is_some()));
    }

    #[tokio::test]
    async fn deleted_messages_replay_as_deletes() {
        let harness = Harness::new();
        harness.link_channel().await;
        let mut gone = remote_message(channel(), "m1", "r-jane", "A");
        gone.deleted_at = Some(Utc::now());
        harness.remote.add_message(gone);

        backfill(&harness).run().await.unwrap();
        assert_eq!(harness.queue.drain()[0].change_type, ChangeType::Deleted);
    }

    #[tokio::test]
    async fn checkpoint_bounds_the_replay() {
        let harness = Harness::new();
        let link = harness.link_channel().await;
        let mut old = remote_message(channel(), "m1", "r-jane", "A");
        old.created_at = Utc::now() - ChronoDuration::minutes(30);
        old.last_modified_at = old.created_at;
        harness.remote.add_message(old);
        harness
            .db
            .marker_store()
            .advance_last_received_change(&link.link_id, Utc::now() - ChronoDuration::minutes(5))
            .await
            .unwrap();

        let report = backfill(&harness).run().await.unwrap();
        assert_eq!(report.enqueued, 0);
    }

    #[tokio::test]
    async fn busy_link_does_not_hide_a_quiet_links_gap() {
        let harness = Harness::new();
        let busy = harness.link_channel().await;
        let quiet = harness.link_chat("D1", "X1").await;
        let mut missed = remote_message(RemoteContainer::chat("X1"), "c1", "r-jane", "A");
        missed.created_at = quiet.created_at + ChronoDuration::seconds(1);
        missed.last_modified_at = missed.created_at;
        harness.remote.add_message(missed);
        harness
            .db
            .marker_store()
            .advance_last_received_change(&busy.link_id, Utc::now() + ChronoDuration::minutes(5))
            .await
            .unwrap();

        let report = backfill(&harness).run().await.unwrap();
        assert_eq!(report.enqueued, 1);
        assert_eq!(harness.queue.drain()[0].locator.changed_message_id(), "c1");
    }

    #[tokio::test]
    async fn nothing_is_replayed_toward_a_disabled_direction() {
        let harness =
            Harness::with_config(|config| config.bridge.sync_direction = SyncDirection::LocalToRemote);
        harness.link_channel().await;
        harness
            .remote
            .add_message(remote_message(channel(), "m1", "r-jane", "A"));
        let report = backfill(&harness).run().await.unwrap();
        assert_eq!(report, BackfillReport::default());
        assert!(harness.queue.is_empty());
    }

    #[test]
    fn replay_starts_no_earlier_than_the_link() {
        let linked = Utc::now() - ChronoDuration::hours(1);
        assert_eq!(replay_start(linked, None), linked);
        let checkpoint = Utc::now();
        assert_eq!(
            replay_start(linked, Some(checkpoint)),
            checkpoint - ChronoDuration::seconds(REPLAY_OVERLAP_SECS)
        );
        assert_eq!(
            replay_start(linked, Some(linked - ChronoDuration::hours(2))),
            linked
        );
    }
}
