use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::events::{ChangeEvent, ChangeType, DiscardReason, SyncError, SyncOutcome};
use super::logic::{edit_hash, local_echo_key, local_reaction_echo_key, remote_echo_key};
use super::message_flow::MessageFlow;
use super::queue::LinkLocks;
use super::user_sync::UserSyncHandler;
use crate::config::Config;
use crate::db::{ConversationLink, DatabaseManager, MessageCorrespondence, Origin};
use crate::emoji::remote_reaction_to_local;
use crate::mattermost::{LocalApi, NewPost};
use crate::msteams::{MessageTarget, RemoteApi, RemoteContainer, RemoteMessage};
use crate::web::metrics::{
    ACTION_CREATED, ACTION_DELETED, ACTION_UPDATED, Metrics, REACTION_SET, REACTION_UNSET,
    SOURCE_REMOTE,
};

/// Applies changes in the direction opposite to where they happened. The
/// remote-to-local half lives here; the local-to-remote half is in
/// `outbound`. Callers hold the conversation lane while a change applies.
pub struct SyncEngine {
    pub(super) config: Arc<Config>,
    pub(super) db: Arc<DatabaseManager>,
    pub(super) remote: Arc<dyn RemoteApi>,
    pub(super) local: Arc<dyn LocalApi>,
    pub(super) users: Arc<UserSyncHandler>,
    pub(super) flow: Arc<MessageFlow>,
    pub(super) locks: Arc<LinkLocks>,
    bridge_remote_id: RwLock<Option<String>>,
}

impl SyncEngine {
    pub fn new(
        config: Arc<Config>,
        db: Arc<DatabaseManager>,
        remote: Arc<dyn RemoteApi>,
        local: Arc<dyn LocalApi>,
        users: Arc<UserSyncHandler>,
        flow: Arc<MessageFlow>,
        locks: Arc<LinkLocks>,
    ) -> Self {
        Self {
            config,
            db,
            remote,
            local,
            users,
            flow,
            locks,
            bridge_remote_id: RwLock::new(None),
        }
    }

    pub fn locks(&self) -> Arc<LinkLocks> {
        self.locks.clone()
    }

    /// Learns the remote identity the bridge posts as. Best effort: the
    /// application id check still applies when this fails.
    pub async fn identify(&self) {
        match self.remote.get_me().await {
            Ok(me) => {
                info!("bridge remote identity resolved remote_id={}", me.id);
                *self.bridge_remote_id.write() = Some(me.id);
            }
            Err(err) => debug!("bridge remote identity unavailable error={}", err),
        }
    }

    fn app_id(&self) -> &str {
        self.config
            .remote
            .app_id
            .as_deref()
            .unwrap_or(&self.config.remote.client_id)
    }

    fn is_bridge_message(&self, message: &RemoteMessage) -> bool {
        if message.application_id.as_deref() == Some(self.app_id()) {
            return true;
        }
        match (message.user_id.as_deref(), self.bridge_remote_id.read().as_deref()) {
            (Some(user_id), Some(bridge_id)) => user_id == bridge_id,
            _ => false,
        }
    }

    /// Returns true when the correspondence was written within the echo
    /// fallback window.
    pub(super) fn recently_written(&self, row: &MessageCorrespondence) -> bool {
        let window = chrono::Duration::milliseconds(self.config.limits.echo_fallback_window_ms as i64);
        Utc::now() - row.created_at <= window
    }

    pub(super) async fn put_marker(&self, key: &str) -> Result<(), SyncError> {
        self.db
            .marker_store()
            .put_anti_echo_marker(key, self.config.echo_marker_ttl())
            .await?;
        Ok(())
    }

    pub(super) async fn consume_marker(&self, key: &str) -> Result<bool, SyncError> {
        Ok(self.db.marker_store().consume_anti_echo_marker(key).await?)
    }

    async fn checkpoint(&self, link: &ConversationLink, at: DateTime<Utc>) {
        if let Err(err) = self
            .db
            .marker_store()
            .advance_last_received_change(&link.link_id, at)
            .await
        {
            warn!(
                "replay checkpoint not advanced link_id={} error={}",
                link.link_id, err
            );
        }
    }

    async fn correspondence(
        &self,
        container: &RemoteContainer,
        remote_message_id: &str,
    ) -> Result<Option<MessageCorrespondence>, SyncError> {
        Ok(self
            .db
            .message_store()
            .resolve_local_from_remote(container, remote_message_id)
            .await?)
    }

    /// Applies one remote change event locally.
    pub async fn handle_remote(&self, event: &ChangeEvent) -> Result<SyncOutcome, SyncError> {
        let container = &event.locator.container;
        let remote_id = event.locator.changed_message_id();

        if self
            .consume_marker(&remote_echo_key(&container.key(), remote_id))
            .await?
        {
            debug!(
                "remote change caused by the bridge container={} remote_id={}",
                container.key(),
                remote_id
            );
            return Ok(SyncOutcome::Discarded(DiscardReason::Echo));
        }

        let Some(link) = self.db.link_store().get_by_remote(container).await? else {
            return Ok(SyncOutcome::Discarded(DiscardReason::Unlinked));
        };
        if !self
            .config
            .bridge
            .change_type_enabled(event.change_type.as_str())
        {
            return Ok(SyncOutcome::Discarded(DiscardReason::ChangeTypeDisabled));
        }
        if !self.config.bridge.sync_direction.allows_remote_to_local() {
            return Ok(SyncOutcome::Discarded(DiscardReason::DirectionDisabled));
        }
        if link.kind.is_direct() && !self.config.bridge.sync_direct_messages {
            return Ok(SyncOutcome::Discarded(DiscardReason::DirectMessagesDisabled));
        }

        match event.change_type {
            ChangeType::Created => self.apply_created(&link, event).await,
            ChangeType::Updated => self.apply_updated(&link, event).await,
            ChangeType::Deleted => self.apply_deleted(&link, remote_id).await,
        }
    }

    async fn fetch(&self, event: &ChangeEvent) -> Result<RemoteMessage, SyncError> {
        if let Some(message) = event.message.as_ref() {
            return Ok(message.clone());
        }
        Ok(self.remote.get_message(&event.locator.target()).await?)
    }

    fn screen(&self, message: &RemoteMessage) -> Option<DiscardReason> {
        if message.is_system() || (message.user_id.is_none() && message.application_id.is_none()) {
            return Some(DiscardReason::Policy);
        }
        if self.is_bridge_message(message) {
            return Some(DiscardReason::IsBotUser);
        }
        None
    }

    async fn apply_created(
        &self,
        link: &ConversationLink,
        event: &ChangeEvent,
    ) -> Result<SyncOutcome, SyncError> {
        let remote_id = event.locator.changed_message_id();
        if let Some(existing) = self.correspondence(&link.remote, remote_id).await? {
            if existing.is_deleted() {
                return Ok(SyncOutcome::Discarded(DiscardReason::Tombstoned));
            }
            if existing.origin == Origin::Local && self.recently_written(&existing) {
                return Ok(SyncOutcome::Discarded(DiscardReason::Echo));
            }
            return Ok(SyncOutcome::Discarded(DiscardReason::DuplicatedPost));
        }

        let message = self.fetch(event).await?;
        if message.deleted_at.is_some() {
            return self.apply_deleted(link, remote_id).await;
        }
        if let Some(reason) = self.screen(&message) {
            self.checkpoint(link, message.last_modified_at).await;
            return Ok(SyncOutcome::Discarded(reason));
        }

        let root = self.resolve_local_root(link, &message).await?;
        self.create_local(link, &message, root).await?;
        Ok(SyncOutcome::Applied)
    }

    /// Local thread root for a remote reply. A parent the bridge has not
    /// seen yet is fetched and mirrored first; one that cannot be read
    /// leaves the reply unthreaded.
    async fn resolve_local_root(
        &self,
        link: &ConversationLink,
        message: &RemoteMessage,
    ) -> Result<Option<String>, SyncError> {
        let Some(parent_id) = message.parent_id() else {
            return Ok(None);
        };
        if let Some(row) = self.correspondence(&link.remote, &parent_id).await? {
            return Ok(local_root_of(&row));
        }

        let target = MessageTarget::new(link.remote.clone(), parent_id.clone());
        let parent = match self.remote.get_message(&target).await {
            Ok(parent) => parent,
            Err(err) if err.is_not_found() => {
                debug!(
                    "reply parent unavailable, posting unthreaded remote_id={} parent_id={}",
                    message.id, parent_id
                );
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        if parent.deleted_at.is_some() || self.screen(&parent).is_some() {
            return Ok(None);
        }
        let row = self.create_local(link, &parent, None).await?;
        Ok(local_root_of(&row))
    }

    async fn create_local(
        &self,
        link: &ConversationLink,
        message: &RemoteMessage,
        root: Option<String>,
    ) -> Result<MessageCorrespondence, SyncError> {
        let sender = message
            .user_id
            .as_deref()
            .ok_or_else(|| SyncError::PolicyRejection(format!("message {} has no sender", message.id)))?;
        let author = self
            .users
            .local_user_for_remote(sender, message.user_display_name.as_deref())
            .await?;
        let usernames = self.users.local_usernames(&message.mentioned_user_ids()).await;
        let content = self.flow.render_for_local(message, &usernames).await;
        let is_direct = link.kind.is_direct();
        let files = self
            .flow
            .transfer_to_local(
                &content.files,
                &author.local_user_id,
                &link.local_conversation_id,
                is_direct,
            )
            .await;
        if content.message.trim().is_empty() && files.local_file_ids.is_empty() {
            return Err(SyncError::BadRequest(format!(
                "message {} has nothing to post",
                message.id
            )));
        }

        self.put_marker(&local_echo_key(&link.link_id, &message.id)).await?;
        let post = self
            .local
            .create_post(&NewPost {
                channel_id: link.local_conversation_id.clone(),
                user_id: author.local_user_id.clone(),
                root_id: root.clone(),
                message: content.message.clone(),
                file_ids: files.local_file_ids.clone(),
            })
            .await?;

        let row = MessageCorrespondence::new(link, &post.id, &message.id, Origin::Remote)
            .with_thread(root, message.parent_id())
            .with_edit_hash(edit_hash(&content.message))
            .with_sender(&author.local_user_id)
            .with_remote_updated_at(Some(message.last_modified_at));
        let stored = self.db.message_store().link_message(row).await?;
        if stored.local_message_id != post.id {
            warn!(
                "mirrored post lost the correspondence race remote_id={} local_id={} kept_local_id={}",
                message.id, post.id, stored.local_message_id
            );
        }

        if !message.reactions.is_empty() {
            self.sync_reactions(&stored, message, is_direct).await?;
        }
        self.checkpoint(link, message.last_modified_at).await;
        Metrics::observe_message(ACTION_CREATED, SOURCE_REMOTE, is_direct);
        info!(
            "remote message mirrored link_id={} remote_id={} local_id={} files={}",
            link.link_id,
            message.id,
            post.id,
            files.transferred()
        );
        Ok(stored)
    }

    async fn apply_updated(
        &self,
        link: &ConversationLink,
        event: &ChangeEvent,
    ) -> Result<SyncOutcome, SyncError> {
        let remote_id = event.locator.changed_message_id();
        let existing = self.correspondence(&link.remote, remote_id).await?;
        if existing.as_ref().is_some_and(MessageCorrespondence::is_deleted) {
            return Ok(SyncOutcome::Discarded(DiscardReason::Tombstoned));
        }

        let message = self.fetch(event).await?;
        if message.deleted_at.is_some() {
            return self.apply_deleted(link, remote_id).await;
        }
        if message.is_system() {
            return Ok(SyncOutcome::Discarded(DiscardReason::Policy));
        }

        let Some(row) = existing else {
            // The create was never seen; mirror now unless the message
            // predates the link.
            if message.created_at < link.created_at {
                return Ok(SyncOutcome::Discarded(DiscardReason::Unlinked));
            }
            if let Some(reason) = self.screen(&message) {
                return Ok(SyncOutcome::Discarded(reason));
            }
            let root = self.resolve_local_root(link, &message).await?;
            self.create_local(link, &message, root).await?;
            return Ok(SyncOutcome::Applied);
        };

        if row
            .remote_updated_at
            .is_some_and(|applied| applied >= message.last_modified_at)
        {
            return Ok(SyncOutcome::Discarded(DiscardReason::AlreadyAppliedChange));
        }

        let is_direct = link.kind.is_direct();
        let mut changed = false;
        let mut next_hash = row.edit_hash.clone();
        // Bodies the bridge wrote are owned by the local side; only their
        // reactions come back.
        if !self.is_bridge_message(&message) {
            let usernames = self.users.local_usernames(&message.mentioned_user_ids()).await;
            let content = self.flow.render_for_local(&message, &usernames).await;
            let hash = edit_hash(&content.message);
            if row.edit_hash.as_deref() != Some(hash.as_str()) {
                let editor = row
                    .last_sender
                    .clone()
                    .unwrap_or_else(|| self.config.local.bot_user_id.clone());
                self.put_marker(&local_echo_key(&link.link_id, remote_id)).await?;
                self.local
                    .update_post(&editor, &row.local_message_id, &content.message)
                    .await?;
                Metrics::observe_message(ACTION_UPDATED, SOURCE_REMOTE, is_direct);
                changed = true;
            }
            next_hash = Some(hash);
        }

        let reaction_changes = self.sync_reactions(&row, &message, is_direct).await?;

        let mut updated = row.clone().with_remote_updated_at(Some(message.last_modified_at));
        updated.edit_hash = next_hash;
        self.db.message_store().link_message(updated).await?;
        self.checkpoint(link, message.last_modified_at).await;

        if changed || reaction_changes > 0 {
            debug!(
                "remote edit applied remote_id={} local_id={} body_changed={} reactions={}",
                remote_id, row.local_message_id, changed, reaction_changes
            );
            Ok(SyncOutcome::Applied)
        } else {
            Ok(SyncOutcome::Discarded(DiscardReason::AlreadyAppliedChange))
        }
    }

    /// Brings the local reactions on a mirrored post in line with the
    /// remote message. Only users known on both sides are touched.
    async fn sync_reactions(
        &self,
        row: &MessageCorrespondence,
        message: &RemoteMessage,
        is_direct: bool,
    ) -> Result<usize, SyncError> {
        let post_id = &row.local_message_id;
        let users = self.db.user_store();

        let mut desired = HashSet::new();
        for reaction in &message.reactions {
            let Some(emoji) = remote_reaction_to_local(&reaction.reaction_type) else {
                debug!("reaction has no local emoji reaction={}", reaction.reaction_type);
                continue;
            };
            if let Some(user) = users.resolve_by_remote(&reaction.user_id).await? {
                desired.insert((user.local_user_id, emoji));
            }
        }

        let current = self.local.get_reactions(post_id).await?;
        let existing: HashSet<(String, String)> = current
            .iter()
            .map(|reaction| (reaction.user_id.clone(), reaction.emoji_name.clone()))
            .collect();

        let mut changes = 0;
        for (user_id, emoji) in existing.difference(&desired) {
            if users.resolve_by_local(user_id).await?.is_none() {
                continue;
            }
            self.put_marker(&local_reaction_echo_key(post_id, user_id, emoji))
                .await?;
            self.local.remove_reaction(user_id, post_id, emoji).await?;
            Metrics::observe_reaction(REACTION_UNSET, SOURCE_REMOTE, is_direct);
            changes += 1;
        }
        for (user_id, emoji) in desired.difference(&existing) {
            self.put_marker(&local_reaction_echo_key(post_id, user_id, emoji))
                .await?;
            self.local.add_reaction(user_id, post_id, emoji).await?;
            Metrics::observe_reaction(REACTION_SET, SOURCE_REMOTE, is_direct);
            changes += 1;
        }
        Ok(changes)
    }

    async fn apply_deleted(
        &self,
        link: &ConversationLink,
        remote_id: &str,
    ) -> Result<SyncOutcome, SyncError> {
        let retention = self.config.tombstone_retention();
        let messages = self.db.message_store();

        let row = match self.correspondence(&link.remote, remote_id).await? {
            Some(row) if row.is_deleted() => {
                return Ok(SyncOutcome::Discarded(DiscardReason::Tombstoned));
            }
            Some(row) => row,
            None => {
                debug!(
                    "delete for unseen remote message, tombstoning remote_id={}",
                    remote_id
                );
                messages
                    .tombstone_remote(&link.link_id, &link.remote, remote_id, retention)
                    .await?;
                return Ok(SyncOutcome::Discarded(DiscardReason::Tombstoned));
            }
        };

        self.put_marker(&local_echo_key(&link.link_id, remote_id)).await?;
        match self.local.delete_post(&row.local_message_id).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                debug!("mirrored post already gone local_id={}", row.local_message_id);
            }
            Err(err) => return Err(err.into()),
        }
        messages
            .tombstone_remote(&link.link_id, &link.remote, remote_id, retention)
            .await?;
        Metrics::observe_message(ACTION_DELETED, SOURCE_REMOTE, link.kind.is_direct());
        info!(
            "remote delete mirrored remote_id={} local_id={}",
            remote_id, row.local_message_id
        );
        Ok(SyncOutcome::Applied)
    }
}

fn local_root_of(row: &MessageCorrespondence) -> Option<String> {
    if row.is_deleted() || row.local_message_id.is_empty() {
        return None;
    }
    Some(
        row.local_root_id
            .clone()
            .unwrap_or_else(|| row.local_message_id.clone()),
    )
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::bridge::testing::{Harness, channel, remote_message};
    use crate::config::SyncDirection;
    use crate::msteams::{RemoteAttachment, RemoteError, RemoteUser, ResourceLocator};

    fn event(change_type: ChangeType, message: &RemoteMessage) -> ChangeEvent {
        ChangeEvent::new(
            change_type,
            ResourceLocator::for_message(message),
            "sub-1",
            format!("delivery-{}-{}", message.id, change_type),
        )
    }

    fn jane() -> RemoteUser {
        RemoteUser {
            id: "r-jane".to_string(),
            display_name: Some("Jane Doe".to_string()),
            ..Default::default()
        }
    }

    async fn setup() -> (Harness, Arc<SyncEngine>, ConversationLink) {
        let harness = Harness::new();
        harness.remote.add_user(jane());
        let link = harness.link_channel().await;
        let engine = harness.engine();
        (harness, engine, link)
    }

    #[tokio::test]
    async fn created_message_is_mirrored_once() {
        let (harness, engine, link) = setup().await;
        let message = remote_message(channel(), "m1", "r-jane", "<p><b>hello</b></p>");
        harness.remote.add_message(message.clone());

        let outcome = engine.handle_remote(&event(ChangeType::Created, &message)).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Applied);

        let posts = harness.local.posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].message, "**hello**");
        assert_eq!(posts[0].channel_id, link.local_conversation_id);
        let author = harness.local.user(&posts[0].user_id).unwrap();
        assert_eq!(author.username, "msteams_jane-doe");

        let row = harness
            .db
            .message_store()
            .resolve_remote_from_local(&posts[0].id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.remote_message_id, "m1");
        assert_eq!(row.origin, Origin::Remote);

        let again = engine.handle_remote(&event(ChangeType::Created, &message)).await.unwrap();
        assert_eq!(again, SyncOutcome::Discarded(DiscardReason::DuplicatedPost));
        assert_eq!(harness.local.posts().len(), 1);
        assert!(
            harness
                .db
                .marker_store()
                .last_received_change(&link.link_id)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn bridge_marker_discards_as_echo() {
        let (harness, engine, _link) = setup().await;
        let message = remote_message(channel(), "m1", "r-jane", "hi");
        harness.remote.add_message(message.clone());
        engine
            .put_marker(&remote_echo_key(&channel().key(), "m1"))
            .await
            .unwrap();

        let outcome = engine.handle_remote(&event(ChangeType::Created, &message)).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Discarded(DiscardReason::Echo));
        assert!(harness.local.posts().is_empty());
    }

    #[tokio::test]
    async fn unlinked_and_disabled_changes_are_discarded() {
        let harness = Harness::with_config(|config| {
            config.bridge.enabled_change_types = vec!["created".to_string()];
        });
        let engine = harness.engine();
        let message = remote_message(channel(), "m1", "r-jane", "hi");

        let outcome = engine.handle_remote(&event(ChangeType::Created, &message)).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Discarded(DiscardReason::Unlinked));

        harness.link_channel().await;
        let outcome = engine.handle_remote(&event(ChangeType::Deleted, &message)).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Discarded(DiscardReason::ChangeTypeDisabled));
    }

    #[tokio::test]
    async fn local_only_direction_ignores_remote_changes() {
        let harness = Harness::with_config(|config| {
            config.bridge.sync_direction = SyncDirection::LocalToRemote;
        });
        harness.link_channel().await;
        let engine = harness.engine();
        let message = remote_message(channel(), "m1", "r-jane", "hi");

        let outcome = engine.handle_remote(&event(ChangeType::Created, &message)).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Discarded(DiscardReason::DirectionDisabled));
    }

    #[tokio::test]
    async fn bridge_authored_messages_are_not_mirrored() {
        let (harness, engine, _link) = setup().await;
        let mut message = remote_message(channel(), "m1", "r-jane", "hi");
        message.user_id = None;
        message.application_id = Some("client".to_string());
        harness.remote.add_message(message.clone());

        let outcome = engine.handle_remote(&event(ChangeType::Created, &message)).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Discarded(DiscardReason::IsBotUser));
        assert!(harness.local.posts().is_empty());
    }

    #[tokio::test]
    async fn delete_before_create_leaves_tombstone() {
        let (harness, engine, _link) = setup().await;
        let message = remote_message(channel(), "m1", "r-jane", "hi");

        let deleted = engine.handle_remote(&event(ChangeType::Deleted, &message)).await.unwrap();
        assert_eq!(deleted, SyncOutcome::Discarded(DiscardReason::Tombstoned));

        harness.remote.add_message(message.clone());
        let created = engine.handle_remote(&event(ChangeType::Created, &message)).await.unwrap();
        assert_eq!(created, SyncOutcome::Discarded(DiscardReason::Tombstoned));
        assert!(harness.local.posts().is_empty());
    }

    #[tokio::test]
    async fn identical_edit_writes_nothing() {
        let (harness, engine, _link) = setup().await;
        let mut message = remote_message(channel(), "m1", "r-jane", "<p>hello</p>");
        harness.remote.add_message(message.clone());
        engine.handle_remote(&event(ChangeType::Created, &message)).await.unwrap();

        message.last_modified_at += ChronoDuration::seconds(5);
        message.body = "<p>hello </p>".to_string();
        harness.remote.add_message(message.clone());
        let outcome = engine.handle_remote(&event(ChangeType::Updated, &message)).await.unwrap();

        assert_eq!(outcome, SyncOutcome::Discarded(DiscardReason::AlreadyAppliedChange));
        assert_eq!(harness.local.update_count(), 0);
    }

    #[tokio::test]
    async fn edit_is_applied_and_replays_are_skipped() {
        let (harness, engine, _link) = setup().await;
        let mut message = remote_message(channel(), "m1", "r-jane", "<p>hello</p>");
        harness.remote.add_message(message.clone());
        engine.handle_remote(&event(ChangeType::Created, &message)).await.unwrap();

        message.last_modified_at += ChronoDuration::seconds(5);
        message.body = "<p>hello world</p>".to_string();
        harness.remote.add_message(message.clone());
        let outcome = engine.handle_remote(&event(ChangeType::Updated, &message)).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Applied);
        assert_eq!(harness.local.posts()[0].message, "hello world");

        let replay = engine.handle_remote(&event(ChangeType::Updated, &message)).await.unwrap();
        assert_eq!(replay, SyncOutcome::Discarded(DiscardReason::AlreadyAppliedChange));
        assert_eq!(harness.local.update_count(), 1);
    }

    #[tokio::test]
    async fn remote_reactions_follow_connected_users() {
        let (harness, engine, _link) = setup().await;
        harness.local.add_user("u-bob", "bob", "bob@example.com");
        harness.link_user("u-bob", "r-bob").await;

        let mut message = remote_message(channel(), "m1", "r-jane", "hi");
        harness.remote.add_message(message.clone());
        engine.handle_remote(&event(ChangeType::Created, &message)).await.unwrap();
        let post_id = harness.local.posts()[0].id.clone();

        message.last_modified_at += ChronoDuration::seconds(1);
        message.reactions = vec![
            Harness::reaction("r-bob", "like"),
            Harness::reaction("r-stranger", "like"),
        ];
        harness.remote.add_message(message.clone());
        engine.handle_remote(&event(ChangeType::Updated, &message)).await.unwrap();

        let reactions = harness.local.reactions_on(&post_id);
        assert_eq!(reactions.len(), 1);
        assert_eq!(reactions[0].user_id, "u-bob");
        assert_eq!(reactions[0].emoji_name, "+1");

        message.last_modified_at += ChronoDuration::seconds(1);
        message.reactions.clear();
        harness.remote.add_message(message.clone());
        engine.handle_remote(&event(ChangeType::Updated, &message)).await.unwrap();
        assert!(harness.local.reactions_on(&post_id).is_empty());
    }

    #[tokio::test]
    async fn delete_removes_post_and_tombstones() {
        let (harness, engine, _link) = setup().await;
        let message = remote_message(channel(), "m1", "r-jane", "hi");
        harness.remote.add_message(message.clone());
        engine.handle_remote(&event(ChangeType::Created, &message)).await.unwrap();

        let outcome = engine.handle_remote(&event(ChangeType::Deleted, &message)).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Applied);
        assert!(harness.local.posts().is_empty());

        let again = engine.handle_remote(&event(ChangeType::Deleted, &message)).await.unwrap();
        assert_eq!(again, SyncOutcome::Discarded(DiscardReason::Tombstoned));
    }

    #[tokio::test]
    async fn reply_mirrors_unseen_parent_first() {
        let (harness, engine, _link) = setup().await;
        let parent = remote_message(channel(), "m1", "r-jane", "root");
        let mut reply = remote_message(channel(), "m2", "r-jane", "reply");
        reply.reply_to_id = Some("m1".to_string());
        harness.remote.add_message(parent.clone());
        harness.remote.add_message(reply.clone());

        engine.handle_remote(&event(ChangeType::Created, &reply)).await.unwrap();

        let posts = harness.local.posts();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].message, "root");
        assert_eq!(posts[1].root_id, posts[0].id);

        let parent_again = engine.handle_remote(&event(ChangeType::Created, &parent)).await.unwrap();
        assert_eq!(parent_again, SyncOutcome::Discarded(DiscardReason::DuplicatedPost));
    }

    #[tokio::test]
    async fn vanished_message_surfaces_not_found() {
        let (_harness, engine, _link) = setup().await;
        let message = remote_message(channel(), "gone", "r-jane", "hi");

        let err = engine
            .handle_remote(&event(ChangeType::Created, &message))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn oversized_attachment_is_dropped_but_message_mirrored() {
        let harness = Harness::with_config(|config| config.local.max_file_size = 4);
        harness.remote.add_user(jane());
        harness.link_channel().await;
        let engine = harness.engine();

        let mut message = remote_message(channel(), "m1", "r-jane", "<p>see file</p>");
        message.attachments.push(RemoteAttachment {
            id: Some("a1".to_string()),
            content_type: "reference".to_string(),
            content: None,
            content_url: Some("https://files.example.com/big.bin".to_string()),
            name: Some("big.bin".to_string()),
        });
        harness
            .remote
            .add_file("https://files.example.com/big.bin", vec![0u8; 64]);
        harness.remote.add_message(message.clone());

        let outcome = engine.handle_remote(&event(ChangeType::Created, &message)).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Applied);
        let posts = harness.local.posts();
        assert_eq!(posts.len(), 1);
        assert!(posts[0].message.starts_with("see file"));
        assert!(posts[0].file_ids.is_empty());
    }

    #[tokio::test]
    async fn transient_read_failure_is_retryable() {
        let (harness, engine, _link) = setup().await;
        let message = remote_message(channel(), "m1", "r-jane", "hi");
        harness.remote.add_message(message.clone());
        harness
            .remote
            .fail_next("get_message", RemoteError::TransportTransient("reset".to_string()));

        let err = engine
            .handle_remote(&event(ChangeType::Created, &message))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(harness.local.posts().is_empty());
    }
}
