use tracing::{debug, info, warn};

use super::engine::SyncEngine;
use super::events::{DiscardReason, SyncError, SyncOutcome};
use super::logic::{edit_hash, local_echo_key, local_reaction_echo_key, preview_text, remote_echo_key};
use super::message_flow::local_to_remote;
use crate::db::{ConversationLink, MessageCorrespondence, Origin};
use crate::emoji::local_reaction_to_remote;
use crate::mattermost::{LocalEventKind, LocalHookEvent, LocalPost, LocalReaction};
use crate::msteams::{MessageTarget, OutgoingMessage, ReplyReference};
use crate::parsers::extract_local_mentions;
use crate::web::metrics::{
    ACTION_CREATED, ACTION_DELETED, ACTION_UPDATED, Metrics, REACTION_SET, REACTION_UNSET,
    SOURCE_LOCAL,
};

fn remote_target(row: &MessageCorrespondence) -> MessageTarget {
    MessageTarget {
        container: row.remote_container.clone(),
        parent_id: row.remote_parent_id.clone(),
        message_id: row.remote_message_id.clone(),
    }
}

impl SyncEngine {
    /// Applies one local hook event on the remote side. The conversation
    /// lane is taken here, once the link is known.
    pub async fn handle_local(&self, event: &LocalHookEvent) -> Result<SyncOutcome, SyncError> {
        if !self.config.bridge.sync_direction.allows_local_to_remote() {
            return Ok(SyncOutcome::Discarded(DiscardReason::DirectionDisabled));
        }

        match event.event {
            LocalEventKind::Posted | LocalEventKind::PostEdited | LocalEventKind::PostDeleted => {
                let post = event
                    .post
                    .as_ref()
                    .ok_or_else(|| SyncError::BadRequest("post event without post".to_string()))?;
                if let Some(reason) = self.screen_local_author(&post.user_id).await? {
                    return Ok(SyncOutcome::Discarded(reason));
                }
                if post.is_system() {
                    return Ok(SyncOutcome::Discarded(DiscardReason::Policy));
                }
                let link = match self.local_link(&post.channel_id).await? {
                    Ok(link) => link,
                    Err(reason) => return Ok(SyncOutcome::Discarded(reason)),
                };

                let _lane = self.locks.lock(&link.remote.key()).await;
                match event.event {
                    LocalEventKind::Posted => self.mirror_post(&link, post).await,
                    LocalEventKind::PostEdited => self.mirror_edit(&link, post).await,
                    _ => self.mirror_delete(&link, post).await,
                }
            }
            LocalEventKind::ReactionAdded | LocalEventKind::ReactionRemoved => {
                let reaction = event.reaction.as_ref().ok_or_else(|| {
                    SyncError::BadRequest("reaction event without reaction".to_string())
                })?;
                if let Some(reason) = self.screen_local_author(&reaction.user_id).await? {
                    return Ok(SyncOutcome::Discarded(reason));
                }
                let post = self.local.get_post(&reaction.post_id).await?;
                let link = match self.local_link(&post.channel_id).await? {
                    Ok(link) => link,
                    Err(reason) => return Ok(SyncOutcome::Discarded(reason)),
                };

                let _lane = self.locks.lock(&link.remote.key()).await;
                let added = event.event == LocalEventKind::ReactionAdded;
                self.mirror_reaction(&link, reaction, added).await
            }
        }
    }

    async fn screen_local_author(&self, user_id: &str) -> Result<Option<DiscardReason>, SyncError> {
        if user_id == self.config.local.bot_user_id {
            return Ok(Some(DiscardReason::IsBotUser));
        }
        if self.users.is_synthetic(user_id).await? {
            return Ok(Some(DiscardReason::SyntheticUser));
        }
        Ok(None)
    }

    async fn local_link(
        &self,
        channel_id: &str,
    ) -> Result<Result<ConversationLink, DiscardReason>, SyncError> {
        let Some(link) = self.db.link_store().get_by_local(channel_id).await? else {
            return Ok(Err(DiscardReason::Unlinked));
        };
        if link.kind.is_direct() && !self.config.bridge.sync_direct_messages {
            return Ok(Err(DiscardReason::DirectMessagesDisabled));
        }
        Ok(Ok(link))
    }

    async fn author_name(&self, user_id: &str) -> Option<String> {
        match self.local.get_user(user_id).await {
            Ok(user) => Some(user.display_name()),
            Err(err) => {
                debug!("author not readable user_id={} error={}", user_id, err);
                None
            }
        }
    }

    async fn render_outgoing(&self, post: &LocalPost) -> OutgoingMessage {
        let targets = self
            .users
            .mention_targets(&extract_local_mentions(&post.message))
            .await;
        let author = self.author_name(&post.user_id).await;
        local_to_remote(&post.message, &targets, author.as_deref())
    }

    async fn reply_reference(&self, parent: &MessageCorrespondence) -> ReplyReference {
        let root = self.local.get_post(&parent.local_message_id).await.ok();
        let sender = root
            .as_ref()
            .map(|post| post.user_id.clone())
            .or_else(|| parent.last_sender.clone());

        let (sender_id, sender_name) = match sender.as_deref() {
            Some(local_id) => (
                self.users.remote_user_for_local(local_id).await.ok().flatten(),
                self.author_name(local_id).await,
            ),
            None => (None, None),
        };
        ReplyReference {
            message_id: parent.remote_message_id.clone(),
            preview: root
                .map(|post| preview_text(&post.message))
                .unwrap_or_default(),
            sender_id,
            sender_name,
        }
    }

    async fn mirror_post(
        &self,
        link: &ConversationLink,
        post: &LocalPost,
    ) -> Result<SyncOutcome, SyncError> {
        let messages = self.db.message_store();
        if let Some(row) = messages.resolve_remote_from_local(&post.id).await? {
            if row.is_deleted() {
                return Ok(SyncOutcome::Discarded(DiscardReason::Tombstoned));
            }
            let marked = self
                .consume_marker(&local_echo_key(&link.link_id, &row.remote_message_id))
                .await?;
            if marked || (row.origin == Origin::Remote && self.recently_written(&row)) {
                return Ok(SyncOutcome::Discarded(DiscardReason::Echo));
            }
            return Ok(SyncOutcome::Discarded(DiscardReason::DuplicatedPost));
        }

        let parent = match post.root() {
            Some(root_id) => messages
                .resolve_remote_from_local(root_id)
                .await?
                .filter(|row| !row.is_deleted() && !row.remote_message_id.is_empty()),
            None => None,
        };

        let mut outgoing = self.render_outgoing(post).await;
        if let Some(parent) = parent.as_ref() {
            outgoing.reply_to = Some(self.reply_reference(parent).await);
        }
        let is_direct = link.kind.is_direct();
        let files = self
            .flow
            .transfer_to_remote(&post.file_ids, &link.remote, is_direct)
            .await;
        outgoing.attachments = files.remote_files.clone();

        let sent = self.remote.send_message(&link.remote, &outgoing).await?;
        self.put_marker(&remote_echo_key(&link.remote.key(), &sent.id))
            .await?;

        let row = MessageCorrespondence::new(link, &post.id, &sent.id, Origin::Local)
            .with_thread(
                post.root().map(ToOwned::to_owned),
                parent.map(|parent| parent.remote_message_id),
            )
            .with_edit_hash(edit_hash(&post.message))
            .with_sender(&post.user_id)
            .with_remote_updated_at(Some(sent.last_modified_at));
        messages.link_message(row).await?;
        Metrics::observe_message(ACTION_CREATED, SOURCE_LOCAL, is_direct);

        let skipped = files.discarded_count(DiscardReason::Size)
            + files.discarded_count(DiscardReason::FileLimitReached);
        if skipped > 0 {
            self.notify(
                &post.user_id,
                &post.channel_id,
                &format!("{skipped} attachment(s) were too large or too many and were not sent to Microsoft Teams."),
            )
            .await;
        }
        info!(
            "local post mirrored link_id={} local_id={} remote_id={}",
            link.link_id, post.id, sent.id
        );
        Ok(SyncOutcome::Applied)
    }

    async fn mirror_edit(
        &self,
        link: &ConversationLink,
        post: &LocalPost,
    ) -> Result<SyncOutcome, SyncError> {
        let messages = self.db.message_store();
        let Some(row) = messages.resolve_remote_from_local(&post.id).await? else {
            return Err(SyncError::CorrespondenceMissing(post.id.clone()));
        };
        if row.is_deleted() {
            return Ok(SyncOutcome::Discarded(DiscardReason::Tombstoned));
        }
        if self
            .consume_marker(&local_echo_key(&link.link_id, &row.remote_message_id))
            .await?
        {
            return Ok(SyncOutcome::Discarded(DiscardReason::Echo));
        }
        let hash = edit_hash(&post.message);
        if row.edit_hash.as_deref() == Some(hash.as_str()) {
            return Ok(SyncOutcome::Discarded(DiscardReason::AlreadyAppliedChange));
        }

        let mut outgoing = self.render_outgoing(post).await;
        if let Some(parent_id) = row.remote_parent_id.as_ref() {
            if row.remote_container.is_chat() {
                if let Some(parent) = messages
                    .resolve_local_from_remote(&row.remote_container, parent_id)
                    .await?
                {
                    outgoing.reply_to = Some(self.reply_reference(&parent).await);
                }
            }
        }

        self.put_marker(&remote_echo_key(&link.remote.key(), &row.remote_message_id))
            .await?;
        self.remote
            .update_message(&remote_target(&row), &outgoing)
            .await?;

        let updated = row.clone().with_edit_hash(hash).with_sender(&post.user_id);
        messages.link_message(updated).await?;
        Metrics::observe_message(ACTION_UPDATED, SOURCE_LOCAL, link.kind.is_direct());
        debug!(
            "local edit mirrored local_id={} remote_id={}",
            post.id, row.remote_message_id
        );
        Ok(SyncOutcome::Applied)
    }

    async fn mirror_delete(
        &self,
        link: &ConversationLink,
        post: &LocalPost,
    ) -> Result<SyncOutcome, SyncError> {
        let retention = self.config.tombstone_retention();
        let messages = self.db.message_store();

        let row = match messages.resolve_remote_from_local(&post.id).await? {
            Some(row) if row.is_deleted() => {
                return Ok(SyncOutcome::Discarded(DiscardReason::Tombstoned));
            }
            Some(row) => row,
            None => {
                messages.tombstone_local(&post.id, retention).await?;
                return Ok(SyncOutcome::Discarded(DiscardReason::Tombstoned));
            }
        };

        if self
            .consume_marker(&local_echo_key(&link.link_id, &row.remote_message_id))
            .await?
        {
            messages.tombstone_local(&post.id, retention).await?;
            return Ok(SyncOutcome::Discarded(DiscardReason::Echo));
        }

        self.put_marker(&remote_echo_key(&link.remote.key(), &row.remote_message_id))
            .await?;
        match self.remote.delete_message(&remote_target(&row)).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                debug!("remote message already gone remote_id={}", row.remote_message_id);
            }
            Err(err) => return Err(err.into()),
        }
        messages.tombstone_local(&post.id, retention).await?;
        Metrics::observe_message(ACTION_DELETED, SOURCE_LOCAL, link.kind.is_direct());
        info!(
            "local delete mirrored local_id={} remote_id={}",
            post.id, row.remote_message_id
        );
        Ok(SyncOutcome::Applied)
    }

    async fn mirror_reaction(
        &self,
        link: &ConversationLink,
        reaction: &LocalReaction,
        added: bool,
    ) -> Result<SyncOutcome, SyncError> {
        let echo_key =
            local_reaction_echo_key(&reaction.post_id, &reaction.user_id, &reaction.emoji_name);
        if self.consume_marker(&echo_key).await? {
            return Ok(SyncOutcome::Discarded(DiscardReason::Echo));
        }

        let Some(row) = self
            .db
            .message_store()
            .resolve_remote_from_local(&reaction.post_id)
            .await?
        else {
            return Err(SyncError::CorrespondenceMissing(reaction.post_id.clone()));
        };
        if row.is_deleted() {
            return Ok(SyncOutcome::Discarded(DiscardReason::Tombstoned));
        }
        let Some(remote_user) = self.users.remote_user_for_local(&reaction.user_id).await? else {
            debug!("reaction by unconnected user user_id={}", reaction.user_id);
            return Ok(SyncOutcome::Discarded(DiscardReason::Policy));
        };
        let Some(remote_reaction) = local_reaction_to_remote(&reaction.emoji_name) else {
            debug!("emoji has no remote form emoji={}", reaction.emoji_name);
            return Ok(SyncOutcome::Discarded(DiscardReason::Policy));
        };

        self.put_marker(&remote_echo_key(&link.remote.key(), &row.remote_message_id))
            .await?;
        let target = remote_target(&row);
        let is_direct = link.kind.is_direct();
        if added {
            self.remote
                .set_reaction(&target, &remote_user, remote_reaction)
                .await?;
            Metrics::observe_reaction(REACTION_SET, SOURCE_LOCAL, is_direct);
        } else {
            self.remote
                .unset_reaction(&target, &remote_user, remote_reaction)
                .await?;
            Metrics::observe_reaction(REACTION_UNSET, SOURCE_LOCAL, is_direct);
        }
        Ok(SyncOutcome::Applied)
    }

    async fn notify(&self, user_id: &str, channel_id: &str, message: &str) {
        if let Err(err) = self
            .local
            .send_ephemeral_post(user_id, channel_id, message)
            .await
        {
            warn!("ephemeral notice failed user_id={} error={}", user_id, err);
        }
    }

    /// Tells the author their change did not reach the remote side.
    pub async fn notify_local_failure(&self, event: &LocalHookEvent, err: &SyncError) {
        let (user_id, channel_id) = match (event.post.as_ref(), event.reaction.as_ref()) {
            (Some(post), _) => (post.user_id.clone(), post.channel_id.clone()),
            (None, Some(reaction)) => match self.local.get_post(&reaction.post_id).await {
                Ok(post) => (reaction.user_id.clone(), post.channel_id),
                Err(_) => return,
            },
            (None, None) => return,
        };
        let action = match event.event {
            LocalEventKind::Posted => "message",
            LocalEventKind::PostEdited => "edit",
            LocalEventKind::PostDeleted => "deletion",
            LocalEventKind::ReactionAdded | LocalEventKind::ReactionRemoved => "reaction",
        };
        debug!("reporting sync failure user_id={} error={}", user_id, err);
        self.notify(
            &user_id,
            &channel_id,
            &format!("Your {action} could not be delivered to Microsoft Teams. Please try again later."),
        )
        .await;
    }
}
