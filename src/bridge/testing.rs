//! In-memory stand-ins for both servers plus a harness wiring them to an
//! in-memory store.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::dispatcher::Dispatcher;
use super::engine::SyncEngine;
use super::message_flow::MessageFlow;
use super::queue::{ChangeQueue, LinkLocks};
use super::subscriptions::SubscriptionManager;
use super::user_sync::UserSyncHandler;
use crate::config::{Config, test_config};
use crate::db::{ConversationLink, DatabaseManager, LinkKind, UserCorrespondence};
use crate::mattermost::{
    LocalApi, LocalChannel, LocalError, LocalFileInfo, LocalPost, LocalReaction, LocalUser,
    NewPost, NewUser,
};
use crate::msteams::{
    MessageTarget, OutgoingMessage, RemoteApi, RemoteChat, RemoteContainer, RemoteError,
    RemoteMessage, RemoteReaction, RemoteSubscription, RemoteUser, SubscriptionRequest,
    UploadedFile,
};

pub(crate) const TEAM: &str = "T1";
pub(crate) const CHANNEL: &str = "C1";
pub(crate) const LOCAL_CHANNEL: &str = "town-square";

static IDS: AtomicU64 = AtomicU64::new(1);

fn next_id(prefix: &str) -> String {
    format!("{prefix}{}", IDS.fetch_add(1, Ordering::Relaxed))
}

pub(crate) fn channel() -> RemoteContainer {
    RemoteContainer::channel(TEAM, CHANNEL)
}

/// A plain user message as Graph would return it.
pub(crate) fn remote_message(container: RemoteContainer, id: &str, user_id: &str, html: &str) -> RemoteMessage {
    let now = Utc::now();
    RemoteMessage {
        id: id.to_string(),
        container,
        reply_to_id: None,
        user_id: Some(user_id.to_string()),
        user_display_name: None,
        application_id: None,
        body: html.to_string(),
        body_is_html: true,
        subject: None,
        message_type: "message".to_string(),
        attachments: Vec::new(),
        mentions: Vec::new(),
        reactions: Vec::new(),
        created_at: now,
        last_modified_at: now,
        deleted_at: None,
    }
}

pub(crate) fn local_post(id: &str, channel_id: &str, user_id: &str, message: &str) -> LocalPost {
    LocalPost {
        id: id.to_string(),
        channel_id: channel_id.to_string(),
        user_id: user_id.to_string(),
        message: message.to_string(),
        create_at: Utc::now().timestamp_millis(),
        ..Default::default()
    }
}

fn message_key(container: &RemoteContainer, id: &str) -> String {
    format!("{}/{}", container.key(), id)
}

#[derive(Default)]
struct RemoteState {
    users: HashMap<String, RemoteUser>,
    messages: Vec<RemoteMessage>,
    sent: Vec<(RemoteContainer, OutgoingMessage)>,
    updates: Vec<(MessageTarget, OutgoingMessage)>,
    deletes: Vec<MessageTarget>,
    reactions: Vec<(String, String, String, bool)>,
    files: HashMap<String, Vec<u8>>,
    uploads: Vec<String>,
    subscriptions: Vec<RemoteSubscription>,
    failures: HashMap<&'static str, VecDeque<RemoteError>>,
    reauthentications: usize,
    get_message_calls: usize,
}

/// Graph double. Messages are kept in insertion order; sends are recorded
/// and also become readable messages.
#[derive(Default)]
pub(crate) struct FakeRemote {
    state: Mutex<RemoteState>,
}

impl FakeRemote {
    pub fn add_user(&self, user: RemoteUser) {
        self.state.lock().users.insert(user.id.clone(), user);
    }

    pub fn add_message(&self, message: RemoteMessage) {
        let mut state = self.state.lock();
        let key = message_key(&message.container, &message.id);
        state
            .messages
            .retain(|existing| message_key(&existing.container, &existing.id) != key);
        state.messages.push(message);
    }

    pub fn add_file(&self, url: &str, data: Vec<u8>) {
        self.state.lock().files.insert(url.to_string(), data);
    }

    /// The next call to `operation` fails with `err`.
    pub fn fail_next(&self, operation: &'static str, err: RemoteError) {
        self.state
            .lock()
            .failures
            .entry(operation)
            .or_default()
            .push_back(err);
    }

    pub fn sent(&self) -> Vec<(RemoteContainer, OutgoingMessage)> {
        self.state.lock().sent.clone()
    }

    pub fn updates(&self) -> Vec<(MessageTarget, OutgoingMessage)> {
        self.state.lock().updates.clone()
    }

    pub fn deletes(&self) -> Vec<MessageTarget> {
        self.state.lock().deletes.clone()
    }

    /// `(message_id, user_id, reaction, set)` per call.
    pub fn reactions(&self) -> Vec<(String, String, String, bool)> {
        self.state.lock().reactions.clone()
    }

    pub fn uploads(&self) -> Vec<String> {
        self.state.lock().uploads.clone()
    }

    pub fn subscriptions(&self) -> Vec<RemoteSubscription> {
        self.state.lock().subscriptions.clone()
    }

    /// Drops a subscription behind the bridge's back.
    pub fn remove_subscription(&self, subscription_id: &str) {
        self.state
            .lock()
            .subscriptions
            .retain(|subscription| subscription.id != subscription_id);
    }

    pub fn expire_subscription(&self, subscription_id: &str, expires_at: DateTime<Utc>) {
        for subscription in self.state.lock().subscriptions.iter_mut() {
            if subscription.id == subscription_id {
                subscription.expires_at = expires_at;
            }
        }
    }

    pub fn reauthentications(&self) -> usize {
        self.state.lock().reauthentications
    }

    pub fn get_message_calls(&self) -> usize {
        self.state.lock().get_message_calls
    }

    fn take_failure(&self, operation: &'static str) -> Result<(), RemoteError> {
        match self
            .state
            .lock()
            .failures
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn get_me(&self) -> Result<RemoteUser, RemoteError> {
        self.take_failure("get_me")?;
        Ok(RemoteUser {
            id: "r-bridge".to_string(),
            display_name: Some("Bridge".to_string()),
            ..Default::default()
        })
    }

    async fn get_user(&self, user_id: &str) -> Result<RemoteUser, RemoteError> {
        self.take_failure("get_user")?;
        self.state
            .lock()
            .users
            .get(user_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("user {user_id}")))
    }

    async fn get_chat(&self, chat_id: &str) -> Result<RemoteChat, RemoteError> {
        self.take_failure("get_chat")?;
        Ok(RemoteChat {
            id: chat_id.to_string(),
            chat_type: "group".to_string(),
            topic: None,
            members: Vec::new(),
        })
    }

    async fn create_or_get_chat(&self, user_ids: &[String]) -> Result<RemoteChat, RemoteError> {
        self.take_failure("create_or_get_chat")?;
        Ok(RemoteChat {
            id: format!("chat-{}", user_ids.join("-")),
            chat_type: if user_ids.len() == 2 { "oneOnOne" } else { "group" }.to_string(),
            topic: None,
            members: Vec::new(),
        })
    }

    async fn send_message(
        &self,
        container: &RemoteContainer,
        message: &OutgoingMessage,
    ) -> Result<RemoteMessage, RemoteError> {
        self.take_failure("send_message")?;
        let mut sent = remote_message(container.clone(), &next_id("r-sent-"), "r-bridge", &message.html);
        sent.user_id = None;
        sent.application_id = Some("client".to_string());
        if !container.is_chat() {
            sent.reply_to_id = message.reply_to.as_ref().map(|reply| reply.message_id.clone());
        }
        let mut state = self.state.lock();
        state.sent.push((container.clone(), message.clone()));
        state.messages.push(sent.clone());
        Ok(sent)
    }

    async fn update_message(
        &self,
        target: &MessageTarget,
        message: &OutgoingMessage,
    ) -> Result<(), RemoteError> {
        self.take_failure("update_message")?;
        self.state.lock().updates.push((target.clone(), message.clone()));
        Ok(())
    }

    async fn delete_message(&self, target: &MessageTarget) -> Result<(), RemoteError> {
        self.take_failure("delete_message")?;
        self.state.lock().deletes.push(target.clone());
        Ok(())
    }

    async fn get_message(&self, target: &MessageTarget) -> Result<RemoteMessage, RemoteError> {
        self.state.lock().get_message_calls += 1;
        self.take_failure("get_message")?;
        let key = message_key(&target.container, &target.message_id);
        self.state
            .lock()
            .messages
            .iter()
            .find(|message| message_key(&message.container, &message.id) == key)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("message {key}")))
    }

    async fn list_messages_since(
        &self,
        container: &RemoteContainer,
        since: DateTime<Utc>,
    ) -> Result<Vec<RemoteMessage>, RemoteError> {
        self.take_failure("list_messages_since")?;
        let mut messages: Vec<RemoteMessage> = self
            .state
            .lock()
            .messages
            .iter()
            .filter(|message| &message.container == container && message.last_modified_at > since)
            .cloned()
            .collect();
        messages.sort_by_key(|message| message.last_modified_at);
        Ok(messages)
    }

    async fn set_reaction(
        &self,
        target: &MessageTarget,
        user_id: &str,
        reaction: &str,
    ) -> Result<(), RemoteError> {
        self.take_failure("set_reaction")?;
        self.state.lock().reactions.push((
            target.message_id.clone(),
            user_id.to_string(),
            reaction.to_string(),
            true,
        ));
        Ok(())
    }

    async fn unset_reaction(
        &self,
        target: &MessageTarget,
        user_id: &str,
        reaction: &str,
    ) -> Result<(), RemoteError> {
        self.take_failure("unset_reaction")?;
        self.state.lock().reactions.push((
            target.message_id.clone(),
            user_id.to_string(),
            reaction.to_string(),
            false,
        ));
        Ok(())
    }

    async fn upload_file(
        &self,
        _container: &RemoteContainer,
        file_name: &str,
        content_type: &str,
        _data: Vec<u8>,
    ) -> Result<UploadedFile, RemoteError> {
        self.take_failure("upload_file")?;
        self.state.lock().uploads.push(file_name.to_string());
        Ok(UploadedFile {
            id: next_id("drive-"),
            name: file_name.to_string(),
            content_url: format!("https://files.example.com/{file_name}"),
            content_type: content_type.to_string(),
        })
    }

    async fn get_file_size_and_download_url(
        &self,
        web_url: &str,
    ) -> Result<(u64, String), RemoteError> {
        self.take_failure("get_file_size_and_download_url")?;
        let size = self
            .state
            .lock()
            .files
            .get(web_url)
            .map(|data| data.len() as u64)
            .ok_or_else(|| RemoteError::NotFound(format!("file {web_url}")))?;
        Ok((size, web_url.to_string()))
    }

    async fn get_file_content(&self, web_url: &str) -> Result<Vec<u8>, RemoteError> {
        self.take_failure("get_file_content")?;
        self.state
            .lock()
            .files
            .get(web_url)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("file {web_url}")))
    }

    async fn stream_file_content(
        &self,
        download_url: &str,
        sink: mpsc::Sender<Result<Vec<u8>, RemoteError>>,
    ) {
        let data = self.state.lock().files.get(download_url).cloned();
        let chunk = data.ok_or_else(|| RemoteError::TransportTransient(format!("file {download_url}")));
        let _ = sink.send(chunk).await;
    }

    async fn get_hosted_content(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        self.get_file_content(url).await
    }

    async fn get_code_snippet(&self, url: &str) -> Result<String, RemoteError> {
        let data = self.get_file_content(url).await?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    async fn list_subscriptions(&self) -> Result<Vec<RemoteSubscription>, RemoteError> {
        self.take_failure("list_subscriptions")?;
        Ok(self.state.lock().subscriptions.clone())
    }

    async fn create_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<RemoteSubscription, RemoteError> {
        self.take_failure("create_subscription")?;
        let subscription = RemoteSubscription {
            id: next_id("sub-"),
            resource: request.resource.clone(),
            change_type: request.change_type.clone(),
            notification_url: request.notification_url.clone(),
            lifecycle_notification_url: Some(request.lifecycle_notification_url.clone()),
            client_state: Some(request.client_state.clone()),
            expires_at: request.expires_at,
        };
        self.state.lock().subscriptions.push(subscription.clone());
        Ok(subscription)
    }

    async fn refresh_subscription(
        &self,
        subscription_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, RemoteError> {
        self.take_failure("refresh_subscription")?;
        let mut state = self.state.lock();
        let subscription = state
            .subscriptions
            .iter_mut()
            .find(|subscription| subscription.id == subscription_id)
            .ok_or_else(|| RemoteError::NotFound(format!("subscription {subscription_id}")))?;
        subscription.expires_at = expires_at;
        Ok(expires_at)
    }

    async fn delete_subscription(&self, subscription_id: &str) -> Result<(), RemoteError> {
        self.take_failure("delete_subscription")?;
        self.remove_subscription(subscription_id);
        Ok(())
    }

    async fn force_reauthenticate(&self) {
        self.state.lock().reauthentications += 1;
    }
}

#[derive(Default)]
struct LocalState {
    posts: Vec<LocalPost>,
    users: HashMap<String, LocalUser>,
    channels: HashMap<String, LocalChannel>,
    reactions: Vec<LocalReaction>,
    files: HashMap<String, (LocalFileInfo, Vec<u8>)>,
    ephemeral: Vec<(String, String, String)>,
    updates: usize,
    failures: HashMap<&'static str, VecDeque<LocalError>>,
    stalls: HashMap<&'static str, VecDeque<Duration>>,
}

/// Local server double.
#[derive(Default)]
pub(crate) struct FakeLocal {
    state: Mutex<LocalState>,
}

impl FakeLocal {
    pub fn add_user(&self, id: &str, username: &str, email: &str) {
        self.state.lock().users.insert(
            id.to_string(),
            LocalUser {
                id: id.to_string(),
                username: username.to_string(),
                email: email.to_string(),
                ..Default::default()
            },
        );
    }

    pub fn add_channel(&self, id: &str, channel_type: &str) {
        self.state.lock().channels.insert(
            id.to_string(),
            LocalChannel {
                id: id.to_string(),
                team_id: "team".to_string(),
                channel_type: channel_type.to_string(),
                name: id.to_string(),
                display_name: id.to_string(),
            },
        );
    }

    pub fn add_post(&self, post: LocalPost) {
        let mut state = self.state.lock();
        state.posts.retain(|existing| existing.id != post.id);
        state.posts.push(post);
    }

    pub fn add_file(&self, id: &str, name: &str, data: Vec<u8>) {
        let info = LocalFileInfo {
            id: id.to_string(),
            name: name.to_string(),
            size: data.len() as u64,
            mime_type: String::new(),
        };
        self.state.lock().files.insert(id.to_string(), (info, data));
    }

    pub fn add_local_reaction(&self, user_id: &str, post_id: &str, emoji_name: &str) {
        self.state.lock().reactions.push(LocalReaction {
            user_id: user_id.to_string(),
            post_id: post_id.to_string(),
            emoji_name: emoji_name.to_string(),
            create_at: Utc::now().timestamp_millis(),
        });
    }

    pub fn fail_next(&self, operation: &'static str, err: LocalError) {
        self.state
            .lock()
            .failures
            .entry(operation)
            .or_default()
            .push_back(err);
    }

    /// Makes the next call of `operation` take `delay` before it succeeds.
    pub fn stall_next(&self, operation: &'static str, delay: Duration) {
        self.state
            .lock()
            .stalls
            .entry(operation)
            .or_default()
            .push_back(delay);
    }

    pub fn user(&self, id: &str) -> Option<LocalUser> {
        self.state.lock().users.get(id).cloned()
    }

    pub fn post(&self, id: &str) -> Option<LocalPost> {
        self.state.lock().posts.iter().find(|post| post.id == id).cloned()
    }

    /// Live (undeleted) posts in creation order.
    pub fn posts(&self) -> Vec<LocalPost> {
        self.state
            .lock()
            .posts
            .iter()
            .filter(|post| post.delete_at == 0)
            .cloned()
            .collect()
    }

    pub fn reactions_on(&self, post_id: &str) -> Vec<LocalReaction> {
        self.state
            .lock()
            .reactions
            .iter()
            .filter(|reaction| reaction.post_id == post_id)
            .cloned()
            .collect()
    }

    pub fn update_count(&self) -> usize {
        self.state.lock().updates
    }

    pub fn ephemeral(&self) -> Vec<(String, String, String)> {
        self.state.lock().ephemeral.clone()
    }

    async fn stall(&self, operation: &'static str) {
        let delay = self
            .state
            .lock()
            .stalls
            .get_mut(operation)
            .and_then(VecDeque::pop_front);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn take_failure(&self, operation: &'static str) -> Result<(), LocalError> {
        match self
            .state
            .lock()
            .failures
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl LocalApi for FakeLocal {
    async fn create_post(&self, post: &NewPost) -> Result<LocalPost, LocalError> {
        self.take_failure("create_post")?;
        self.stall("create_post").await;
        let now = Utc::now().timestamp_millis();
        let created = LocalPost {
            id: next_id("p-"),
            channel_id: post.channel_id.clone(),
            user_id: post.user_id.clone(),
            root_id: post.root_id.clone().unwrap_or_default(),
            message: post.message.clone(),
            file_ids: post.file_ids.clone(),
            create_at: now,
            update_at: now,
            ..Default::default()
        };
        self.state.lock().posts.push(created.clone());
        Ok(created)
    }

    async fn update_post(
        &self,
        _user_id: &str,
        post_id: &str,
        message: &str,
    ) -> Result<LocalPost, LocalError> {
        self.take_failure("update_post")?;
        let mut state = self.state.lock();
        state.updates += 1;
        let post = state
            .posts
            .iter_mut()
            .find(|post| post.id == post_id)
            .ok_or_else(|| LocalError::NotFound(format!("post {post_id}")))?;
        post.message = message.to_string();
        post.edit_at = Utc::now().timestamp_millis();
        Ok(post.clone())
    }

    async fn delete_post(&self, post_id: &str) -> Result<(), LocalError> {
        self.take_failure("delete_post")?;
        let mut state = self.state.lock();
        let post = state
            .posts
            .iter_mut()
            .find(|post| post.id == post_id)
            .ok_or_else(|| LocalError::NotFound(format!("post {post_id}")))?;
        post.delete_at = Utc::now().timestamp_millis();
        Ok(())
    }

    async fn get_post(&self, post_id: &str) -> Result<LocalPost, LocalError> {
        self.take_failure("get_post")?;
        self.post(post_id)
            .ok_or_else(|| LocalError::NotFound(format!("post {post_id}")))
    }

    async fn get_reactions(&self, post_id: &str) -> Result<Vec<LocalReaction>, LocalError> {
        self.take_failure("get_reactions")?;
        Ok(self.reactions_on(post_id))
    }

    async fn add_reaction(
        &self,
        user_id: &str,
        post_id: &str,
        emoji_name: &str,
    ) -> Result<(), LocalError> {
        self.take_failure("add_reaction")?;
        self.add_local_reaction(user_id, post_id, emoji_name);
        Ok(())
    }

    async fn remove_reaction(
        &self,
        user_id: &str,
        post_id: &str,
        emoji_name: &str,
    ) -> Result<(), LocalError> {
        self.take_failure("remove_reaction")?;
        self.state.lock().reactions.retain(|reaction| {
            !(reaction.user_id == user_id
                && reaction.post_id == post_id
                && reaction.emoji_name == emoji_name)
        });
        Ok(())
    }

    async fn upload_file(
        &self,
        _user_id: &str,
        _channel_id: &str,
        file_name: &str,
        data: Vec<u8>,
    ) -> Result<LocalFileInfo, LocalError> {
        self.take_failure("upload_file")?;
        let id = next_id("f-");
        self.add_file(&id, file_name, data);
        self.get_file_info(&id).await
    }

    async fn get_file(&self, file_id: &str) -> Result<Vec<u8>, LocalError> {
        self.state
            .lock()
            .files
            .get(file_id)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| LocalError::NotFound(format!("file {file_id}")))
    }

    async fn get_file_info(&self, file_id: &str) -> Result<LocalFileInfo, LocalError> {
        self.state
            .lock()
            .files
            .get(file_id)
            .map(|(info, _)| info.clone())
            .ok_or_else(|| LocalError::NotFound(format!("file {file_id}")))
    }

    async fn get_user(&self, user_id: &str) -> Result<LocalUser, LocalError> {
        self.user(user_id)
            .ok_or_else(|| LocalError::NotFound(format!("user {user_id}")))
    }

    async fn get_user_by_email(&self, email: &str) -> Result<LocalUser, LocalError> {
        self.state
            .lock()
            .users
            .values()
            .find(|user| user.email.eq_ignore_ascii_case(email))
            .cloned()
            .ok_or_else(|| LocalError::NotFound(format!("email {email}")))
    }

    async fn get_user_by_username(&self, username: &str) -> Result<LocalUser, LocalError> {
        self.state
            .lock()
            .users
            .values()
            .find(|user| user.username == username)
            .cloned()
            .ok_or_else(|| LocalError::NotFound(format!("username {username}")))
    }

    async fn create_user(&self, user: &NewUser) -> Result<LocalUser, LocalError> {
        self.take_failure("create_user")?;
        let mut state = self.state.lock();
        if state.users.values().any(|existing| existing.username == user.username) {
            return Err(LocalError::BadRequest(
                "status=400 body=store.sql_user.save.username_exists.app_error".to_string(),
            ));
        }
        let created = LocalUser {
            id: next_id("u-"),
            username: user.username.clone(),
            email: user.email.clone(),
            first_name: user.first_name.clone(),
            nickname: user.nickname.clone(),
            ..Default::default()
        };
        state.users.insert(created.id.clone(), created.clone());
        Ok(created)
    }

    async fn get_channel(&self, channel_id: &str) -> Result<LocalChannel, LocalError> {
        self.state
            .lock()
            .channels
            .get(channel_id)
            .cloned()
            .ok_or_else(|| LocalError::NotFound(format!("channel {channel_id}")))
    }

    async fn send_ephemeral_post(
        &self,
        user_id: &str,
        channel_id: &str,
        message: &str,
    ) -> Result<(), LocalError> {
        self.state.lock().ephemeral.push((
            user_id.to_string(),
            channel_id.to_string(),
            message.to_string(),
        ));
        Ok(())
    }
}

/// Both fakes, an in-memory store and the test configuration.
pub(crate) struct Harness {
    pub config: Arc<Config>,
    pub db: Arc<DatabaseManager>,
    pub remote: Arc<FakeRemote>,
    pub local: Arc<FakeLocal>,
    pub queue: Arc<ChangeQueue>,
    pub locks: Arc<LinkLocks>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let mut config = test_config();
        config.limits.retry_base_delay_ms = 1;
        config.limits.vanished_retry_delay_ms = 1;
        adjust(&mut config);
        let queue = Arc::new(ChangeQueue::new(config.queue.queue_capacity));
        let local = Arc::new(FakeLocal::default());
        local.add_user(&config.local.bot_user_id, "msteams", "bot@example.com");
        local.add_channel(LOCAL_CHANNEL, "O");
        Self {
            config: Arc::new(config),
            db: Arc::new(DatabaseManager::new_in_memory()),
            remote: Arc::new(FakeRemote::default()),
            local,
            queue,
            locks: Arc::new(LinkLocks::new()),
        }
    }

    fn remote_api(&self) -> Arc<dyn RemoteApi> {
        self.remote.clone()
    }

    fn local_api(&self) -> Arc<dyn LocalApi> {
        self.local.clone()
    }

    pub fn user_sync(&self) -> UserSyncHandler {
        UserSyncHandler::new(
            self.db.clone(),
            self.local_api(),
            self.remote_api(),
            self.config.clone(),
        )
    }

    pub fn engine(&self) -> Arc<SyncEngine> {
        let users = Arc::new(self.user_sync());
        let flow = Arc::new(MessageFlow::new(
            self.remote_api(),
            self.local_api(),
            self.config.clone(),
        ));
        Arc::new(SyncEngine::new(
            self.config.clone(),
            self.db.clone(),
            self.remote_api(),
            self.local_api(),
            users,
            flow,
            self.locks.clone(),
        ))
    }

    pub fn dispatcher(&self, engine: Arc<SyncEngine>) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            self.config.clone(),
            self.queue.clone(),
            engine,
            self.locks.clone(),
            Arc::new(tokio::sync::Notify::new()),
        ))
    }

    pub fn subscriptions(&self) -> Arc<SubscriptionManager> {
        Arc::new(SubscriptionManager::new(
            self.config.clone(),
            self.db.clone(),
            self.remote_api(),
            Arc::new(self.user_sync()),
        ))
    }

    pub async fn link_user(&self, local_user_id: &str, remote_user_id: &str) {
        self.db
            .user_store()
            .link_user(UserCorrespondence::new(local_user_id, remote_user_id, false))
            .await
            .expect("user link stored");
    }

    /// Links the default local channel to the default remote channel.
    pub async fn link_channel(&self) -> ConversationLink {
        let mut link = ConversationLink::new(LOCAL_CHANNEL, channel(), LinkKind::Channel, "admin");
        link.created_at = Utc::now() - ChronoDuration::hours(1);
        self.db
            .link_store()
            .create_link(&link)
            .await
            .expect("link stored");
        link
    }

    pub async fn link_chat(&self, local_channel_id: &str, chat_id: &str) -> ConversationLink {
        self.local.add_channel(local_channel_id, "D");
        let mut link = ConversationLink::new(
            local_channel_id,
            RemoteContainer::chat(chat_id),
            LinkKind::DirectChat,
            "admin",
        );
        link.created_at = Utc::now() - ChronoDuration::hours(1);
        self.db
            .link_store()
            .create_link(&link)
            .await
            .expect("link stored");
        link
    }

    pub fn reaction(user_id: &str, reaction_type: &str) -> RemoteReaction {
        RemoteReaction {
            user_id: user_id.to_string(),
            reaction_type: reaction_type.to_string(),
        }
    }
}
