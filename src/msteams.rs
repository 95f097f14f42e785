use std::future::Future;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::RemoteConfig;
use crate::web::metrics::Metrics;

pub mod auth;
pub mod error;
pub mod models;
pub mod notifications;
pub mod resource;
pub mod upload;

pub use self::auth::TokenProvider;
pub use self::error::RemoteError;
pub use self::models::{
    MessageTarget, OutgoingMention, OutgoingMessage, RemoteAttachment, RemoteChat,
    RemoteChatMember, RemoteContainer, RemoteMention, RemoteMessage, RemoteReaction,
    RemoteSubscription, RemoteUser, ReplyReference, SubscriptionRequest, UploadedFile,
};
pub use self::notifications::{
    ChangeNotification, ContentDecryptor, DecryptError, EncryptedContent, NotificationBatch,
};
pub use self::resource::ResourceLocator;

use self::models::{GraphChat, GraphChatMessage, GraphCollection};

const PAGE_SIZE: u32 = 50;
const STREAM_CHANNEL_DEPTH: usize = 8;

/// Typed facade over the Graph endpoints the bridge needs. Every call takes
/// plain identifiers and returns domain types or a categorized error; retry
/// policy belongs to the caller.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn get_me(&self) -> Result<RemoteUser, RemoteError>;

    async fn get_user(&self, user_id: &str) -> Result<RemoteUser, RemoteError>;

    async fn get_chat(&self, chat_id: &str) -> Result<RemoteChat, RemoteError>;

    async fn create_or_get_chat(&self, user_ids: &[String]) -> Result<RemoteChat, RemoteError>;

    /// Posts a message. Channel replies go to the parent's reply thread;
    /// chat replies quote the parent.
    async fn send_message(
        &self,
        container: &RemoteContainer,
        message: &OutgoingMessage,
    ) -> Result<RemoteMessage, RemoteError>;

    async fn update_message(
        &self,
        target: &MessageTarget,
        message: &OutgoingMessage,
    ) -> Result<(), RemoteError>;

    async fn delete_message(&self, target: &MessageTarget) -> Result<(), RemoteError>;

    async fn get_message(&self, target: &MessageTarget) -> Result<RemoteMessage, RemoteError>;

    /// Messages (replies included) modified after `since`, oldest first.
    async fn list_messages_since(
        &self,
        container: &RemoteContainer,
        since: DateTime<Utc>,
    ) -> Result<Vec<RemoteMessage>, RemoteError>;

    async fn set_reaction(
        &self,
        target: &MessageTarget,
        user_id: &str,
        reaction: &str,
    ) -> Result<(), RemoteError>;

    async fn unset_reaction(
        &self,
        target: &MessageTarget,
        user_id: &str,
        reaction: &str,
    ) -> Result<(), RemoteError>;

    async fn upload_file(
        &self,
        container: &RemoteContainer,
        file_name: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<UploadedFile, RemoteError>;

    /// Size and pre-authenticated download URL of a shared file.
    async fn get_file_size_and_download_url(
        &self,
        web_url: &str,
    ) -> Result<(u64, String), RemoteError>;

    async fn get_file_content(&self, web_url: &str) -> Result<Vec<u8>, RemoteError>;

    /// Streams a download into `sink`. Failures are delivered on the
    /// channel as `TransportTransient` rather than returned.
    async fn stream_file_content(
        &self,
        download_url: &str,
        sink: mpsc::Sender<Result<Vec<u8>, RemoteError>>,
    );

    async fn get_hosted_content(&self, url: &str) -> Result<Vec<u8>, RemoteError>;

    async fn get_code_snippet(&self, url: &str) -> Result<String, RemoteError>;

    async fn list_subscriptions(&self) -> Result<Vec<RemoteSubscription>, RemoteError>;

    async fn create_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<RemoteSubscription, RemoteError>;

    async fn refresh_subscription(
        &self,
        subscription_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, RemoteError>;

    async fn delete_subscription(&self, subscription_id: &str) -> Result<(), RemoteError>;

    /// Drops cached credentials so the next call authenticates again.
    async fn force_reauthenticate(&self);
}

/// Downloads through [`RemoteApi::stream_file_content`], giving up as soon
/// as the content grows past `max_size`. Returns `None` when it does.
pub async fn download_bounded(
    remote: &dyn RemoteApi,
    download_url: &str,
    max_size: u64,
) -> Result<Option<Vec<u8>>, RemoteError> {
    let (tx, mut rx) = mpsc::channel(STREAM_CHANNEL_DEPTH);
    let stream = remote.stream_file_content(download_url, tx);
    let collect = async move {
        let mut content = Vec::new();
        while let Some(chunk) = rx.recv().await {
            content.extend_from_slice(&chunk?);
            if content.len() as u64 > max_size {
                return Ok(None);
            }
        }
        Ok::<_, RemoteError>(Some(content))
    };
    let ((), collected) = tokio::join!(stream, collect);
    collected
}

#[derive(Deserialize)]
struct DriveItemRef {
    size: Option<u64>,
    #[serde(rename = "@microsoft.graph.downloadUrl")]
    download_url: Option<String>,
}

pub struct GraphClient {
    http: reqwest::Client,
    tokens: TokenProvider,
    base_url: String,
    upload_chunk_size: usize,
    max_upload_range_retries: u32,
}

impl GraphClient {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("mattermost-bridge-msteams")
            .timeout(config.request_timeout())
            .build()
            .context("failed to construct HTTP client")?;

        Ok(Self {
            tokens: TokenProvider::new(http.clone(), config),
            http,
            base_url: config.graph_base_url.clone(),
            upload_chunk_size: config.upload_chunk_size,
            max_upload_range_retries: config.max_upload_range_retries,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Graph hands out absolute URLs (hosted contents, snippets); route
    /// them through the configured base so national clouds keep working.
    fn rebase(&self, url: &str) -> String {
        if url.starts_with(&self.base_url) {
            return url.to_string();
        }
        match url.find("/v1.0/") {
            Some(index) => self.url(&url[index + "/v1.0".len()..]),
            None => url.to_string(),
        }
    }

    async fn timed<T, F>(&self, method: &'static str, call: F) -> Result<T, RemoteError>
    where
        F: Future<Output = Result<T, RemoteError>>,
    {
        let started = Instant::now();
        let result = call.await;
        Metrics::observe_api_time(method, result.is_ok(), started.elapsed());
        if let Err(err) = &result {
            debug!("graph call failed method={} error={}", method, err);
        }
        result
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, RemoteError> {
        let mut reauthenticated = false;
        loop {
            let token = self.tokens.token().await?;
            let mut request = self
                .http
                .request(method.clone(), url)
                .bearer_auth(token.expose_secret());
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await.map_err(RemoteError::from_transport)?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            let headers = response.headers().clone();
            let text = response.text().await.unwrap_or_default();
            let err = RemoteError::from_status(status, &headers, &text);
            if err.is_unauthorized() && !reauthenticated {
                warn!(
                    "graph request unauthorized, reauthenticating method={} url={}",
                    method, url
                );
                self.tokens.invalidate().await;
                reauthenticated = true;
                continue;
            }
            return Err(err);
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, RemoteError> {
        let response = self.send(Method::GET, url, None).await?;
        response.json().await.map_err(RemoteError::from_transport)
    }

    async fn post_json<T: DeserializeOwned>(&self, url: &str, body: &Value) -> Result<T, RemoteError> {
        let response = self.send(Method::POST, url, Some(body)).await?;
        response.json().await.map_err(RemoteError::from_transport)
    }

    async fn send_empty(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<(), RemoteError> {
        self.send(method, url, body).await.map(|_| ())
    }

    async fn get_all<T: DeserializeOwned>(&self, first_url: String) -> Result<Vec<T>, RemoteError> {
        let mut items = Vec::new();
        let mut next = Some(first_url);
        while let Some(url) = next.take() {
            let page: GraphCollection<T> = self.get_json(&url).await?;
            items.extend(page.value);
            next = page.next_link;
        }
        Ok(items)
    }

    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        let response = self.send(Method::GET, url, None).await?;
        let bytes = response.bytes().await.map_err(RemoteError::from_transport)?;
        Ok(bytes.to_vec())
    }

    async fn download(&self, download_url: &str) -> Result<Vec<u8>, RemoteError> {
        let response = self
            .http
            .get(download_url)
            .send()
            .await
            .map_err(RemoteError::from_transport)?;
        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let text = response.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(status, &headers, &text));
        }
        let bytes = response.bytes().await.map_err(RemoteError::from_transport)?;
        Ok(bytes.to_vec())
    }

    fn reaction_body(user_id: &str, reaction: &str) -> Value {
        json!({
            "reactionType": reaction,
            "user": { "id": user_id },
        })
    }
}

#[async_trait]
impl RemoteApi for GraphClient {
    async fn get_me(&self) -> Result<RemoteUser, RemoteError> {
        self.timed("get_me", self.get_json(&self.url("/me"))).await
    }

    async fn get_user(&self, user_id: &str) -> Result<RemoteUser, RemoteError> {
        self.timed("get_user", self.get_json(&self.url(&format!("/users/{}", user_id))))
            .await
    }

    async fn get_chat(&self, chat_id: &str) -> Result<RemoteChat, RemoteError> {
        self.timed("get_chat", async {
            let raw: GraphChat = self
                .get_json(&self.url(&format!("/chats/{}?$expand=members", chat_id)))
                .await?;
            Ok(RemoteChat::from_graph(raw))
        })
        .await
    }

    async fn create_or_get_chat(&self, user_ids: &[String]) -> Result<RemoteChat, RemoteError> {
        self.timed("create_or_get_chat", async {
            let Some(first) = user_ids.first() else {
                return Err(RemoteError::BadRequest("chat needs at least one member".to_string()));
            };

            let existing: Vec<GraphChat> = self
                .get_all(self.url(&format!("/users/{}/chats?$expand=members", first)))
                .await?;
            if let Some(chat) = existing
                .into_iter()
                .map(RemoteChat::from_graph)
                .find(|chat| chat.has_exactly_members(user_ids))
            {
                return Ok(chat);
            }

            let chat_type = if user_ids.len() == 2 { "oneOnOne" } else { "group" };
            let members: Vec<Value> = user_ids
                .iter()
                .map(|id| {
                    json!({
                        "@odata.type": "#microsoft.graph.aadUserConversationMember",
                        "roles": ["owner"],
                        "user@odata.bind": format!("{}/users('{}')", self.base_url, id),
                    })
                })
                .collect();
            let raw: GraphChat = self
                .post_json(
                    &self.url("/chats"),
                    &json!({ "chatType": chat_type, "members": members }),
                )
                .await?;
            Ok(RemoteChat::from_graph(raw))
        })
        .await
    }

    async fn send_message(
        &self,
        container: &RemoteContainer,
        message: &OutgoingMessage,
    ) -> Result<RemoteMessage, RemoteError> {
        self.timed("send_message", async {
            let (path, quote_parent) = match (container, message.reply_to.as_ref()) {
                (RemoteContainer::Channel { .. }, Some(parent)) => (
                    format!("{}/messages/{}/replies", container.path(), parent.message_id),
                    false,
                ),
                (RemoteContainer::Channel { .. }, None) => {
                    (format!("{}/messages", container.path()), false)
                }
                (RemoteContainer::Chat { .. }, _) => {
                    (format!("{}/messages", container.path()), true)
                }
            };
            let raw: GraphChatMessage = self
                .post_json(&self.url(&path), &message.to_graph_body(quote_parent))
                .await?;
            Ok(RemoteMessage::from_graph(raw, container.clone()))
        })
        .await
    }

    async fn update_message(
        &self,
        target: &MessageTarget,
        message: &OutgoingMessage,
    ) -> Result<(), RemoteError> {
        self.timed(
            "update_message",
            self.send_empty(
                Method::PATCH,
                &self.url(&target.path()),
                Some(&message.to_graph_body(false)),
            ),
        )
        .await
    }

    async fn delete_message(&self, target: &MessageTarget) -> Result<(), RemoteError> {
        self.timed(
            "delete_message",
            self.send_empty(Method::DELETE, &self.url(&target.path()), None),
        )
        .await
    }

    async fn get_message(&self, target: &MessageTarget) -> Result<RemoteMessage, RemoteError> {
        self.timed("get_message", async {
            let raw: GraphChatMessage = self.get_json(&self.url(&target.path())).await?;
            Ok(RemoteMessage::from_graph(raw, target.container.clone()))
        })
        .await
    }

    async fn list_messages_since(
        &self,
        container: &RemoteContainer,
        since: DateTime<Utc>,
    ) -> Result<Vec<RemoteMessage>, RemoteError> {
        self.timed("list_messages_since", async {
            let first_url = match container {
                RemoteContainer::Channel { .. } => self.url(&format!(
                    "{}/messages?$top={}&$expand=replies",
                    container.path(),
                    PAGE_SIZE
                )),
                RemoteContainer::Chat { .. } => self.url(&format!(
                    "{}/messages?$top={}&$orderby=lastModifiedDateTime desc&$filter=lastModifiedDateTime gt {}",
                    container.path(),
                    PAGE_SIZE,
                    since.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
                )),
            };

            let raw: Vec<GraphChatMessage> = self.get_all(first_url).await?;
            let mut messages = Vec::new();
            for mut message in raw {
                let replies = message.replies.take().unwrap_or_default();
                messages.push(RemoteMessage::from_graph(message, container.clone()));
                messages.extend(
                    replies
                        .into_iter()
                        .map(|reply| RemoteMessage::from_graph(reply, container.clone())),
                );
            }
            messages.retain(|message| message.last_modified_at > since);
            messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            Ok(messages)
        })
        .await
    }

    async fn set_reaction(
        &self,
        target: &MessageTarget,
        user_id: &str,
        reaction: &str,
    ) -> Result<(), RemoteError> {
        let url = self.url(&format!("{}/setReaction", target.path()));
        let body = Self::reaction_body(user_id, reaction);
        self.timed("set_reaction", self.send_empty(Method::POST, &url, Some(&body)))
            .await
    }

    async fn unset_reaction(
        &self,
        target: &MessageTarget,
        user_id: &str,
        reaction: &str,
    ) -> Result<(), RemoteError> {
        let url = self.url(&format!("{}/unsetReaction", target.path()));
        let body = Self::reaction_body(user_id, reaction);
        self.timed("unset_reaction", self.send_empty(Method::POST, &url, Some(&body)))
            .await
    }

    async fn upload_file(
        &self,
        container: &RemoteContainer,
        file_name: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<UploadedFile, RemoteError> {
        self.timed(
            "upload_file",
            self.upload_chunked(container, file_name, content_type, &data),
        )
        .await
    }

    async fn get_file_size_and_download_url(
        &self,
        web_url: &str,
    ) -> Result<(u64, String), RemoteError> {
        self.timed("get_file_size_and_download_url", async {
            let share_id = resource::encode_share_id(web_url);
            let item: DriveItemRef = self
                .get_json(&self.url(&format!("/shares/{}/driveItem", share_id)))
                .await?;
            let download_url = item.download_url.ok_or_else(|| {
                RemoteError::NotFound(format!("no download url for web_url={}", web_url))
            })?;
            Ok((item.size.unwrap_or_default(), download_url))
        })
        .await
    }

    async fn get_file_content(&self, web_url: &str) -> Result<Vec<u8>, RemoteError> {
        let (_, download_url) = self.get_file_size_and_download_url(web_url).await?;
        self.timed("get_file_content", self.download(&download_url)).await
    }

    async fn stream_file_content(
        &self,
        download_url: &str,
        sink: mpsc::Sender<Result<Vec<u8>, RemoteError>>,
    ) {
        let started = Instant::now();
        let response = match self.http.get(download_url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                let status = response.status();
                let _ = sink
                    .send(Err(RemoteError::TransportTransient(format!(
                        "download failed status={}",
                        status
                    ))))
                    .await;
                Metrics::observe_api_time("stream_file_content", false, started.elapsed());
                return;
            }
            Err(err) => {
                let _ = sink
                    .send(Err(RemoteError::TransportTransient(err.to_string())))
                    .await;
                Metrics::observe_api_time("stream_file_content", false, started.elapsed());
                return;
            }
        };

        let mut response = response;
        let mut success = true;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if sink.send(Ok(chunk.to_vec())).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    success = false;
                    let _ = sink
                        .send(Err(RemoteError::TransportTransient(err.to_string())))
                        .await;
                    break;
                }
            }
        }
        Metrics::observe_api_time("stream_file_content", success, started.elapsed());
    }

    async fn get_hosted_content(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        self.timed("get_hosted_content", self.get_bytes(&self.rebase(url)))
            .await
    }

    async fn get_code_snippet(&self, url: &str) -> Result<String, RemoteError> {
        self.timed("get_code_snippet", async {
            let bytes = self.get_bytes(&self.rebase(url)).await?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        })
        .await
    }

    async fn list_subscriptions(&self) -> Result<Vec<RemoteSubscription>, RemoteError> {
        self.timed("list_subscriptions", self.get_all(self.url("/subscriptions")))
            .await
    }

    async fn create_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<RemoteSubscription, RemoteError> {
        self.timed(
            "create_subscription",
            self.post_json(&self.url("/subscriptions"), &request.to_graph_body()),
        )
        .await
    }

    async fn refresh_subscription(
        &self,
        subscription_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, RemoteError> {
        self.timed("refresh_subscription", async {
            let body = json!({ "expirationDateTime": expires_at.to_rfc3339() });
            let response = self
                .send(
                    Method::PATCH,
                    &self.url(&format!("/subscriptions/{}", subscription_id)),
                    Some(&body),
                )
                .await?;
            let updated: Option<RemoteSubscription> = response.json().await.ok();
            Ok(updated.map(|sub| sub.expires_at).unwrap_or(expires_at))
        })
        .await
    }

    async fn delete_subscription(&self, subscription_id: &str) -> Result<(), RemoteError> {
        self.timed(
            "delete_subscription",
            self.send_empty(
                Method::DELETE,
                &self.url(&format!("/subscriptions/{}", subscription_id)),
                None,
            ),
        )
        .await
    }

    async fn force_reauthenticate(&self) {
        self.tokens.invalidate().await;
    }
}
