use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const CONTENT_TYPE_CODE_SNIPPET: &str = "application/vnd.microsoft.card.codesnippet";
pub const CONTENT_TYPE_MESSAGE_REFERENCE: &str = "messageReference";
pub const CONTENT_TYPE_REFERENCE: &str = "reference";

/// A remote conversation: a channel inside a team, or a chat.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteContainer {
    Channel { team_id: String, channel_id: String },
    Chat { chat_id: String },
}

impl RemoteContainer {
    pub fn channel(team_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        RemoteContainer::Channel {
            team_id: team_id.into(),
            channel_id: channel_id.into(),
        }
    }

    pub fn chat(chat_id: impl Into<String>) -> Self {
        RemoteContainer::Chat {
            chat_id: chat_id.into(),
        }
    }

    /// Stable key used in store keys and as the dispatcher lane.
    pub fn key(&self) -> String {
        match self {
            RemoteContainer::Channel {
                team_id,
                channel_id,
            } => format!("{}/{}", team_id, channel_id),
            RemoteContainer::Chat { chat_id } => chat_id.clone(),
        }
    }

    pub fn is_chat(&self) -> bool {
        matches!(self, RemoteContainer::Chat { .. })
    }

    pub(crate) fn path(&self) -> String {
        match self {
            RemoteContainer::Channel {
                team_id,
                channel_id,
            } => format!("/teams/{}/channels/{}", team_id, channel_id),
            RemoteContainer::Chat { chat_id } => format!("/chats/{}", chat_id),
        }
    }
}

/// Addresses one message. Channel replies carry their thread root as
/// `parent_id`; chat messages never do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTarget {
    pub container: RemoteContainer,
    pub parent_id: Option<String>,
    pub message_id: String,
}

impl MessageTarget {
    pub fn new(container: RemoteContainer, message_id: impl Into<String>) -> Self {
        Self {
            container,
            parent_id: None,
            message_id: message_id.into(),
        }
    }

    pub fn reply(
        container: RemoteContainer,
        parent_id: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Self {
        Self {
            container,
            parent_id: Some(parent_id.into()),
            message_id: message_id.into(),
        }
    }

    pub(crate) fn path(&self) -> String {
        let base = self.container.path();
        match (&self.container, self.parent_id.as_deref()) {
            (RemoteContainer::Channel { .. }, Some(parent)) if parent != self.message_id => {
                format!("{}/messages/{}/replies/{}", base, parent, self.message_id)
            }
            _ => format!("{}/messages/{}", base, self.message_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAttachment {
    pub id: Option<String>,
    pub content_type: String,
    pub content: Option<String>,
    pub content_url: Option<String>,
    pub name: Option<String>,
}

impl RemoteAttachment {
    /// Message id carried by a `messageReference` attachment.
    pub fn referenced_message_id(&self) -> Option<String> {
        if self.content_type != CONTENT_TYPE_MESSAGE_REFERENCE {
            return None;
        }
        let content: Value = serde_json::from_str(self.content.as_deref()?).ok()?;
        content
            .get("messageId")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .or_else(|| self.id.clone())
    }

    /// `(language, snippet url)` of a code snippet card.
    pub fn code_snippet(&self) -> Option<(String, String)> {
        if self.content_type != CONTENT_TYPE_CODE_SNIPPET {
            return None;
        }
        let content: Value = serde_json::from_str(self.content.as_deref()?).ok()?;
        let url = content.get("codeSnippetUrl").and_then(Value::as_str)?;
        let language = content
            .get("language")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Some((language.to_string(), url.to_string()))
    }

    pub fn is_file(&self) -> bool {
        self.content_type == CONTENT_TYPE_REFERENCE && self.content_url.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMention {
    pub id: i64,
    pub text: String,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteReaction {
    pub user_id: String,
    pub reaction_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub id: String,
    pub container: RemoteContainer,
    pub reply_to_id: Option<String>,
    pub user_id: Option<String>,
    pub user_display_name: Option<String>,
    pub application_id: Option<String>,
    pub body: String,
    pub body_is_html: bool,
    pub subject: Option<String>,
    pub message_type: String,
    pub attachments: Vec<RemoteAttachment>,
    pub mentions: Vec<RemoteMention>,
    pub reactions: Vec<RemoteReaction>,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl RemoteMessage {
    pub(crate) fn from_graph(raw: GraphChatMessage, container: RemoteContainer) -> Self {
        let now = Utc::now();
        let (user_id, user_display_name, application_id) = match raw.from {
            Some(from) => {
                let user = from.user.unwrap_or_default();
                (
                    user.id,
                    user.display_name,
                    from.application.and_then(|app| app.id),
                )
            }
            None => (None, None, None),
        };
        let body = raw.body.unwrap_or_default();
        let created_at = raw.created_date_time.unwrap_or(now);

        RemoteMessage {
            id: raw.id,
            container,
            reply_to_id: raw.reply_to_id.filter(|id| !id.is_empty()),
            user_id,
            user_display_name,
            application_id,
            body_is_html: body
                .content_type
                .as_deref()
                .is_none_or(|kind| kind.eq_ignore_ascii_case("html")),
            body: body.content.unwrap_or_default(),
            subject: raw.subject.filter(|subject| !subject.is_empty()),
            message_type: raw.message_type.unwrap_or_else(|| "message".to_string()),
            attachments: raw
                .attachments
                .unwrap_or_default()
                .into_iter()
                .map(|attachment| RemoteAttachment {
                    id: attachment.id,
                    content_type: attachment.content_type.unwrap_or_default(),
                    content: attachment.content,
                    content_url: attachment.content_url,
                    name: attachment.name,
                })
                .collect(),
            mentions: raw
                .mentions
                .unwrap_or_default()
                .into_iter()
                .filter_map(|mention| {
                    Some(RemoteMention {
                        id: mention.id,
                        text: mention.mention_text?,
                        user_id: mention.mentioned.and_then(|m| m.user).and_then(|u| u.id),
                    })
                })
                .collect(),
            reactions: raw
                .reactions
                .unwrap_or_default()
                .into_iter()
                .filter_map(|reaction| {
                    Some(RemoteReaction {
                        user_id: reaction.user?.user?.id?,
                        reaction_type: reaction.reaction_type,
                    })
                })
                .collect(),
            created_at,
            last_modified_at: raw.last_modified_date_time.unwrap_or(created_at),
            deleted_at: raw.deleted_date_time,
        }
    }

    /// Thread parent: the channel reply root, or the message a chat
    /// message quotes through a `messageReference` attachment.
    pub fn parent_id(&self) -> Option<String> {
        if let Some(parent) = self.reply_to_id.as_ref() {
            return Some(parent.clone());
        }
        self.attachments
            .iter()
            .find_map(RemoteAttachment::referenced_message_id)
            .filter(|id| id != &self.id)
    }

    pub fn is_system(&self) -> bool {
        self.message_type != "message"
    }

    pub fn mentioned_user_ids(&self) -> Vec<String> {
        self.mentions
            .iter()
            .filter_map(|mention| mention.user_id.clone())
            .collect()
    }

    pub fn target(&self) -> MessageTarget {
        match (&self.container, self.reply_to_id.as_ref()) {
            (RemoteContainer::Channel { .. }, Some(parent)) => {
                MessageTarget::reply(self.container.clone(), parent.clone(), self.id.clone())
            }
            _ => MessageTarget::new(self.container.clone(), self.id.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUser {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub mail: Option<String>,
    #[serde(default)]
    pub user_principal_name: Option<String>,
    #[serde(default)]
    pub user_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteChatMember {
    pub user_id: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteChat {
    pub id: String,
    pub chat_type: String,
    pub topic: Option<String>,
    pub members: Vec<RemoteChatMember>,
}

impl RemoteChat {
    pub(crate) fn from_graph(raw: GraphChat) -> Self {
        RemoteChat {
            id: raw.id,
            chat_type: raw.chat_type.unwrap_or_default(),
            topic: raw.topic,
            members: raw
                .members
                .unwrap_or_default()
                .into_iter()
                .filter_map(|member| {
                    Some(RemoteChatMember {
                        user_id: member.user_id?,
                        display_name: member.display_name,
                        email: member.email,
                    })
                })
                .collect(),
        }
    }

    pub fn is_direct(&self) -> bool {
        self.chat_type.eq_ignore_ascii_case("oneOnOne")
    }

    pub fn has_exactly_members(&self, user_ids: &[String]) -> bool {
        self.members.len() == user_ids.len()
            && user_ids
                .iter()
                .all(|id| self.members.iter().any(|member| &member.user_id == id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSubscription {
    pub id: String,
    pub resource: String,
    #[serde(default)]
    pub change_type: String,
    #[serde(default)]
    pub notification_url: String,
    #[serde(default)]
    pub lifecycle_notification_url: Option<String>,
    #[serde(default)]
    pub client_state: Option<String>,
    #[serde(rename = "expirationDateTime")]
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub resource: String,
    pub change_type: String,
    pub notification_url: String,
    pub lifecycle_notification_url: String,
    pub client_state: String,
    pub expires_at: DateTime<Utc>,
    pub encryption_certificate: Option<String>,
    pub encryption_certificate_id: Option<String>,
}

impl SubscriptionRequest {
    pub(crate) fn to_graph_body(&self) -> Value {
        let mut body = json!({
            "changeType": self.change_type,
            "notificationUrl": self.notification_url,
            "lifecycleNotificationUrl": self.lifecycle_notification_url,
            "resource": self.resource,
            "clientState": self.client_state,
            "expirationDateTime": self.expires_at.to_rfc3339(),
        });
        if let (Some(certificate), Some(certificate_id)) = (
            self.encryption_certificate.as_ref(),
            self.encryption_certificate_id.as_ref(),
        ) {
            body["includeResourceData"] = json!(true);
            body["encryptionCertificate"] = json!(certificate);
            body["encryptionCertificateId"] = json!(certificate_id);
        }
        body
    }
}

/// A file already uploaded to the remote drive, ready to reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub id: String,
    pub name: String,
    pub content_url: String,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyReference {
    pub message_id: String,
    pub preview: String,
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMention {
    pub id: i64,
    pub text: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub html: String,
    pub reply_to: Option<ReplyReference>,
    pub attachments: Vec<UploadedFile>,
    pub mentions: Vec<OutgoingMention>,
}

impl OutgoingMessage {
    pub fn html(html: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            ..Default::default()
        }
    }

    /// Graph `chatMessage` body. Chat replies quote their parent through a
    /// `messageReference` attachment; channel replies are addressed by URL.
    pub(crate) fn to_graph_body(&self, quote_parent: bool) -> Value {
        let mut content = self.html.clone();
        let mut attachments = Vec::new();

        for file in &self.attachments {
            content = format!("<attachment id=\"{}\"></attachment>{}", file.id, content);
            attachments.push(json!({
                "id": file.id,
                "contentType": CONTENT_TYPE_REFERENCE,
                "contentUrl": file.content_url,
                "name": file.name,
            }));
        }

        if quote_parent && let Some(parent) = self.reply_to.as_ref() {
            let reference = json!({
                "messageId": parent.message_id,
                "messagePreview": parent.preview,
                "messageSender": {
                    "user": {
                        "userIdentityType": "aadUser",
                        "id": parent.sender_id,
                        "displayName": parent.sender_name,
                    }
                }
            });
            content = format!(
                "<attachment id=\"{}\"></attachment> {}",
                parent.message_id, content
            );
            attachments.push(json!({
                "id": parent.message_id,
                "contentType": CONTENT_TYPE_MESSAGE_REFERENCE,
                "content": reference.to_string(),
            }));
        }

        let mentions: Vec<Value> = self
            .mentions
            .iter()
            .map(|mention| {
                json!({
                    "id": mention.id,
                    "mentionText": mention.text,
                    "mentioned": {
                        "user": {
                            "id": mention.user_id,
                            "displayName": mention.text,
                            "userIdentityType": "aadUser",
                        }
                    }
                })
            })
            .collect();

        json!({
            "body": { "contentType": "html", "content": content },
            "attachments": attachments,
            "mentions": mentions,
        })
    }
}

// Graph wire shapes. Graph sends explicit nulls, so collections are optional.

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GraphChatMessage {
    pub id: String,
    #[serde(default)]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub from: Option<GraphIdentitySet>,
    #[serde(default)]
    pub body: Option<GraphItemBody>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub attachments: Option<Vec<GraphAttachment>>,
    #[serde(default)]
    pub mentions: Option<Vec<GraphMention>>,
    #[serde(default)]
    pub reactions: Option<Vec<GraphReaction>>,
    #[serde(default)]
    pub created_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_modified_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub replies: Option<Vec<GraphChatMessage>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct GraphIdentitySet {
    #[serde(default)]
    pub user: Option<GraphIdentity>,
    #[serde(default)]
    pub application: Option<GraphIdentity>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GraphIdentity {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GraphItemBody {
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GraphAttachment {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub content_url: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GraphMention {
    pub id: i64,
    #[serde(default)]
    pub mention_text: Option<String>,
    #[serde(default)]
    pub mentioned: Option<GraphIdentitySet>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GraphReaction {
    pub reaction_type: String,
    #[serde(default)]
    pub user: Option<GraphIdentitySet>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GraphChat {
    pub id: String,
    #[serde(default)]
    pub chat_type: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub members: Option<Vec<GraphChatMember>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GraphChatMember {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GraphCollection<T> {
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
    #[serde(rename = "@odata.nextLink", default)]
    pub next_link: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(value: Value) -> GraphChatMessage {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn graph_message_with_nulls_is_converted() {
        let raw = parse(json!({
            "id": "1700000000000",
            "replyToId": null,
            "messageType": "message",
            "from": { "user": { "id": "u1", "displayName": "Ada" }, "application": null },
            "body": { "contentType": "html", "content": "<p>hello</p>" },
            "attachments": null,
            "mentions": [{ "id": 0, "mentionText": "Bob", "mentioned": { "user": { "id": "u2" } } }],
            "reactions": [{ "reactionType": "like", "user": { "user": { "id": "u3" } } }],
            "createdDateTime": "2024-05-01T10:00:00Z",
            "lastModifiedDateTime": null
        }));
        let message = RemoteMessage::from_graph(raw, RemoteContainer::channel("T1", "C1"));

        assert_eq!(message.user_id.as_deref(), Some("u1"));
        assert!(message.body_is_html);
        assert_eq!(message.mentions[0].user_id.as_deref(), Some("u2"));
        assert_eq!(message.reactions[0].reaction_type, "like");
        assert_eq!(message.created_at, message.last_modified_at);
        assert!(message.parent_id().is_none());
        assert_eq!(message.target().path(), "/teams/T1/channels/C1/messages/1700000000000");
    }

    #[test]
    fn chat_reply_parent_comes_from_message_reference() {
        let raw = parse(json!({
            "id": "2",
            "attachments": [{
                "id": "1",
                "contentType": "messageReference",
                "content": "{\"messageId\":\"1\",\"messagePreview\":\"ping\"}"
            }]
        }));
        let message = RemoteMessage::from_graph(raw, RemoteContainer::chat("X1"));
        assert_eq!(message.parent_id().as_deref(), Some("1"));
        assert_eq!(message.target().path(), "/chats/X1/messages/2");
    }

    #[test]
    fn channel_reply_target_includes_root() {
        let raw = parse(json!({ "id": "2", "replyToId": "1" }));
        let message = RemoteMessage::from_graph(raw, RemoteContainer::channel("T", "C"));
        assert_eq!(
            message.target().path(),
            "/teams/T/channels/C/messages/1/replies/2"
        );
    }

    #[test]
    fn code_snippet_card_is_recognized() {
        let attachment = RemoteAttachment {
            id: Some("a".to_string()),
            content_type: CONTENT_TYPE_CODE_SNIPPET.to_string(),
            content: Some(
                r#"{"language":"rust","codeSnippetUrl":"https://graph.microsoft.com/v1.0/drives/x"}"#
                    .to_string(),
            ),
            content_url: None,
            name: None,
        };
        let (language, url) = attachment.code_snippet().unwrap();
        assert_eq!(language, "rust");
        assert!(url.ends_with("/drives/x"));
    }

    #[test]
    fn outgoing_chat_reply_quotes_parent() {
        let mut message = OutgoingMessage::html("<p>pong</p>");
        message.reply_to = Some(ReplyReference {
            message_id: "M1".to_string(),
            preview: "ping".to_string(),
            sender_id: Some("u1".to_string()),
            sender_name: None,
        });
        let body = message.to_graph_body(true);
        let content = body["body"]["content"].as_str().unwrap();
        assert!(content.starts_with("<attachment id=\"M1\"></attachment>"));
        assert_eq!(body["attachments"][0]["contentType"], "messageReference");

        let channel_body = message.to_graph_body(false);
        assert_eq!(channel_body["attachments"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn encrypted_subscription_request_includes_certificate() {
        let request = SubscriptionRequest {
            resource: "chats/getAllMessages".to_string(),
            change_type: "created,deleted,updated".to_string(),
            notification_url: "https://x/changes".to_string(),
            lifecycle_notification_url: "https://x/lifecycle".to_string(),
            client_state: "nonce".to_string(),
            expires_at: Utc::now(),
            encryption_certificate: Some("cert".to_string()),
            encryption_certificate_id: Some("cert-id".to_string()),
        };
        let body = request.to_graph_body();
        assert_eq!(body["includeResourceData"], true);
        assert_eq!(body["encryptionCertificateId"], "cert-id");
    }
}
