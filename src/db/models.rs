use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::msteams::RemoteContainer;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    Channel,
    GroupChat,
    DirectChat,
}

impl LinkKind {
    pub fn is_direct(self) -> bool {
        !matches!(self, LinkKind::Channel)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LinkKind::Channel => "channel",
            LinkKind::GroupChat => "group_chat",
            LinkKind::DirectChat => "direct_chat",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationLink {
    pub link_id: String,
    pub local_conversation_id: String,
    pub remote: RemoteContainer,
    pub kind: LinkKind,
    pub creator: String,
    pub created_at: DateTime<Utc>,
}

impl ConversationLink {
    pub fn new(
        local_conversation_id: impl Into<String>,
        remote: RemoteContainer,
        kind: LinkKind,
        creator: impl Into<String>,
    ) -> Self {
        Self {
            link_id: uuid::Uuid::new_v4().simple().to_string(),
            local_conversation_id: local_conversation_id.into(),
            remote,
            kind,
            creator: creator.into(),
            created_at: Utc::now(),
        }
    }
}

/// Which side a mirrored message was first written on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Local,
    Remote,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::Remote => "remote",
        }
    }
}

/// One row of the message bijection. An orphan tombstone (a delete seen
/// before any create) carries an empty id on the side that never existed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageCorrespondence {
    pub link_id: String,
    pub local_message_id: String,
    pub local_root_id: Option<String>,
    pub remote_message_id: String,
    pub remote_parent_id: Option<String>,
    pub remote_container: RemoteContainer,
    pub origin: Origin,
    pub edit_hash: Option<String>,
    pub last_sender: Option<String>,
    pub remote_updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl MessageCorrespondence {
    pub fn new(
        link: &ConversationLink,
        local_message_id: impl Into<String>,
        remote_message_id: impl Into<String>,
        origin: Origin,
    ) -> Self {
        let now = Utc::now();
        Self {
            link_id: link.link_id.clone(),
            local_message_id: local_message_id.into(),
            local_root_id: None,
            remote_message_id: remote_message_id.into(),
            remote_parent_id: None,
            remote_container: link.remote.clone(),
            origin,
            edit_hash: None,
            last_sender: None,
            remote_updated_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn with_thread(mut self, local_root_id: Option<String>, remote_parent_id: Option<String>) -> Self {
        self.local_root_id = local_root_id.filter(|id| !id.is_empty());
        self.remote_parent_id = remote_parent_id.filter(|id| !id.is_empty());
        self
    }

    pub fn with_edit_hash(mut self, edit_hash: impl Into<String>) -> Self {
        self.edit_hash = Some(edit_hash.into());
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.last_sender = Some(sender.into());
        self
    }

    pub fn with_remote_updated_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.remote_updated_at = at;
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_orphan(&self) -> bool {
        self.local_message_id.is_empty() || self.remote_message_id.is_empty()
    }

    pub fn same_pair(&self, other: &MessageCorrespondence) -> bool {
        self.local_message_id == other.local_message_id
            && self.remote_message_id == other.remote_message_id
            && self.remote_container == other.remote_container
    }

    /// Folds the mutable fields of `newer` into this row; the id pair,
    /// origin and creation time never change once written.
    pub fn merge(&self, newer: &MessageCorrespondence) -> MessageCorrespondence {
        let mut merged = self.clone();
        if merged.local_root_id.is_none() {
            merged.local_root_id = newer.local_root_id.clone();
        }
        if merged.remote_parent_id.is_none() {
            merged.remote_parent_id = newer.remote_parent_id.clone();
        }
        if newer.edit_hash.is_some() {
            merged.edit_hash = newer.edit_hash.clone();
        }
        if newer.last_sender.is_some() {
            merged.last_sender = newer.last_sender.clone();
        }
        if newer.remote_updated_at.is_some() {
            merged.remote_updated_at = newer.remote_updated_at;
        }
        merged.updated_at = Utc::now();
        merged
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserCorrespondence {
    pub local_user_id: String,
    pub remote_user_id: String,
    pub synthetic: bool,
    #[serde(default)]
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UserCorrespondence {
    pub fn new(
        local_user_id: impl Into<String>,
        remote_user_id: impl Into<String>,
        synthetic: bool,
    ) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            remote_user_id: remote_user_id.into(),
            synthetic,
            display_name: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKind {
    Channel,
    Chats,
    UserChats,
}

impl SubscriptionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionKind::Channel => "channel",
            SubscriptionKind::Chats => "chats",
            SubscriptionKind::UserChats => "user_chats",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub subscription_id: String,
    pub kind: SubscriptionKind,
    pub resource: String,
    pub expires_at: DateTime<Utc>,
    pub client_state: String,
    #[serde(default)]
    pub certificate_thumbprint: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
