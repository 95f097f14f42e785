use serde::{Deserialize, Serialize};

const SYSTEM_POST_PREFIX: &str = "system_";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LocalPost {
    pub id: String,
    pub channel_id: String,
    pub user_id: String,
    #[serde(default)]
    pub root_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "type")]
    pub post_type: String,
    #[serde(default)]
    pub file_ids: Vec<String>,
    #[serde(default)]
    pub create_at: i64,
    #[serde(default)]
    pub update_at: i64,
    #[serde(default)]
    pub edit_at: i64,
    #[serde(default)]
    pub delete_at: i64,
}

impl LocalPost {
    pub fn root(&self) -> Option<&str> {
        if self.root_id.is_empty() {
            None
        } else {
            Some(&self.root_id)
        }
    }

    pub fn is_system(&self) -> bool {
        self.post_type.starts_with(SYSTEM_POST_PREFIX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct NewPost {
    pub channel_id: String,
    #[serde(skip)]
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub file_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalReaction {
    pub user_id: String,
    pub post_id: String,
    pub emoji_name: String,
    #[serde(default)]
    pub create_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LocalUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub delete_at: i64,
}

impl LocalUser {
    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let full = full.trim();
        if !full.is_empty() {
            full.to_string()
        } else if !self.nickname.is_empty() {
            self.nickname.clone()
        } else {
            self.username.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub nickname: String,
    pub password: String,
}

pub const CHANNEL_TYPE_DIRECT: &str = "D";
pub const CHANNEL_TYPE_GROUP: &str = "G";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LocalChannel {
    pub id: String,
    #[serde(default)]
    pub team_id: String,
    #[serde(rename = "type")]
    pub channel_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub display_name: String,
}

impl LocalChannel {
    pub fn is_direct_or_group(&self) -> bool {
        matches!(self.channel_type.as_str(), CHANNEL_TYPE_DIRECT | CHANNEL_TYPE_GROUP)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LocalFileInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mime_type: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FileUploadResponse {
    #[serde(default)]
    pub file_infos: Vec<LocalFileInfo>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UserAccessToken {
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalEventKind {
    Posted,
    PostEdited,
    PostDeleted,
    ReactionAdded,
    ReactionRemoved,
}

impl LocalEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LocalEventKind::Posted => "posted",
            LocalEventKind::PostEdited => "post_edited",
            LocalEventKind::PostDeleted => "post_deleted",
            LocalEventKind::ReactionAdded => "reaction_added",
            LocalEventKind::ReactionRemoved => "reaction_removed",
        }
    }

    pub fn is_reaction(self) -> bool {
        matches!(self, LocalEventKind::ReactionAdded | LocalEventKind::ReactionRemoved)
    }
}

/// Payload POSTed by the local server's event relay for every post or
/// reaction lifecycle callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalHookEvent {
    pub event: LocalEventKind,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub post: Option<LocalPost>,
    #[serde(default)]
    pub reaction: Option<LocalReaction>,
}
