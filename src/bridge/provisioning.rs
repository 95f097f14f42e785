use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use super::subscriptions::SubscriptionManager;
use crate::config::Config;
use crate::db::models::{ConversationLink, LinkKind};
use crate::db::{DatabaseError, DatabaseManager};
use crate::mattermost::models::CHANNEL_TYPE_DIRECT;
use crate::mattermost::{LocalApi, LocalError};
use crate::msteams::RemoteContainer;
use crate::web::metrics::Metrics;

#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error("either team_id and channel_id or chat_id must be given")]
    InvalidTarget,
    #[error("local channel {0} does not exist")]
    UnknownLocalChannel(String),
    #[error("a direct or group conversation can only be linked to a chat")]
    KindMismatch,
    #[error("direct message sync is disabled")]
    DirectMessagesDisabled,
    #[error("the conversation is already linked")]
    AlreadyLinked,
    #[error("link {0} not found")]
    NotFound(String),
    #[error("local platform error: {0}")]
    Local(#[from] LocalError),
    #[error("database error: {0}")]
    Database(DatabaseError),
}

impl From<DatabaseError> for ProvisioningError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::Conflict(_) => ProvisioningError::AlreadyLinked,
            other => ProvisioningError::Database(other),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LinkRequest {
    pub local_channel_id: String,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub creator: Option<String>,
}

impl LinkRequest {
    fn remote(&self) -> Result<RemoteContainer, ProvisioningError> {
        let non_empty = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        match (
            non_empty(&self.team_id),
            non_empty(&self.channel_id),
            non_empty(&self.chat_id),
        ) {
            (Some(team_id), Some(channel_id), None) => Ok(RemoteContainer::Channel {
                team_id,
                channel_id,
            }),
            (None, None, Some(chat_id)) => Ok(RemoteContainer::Chat { chat_id }),
            _ => Err(ProvisioningError::InvalidTarget),
        }
    }
}

/// Creates and removes conversation links. Every change re-runs the
/// subscription reconciler so channel links start receiving changes
/// right away.
pub struct LinkProvisioner {
    config: Arc<Config>,
    db: Arc<DatabaseManager>,
    local: Arc<dyn LocalApi>,
    subscriptions: Arc<SubscriptionManager>,
}

impl LinkProvisioner {
    pub fn new(
        config: Arc<Config>,
        db: Arc<DatabaseManager>,
        local: Arc<dyn LocalApi>,
        subscriptions: Arc<SubscriptionManager>,
    ) -> Self {
        Self {
            config,
            db,
            local,
            subscriptions,
        }
    }

    pub async fn list(&self) -> Result<Vec<ConversationLink>, ProvisioningError> {
        Ok(self.db.link_store().list().await?)
    }

    pub async fn create(&self, request: &LinkRequest) -> Result<ConversationLink, ProvisioningError> {
        let remote = request.remote()?;
        let channel = match self.local.get_channel(&request.local_channel_id).await {
            Ok(channel) => channel,
            Err(LocalError::NotFound(_)) => {
                return Err(ProvisioningError::UnknownLocalChannel(
                    request.local_channel_id.clone(),
                ));
            }
            Err(err) => return Err(err.into()),
        };

        let kind = match (&remote, channel.is_direct_or_group()) {
            (RemoteContainer::Channel { .. }, false) => LinkKind::Channel,
            (RemoteContainer::Channel { .. }, true) => return Err(ProvisioningError::KindMismatch),
            (RemoteContainer::Chat { .. }, _) if channel.channel_type == CHANNEL_TYPE_DIRECT => {
                LinkKind::DirectChat
            }
            (RemoteContainer::Chat { .. }, _) => LinkKind::GroupChat,
        };
        if kind.is_direct() && !self.config.bridge.sync_direct_messages {
            return Err(ProvisioningError::DirectMessagesDisabled);
        }

        let creator = request.creator.clone().unwrap_or_else(|| "admin".to_string());
        let link = ConversationLink::new(&request.local_channel_id, remote, kind, creator);
        self.db.link_store().create_link(&link).await?;
        info!(
            "conversation linked link_id={} local={} remote={} kind={}",
            link.link_id,
            link.local_conversation_id,
            link.remote.key(),
            link.kind.as_str()
        );

        self.after_change().await;
        Ok(link)
    }

    pub async fn unlink(&self, link_id: &str) -> Result<ConversationLink, ProvisioningError> {
        let link = self
            .db
            .link_store()
            .delete(link_id)
            .await?
            .ok_or_else(|| ProvisioningError::NotFound(link_id.to_string()))?;
        info!(
            "conversation unlinked link_id={} local={} remote={}",
            link.link_id,
            link.local_conversation_id,
            link.remote.key()
        );
        self.after_change().await;
        Ok(link)
    }

    pub async fn refresh_gauge(&self) -> Result<usize, ProvisioningError> {
        let count = self
            .db
            .link_store()
            .list()
            .await?
            .iter()
            .filter(|link| link.kind == LinkKind::Channel)
            .count();
        Metrics::set_linked_channels(count);
        Ok(count)
    }

    async fn after_change(&self) {
        if let Err(err) = self.refresh_gauge().await {
            warn!("linked channel gauge not refreshed error={}", err);
        }
        if let Err(err) = self.subscriptions.reconcile().await {
            warn!("reconcile after link change failed error={}", err);
            self.subscriptions.request_repair();
        }
    }
}
