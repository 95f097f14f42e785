use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::events::SyncError;
use super::logic::{synthetic_display_name, synthetic_username};
use crate::config::Config;
use crate::db::{DatabaseManager, UserCorrespondence};
use crate::mattermost::{LocalApi, LocalError, LocalUser, NewUser};
use crate::msteams::{RemoteApi, RemoteUser};
use crate::parsers::MentionTarget;
use crate::web::metrics::Metrics;

const MAX_USERNAME_SUFFIX: u32 = 20;
const SYNTHETIC_EMAIL_DOMAIN: &str = "msteams-sync.invalid";

/// Maps remote users onto local accounts, creating placeholder (synthetic)
/// accounts for senders nobody has connected yet.
pub struct UserSyncHandler {
    db: Arc<DatabaseManager>,
    local: Arc<dyn LocalApi>,
    remote: Arc<dyn RemoteApi>,
    config: Arc<Config>,
}

impl UserSyncHandler {
    pub fn new(
        db: Arc<DatabaseManager>,
        local: Arc<dyn LocalApi>,
        remote: Arc<dyn RemoteApi>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            local,
            remote,
            config,
        }
    }

    /// Local author for a remote sender, provisioning one when needed.
    pub async fn local_user_for_remote(
        &self,
        remote_user_id: &str,
        display_name_hint: Option<&str>,
    ) -> Result<UserCorrespondence, SyncError> {
        if let Some(existing) = self.db.user_store().resolve_by_remote(remote_user_id).await? {
            return Ok(existing);
        }

        let remote_user = match self.remote.get_user(remote_user_id).await {
            Ok(user) => user,
            Err(err) if err.is_not_found() => RemoteUser {
                id: remote_user_id.to_string(),
                display_name: display_name_hint.map(ToOwned::to_owned),
                ..Default::default()
            },
            Err(err) => return Err(err.into()),
        };
        self.provision(&remote_user).await
    }

    async fn provision(&self, remote_user: &RemoteUser) -> Result<UserCorrespondence, SyncError> {
        let email = remote_user
            .mail
            .clone()
            .or_else(|| remote_user.user_principal_name.clone())
            .filter(|mail| mail.contains('@'));

        if let Some(email) = email.as_deref() {
            match self.local.get_user_by_email(email).await {
                Ok(existing) => {
                    info!(
                        "linking remote user to existing local account remote_id={} local_id={}",
                        remote_user.id, existing.id
                    );
                    let mut pairing = UserCorrespondence::new(&existing.id, &remote_user.id, false);
                    pairing.display_name = Some(existing.display_name());
                    return Ok(self.db.user_store().link_user(pairing).await?);
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }

        let display_name = remote_user
            .display_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "Unknown User".to_string());
        let created = self
            .create_synthetic(&remote_user.id, &display_name, email)
            .await?;

        let mut pairing = UserCorrespondence::new(&created.id, &remote_user.id, true);
        pairing.display_name = Some(display_name);
        let stored = self.db.user_store().link_user(pairing).await?;
        if stored.local_user_id != created.id {
            debug!(
                "synthetic user provisioning collapsed remote_id={} kept={} dropped={}",
                remote_user.id, stored.local_user_id, created.id
            );
        } else {
            info!(
                "synthetic user created remote_id={} local_id={} username={}",
                remote_user.id, created.id, created.username
            );
        }
        Ok(stored)
    }

    async fn create_synthetic(
        &self,
        remote_user_id: &str,
        display_name: &str,
        email: Option<String>,
    ) -> Result<LocalUser, SyncError> {
        let bridge = &self.config.bridge;
        let base = synthetic_username(&bridge.synthetic_user_prefix, display_name, remote_user_id);
        let mut username = base.clone();

        for suffix in 1..=MAX_USERNAME_SUFFIX {
            let request = NewUser {
                username: username.clone(),
                email: email
                    .clone()
                    .unwrap_or_else(|| format!("{}@{}", username, SYNTHETIC_EMAIL_DOMAIN)),
                first_name: display_name.to_string(),
                nickname: synthetic_display_name(&bridge.synthetic_display_name_pattern, display_name),
                password: random_password(),
            };
            match self.local.create_user(&request).await {
                Ok(user) => return Ok(user),
                Err(LocalError::BadRequest(detail)) if is_username_clash(&detail) => {
                    debug!("synthetic username taken username={} retrying", username);
                    username = format!("{base}-{suffix}");
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(SyncError::PolicyRejection(format!(
            "no free username for remote user {remote_user_id}"
        )))
    }

    /// Remote identity of a local user, if connected.
    pub async fn remote_user_for_local(&self, local_user_id: &str) -> Result<Option<String>, SyncError> {
        Ok(self
            .db
            .user_store()
            .resolve_by_local(local_user_id)
            .await?
            .map(|user| user.remote_user_id))
    }

    pub async fn is_synthetic(&self, local_user_id: &str) -> Result<bool, SyncError> {
        Ok(self.db.user_store().is_synthetic(local_user_id).await?)
    }

    /// Local usernames for the remote users mentioned in a message. Users
    /// with no local counterpart are left out.
    pub async fn local_usernames(
        &self,
        remote_user_ids: &[String],
    ) -> HashMap<String, String> {
        let mut names = HashMap::new();
        for remote_id in remote_user_ids {
            let remote_id = remote_id.as_str();
            if names.contains_key(remote_id) {
                continue;
            }
            let local_id = match self.db.user_store().resolve_by_remote(remote_id).await {
                Ok(Some(pairing)) => pairing.local_user_id,
                Ok(None) => continue,
                Err(err) => {
                    warn!("mention lookup failed remote_id={} error={}", remote_id, err);
                    continue;
                }
            };
            match self.local.get_user(&local_id).await {
                Ok(user) => {
                    names.insert(remote_id.to_string(), user.username);
                }
                Err(err) => debug!("mentioned user not readable local_id={} error={}", local_id, err),
            }
        }
        names
    }

    /// Mention targets for `@username` tokens found in a local post.
    pub async fn mention_targets(&self, usernames: &[String]) -> Vec<MentionTarget> {
        let mut targets = Vec::new();
        for username in usernames {
            let user = match self.local.get_user_by_username(username).await {
                Ok(user) => user,
                Err(err) => {
                    debug!("mention not resolvable username={} error={}", username, err);
                    continue;
                }
            };
            if let Ok(Some(pairing)) = self.db.user_store().resolve_by_local(&user.id).await {
                targets.push(MentionTarget {
                    username: username.clone(),
                    remote_user_id: pairing.remote_user_id,
                    display_name: pairing.display_name.unwrap_or_else(|| user.display_name()),
                });
            }
        }
        targets
    }

    /// Refreshes the connected and synthetic user gauges.
    pub async fn refresh_user_gauges(&self) -> Result<(usize, usize), SyncError> {
        let users = self.db.user_store().list_users().await?;
        let synthetic = users.iter().filter(|user| user.synthetic).count();
        let connected = users.len() - synthetic;
        Metrics::set_connected_users(connected);
        Metrics::set_synthetic_users(synthetic);
        Ok((connected, synthetic))
    }

    /// Remote ids of connected (non-synthetic) users.
    pub async fn connected_remote_users(&self) -> Result<Vec<String>, SyncError> {
        Ok(self
            .db
            .user_store()
            .list_users()
            .await?
            .into_iter()
            .filter(|user| !user.synthetic)
            .map(|user| user.remote_user_id)
            .collect())
    }
}

fn is_username_clash(detail: &str) -> bool {
    let detail = detail.to_ascii_lowercase();
    detail.contains("username_exists") || detail.contains("username already")
}

fn random_password() -> String {
    format!(
        "{}A!{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}
