use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::config::LocalConfig;

pub mod error;
pub mod models;

pub use self::error::LocalError;
pub use self::models::{
    LocalChannel, LocalEventKind, LocalFileInfo, LocalHookEvent, LocalPost, LocalReaction,
    LocalUser, NewPost, NewUser,
};

use self::models::{FileUploadResponse, UserAccessToken};

const API_PREFIX: &str = "/api/v4";
const IMPERSONATION_TOKEN_DESCRIPTION: &str = "msteams bridge";

/// Operations the bridge performs against the local server. Calls that
/// take a `user_id` act as that user.
#[async_trait]
pub trait LocalApi: Send + Sync {
    async fn create_post(&self, post: &NewPost) -> Result<LocalPost, LocalError>;

    async fn update_post(
        &self,
        user_id: &str,
        post_id: &str,
        message: &str,
    ) -> Result<LocalPost, LocalError>;

    async fn delete_post(&self, post_id: &str) -> Result<(), LocalError>;

    async fn get_post(&self, post_id: &str) -> Result<LocalPost, LocalError>;

    async fn get_reactions(&self, post_id: &str) -> Result<Vec<LocalReaction>, LocalError>;

    async fn add_reaction(
        &self,
        user_id: &str,
        post_id: &str,
        emoji_name: &str,
    ) -> Result<(), LocalError>;

    async fn remove_reaction(
        &self,
        user_id: &str,
        post_id: &str,
        emoji_name: &str,
    ) -> Result<(), LocalError>;

    async fn upload_file(
        &self,
        user_id: &str,
        channel_id: &str,
        file_name: &str,
        data: Vec<u8>,
    ) -> Result<LocalFileInfo, LocalError>;

    async fn get_file(&self, file_id: &str) -> Result<Vec<u8>, LocalError>;

    async fn get_file_info(&self, file_id: &str) -> Result<LocalFileInfo, LocalError>;

    async fn get_user(&self, user_id: &str) -> Result<LocalUser, LocalError>;

    async fn get_user_by_email(&self, email: &str) -> Result<LocalUser, LocalError>;

    async fn get_user_by_username(&self, username: &str) -> Result<LocalUser, LocalError>;

    async fn create_user(&self, user: &NewUser) -> Result<LocalUser, LocalError>;

    async fn get_channel(&self, channel_id: &str) -> Result<LocalChannel, LocalError>;

    /// Posts a notice only `user_id` can see.
    async fn send_ephemeral_post(
        &self,
        user_id: &str,
        channel_id: &str,
        message: &str,
    ) -> Result<(), LocalError>;
}

pub struct MattermostClient {
    http: reqwest::Client,
    base_url: String,
    access_token: SecretString,
    bot_user_id: String,
    user_tokens: Mutex<HashMap<String, SecretString>>,
}

impl MattermostClient {
    pub fn new(config: &LocalConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("mattermost-bridge-msteams")
            .build()
            .context("failed to construct HTTP client")?;

        Ok(Self {
            http,
            base_url: format!("{}{}", config.url.trim_end_matches('/'), API_PREFIX),
            access_token: SecretString::from(config.access_token.clone()),
            bot_user_id: config.bot_user_id.clone(),
            user_tokens: Mutex::new(HashMap::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Token to act as `user_id`. Other users get a personal access token
    /// issued once through the bot's session and cached.
    async fn token_for(&self, user_id: Option<&str>) -> Result<SecretString, LocalError> {
        let user_id = match user_id {
            Some(id) if !id.is_empty() && id != self.bot_user_id => id,
            _ => return Ok(self.access_token.clone()),
        };
        if let Some(token) = self.user_tokens.lock().get(user_id) {
            return Ok(token.clone());
        }

        let response = self
            .execute(
                Method::POST,
                &self.url(&format!("/users/{}/tokens", user_id)),
                &self.access_token,
                Some(&json!({ "description": IMPERSONATION_TOKEN_DESCRIPTION })),
            )
            .await?;
        let issued: UserAccessToken = response.json().await.map_err(LocalError::from_transport)?;
        info!("issued local access token for user user_id={}", user_id);
        let token = SecretString::from(issued.token);
        self.user_tokens
            .lock()
            .insert(user_id.to_string(), token.clone());
        Ok(token)
    }

    async fn execute(
        &self,
        method: Method,
        url: &str,
        token: &SecretString,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, LocalError> {
        let mut request = self
            .http
            .request(method.clone(), url)
            .bearer_auth(token.expose_secret());
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(LocalError::from_transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let err = LocalError::from_status(status, &text);
        debug!("local call failed method={} url={} error={}", method, url, err);
        Err(err)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        as_user: Option<&str>,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, LocalError> {
        let token = self.token_for(as_user).await?;
        self.execute(method, &self.url(path), &token, body).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        as_user: Option<&str>,
        body: Option<&Value>,
    ) -> Result<T, LocalError> {
        let response = self.send(method, path, as_user, body).await?;
        response.json().await.map_err(LocalError::from_transport)
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, LocalError> {
    serde_json::to_value(value).map_err(|e| LocalError::Other(format!("invalid payload: {e}")))
}

#[async_trait]
impl LocalApi for MattermostClient {
    async fn create_post(&self, post: &NewPost) -> Result<LocalPost, LocalError> {
        let body = to_value(post)?;
        self.send_json(Method::POST, "/posts", Some(&post.user_id), Some(&body))
            .await
    }

    async fn update_post(
        &self,
        user_id: &str,
        post_id: &str,
        message: &str,
    ) -> Result<LocalPost, LocalError> {
        self.send_json(
            Method::PUT,
            &format!("/posts/{}/patch", post_id),
            Some(user_id),
            Some(&json!({ "message": message })),
        )
        .await
    }

    async fn delete_post(&self, post_id: &str) -> Result<(), LocalError> {
        self.send(Method::DELETE, &format!("/posts/{}", post_id), None, None)
            .await
            .map(|_| ())
    }

    async fn get_post(&self, post_id: &str) -> Result<LocalPost, LocalError> {
        self.send_json(Method::GET, &format!("/posts/{}", post_id), None, None)
            .await
    }

    async fn get_reactions(&self, post_id: &str) -> Result<Vec<LocalReaction>, LocalError> {
        let reactions: Option<Vec<LocalReaction>> = self
            .send_json(Method::GET, &format!("/posts/{}/reactions", post_id), None, None)
            .await?;
        Ok(reactions.unwrap_or_default())
    }

    async fn add_reaction(
        &self,
        user_id: &str,
        post_id: &str,
        emoji_name: &str,
    ) -> Result<(), LocalError> {
        let body = json!({
            "user_id": user_id,
            "post_id": post_id,
            "emoji_name": emoji_name,
        });
        self.send(Method::POST, "/reactions", Some(user_id), Some(&body))
            .await
            .map(|_| ())
    }

    async fn remove_reaction(
        &self,
        user_id: &str,
        post_id: &str,
        emoji_name: &str,
    ) -> Result<(), LocalError> {
        self.send(
            Method::DELETE,
            &format!("/users/{}/posts/{}/reactions/{}", user_id, post_id, emoji_name),
            Some(user_id),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn upload_file(
        &self,
        user_id: &str,
        channel_id: &str,
        file_name: &str,
        data: Vec<u8>,
    ) -> Result<LocalFileInfo, LocalError> {
        let token = self.token_for(Some(user_id)).await?;
        let response = self
            .http
            .post(self.url("/files"))
            .query(&[("channel_id", channel_id), ("filename", file_name)])
            .bearer_auth(token.expose_secret())
            .body(data)
            .send()
            .await
            .map_err(LocalError::from_transport)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LocalError::from_status(status, &text));
        }
        let uploaded: FileUploadResponse =
            response.json().await.map_err(LocalError::from_transport)?;
        uploaded
            .file_infos
            .into_iter()
            .next()
            .ok_or_else(|| LocalError::Other("upload returned no file info".to_string()))
    }

    async fn get_file(&self, file_id: &str) -> Result<Vec<u8>, LocalError> {
        let response = self
            .send(Method::GET, &format!("/files/{}", file_id), None, None)
            .await?;
        let bytes = response.bytes().await.map_err(LocalError::from_transport)?;
        Ok(bytes.to_vec())
    }

    async fn get_file_info(&self, file_id: &str) -> Result<LocalFileInfo, LocalError> {
        self.send_json(Method::GET, &format!("/files/{}/info", file_id), None, None)
            .await
    }

    async fn get_user(&self, user_id: &str) -> Result<LocalUser, LocalError> {
        self.send_json(Method::GET, &format!("/users/{}", user_id), None, None)
            .await
    }

    async fn get_user_by_email(&self, email: &str) -> Result<LocalUser, LocalError> {
        self.send_json(Method::GET, &format!("/users/email/{}", email), None, None)
            .await
    }

    async fn get_user_by_username(&self, username: &str) -> Result<LocalUser, LocalError> {
        self.send_json(Method::GET, &format!("/users/username/{}", username), None, None)
            .await
    }

    async fn create_user(&self, user: &NewUser) -> Result<LocalUser, LocalError> {
        let body = to_value(user)?;
        self.send_json(Method::POST, "/users", None, Some(&body)).await
    }

    async fn get_channel(&self, channel_id: &str) -> Result<LocalChannel, LocalError> {
        self.send_json(Method::GET, &format!("/channels/{}", channel_id), None, None)
            .await
    }

    async fn send_ephemeral_post(
        &self,
        user_id: &str,
        channel_id: &str,
        message: &str,
    ) -> Result<(), LocalError> {
        let body = json!({
            "user_id": user_id,
            "post": { "channel_id": channel_id, "message": message },
        });
        self.send(Method::POST, "/posts/ephemeral", None, Some(&body))
            .await
            .map(|_| ())
    }
}
