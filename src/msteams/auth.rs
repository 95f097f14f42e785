use std::time::{Duration, Instant};

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::RemoteError;
use crate::config::RemoteConfig;

const EXPIRY_SKEW: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

struct CachedToken {
    value: SecretString,
    refresh_at: Instant,
}

/// Client-credentials token source for Graph. The cached token is handed
/// out until shortly before expiry; concurrent callers share one refresh.
pub struct TokenProvider {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: SecretString,
    scope: String,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(http: reqwest::Client, config: &RemoteConfig) -> Self {
        Self {
            http,
            token_url: format!(
                "{}/{}/oauth2/v2.0/token",
                config.login_base_url, config.tenant_id
            ),
            client_id: config.client_id.clone(),
            client_secret: SecretString::from(config.client_secret.clone()),
            scope: graph_scope(&config.graph_base_url),
            cached: Mutex::new(None),
        }
    }

    pub async fn token(&self) -> Result<SecretString, RemoteError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && Instant::now() < token.refresh_at
        {
            return Ok(token.value.clone());
        }

        let fresh = self.request_token().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }

    /// Drops the cached token so the next call authenticates again.
    pub async fn invalidate(&self) {
        if self.cached.lock().await.take().is_some() {
            debug!("graph token invalidated");
        }
    }

    async fn request_token(&self) -> Result<CachedToken, RemoteError> {
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
                ("scope", self.scope.as_str()),
            ])
            .send()
            .await
            .map_err(RemoteError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(match RemoteError::from_status(status, &headers, &body) {
                RemoteError::BadRequest(detail) => RemoteError::Unauthorized(detail),
                other => other,
            });
        }

        let token: TokenResponse = response.json().await.map_err(RemoteError::from_transport)?;
        let lifetime = Duration::from_secs(token.expires_in);
        info!(
            "graph token acquired client_id={} expires_in_secs={}",
            self.client_id, token.expires_in
        );
        Ok(CachedToken {
            value: SecretString::from(token.access_token),
            refresh_at: Instant::now() + lifetime.saturating_sub(EXPIRY_SKEW),
        })
    }
}

fn graph_scope(graph_base_url: &str) -> String {
    match url::Url::parse(graph_base_url) {
        Ok(parsed) => format!("{}/.default", parsed.origin().ascii_serialization()),
        Err(_) => "https://graph.microsoft.com/.default".to_string(),
    }
}
