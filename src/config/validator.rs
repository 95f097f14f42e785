use thiserror::Error;

use super::parser::{Config, UPLOAD_CHUNK_UNIT};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

const KNOWN_CHANGE_TYPES: &[&str] = &["created", "updated", "deleted"];

fn ensure(condition: bool, message: impl Into<String>) -> Result<(), ConfigError> {
    if condition {
        Ok(())
    } else {
        Err(ConfigError::InvalidConfig(message.into()))
    }
}

fn not_blank(value: &str, field: &str) -> Result<(), ConfigError> {
    ensure(!value.trim().is_empty(), format!("{field} cannot be empty"))
}

fn looks_like_placeholder_secret(secret: &str) -> bool {
    matches!(
        secret.trim().to_ascii_lowercase().as_str(),
        "your_client_secret" | "your-client-secret" | "your_secret_here" | "changeme"
    )
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let webhook_base_ok = url::Url::parse(&self.bridge.webhook_base_url)
            .is_ok_and(|parsed| matches!(parsed.scheme(), "http" | "https"));
        ensure(
            webhook_base_ok,
            "bridge.webhook_base_url must be an absolute http(s) URL",
        )?;
        ensure(self.bridge.port != 0, "bridge.port must be between 1 and 65535")?;
        if let Some(unknown) = self.bridge.enabled_change_types.iter().find(|change_type| {
            !KNOWN_CHANGE_TYPES.contains(&change_type.to_ascii_lowercase().as_str())
        }) {
            return Err(ConfigError::InvalidConfig(format!(
                "bridge.enabled_change_types contains unknown change type {unknown}"
            )));
        }

        not_blank(&self.remote.tenant_id, "remote.tenant_id")?;
        not_blank(&self.remote.client_id, "remote.client_id")?;
        ensure(
            !self.remote.client_secret.trim().is_empty()
                && !looks_like_placeholder_secret(&self.remote.client_secret),
            "remote.client_secret must be set to a real application secret",
        )?;
        not_blank(&self.remote.webhook_secret, "remote.webhook_secret")?;
        ensure(
            self.remote.upload_chunk_size != 0
                && self.remote.upload_chunk_size % UPLOAD_CHUNK_UNIT == 0,
            format!("remote.upload_chunk_size must be a non-zero multiple of {UPLOAD_CHUNK_UNIT}"),
        )?;
        self.remote.encryption_key_bytes()?;

        not_blank(&self.local.url, "local.url")?;
        not_blank(&self.local.access_token, "local.access_token")?;
        not_blank(&self.local.hook_token, "local.hook_token")?;
        not_blank(
            &self.database.connection_string(),
            "database connection string",
        )?;

        ensure(self.queue.worker_count > 0, "queue.worker_count must be at least 1")?;
        ensure(
            self.queue.queue_capacity > 0,
            "queue.queue_capacity must be at least 1",
        )?;

        let subscriptions = &self.subscriptions;
        ensure(
            subscriptions.max_backoff_secs.saturating_mul(2) <= subscriptions.refresh_margin_secs,
            "subscriptions.max_backoff_secs must be at most half of refresh_margin_secs",
        )?;
        ensure(
            subscriptions.refresh_margin_secs < subscriptions.expiry_secs,
            "subscriptions.refresh_margin_secs must be shorter than expiry_secs",
        )
    }
}
