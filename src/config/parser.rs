use std::path::Path;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde::{Deserialize, Serialize};

use super::ConfigError;

pub(super) const UPLOAD_CHUNK_UNIT: usize = 327_680;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub bridge: BridgeConfig,
    pub remote: RemoteConfig,
    pub local: LocalConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub subscriptions: SubscriptionsConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    #[default]
    Both,
    RemoteToLocal,
    LocalToRemote,
}

impl SyncDirection {
    pub fn allows_remote_to_local(self) -> bool {
        matches!(self, SyncDirection::Both | SyncDirection::RemoteToLocal)
    }

    pub fn allows_local_to_remote(self) -> bool {
        matches!(self, SyncDirection::Both | SyncDirection::LocalToRemote)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncDirection::Both => "both",
            SyncDirection::RemoteToLocal => "remote_to_local",
            SyncDirection::LocalToRemote => "local_to_remote",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    pub webhook_base_url: String,
    #[serde(default)]
    pub sync_direction: SyncDirection,
    #[serde(default = "default_true")]
    pub sync_direct_messages: bool,
    #[serde(default = "default_enabled_change_types")]
    pub enabled_change_types: Vec<String>,
    #[serde(default = "default_synthetic_user_prefix")]
    pub synthetic_user_prefix: String,
    #[serde(default = "default_synthetic_display_name_pattern")]
    pub synthetic_display_name_pattern: String,
    #[serde(default)]
    pub user_chat_subscriptions: bool,
    #[serde(default = "default_true")]
    pub backfill_on_start: bool,
}

impl BridgeConfig {
    pub fn change_type_enabled(&self, change_type: &str) -> bool {
        self.enabled_change_types
            .iter()
            .any(|enabled| enabled.eq_ignore_ascii_case(change_type))
    }

    pub fn changes_url(&self) -> String {
        format!("{}changes", self.webhook_base())
    }

    pub fn lifecycle_url(&self) -> String {
        format!("{}lifecycle", self.webhook_base())
    }

    fn webhook_base(&self) -> String {
        if self.webhook_base_url.ends_with('/') {
            self.webhook_base_url.clone()
        } else {
            format!("{}/", self.webhook_base_url)
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default = "default_graph_base_url")]
    pub graph_base_url: String,
    #[serde(default = "default_login_base_url")]
    pub login_base_url: String,
    pub webhook_secret: String,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub certificate_id: Option<String>,
    #[serde(default)]
    pub encryption_key: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_upload_chunk_size")]
    pub upload_chunk_size: usize,
    #[serde(default = "default_max_upload_range_retries")]
    pub max_upload_range_retries: u32,
}

impl RemoteConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn encryption_key_bytes(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        let Some(raw) = self.encryption_key.as_deref().map(str::trim) else {
            return Ok(None);
        };
        if raw.is_empty() {
            return Ok(None);
        }
        let bytes = BASE64_STANDARD.decode(raw).map_err(|e| {
            ConfigError::InvalidConfig(format!("remote.encryption_key is not base64: {e}"))
        })?;
        if bytes.len() != 32 {
            return Err(ConfigError::InvalidConfig(
                "remote.encryption_key must decode to 32 bytes".to_string(),
            ));
        }
        Ok(Some(bytes))
    }

    pub fn encrypted_resource_data(&self) -> bool {
        self.certificate.is_some() && self.encryption_key.is_some()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalConfig {
    pub url: String,
    pub access_token: String,
    pub bot_user_id: String,
    pub hook_token: String,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_max_file_attachments")]
    pub max_file_attachments: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub conn_string: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default)]
    pub min_connections: Option<u32>,
}

impl DatabaseConfig {
    pub fn db_type(&self) -> DbType {
        let url = self.connection_string();
        if url.starts_with("sqlite://") {
            DbType::Sqlite
        } else if url.starts_with("memory://") {
            DbType::Memory
        } else {
            DbType::Postgres
        }
    }

    pub fn connection_string(&self) -> String {
        if let Some(ref url) = self.url {
            url.clone()
        } else if let Some(ref conn) = self.conn_string {
            conn.clone()
        } else if let Some(ref file) = self.filename {
            format!("sqlite://{}", file)
        } else {
            String::new()
        }
    }

    pub fn sqlite_path(&self) -> Option<String> {
        if let DbType::Sqlite = self.db_type() {
            let url = self.connection_string();
            Some(url.strip_prefix("sqlite://").unwrap_or(&url).to_string())
        } else {
            None
        }
    }

    pub fn max_connections(&self) -> u32 {
        match self.db_type() {
            DbType::Postgres => self.max_connections.unwrap_or(10),
            DbType::Sqlite | DbType::Memory => 1,
        }
    }

    pub fn min_connections(&self) -> u32 {
        match self.db_type() {
            DbType::Postgres => self.min_connections.unwrap_or(1),
            DbType::Sqlite | DbType::Memory => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbType {
    Postgres,
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            push_timeout_ms: default_push_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubscriptionsConfig {
    #[serde(default = "default_refresh_margin_secs")]
    pub refresh_margin_secs: u64,
    #[serde(default = "default_subscription_expiry_secs")]
    pub expiry_secs: u64,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_recreate_threshold_secs")]
    pub recreate_threshold_secs: u64,
}

impl Default for SubscriptionsConfig {
    fn default() -> Self {
        Self {
            refresh_margin_secs: default_refresh_margin_secs(),
            expiry_secs: default_subscription_expiry_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            recreate_threshold_secs: default_recreate_threshold_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    #[serde(default = "default_delivery_dedup_window_secs")]
    pub delivery_dedup_window_secs: u64,
    #[serde(default = "default_tombstone_retention_secs")]
    pub tombstone_retention_secs: u64,
    #[serde(default = "default_echo_marker_ttl_secs")]
    pub echo_marker_ttl_secs: u64,
    #[serde(default = "default_echo_fallback_window_ms")]
    pub echo_fallback_window_ms: u64,
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_max_timeout_requeues")]
    pub max_timeout_requeues: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_vanished_retry_delay_ms")]
    pub vanished_retry_delay_ms: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            delivery_dedup_window_secs: default_delivery_dedup_window_secs(),
            tombstone_retention_secs: default_tombstone_retention_secs(),
            echo_marker_ttl_secs: default_echo_marker_ttl_secs(),
            echo_fallback_window_ms: default_echo_fallback_window_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            max_retry_attempts: default_max_retry_attempts(),
            max_timeout_requeues: default_max_timeout_requeues(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            vanished_retry_delay_ms: default_vanished_retry_delay_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(alias = "console", default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(&path)?;
        Self::load_from_str(&content)
    }

    pub fn load_from_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(content)?;
        config.apply_env_overrides();
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        self.remote.client_secret = self.remote.client_secret.trim().to_string();
        self.local.url = self.local.url.trim_end_matches('/').to_string();
        self.remote.graph_base_url = self.remote.graph_base_url.trim_end_matches('/').to_string();
        self.remote.login_base_url = self.remote.login_base_url.trim_end_matches('/').to_string();
        for change_type in &mut self.bridge.enabled_change_types {
            *change_type = change_type.trim().to_ascii_lowercase();
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("MSTEAMS_BRIDGE_TENANT_ID") {
            self.remote.tenant_id = value;
        }
        if let Ok(value) = std::env::var("MSTEAMS_BRIDGE_CLIENT_ID") {
            self.remote.client_id = value;
        }
        if let Ok(value) = std::env::var("MSTEAMS_BRIDGE_CLIENT_SECRET") {
            self.remote.client_secret = value;
        }
        if let Ok(value) = std::env::var("MSTEAMS_BRIDGE_WEBHOOK_SECRET") {
            self.remote.webhook_secret = value;
        }
        if let Ok(value) = std::env::var("MSTEAMS_BRIDGE_LOCAL_ACCESS_TOKEN") {
            self.local.access_token = value;
        }
        if let Ok(value) = std::env::var("MSTEAMS_BRIDGE_DATABASE_URL") {
            self.database.url = Some(value);
        }
    }

    pub fn delivery_dedup_window(&self) -> Duration {
        Duration::from_secs(self.limits.delivery_dedup_window_secs)
    }

    pub fn tombstone_retention(&self) -> Duration {
        Duration::from_secs(self.limits.tombstone_retention_secs)
    }

    pub fn echo_marker_ttl(&self) -> Duration {
        Duration::from_secs(self.limits.echo_marker_ttl_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.limits.operation_timeout_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    9006
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_enabled_change_types() -> Vec<String> {
    vec![
        "created".to_string(),
        "updated".to_string(),
        "deleted".to_string(),
    ]
}

fn default_synthetic_user_prefix() -> String {
    "msteams_".to_string()
}

fn default_synthetic_display_name_pattern() -> String {
    ":displayname (Teams)".to_string()
}

fn default_graph_base_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_login_base_url() -> String {
    "https://login.microsoftonline.com".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_upload_chunk_size() -> usize {
    UPLOAD_CHUNK_UNIT
}

fn default_max_upload_range_retries() -> u32 {
    3
}

fn default_max_file_size() -> u64 {
    100 * 1024 * 1024
}

fn default_max_file_attachments() -> usize {
    10
}

fn default_worker_count() -> usize {
    16
}

fn default_queue_capacity() -> usize {
    5000
}

fn default_push_timeout_ms() -> u64 {
    100
}

fn default_refresh_margin_secs() -> u64 {
    300
}

fn default_subscription_expiry_secs() -> u64 {
    1800
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

fn default_max_backoff_secs() -> u64 {
    120
}

fn default_recreate_threshold_secs() -> u64 {
    15
}

fn default_delivery_dedup_window_secs() -> u64 {
    600
}

fn default_tombstone_retention_secs() -> u64 {
    86_400
}

fn default_echo_marker_ttl_secs() -> u64 {
    60
}

fn default_echo_fallback_window_ms() -> u64 {
    5_000
}

fn default_operation_timeout_ms() -> u64 {
    30_000
}

fn default_max_retry_attempts() -> u32 {
    5
}

fn default_max_timeout_requeues() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_vanished_retry_delay_ms() -> u64 {
    2_000
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config::load_from_str(
        r#"
bridge:
  webhook_base_url: "https://bridge.example.com/plugins/msteams"
remote:
  tenant_id: "tenant"
  client_id: "client"
  client_secret: "secret-value"
  webhook_secret: "webhook-secret"
local:
  url: "http://mattermost.local/"
  access_token: "token"
  bot_user_id: "bot"
  hook_token: "hook-token"
database:
  url: "memory://"
"#,
    )
    .expect("test config is valid")
}
