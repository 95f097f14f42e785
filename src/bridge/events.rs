use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::db::DatabaseError;
use crate::mattermost::LocalError;
use crate::msteams::{RemoteError, RemoteMessage, ResourceLocator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

impl ChangeType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "created" => Some(ChangeType::Created),
            "updated" => Some(ChangeType::Updated),
            "deleted" => Some(ChangeType::Deleted),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::Created => "created",
            ChangeType::Updated => "updated",
            ChangeType::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Message,
    ChatMessage,
}

/// One change record taken from a webhook delivery or synthesized by the
/// replay on startup.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub change_type: ChangeType,
    pub locator: ResourceLocator,
    pub subscription_id: String,
    pub delivery_id: String,
    pub received_at: DateTime<Utc>,
    /// Message content delivered inline (decrypted resource data or a
    /// replayed message); saves the read from the remote side.
    pub message: Option<RemoteMessage>,
    pub attempts: u32,
    pub timeout_requeues: u32,
    pub vanished_retried: bool,
}

impl ChangeEvent {
    pub fn new(
        change_type: ChangeType,
        locator: ResourceLocator,
        subscription_id: impl Into<String>,
        delivery_id: impl Into<String>,
    ) -> Self {
        Self {
            change_type,
            locator,
            subscription_id: subscription_id.into(),
            delivery_id: delivery_id.into(),
            received_at: Utc::now(),
            message: None,
            attempts: 0,
            timeout_requeues: 0,
            vanished_retried: false,
        }
    }

    pub fn with_message(mut self, message: RemoteMessage) -> Self {
        self.message = Some(message);
        self
    }

    pub fn resource_kind(&self) -> ResourceKind {
        if self.locator.container.is_chat() {
            ResourceKind::ChatMessage
        } else {
            ResourceKind::Message
        }
    }

    /// Serialization lane: one per remote conversation, which is linked to
    /// at most one local conversation.
    pub fn lane(&self) -> String {
        self.locator.container.key()
    }
}

/// Why an event or file was dropped. Labels are stable metric values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscardReason {
    Echo,
    Unlinked,
    DuplicatedPost,
    AlreadyAppliedChange,
    Tombstoned,
    Vanished,
    Timeout,
    Error,
    BadRequest,
    Policy,
    InvalidChangeType,
    ChangeTypeDisabled,
    DirectionDisabled,
    DirectMessagesDisabled,
    SyntheticUser,
    IsBotUser,
    Size,
    FileLimitReached,
    UnableToGetRemoteData,
    QueueClosed,
}

impl DiscardReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DiscardReason::Echo => "self",
            DiscardReason::Unlinked => "unlinked",
            DiscardReason::DuplicatedPost => "duplicated_post",
            DiscardReason::AlreadyAppliedChange => "already_applied_change",
            DiscardReason::Tombstoned => "tombstoned",
            DiscardReason::Vanished => "vanished",
            DiscardReason::Timeout => "timeout",
            DiscardReason::Error => "error",
            DiscardReason::BadRequest => "bad_request",
            DiscardReason::Policy => "policy",
            DiscardReason::InvalidChangeType => "invalid_change_type",
            DiscardReason::ChangeTypeDisabled => "change_type_disabled",
            DiscardReason::DirectionDisabled => "direction_disabled",
            DiscardReason::DirectMessagesDisabled => "direct_messages_disabled",
            DiscardReason::SyntheticUser => "synthetic_user",
            DiscardReason::IsBotUser => "is_bot_user",
            DiscardReason::Size => "size",
            DiscardReason::FileLimitReached => "file_limit_reached",
            DiscardReason::UnableToGetRemoteData => "unable_to_get_remote_data",
            DiscardReason::QueueClosed => "queue_closed",
        }
    }
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied,
    Discarded(DiscardReason),
}

impl SyncOutcome {
    pub fn discarded_reason(self) -> &'static str {
        match self {
            SyncOutcome::Applied => crate::web::metrics::NOT_DISCARDED,
            SyncOutcome::Discarded(reason) => reason.as_str(),
        }
    }
}

/// Failure of one sync operation, classified for the dispatcher's retry
/// policy.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited retry_after={retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("transient failure: {0}")]
    TransportTransient(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("rejected by policy: {0}")]
    PolicyRejection(String),

    #[error("correspondence missing: {0}")]
    CorrespondenceMissing(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl SyncError {
    pub fn deadline_exceeded(operation: &str) -> Self {
        SyncError::TransportTransient(format!("deadline exceeded during {operation}"))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::RateLimited { .. } | SyncError::TransportTransient(_)
        )
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Unauthorized(detail) => SyncError::Unauthorized(detail),
            RemoteError::NotFound(detail) => SyncError::NotFound(detail),
            RemoteError::RateLimited { retry_after } | RemoteError::Throttled { retry_after } => {
                SyncError::RateLimited { retry_after }
            }
            RemoteError::TransportTransient(detail) => SyncError::TransportTransient(detail),
            RemoteError::BadRequest(detail) => SyncError::BadRequest(detail),
            RemoteError::Other(detail) => SyncError::Fatal(detail),
        }
    }
}

impl From<LocalError> for SyncError {
    fn from(err: LocalError) -> Self {
        match err {
            LocalError::Unauthorized(detail) => SyncError::Unauthorized(detail),
            LocalError::NotFound(detail) => SyncError::NotFound(detail),
            LocalError::BadRequest(detail) => SyncError::BadRequest(detail),
            LocalError::Transient(detail) => SyncError::TransportTransient(detail),
            LocalError::Other(detail) => SyncError::Fatal(detail),
        }
    }
}

impl From<DatabaseError> for SyncError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::Connection(detail) | DatabaseError::Conflict(detail) => {
                SyncError::TransportTransient(detail)
            }
            other => SyncError::Fatal(other.to_string()),
        }
    }
}
