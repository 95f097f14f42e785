use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::DatabaseError;

mod links;
mod markers;
mod messages;
mod subscriptions;
mod users;

pub use self::links::LinkStore;
pub use self::markers::MarkerStore;
pub use self::messages::MessageStore;
pub use self::subscriptions::SubscriptionStore;
pub use self::users::UserStore;

/// Attempts made by read-modify-write helpers before reporting a conflict.
pub(crate) const CAS_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    Put {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Delete {
        key: String,
    },
}

impl KvOp {
    pub fn put(key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) -> Self {
        KvOp::Put {
            key: key.into(),
            value: value.into(),
            ttl,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        KvOp::Delete { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            KvOp::Put { key, .. } | KvOp::Delete { key } => key,
        }
    }
}

/// Precondition for [`KvStore::transact`]: the live value under `key` must
/// equal `expected` (`None` meaning absent or expired).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvCondition {
    pub key: String,
    pub expected: Option<String>,
}

impl KvCondition {
    pub fn new(key: impl Into<String>, expected: Option<String>) -> Self {
        Self {
            key: key.into(),
            expected,
        }
    }

    pub fn absent(key: impl Into<String>) -> Self {
        Self::new(key, None)
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn expiry_millis(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now_millis().saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64))
}

/// Backend seam for the correspondence store. Every mutation funnels
/// through `transact`, which applies all ops or none.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, DatabaseError>;

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, DatabaseError>;

    async fn transact(
        &self,
        conditions: Vec<KvCondition>,
        ops: Vec<KvOp>,
    ) -> Result<bool, DatabaseError>;

    async fn purge_expired(&self) -> Result<u64, DatabaseError>;

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), DatabaseError> {
        self.transact(Vec::new(), vec![KvOp::put(key, value, ttl)])
            .await
            .map(|_| ())
    }

    async fn delete(&self, key: &str) -> Result<(), DatabaseError> {
        self.transact(Vec::new(), vec![KvOp::delete(key)])
            .await
            .map(|_| ())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<bool, DatabaseError> {
        let op = match value {
            Some(value) => KvOp::put(key, value, ttl),
            None => KvOp::delete(key),
        };
        self.transact(
            vec![KvCondition::new(key, expected.map(str::to_string))],
            vec![op],
        )
        .await
    }
}

pub(crate) fn encode<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, DatabaseError> {
    Ok(serde_json::from_str(raw)?)
}
