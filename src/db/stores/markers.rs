use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{CAS_ATTEMPTS, KvStore};
use crate::db::DatabaseError;

const LAST_RECEIVED_PREFIX: &str = "sync:last_received:";

fn last_received_key(link_id: &str) -> String {
    format!("{LAST_RECEIVED_PREFIX}{link_id}")
}

/// Short-lived markers: webhook delivery ids, anti-echo flags and the
/// per-link replay checkpoints.
#[derive(Clone)]
pub struct MarkerStore {
    kv: Arc<dyn KvStore>,
}

impl MarkerStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Returns `true` only for the first caller within `window`.
    pub async fn record_delivery(
        &self,
        delivery_id: &str,
        window: Duration,
    ) -> Result<bool, DatabaseError> {
        self.kv
            .compare_and_set(
                &format!("delivery:{}", delivery_id),
                None,
                Some("1"),
                Some(window),
            )
            .await
    }

    /// Releases a delivery id so a redelivery is processed again.
    pub async fn forget_delivery(&self, delivery_id: &str) -> Result<(), DatabaseError> {
        self.kv.delete(&format!("delivery:{}", delivery_id)).await
    }

    pub async fn put_anti_echo_marker(&self, key: &str, ttl: Duration) -> Result<(), DatabaseError> {
        self.kv.put(&format!("echo:{}", key), "1", Some(ttl)).await
    }

    /// Removes the marker; only one concurrent consumer observes `true`.
    pub async fn consume_anti_echo_marker(&self, key: &str) -> Result<bool, DatabaseError> {
        let key = format!("echo:{}", key);
        match self.kv.get(&key).await? {
            Some(value) => self.kv.compare_and_set(&key, Some(&value), None, None).await,
            None => Ok(false),
        }
    }

    pub async fn last_received_change(
        &self,
        link_id: &str,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        Ok(self
            .kv
            .get(&last_received_key(link_id))
            .await?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|at| at.with_timezone(&Utc)))
    }

    /// Moves the link's checkpoint forward; older timestamps are ignored.
    pub async fn advance_last_received_change(
        &self,
        link_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let key = last_received_key(link_id);
        for _ in 0..CAS_ATTEMPTS {
            let raw = self.kv.get(&key).await?;
            let current = raw
                .as_deref()
                .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
                .map(|value| value.with_timezone(&Utc));
            if current.is_some_and(|current| current >= at) {
                return Ok(());
            }
            let next = at.to_rfc3339();
            if self
                .kv
                .compare_and_set(&key, raw.as_deref(), Some(&next), None)
                .await?
            {
                return Ok(());
            }
        }
        Err(DatabaseError::Conflict(
            format!("last received checkpoint of link {link_id} did not converge"),
        ))
    }
}
