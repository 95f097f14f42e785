use std::sync::Arc;

use super::{KvStore, decode, encode};
use crate::db::{DatabaseError, SubscriptionRecord};

fn subscription_key(subscription_id: &str) -> String {
    format!("sub:{}", subscription_id)
}

#[derive(Clone)]
pub struct SubscriptionStore {
    kv: Arc<dyn KvStore>,
}

impl SubscriptionStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn put(&self, record: &SubscriptionRecord) -> Result<(), DatabaseError> {
        self.kv
            .put(&subscription_key(&record.subscription_id), &encode(record)?, None)
            .await
    }

    pub async fn get(
        &self,
        subscription_id: &str,
    ) -> Result<Option<SubscriptionRecord>, DatabaseError> {
        self.kv
            .get(&subscription_key(subscription_id))
            .await?
            .as_deref()
            .map(decode::<SubscriptionRecord>)
            .transpose()
    }

    pub async fn list(&self) -> Result<Vec<SubscriptionRecord>, DatabaseError> {
        self.kv
            .list_prefix("sub:")
            .await?
            .iter()
            .map(|(_, raw)| decode::<SubscriptionRecord>(raw))
            .collect()
    }

    pub async fn delete(&self, subscription_id: &str) -> Result<(), DatabaseError> {
        self.kv.delete(&subscription_key(subscription_id)).await
    }
}
