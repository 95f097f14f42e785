use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::DatabaseError;
use super::stores::{KvCondition, KvOp, KvStore, expiry_millis, now_millis};

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<i64>,
}

impl MemoryEntry {
    fn live(&self, now: i64) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Process-local backend; a single lock makes every transaction linearizable.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<BTreeMap<String, MemoryEntry>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let now = now_millis();
        let entries = self.entries.lock();
        Ok(entries
            .get(key)
            .filter(|entry| entry.live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, DatabaseError> {
        let now = now_millis();
        let entries = self.entries.lock();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, entry)| entry.live(now))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect())
    }

    async fn transact(
        &self,
        conditions: Vec<KvCondition>,
        ops: Vec<KvOp>,
    ) -> Result<bool, DatabaseError> {
        let now = now_millis();
        let mut entries = self.entries.lock();

        for condition in &conditions {
            let current = entries
                .get(&condition.key)
                .filter(|entry| entry.live(now))
                .map(|entry| entry.value.as_str());
            if current != condition.expected.as_deref() {
                return Ok(false);
            }
        }

        for op in ops {
            match op {
                KvOp::Put { key, value, ttl } => {
                    entries.insert(
                        key,
                        MemoryEntry {
                            value,
                            expires_at: expiry_millis(ttl),
                        },
                    );
                }
                KvOp::Delete { key } => {
                    entries.remove(&key);
                }
            }
        }
        Ok(true)
    }

    async fn purge_expired(&self) -> Result<u64, DatabaseError> {
        let now = now_millis();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.live(now));
        Ok((before - entries.len()) as u64)
    }
}
