use std::sync::Arc;

use super::{CAS_ATTEMPTS, KvCondition, KvOp, KvStore, decode, encode};
use crate::db::{DatabaseError, UserCorrespondence};

fn local_key(local_user_id: &str) -> String {
    format!("user:local:{}", local_user_id)
}

fn remote_key(remote_user_id: &str) -> String {
    format!("user:remote:{}", remote_user_id)
}

#[derive(Clone)]
pub struct UserStore {
    kv: Arc<dyn KvStore>,
}

impl UserStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    async fn read(&self, key: &str) -> Result<Option<UserCorrespondence>, DatabaseError> {
        self.kv
            .get(key)
            .await?
            .as_deref()
            .map(decode::<UserCorrespondence>)
            .transpose()
    }

    pub async fn resolve_by_local(
        &self,
        local_user_id: &str,
    ) -> Result<Option<UserCorrespondence>, DatabaseError> {
        self.read(&local_key(local_user_id)).await
    }

    pub async fn resolve_by_remote(
        &self,
        remote_user_id: &str,
    ) -> Result<Option<UserCorrespondence>, DatabaseError> {
        self.read(&remote_key(remote_user_id)).await
    }

    pub async fn is_synthetic(&self, local_user_id: &str) -> Result<bool, DatabaseError> {
        Ok(self
            .resolve_by_local(local_user_id)
            .await?
            .is_some_and(|user| user.synthetic))
    }

    /// Records the pairing unless the remote user is already paired, in
    /// which case the existing row is returned. Concurrent provisioning of
    /// the same remote user therefore collapses onto a single row.
    pub async fn link_user(
        &self,
        user: UserCorrespondence,
    ) -> Result<UserCorrespondence, DatabaseError> {
        let lkey = local_key(&user.local_user_id);
        let rkey = remote_key(&user.remote_user_id);
        let value = encode(&user)?;

        for _ in 0..CAS_ATTEMPTS {
            if let Some(existing) = self.read(&rkey).await? {
                return Ok(existing);
            }
            if let Some(existing) = self.read(&lkey).await? {
                if existing.remote_user_id != user.remote_user_id {
                    return Err(DatabaseError::Conflict(format!(
                        "local user {} is already paired with remote user {}",
                        existing.local_user_id, existing.remote_user_id
                    )));
                }
            }
            let applied = self
                .kv
                .transact(
                    vec![KvCondition::absent(rkey.clone()), KvCondition::absent(lkey.clone())],
                    vec![
                        KvOp::put(lkey.clone(), value.clone(), None),
                        KvOp::put(rkey.clone(), value.clone(), None),
                    ],
                )
                .await?;
            if applied {
                return Ok(user);
            }
        }

        Err(DatabaseError::Conflict(format!(
            "user link for remote_id={} did not converge",
            user.remote_user_id
        )))
    }

    pub async fn unlink_user(&self, local_user_id: &str) -> Result<(), DatabaseError> {
        let Some(existing) = self.resolve_by_local(local_user_id).await? else {
            return Ok(());
        };
        self.kv
            .transact(
                Vec::new(),
                vec![
                    KvOp::delete(local_key(&existing.local_user_id)),
                    KvOp::delete(remote_key(&existing.remote_user_id)),
                ],
            )
            .await
            .map(|_| ())
    }

    pub async fn list_users(&self) -> Result<Vec<UserCorrespondence>, DatabaseError> {
        self.kv
            .list_prefix("user:local:")
            .await?
            .iter()
            .map(|(_, raw)| decode::<UserCorrespondence>(raw))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryKvStore;

    fn store() -> UserStore {
        UserStore::new(Arc::new(MemoryKvStore::new()))
    }

    #[tokio::test]
    async fn synthetic_flag_is_reported() {
        let store = store();
        store
            .link_user(UserCorrespondence::new("mm-ghost", "aad-1", true))
            .await
            .unwrap();
        store
            .link_user(UserCorrespondence::new("mm-real", "aad-2", false))
            .await
            .unwrap();
        assert!(store.is_synthetic("mm-ghost").await.unwrap());
        assert!(!store.is_synthetic("mm-real").await.unwrap());
        assert!(!store.is_synthetic("unknown").await.unwrap());
        assert_eq!(store.list_users().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn second_pairing_of_remote_user_returns_first() {
        let store = store();
        store
            .link_user(UserCorrespondence::new("mm-a", "aad-1", true))
            .await
            .unwrap();
        let winner = store
            .link_user(UserCorrespondence::new("mm-b", "aad-1", true))
            .await
            .unwrap();
        assert_eq!(winner.local_user_id, "mm-a");
        assert!(store.resolve_by_local("mm-b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unlink_removes_both_halves() {
        let store = store();
        store
            .link_user(UserCorrespondence::new("mm-a", "aad-1", false))
            .await
            .unwrap();
        store.unlink_user("mm-a").await.unwrap();
        assert!(store.resolve_by_remote("aad-1").await.unwrap().is_none());
        assert!(store.resolve_by_local("mm-a").await.unwrap().is_none());
    }
}
