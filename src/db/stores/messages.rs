use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use super::{CAS_ATTEMPTS, KvCondition, KvOp, KvStore, decode, encode};
use crate::db::{DatabaseError, MessageCorrespondence};
use crate::msteams::RemoteContainer;

fn local_key(local_message_id: &str) -> String {
    format!("msg:local:{}", local_message_id)
}

fn remote_key(container: &RemoteContainer, remote_message_id: &str) -> String {
    format!("msg:remote:{}:{}", container.key(), remote_message_id)
}

fn row_keys(row: &MessageCorrespondence) -> Vec<String> {
    let mut keys = Vec::with_capacity(2);
    if !row.local_message_id.is_empty() {
        keys.push(local_key(&row.local_message_id));
    }
    if !row.remote_message_id.is_empty() {
        keys.push(remote_key(&row.remote_container, &row.remote_message_id));
    }
    keys
}

/// Message bijection. Each row is written under both its local and its
/// remote key in one transaction, so either side resolves to the same row.
#[derive(Clone)]
pub struct MessageStore {
    kv: Arc<dyn KvStore>,
}

impl MessageStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    async fn read(&self, key: &str) -> Result<(Option<String>, Option<MessageCorrespondence>), DatabaseError> {
        let raw = self.kv.get(key).await?;
        let row = raw.as_deref().map(decode::<MessageCorrespondence>).transpose()?;
        Ok((raw, row))
    }

    pub async fn resolve_local_from_remote(
        &self,
        container: &RemoteContainer,
        remote_message_id: &str,
    ) -> Result<Option<MessageCorrespondence>, DatabaseError> {
        Ok(self.read(&remote_key(container, remote_message_id)).await?.1)
    }

    pub async fn resolve_remote_from_local(
        &self,
        local_message_id: &str,
    ) -> Result<Option<MessageCorrespondence>, DatabaseError> {
        Ok(self.read(&local_key(local_message_id)).await?.1)
    }

    /// Inserts `proposal` or folds its mutable fields into the existing row.
    /// Returns the row as stored; when either id is already paired with a
    /// different counterpart (or tombstoned) the stored row wins unchanged.
    pub async fn link_message(
        &self,
        proposal: MessageCorrespondence,
    ) -> Result<MessageCorrespondence, DatabaseError> {
        let lkey = local_key(&proposal.local_message_id);
        let rkey = remote_key(&proposal.remote_container, &proposal.remote_message_id);

        for _ in 0..CAS_ATTEMPTS {
            let (local_raw, by_local) = self.read(&lkey).await?;
            let (remote_raw, by_remote) = self.read(&rkey).await?;

            for existing in [&by_local, &by_remote].into_iter().flatten() {
                if existing.is_deleted() {
                    debug!(
                        "message link skipped local_id={} remote_id={} reason=tombstoned",
                        proposal.local_message_id, proposal.remote_message_id
                    );
                    return Ok(existing.clone());
                }
                if !existing.same_pair(&proposal) {
                    warn!(
                        "message link conflict local_id={} remote_id={} existing_local_id={} existing_remote_id={}",
                        proposal.local_message_id,
                        proposal.remote_message_id,
                        existing.local_message_id,
                        existing.remote_message_id
                    );
                    return Ok(existing.clone());
                }
            }

            let row = match by_local.or(by_remote) {
                Some(existing) => existing.merge(&proposal),
                None => proposal.clone(),
            };
            let value = encode(&row)?;
            let applied = self
                .kv
                .transact(
                    vec![
                        KvCondition::new(lkey.clone(), local_raw),
                        KvCondition::new(rkey.clone(), remote_raw),
                    ],
                    vec![
                        KvOp::put(lkey.clone(), value.clone(), None),
                        KvOp::put(rkey.clone(), value, None),
                    ],
                )
                .await?;
            if applied {
                return Ok(row);
            }
        }

        Err(DatabaseError::Conflict(format!(
            "message link for local_id={} did not converge",
            proposal.local_message_id
        )))
    }

    pub async fn tombstone_local(
        &self,
        local_message_id: &str,
        retention: Duration,
    ) -> Result<MessageCorrespondence, DatabaseError> {
        let key = local_key(local_message_id);
        let orphan_id = local_message_id.to_string();
        self.tombstone(key, retention, move |now| MessageCorrespondence {
            link_id: String::new(),
            local_message_id: orphan_id,
            local_root_id: None,
            remote_message_id: String::new(),
            remote_parent_id: None,
            remote_container: RemoteContainer::Chat {
                chat_id: String::new(),
            },
            origin: crate::db::Origin::Local,
            edit_hash: None,
            last_sender: None,
            remote_updated_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: Some(now),
        })
        .await
    }

    pub async fn tombstone_remote(
        &self,
        link_id: &str,
        container: &RemoteContainer,
        remote_message_id: &str,
        retention: Duration,
    ) -> Result<MessageCorrespondence, DatabaseError> {
        let key = remote_key(container, remote_message_id);
        let link_id = link_id.to_string();
        let container = container.clone();
        let orphan_id = remote_message_id.to_string();
        self.tombstone(key, retention, move |now| MessageCorrespondence {
            link_id,
            local_message_id: String::new(),
            local_root_id: None,
            remote_message_id: orphan_id,
            remote_parent_id: None,
            remote_container: container,
            origin: crate::db::Origin::Remote,
            edit_hash: None,
            last_sender: None,
            remote_updated_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: Some(now),
        })
        .await
    }

    async fn tombstone<F>(
        &self,
        key: String,
        retention: Duration,
        orphan: F,
    ) -> Result<MessageCorrespondence, DatabaseError>
    where
        F: FnOnce(chrono::DateTime<Utc>) -> MessageCorrespondence,
    {
        let mut orphan = Some(orphan);
        for _ in 0..CAS_ATTEMPTS {
            let (raw, row) = self.read(&key).await?;
            let now = Utc::now();
            let Some(mut row) = row else {
                let Some(build) = orphan.take() else {
                    break;
                };
                let tombstone = build(now);
                let applied = self
                    .kv
                    .transact(
                        vec![KvCondition::absent(key.clone())],
                        vec![KvOp::put(key.clone(), encode(&tombstone)?, Some(retention))],
                    )
                    .await?;
                if applied {
                    return Ok(tombstone);
                }
                continue;
            };

            if row.is_deleted() {
                return Ok(row);
            }

            row.deleted_at = Some(now);
            row.updated_at = now;
            let value = encode(&row)?;
            let mut conditions = Vec::with_capacity(2);
            let mut ops = Vec::with_capacity(2);
            for row_key in row_keys(&row) {
                let expected = if row_key == key {
                    raw.clone()
                } else {
                    self.kv.get(&row_key).await?
                };
                conditions.push(KvCondition::new(row_key.clone(), expected));
                ops.push(KvOp::put(row_key, value.clone(), Some(retention)));
            }
            if self.kv.transact(conditions, ops).await? {
                return Ok(row);
            }
        }

        Err(DatabaseError::Conflict(format!(
            "message tombstone for key={} did not converge",
            key
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::db::memory::MemoryKvStore;
    use crate::db::{ConversationLink, LinkKind, Origin};

    fn store() -> MessageStore {
        MessageStore::new(Arc::new(MemoryKvStore::new()))
    }

    fn link() -> ConversationLink {
        ConversationLink::new(
            "local-channel",
            RemoteContainer::Channel {
                team_id: "T1".to_string(),
                channel_id: "C1".to_string(),
            },
            LinkKind::Channel,
            "admin",
        )
    }

    #[tokio::test]
    async fn link_resolves_in_both_directions() {
        let store = store();
        let link = link();
        let row = MessageCorrespondence::new(&link, "L1", "R1", Origin::Remote);
        store.link_message(row).await.unwrap();

        let from_remote = store
            .resolve_local_from_remote(&link.remote, "R1")
            .await
            .unwrap()
            .unwrap();
        let from_local = store.resolve_remote_from_local("L1").await.unwrap().unwrap();
        assert_eq!(from_remote.local_message_id, "L1");
        assert_eq!(from_local.remote_message_id, "R1");
        assert_eq!(from_local, from_remote);
    }

    #[tokio::test]
    async fn immutable_pair_is_first_writer_wins() {
        let store = store();
        let link = link();
        store
            .link_message(MessageCorrespondence::new(&link, "L1", "R1", Origin::Remote))
            .await
            .unwrap();
        let stored = store
            .link_message(MessageCorrespondence::new(&link, "L1", "R2", Origin::Remote))
            .await
            .unwrap();
        assert_eq!(stored.remote_message_id, "R1");
        assert!(
            store
                .resolve_local_from_remote(&link.remote, "R2")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn mutable_fields_are_last_writer_wins() {
        let store = store();
        let link = link();
        store
            .link_message(
                MessageCorrespondence::new(&link, "L1", "R1", Origin::Remote).with_edit_hash("a"),
            )
            .await
            .unwrap();
        let stored = store
            .link_message(
                MessageCorrespondence::new(&link, "L1", "R1", Origin::Remote).with_edit_hash("b"),
            )
            .await
            .unwrap();
        assert_eq!(stored.edit_hash.as_deref(), Some("b"));
        let reread = store.resolve_remote_from_local("L1").await.unwrap().unwrap();
        assert_eq!(reread.edit_hash.as_deref(), Some("b"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_links_converge_to_one_row() {
        let store = store();
        let link = link();
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let row = MessageCorrespondence::new(&link, "L1", "R1", Origin::Remote)
                .with_edit_hash(format!("h{i}"));
            handles.push(tokio::spawn(async move { store.link_message(row).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let a = store.resolve_remote_from_local("L1").await.unwrap().unwrap();
        let b = store
            .resolve_local_from_remote(&link.remote, "R1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn tombstone_is_idempotent_and_visible_from_both_sides() {
        let store = store();
        let link = link();
        store
            .link_message(MessageCorrespondence::new(&link, "L1", "R1", Origin::Local))
            .await
            .unwrap();
        let first = store
            .tombstone_local("L1", Duration::from_secs(60))
            .await
            .unwrap();
        let second = store
            .tombstone_remote(&link.link_id, &link.remote, "R1", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(first.is_deleted());
        assert_eq!(first.deleted_at, second.deleted_at);
        let remote_view = store
            .resolve_local_from_remote(&link.remote, "R1")
            .await
            .unwrap()
            .unwrap();
        assert!(remote_view.is_deleted());
    }

    #[tokio::test]
    async fn delete_before_create_blocks_later_link() {
        let store = store();
        let link = link();
        let tombstone = store
            .tombstone_remote(&link.link_id, &link.remote, "R9", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(tombstone.is_orphan());

        let stored = store
            .link_message(MessageCorrespondence::new(&link, "L9", "R9", Origin::Remote))
            .await
            .unwrap();
        assert!(stored.is_deleted());
        assert!(store.resolve_remote_from_local("L9").await.unwrap().is_none());
    }
}
