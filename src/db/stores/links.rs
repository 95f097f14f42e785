use std::sync::Arc;

use super::{KvCondition, KvOp, KvStore, decode, encode};
use crate::db::{ConversationLink, DatabaseError};
use crate::msteams::RemoteContainer;

fn link_key(link_id: &str) -> String {
    format!("link:{}", link_id)
}

fn local_index_key(local_conversation_id: &str) -> String {
    format!("linkidx:local:{}", local_conversation_id)
}

fn remote_index_key(container: &RemoteContainer) -> String {
    format!("linkidx:remote:{}", container.key())
}

#[derive(Clone)]
pub struct LinkStore {
    kv: Arc<dyn KvStore>,
}

impl LinkStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Fails with `Conflict` when either conversation is already linked.
    pub async fn create_link(&self, link: &ConversationLink) -> Result<(), DatabaseError> {
        let local_idx = local_index_key(&link.local_conversation_id);
        let remote_idx = remote_index_key(&link.remote);
        let applied = self
            .kv
            .transact(
                vec![
                    KvCondition::absent(local_idx.clone()),
                    KvCondition::absent(remote_idx.clone()),
                    KvCondition::absent(link_key(&link.link_id)),
                ],
                vec![
                    KvOp::put(link_key(&link.link_id), encode(link)?, None),
                    KvOp::put(local_idx, link.link_id.clone(), None),
                    KvOp::put(remote_idx, link.link_id.clone(), None),
                ],
            )
            .await?;
        if applied {
            Ok(())
        } else {
            Err(DatabaseError::Conflict(format!(
                "local conversation {} or remote container {} is already linked",
                link.local_conversation_id,
                link.remote.key()
            )))
        }
    }

    pub async fn get(&self, link_id: &str) -> Result<Option<ConversationLink>, DatabaseError> {
        self.kv
            .get(&link_key(link_id))
            .await?
            .as_deref()
            .map(decode::<ConversationLink>)
            .transpose()
    }

    pub async fn get_by_local(
        &self,
        local_conversation_id: &str,
    ) -> Result<Option<ConversationLink>, DatabaseError> {
        match self.kv.get(&local_index_key(local_conversation_id)).await? {
            Some(link_id) => self.get(&link_id).await,
            None => Ok(None),
        }
    }

    pub async fn get_by_remote(
        &self,
        container: &RemoteContainer,
    ) -> Result<Option<ConversationLink>, DatabaseError> {
        match self.kv.get(&remote_index_key(container)).await? {
            Some(link_id) => self.get(&link_id).await,
            None => Ok(None),
        }
    }

    pub async fn list(&self) -> Result<Vec<ConversationLink>, DatabaseError> {
        self.kv
            .list_prefix("link:")
            .await?
            .iter()
            .map(|(_, raw)| decode::<ConversationLink>(raw))
            .collect()
    }

    pub async fn delete(&self, link_id: &str) -> Result<Option<ConversationLink>, DatabaseError> {
        let Some(link) = self.get(link_id).await? else {
            return Ok(None);
        };
        self.kv
            .transact(
                Vec::new(),
                vec![
                    KvOp::delete(link_key(&link.link_id)),
                    KvOp::delete(local_index_key(&link.local_conversation_id)),
                    KvOp::delete(remote_index_key(&link.remote)),
                ],
            )
            .await?;
        Ok(Some(link))
    }
}
