//! Read-only collaborator interface for conversation membership and
//! display metadata. The call subsystem only reads these; all writes
//! belong to the messaging CRUD layer, which is out of scope here.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use beacon_shared::{ConversationId, UserId};

use crate::error::{RelayError, Result};

/// Display metadata for a user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub username: String,
}

/// Display metadata for a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationInfo {
    /// Group name; direct conversations usually have none.
    pub name: Option<String>,
    pub is_group: bool,
    pub participants: Vec<UserId>,
}

/// Membership and metadata lookups consumed by the call controller.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Whether `user_id` belongs to the conversation. A defense against
    /// stray inbound-call notifications, not a security boundary.
    async fn is_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool>;

    async fn get_profile(&self, user_id: UserId) -> Result<Option<Profile>>;

    async fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<ConversationInfo>>;
}

/// In-memory [`Directory`] for tests and local deployments.
#[derive(Default)]
pub struct MemoryDirectory {
    inner: Mutex<DirectoryTables>,
}

#[derive(Default)]
struct DirectoryTables {
    profiles: HashMap<UserId, Profile>,
    conversations: HashMap<ConversationId, ConversationInfo>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<std::sync::MutexGuard<'_, DirectoryTables>> {
        self.inner
            .lock()
            .map_err(|e| RelayError::Backend(format!("Lock poisoned: {e}")))
    }

    pub fn insert_profile(&self, user_id: UserId, username: impl Into<String>) {
        let Ok(mut inner) = self.tables() else {
            return;
        };
        inner.profiles.insert(
            user_id,
            Profile {
                username: username.into(),
            },
        );
    }

    pub fn insert_conversation(
        &self,
        conversation_id: ConversationId,
        name: Option<String>,
        is_group: bool,
        participants: Vec<UserId>,
    ) {
        let Ok(mut inner) = self.tables() else {
            return;
        };
        inner.conversations.insert(
            conversation_id,
            ConversationInfo {
                name,
                is_group,
                participants,
            },
        );
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn is_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool> {
        let inner = self.tables()?;
        Ok(inner
            .conversations
            .get(&conversation_id)
            .map(|c| c.participants.contains(&user_id))
            .unwrap_or(false))
    }

    async fn get_profile(&self, user_id: UserId) -> Result<Option<Profile>> {
        let inner = self.tables()?;
        Ok(inner.profiles.get(&user_id).cloned())
    }

    async fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<ConversationInfo>> {
        let inner = self.tables()?;
        Ok(inner.conversations.get(&conversation_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn membership_check() {
        let directory = MemoryDirectory::new();
        let conversation = ConversationId::new();
        let alice = UserId::new();
        let mallory = UserId::new();

        directory.insert_conversation(conversation, None, false, vec![alice]);

        assert!(directory.is_participant(conversation, alice).await.unwrap());
        assert!(!directory
            .is_participant(conversation, mallory)
            .await
            .unwrap());
        assert!(!directory
            .is_participant(ConversationId::new(), alice)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn unknown_profile_is_none() {
        let directory = MemoryDirectory::new();
        assert!(directory
            .get_profile(UserId::new())
            .await
            .unwrap()
            .is_none());
    }
}
