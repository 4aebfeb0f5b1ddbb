use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use huddle_core::config::TurnLockPolicy;
use huddle_core::errors::TurnError;
use huddle_core::{Conversation, ConversationId};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for TurnError {
    fn from(value: StoreError) -> Self {
        Self::Persistence(value.to_string())
    }
}

/// Loads and saves whole conversation records atomically per id.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError>;
    async fn save(&self, conversation: Conversation) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: RwLock<HashMap<ConversationId, Conversation>>,
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError> {
        let conversations = self.conversations.read().await;
        Ok(conversations.get(id).cloned())
    }

    async fn save(&self, conversation: Conversation) -> Result<(), StoreError> {
        let mut conversations = self.conversations.write().await;
        conversations.insert(conversation.id.clone(), conversation);
        Ok(())
    }
}

/// Serializes turns per conversation id. Different ids never contend.
pub struct TurnGate {
    policy: TurnLockPolicy,
    locks: Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>,
}

/// Held for the duration of one turn.
pub struct TurnPermit {
    _guard: OwnedMutexGuard<()>,
}

impl TurnGate {
    pub fn new(policy: TurnLockPolicy) -> Self {
        Self { policy, locks: Mutex::new(HashMap::new()) }
    }

    pub async fn acquire(&self, id: &ConversationId) -> Result<TurnPermit, TurnError> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Drop idle entries so the map tracks only live conversations.
            locks.retain(|key, lock| key == id || Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(id.clone()).or_default())
        };

        let guard = match self.policy {
            TurnLockPolicy::Wait => lock.lock_owned().await,
            TurnLockPolicy::Reject => {
                lock.try_lock_owned().map_err(|_| TurnError::TurnInProgress(id.clone()))?
            }
        };
        Ok(TurnPermit { _guard: guard })
    }
}
