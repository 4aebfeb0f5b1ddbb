use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::context::{AnalysisContext, ContextStore};
use crate::events::EventRecorder;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub content: String,
    pub turn: u64,
}

/// One persisted conversation: history, active agent, shared context and the
/// full event trace. Loaded and saved as a single record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub active_agent: String,
    pub history: Vec<HistoryEntry>,
    pub context: ContextStore,
    pub trace: EventRecorder,
    pub turns: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn start(id: ConversationId, entry_agent: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            active_agent: entry_agent.into(),
            history: Vec::new(),
            context: ContextStore::new(AnalysisContext::default()),
            trace: EventRecorder::new(),
            turns: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Opens the next turn and returns its number (1-based).
    pub fn begin_turn(&mut self) -> u64 {
        self.turns += 1;
        self.updated_at = Utc::now();
        self.turns
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.history.push(HistoryEntry {
            role: Role::User,
            agent: None,
            content: content.into(),
            turn: self.turns,
        });
    }

    pub fn push_assistant(&mut self, agent: impl Into<String>, content: impl Into<String>) {
        self.history.push(HistoryEntry {
            role: Role::Assistant,
            agent: Some(agent.into()),
            content: content.into(),
            turn: self.turns,
        });
    }

    pub fn last_assistant_message(&self) -> Option<&HistoryEntry> {
        self.history.iter().rev().find(|entry| entry.role == Role::Assistant)
    }

    pub fn has_history(&self) -> bool {
        !self.history.is_empty()
    }
}
