use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::conversation::ConversationId;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown agent `{0}`")]
    UnknownAgent(String),
    #[error("invalid agent registry: {0}")]
    InvalidRegistry(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TurnError {
    #[error("unknown agent `{0}`")]
    UnknownAgent(String),
    #[error("invalid agent registry: {0}")]
    InvalidRegistry(String),
    #[error("agent `{agent}` is not permitted to call tool `{tool}`")]
    ToolNotPermitted { agent: String, tool: String },
    #[error("tool `{tool}` failed: {message}")]
    ToolExecutionFailed { tool: String, message: String },
    #[error("agent `{from}` may not hand off to `{to}`")]
    HandoffNotAllowed { from: String, to: String },
    #[error("handoff chain exceeded {limit} hops (last request: `{from}` -> `{to}`)")]
    HandoffLoopDetected { from: String, to: String, limit: usize },
    #[error("turn exceeded {limit} model iterations")]
    TurnIterationLimitExceeded { limit: usize },
    #[error("turn exceeded its {budget_secs}s wall-clock budget")]
    TurnTimeout { budget_secs: u64 },
    #[error("a turn is already in progress for conversation `{0}`")]
    TurnInProgress(ConversationId),
    #[error("turn was cancelled")]
    Cancelled,
    #[error("model capability failed: {0}")]
    ModelUnavailable(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RegistryError> for TurnError {
    fn from(value: RegistryError) -> Self {
        match value {
            RegistryError::UnknownAgent(name) => Self::UnknownAgent(name),
            RegistryError::InvalidRegistry(message) => Self::InvalidRegistry(message),
        }
    }
}

/// Stable machine-readable failure codes for transports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnknownAgent,
    InvalidRegistry,
    ToolNotPermitted,
    ToolExecutionFailed,
    HandoffNotAllowed,
    HandoffLoopDetected,
    TurnIterationLimitExceeded,
    TurnTimeout,
    TurnInProgress,
    GuardrailTripped,
    TurnCancelled,
    ModelUnavailable,
    PersistenceFailure,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownAgent => "unknown_agent",
            Self::InvalidRegistry => "invalid_registry",
            Self::ToolNotPermitted => "tool_not_permitted",
            Self::ToolExecutionFailed => "tool_execution_failed",
            Self::HandoffNotAllowed => "handoff_not_allowed",
            Self::HandoffLoopDetected => "handoff_loop_detected",
            Self::TurnIterationLimitExceeded => "turn_iteration_limit_exceeded",
            Self::TurnTimeout => "turn_timeout",
            Self::TurnInProgress => "turn_in_progress",
            Self::GuardrailTripped => "guardrail_tripped",
            Self::TurnCancelled => "turn_cancelled",
            Self::ModelUnavailable => "model_unavailable",
            Self::PersistenceFailure => "persistence_failure",
            Self::Internal => "internal_error",
        }
    }

    /// End-user text. Never carries internal detail.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::ToolNotPermitted | Self::HandoffNotAllowed => {
                "Sorry, I'm not able to do that from here."
            }
            Self::TurnInProgress => {
                "Your previous message is still being processed. Please wait a moment."
            }
            Self::TurnCancelled => "The request was cancelled.",
            Self::GuardrailTripped => {
                "Sorry, I can only answer questions related to game data analytics."
            }
            Self::UnknownAgent
            | Self::InvalidRegistry
            | Self::ToolExecutionFailed
            | Self::HandoffLoopDetected
            | Self::TurnIterationLimitExceeded
            | Self::TurnTimeout
            | Self::ModelUnavailable
            | Self::PersistenceFailure
            | Self::Internal => {
                "Sorry, something went wrong while handling your request. Please try again."
            }
        }
    }
}

impl TurnError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownAgent(_) => ErrorCode::UnknownAgent,
            Self::InvalidRegistry(_) => ErrorCode::InvalidRegistry,
            Self::ToolNotPermitted { .. } => ErrorCode::ToolNotPermitted,
            Self::ToolExecutionFailed { .. } => ErrorCode::ToolExecutionFailed,
            Self::HandoffNotAllowed { .. } => ErrorCode::HandoffNotAllowed,
            Self::HandoffLoopDetected { .. } => ErrorCode::HandoffLoopDetected,
            Self::TurnIterationLimitExceeded { .. } => ErrorCode::TurnIterationLimitExceeded,
            Self::TurnTimeout { .. } => ErrorCode::TurnTimeout,
            Self::TurnInProgress(_) => ErrorCode::TurnInProgress,
            Self::Cancelled => ErrorCode::TurnCancelled,
            Self::ModelUnavailable(_) => ErrorCode::ModelUnavailable,
            Self::Persistence(_) => ErrorCode::PersistenceFailure,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn into_failure(self, conversation_id: Option<ConversationId>) -> TurnFailure {
        let code = self.code();
        TurnFailure {
            code,
            message: code.user_message().to_owned(),
            conversation_id,
            detail: self.to_string(),
        }
    }
}

/// Failure response handed to the transport layer.
///
/// `message` is safe to show end users; `detail` is for operators and is
/// never serialized.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize)]
#[error("{}: {detail}", .code.as_str())]
pub struct TurnFailure {
    pub code: ErrorCode,
    pub message: String,
    pub conversation_id: Option<ConversationId>,
    #[serde(skip)]
    pub detail: String,
}
