//! Core domain model for the huddle multi-agent runtime.
//!
//! Everything here is transport- and model-agnostic: the shared
//! [`AnalysisContext`], the [`Conversation`] aggregate, the append-only
//! [`EventRecorder`] trace, the per-turn state table and the error taxonomy.
//! Runtime components that act on these types live in `huddle-agent`.

pub mod config;
pub mod domain;
pub mod errors;
pub mod events;
pub mod turn;

pub use domain::context::{AnalysisContext, ContextDiff, ContextStore, TimeRange};
pub use domain::conversation::{Conversation, ConversationId, HistoryEntry, Role};
pub use domain::guardrail::GuardrailVerdict;
pub use errors::{ErrorCode, RegistryError, TurnError, TurnFailure};
pub use events::{
    Event, EventDetail, EventKind, EventRecorder, EventSink, FailureNote, InMemoryEventSink,
    TracingEventSink,
};
pub use turn::{TurnMachine, TurnSignal, TurnState, TurnTransition, TurnTransitionError};
