//! Agent runtime - guardrails, routing, tools and handoffs for multi-agent conversations
//!
//! This crate drives one conversation turn at a time:
//! - Screens every user input with independent guardrails (`guardrails`)
//! - Asks the active agent's model capability what to do next (`llm`)
//! - Runs authorized tools against the shared analysis context (`tools`)
//! - Transfers control along the declared handoff graph (`handoff`)
//! - Fans cross-domain questions out to several specialists (`orchestrator`)
//! - Records every step in the conversation's event trace
//!
//! # Architecture
//!
//! The turn loop is bounded on every axis:
//! 1. **Guardrails** - all checks run; any failure refuses the turn without a model call
//! 2. **Model step** - the capability answers, requests tools, or requests a handoff
//! 3. **Tool loop** - repeats until a message, capped by `max_iterations`
//! 4. **Handoff** - the new agent gets the same input, capped by `max_handoff_chain`
//!
//! # Key Types
//!
//! - `ConversationEngine` - turn orchestrator (see `runtime` module)
//! - `AgentRegistry` - validated, read-only agent catalog
//! - `ModelCapability` - pluggable "ask the model" seam; `KeywordModel` runs offline
//!
//! # Safety Principle
//!
//! The model never decides what it is allowed to do. Every tool call and
//! handoff it requests is checked against the static registry first.

pub mod catalog;
pub mod guardrails;
pub mod handoff;
pub mod llm;
pub mod orchestrator;
pub mod registry;
pub mod runtime;
pub mod store;
pub mod tools;

mod trace;

pub use guardrails::{Guardrail, GuardrailEngine, GuardrailInput, GuardrailReport};
pub use handoff::{HandoffError, HandoffOutcome, HandoffResolver};
pub use llm::{KeywordModel, ModelCapability, ModelReply, ModelRequest, ScriptedModel};
pub use registry::{AgentDefinition, AgentRegistry, AgentSummary};
pub use runtime::{
    cancellation, CancelHandle, CancelSignal, ConversationEngine, EngineSettings, TurnRequest,
    TurnResponse,
};
pub use store::{ConversationStore, InMemoryConversationStore, TurnGate};
pub use tools::{Tool, ToolCallRequest, ToolError, ToolInvoker, ToolOutcome};
