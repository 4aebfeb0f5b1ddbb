use std::sync::Arc;

use huddle_core::errors::{RegistryError, TurnError};
use huddle_core::events::{EventDetail, EventSink};
use huddle_core::{ContextDiff, Conversation};
use thiserror::Error;
use tracing::{info, warn};

use crate::registry::AgentRegistry;
use crate::trace;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HandoffError {
    #[error("agent `{from}` may not hand off to `{to}`")]
    NotAllowed { from: String, to: String },
    #[error("handoff chain exceeded {limit} hops (last request: `{from}` -> `{to}`)")]
    LoopDetected { from: String, to: String, limit: usize },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl From<HandoffError> for TurnError {
    fn from(value: HandoffError) -> Self {
        match value {
            HandoffError::NotAllowed { from, to } => Self::HandoffNotAllowed { from, to },
            HandoffError::LoopDetected { from, to, limit } => {
                Self::HandoffLoopDetected { from, to, limit }
            }
            HandoffError::Registry(error) => error.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HandoffOutcome {
    pub source: String,
    pub target: String,
    /// Context fields filled by the target's entry defaults.
    pub seeded: ContextDiff,
}

/// Validates requested control transfers against the registry's handoff graph.
#[derive(Clone)]
pub struct HandoffResolver {
    registry: Arc<AgentRegistry>,
    sink: Arc<dyn EventSink>,
    max_chain: usize,
}

impl HandoffResolver {
    pub fn new(registry: Arc<AgentRegistry>, sink: Arc<dyn EventSink>, max_chain: usize) -> Self {
        Self { registry, sink, max_chain }
    }

    /// Moves control from `from` to `to`.
    ///
    /// `hops_so_far` counts handoffs already accepted in the current turn. A
    /// rejected request leaves the conversation untouched.
    pub fn resolve(
        &self,
        conversation: &mut Conversation,
        from: &str,
        to: &str,
        hops_so_far: usize,
    ) -> Result<HandoffOutcome, HandoffError> {
        let source = self.registry.get(from)?;
        if !source.can_hand_off_to(to) {
            warn!(
                event_name = "handoff.rejected",
                conversation_id = %conversation.id,
                agent = %from,
                target = %to,
                reason = "not_allowed",
                "handoff target outside the agent's handoff set"
            );
            return Err(HandoffError::NotAllowed { from: from.to_owned(), to: to.to_owned() });
        }
        let target = self.registry.get(to)?;
        if hops_so_far >= self.max_chain {
            warn!(
                event_name = "handoff.rejected",
                conversation_id = %conversation.id,
                agent = %from,
                target = %to,
                reason = "loop_detected",
                limit = self.max_chain,
                "handoff chain bound reached"
            );
            return Err(HandoffError::LoopDetected {
                from: from.to_owned(),
                to: to.to_owned(),
                limit: self.max_chain,
            });
        }

        trace::record(
            conversation,
            self.sink.as_ref(),
            from,
            format!("Handed off from {from} to {to}"),
            EventDetail::Handoff { source_agent: from.to_owned(), target_agent: to.to_owned() },
        );
        conversation.active_agent = target.name.clone();

        let seeded = conversation.context.seed_defaults(&target.on_enter);
        if !seeded.is_empty() {
            let fields = seeded.keys().cloned().collect::<Vec<_>>().join(", ");
            trace::record(
                conversation,
                self.sink.as_ref(),
                &target.name,
                format!("Updated context: {fields}"),
                EventDetail::ContextUpdate { changes: seeded.clone() },
            );
        }

        info!(
            event_name = "handoff.accepted",
            conversation_id = %conversation.id,
            agent = %from,
            target = %to,
            hop = hops_so_far + 1,
            "handoff accepted"
        );
        Ok(HandoffOutcome { source: from.to_owned(), target: target.name.clone(), seeded })
    }
}
