use thiserror::Error;

use crate::turn::states::{TurnSignal, TurnState, TurnTransition};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TurnTransitionError {
    #[error("invalid turn transition from {state:?} using signal {signal:?}")]
    InvalidTransition { state: TurnState, signal: TurnSignal },
}

/// Tracks one turn's progress through the turn state table.
#[derive(Clone, Debug)]
pub struct TurnMachine {
    state: TurnState,
    transitions: Vec<TurnTransition>,
}

impl Default for TurnMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnMachine {
    pub fn new() -> Self {
        Self { state: TurnState::AwaitingGuardrail, transitions: Vec::new() }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn transitions(&self) -> &[TurnTransition] {
        &self.transitions
    }

    pub fn apply(&mut self, signal: TurnSignal) -> Result<&TurnTransition, TurnTransitionError> {
        let outcome = transition(self.state, signal)?;
        self.state = outcome.to;
        self.transitions.push(outcome);
        Ok(&self.transitions[self.transitions.len() - 1])
    }
}

pub fn transition(
    current: TurnState,
    signal: TurnSignal,
) -> Result<TurnTransition, TurnTransitionError> {
    use TurnSignal::{
        Aborted, BootstrapRequested, GuardrailsPassed, GuardrailsTripped, HandoffAccepted,
        HandoffRejected, HandoffRequested, MessageProduced, ModelInvoked, RefusalSent,
        ResponseRecorded, ToolFailuresExhausted, ToolRefused, ToolsCompleted, ToolsRequested,
    };
    use TurnState::{
        AgentActing, AwaitingGuardrail, Failed, HandoffRequested as Handoff, Refused, Responding,
        Routed, ToolLoop, TurnComplete,
    };

    let to = match (current, signal) {
        (AwaitingGuardrail, GuardrailsPassed) | (AwaitingGuardrail, BootstrapRequested) => Routed,
        (AwaitingGuardrail, GuardrailsTripped) => Refused,
        (Refused, RefusalSent) => TurnComplete,
        (Routed, ModelInvoked) => AgentActing,
        (AgentActing, ToolsRequested) => ToolLoop,
        (AgentActing, HandoffRequested) => Handoff,
        (AgentActing, MessageProduced) => Responding,
        (ToolLoop, ToolsCompleted) => Routed,
        (ToolLoop, ToolRefused) | (ToolLoop, ToolFailuresExhausted) => Responding,
        (Handoff, HandoffAccepted) => Routed,
        (Handoff, HandoffRejected) => Responding,
        (Responding, ResponseRecorded) => TurnComplete,
        (TurnComplete, _) | (Failed, _) => {
            return Err(TurnTransitionError::InvalidTransition { state: current, signal });
        }
        (_, Aborted) => Failed,
        _ => {
            return Err(TurnTransitionError::InvalidTransition { state: current, signal });
        }
    };

    Ok(TurnTransition { from: current, to, signal })
}
