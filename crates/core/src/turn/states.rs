use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    AwaitingGuardrail,
    Refused,
    Routed,
    AgentActing,
    ToolLoop,
    HandoffRequested,
    Responding,
    TurnComplete,
    Failed,
}

impl TurnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TurnComplete | Self::Failed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnSignal {
    GuardrailsPassed,
    GuardrailsTripped,
    BootstrapRequested,
    ModelInvoked,
    ToolsRequested,
    ToolsCompleted,
    ToolRefused,
    ToolFailuresExhausted,
    HandoffRequested,
    HandoffAccepted,
    HandoffRejected,
    MessageProduced,
    RefusalSent,
    ResponseRecorded,
    Aborted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnTransition {
    pub from: TurnState,
    pub to: TurnState,
    pub signal: TurnSignal,
}
