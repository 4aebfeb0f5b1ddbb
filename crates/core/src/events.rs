use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::context::ContextDiff;
use crate::domain::guardrail::GuardrailVerdict;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Handoff,
    ToolCall,
    ToolOutput,
    ContextUpdate,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Handoff => "handoff",
            Self::ToolCall => "tool_call",
            Self::ToolOutput => "tool_output",
            Self::ContextUpdate => "context_update",
        }
    }
}

/// Operator-facing failure detail attached to a synthesized message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureNote {
    pub code: String,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "metadata", rename_all = "snake_case")]
pub enum EventDetail {
    Message {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        guardrails: Vec<GuardrailVerdict>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<FailureNote>,
    },
    Handoff {
        source_agent: String,
        target_agent: String,
    },
    ToolCall {
        call_id: String,
        tool_name: String,
        arguments: Value,
    },
    ToolOutput {
        call_id: String,
        tool_name: String,
        output: Value,
        failed: bool,
    },
    ContextUpdate {
        changes: ContextDiff,
    },
}

impl EventDetail {
    pub fn message() -> Self {
        Self::Message { guardrails: Vec::new(), failure: None }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Message { .. } => EventKind::Message,
            Self::Handoff { .. } => EventKind::Handoff,
            Self::ToolCall { .. } => EventKind::ToolCall,
            Self::ToolOutput { .. } => EventKind::ToolOutput,
            Self::ContextUpdate { .. } => EventKind::ContextUpdate,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub sequence: u64,
    pub turn: u64,
    pub agent: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub detail: EventDetail,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        self.detail.kind()
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
}

/// Forwards every trace event to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &Event) {
        tracing::debug!(
            event_name = "trace.event_recorded",
            event_id = %event.id,
            event_type = event.kind().as_str(),
            sequence = event.sequence,
            turn = event.turn,
            agent = %event.agent,
            "{}",
            event.content
        );
    }
}

#[derive(Clone, Default)]
pub struct InMemoryEventSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl InMemoryEventSink {
    pub fn events(&self) -> Vec<Event> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl EventSink for InMemoryEventSink {
    fn emit(&self, event: &Event) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}

/// Append-only, strictly ordered event trace of one conversation.
///
/// Sequence numbers are assigned at append time and never reused; recorded
/// events are never rewritten.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventRecorder {
    events: Vec<Event>,
    next_sequence: u64,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        turn: u64,
        agent: impl Into<String>,
        content: impl Into<String>,
        detail: EventDetail,
    ) -> &Event {
        let event = Event {
            id: Uuid::new_v4().to_string(),
            sequence: self.next_sequence,
            turn,
            agent: agent.into(),
            content: content.into(),
            timestamp: Utc::now(),
            detail,
        };
        self.next_sequence += 1;
        self.events.push(event);
        &self.events[self.events.len() - 1]
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events appended at or after `sequence`.
    pub fn since(&self, sequence: u64) -> &[Event] {
        let start = self.events.partition_point(|event| event.sequence < sequence);
        &self.events[start..]
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn for_turn(&self, turn: u64) -> impl Iterator<Item = &Event> {
        self.events.iter().filter(move |event| event.turn == turn)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::events::{
        EventDetail, EventKind, EventRecorder, EventSink, InMemoryEventSink,
    };

    #[test]
    fn recorder_assigns_monotonic_sequences() {
        let mut recorder = EventRecorder::new();
        recorder.record(1, "Triage Agent", "hello", EventDetail::message());
        recorder.record(
            1,
            "Triage Agent",
            "Transferring to Revenue Analysis Agent",
            EventDetail::Handoff {
                source_agent: "Triage Agent".to_owned(),
                target_agent: "Revenue Analysis Agent".to_owned(),
            },
        );
        recorder.record(2, "Revenue Analysis Agent", "done", EventDetail::message());

        let sequences = recorder.events().iter().map(|event| event.sequence).collect::<Vec<_>>();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(recorder.since(1).len(), 2);
        assert_eq!(recorder.for_turn(1).count(), 2);
        assert_eq!(recorder.events()[1].kind(), EventKind::Handoff);
    }

    #[test]
    fn event_serializes_type_and_metadata_for_the_ui() {
        let mut recorder = EventRecorder::new();
        let event = recorder
            .record(
                1,
                "Revenue Analysis Agent",
                "revenue_analysis",
                EventDetail::ToolCall {
                    call_id: "call-1".to_owned(),
                    tool_name: "revenue_analysis".to_owned(),
                    arguments: json!({ "time_period": "current_month" }),
                },
            )
            .clone();

        let value = serde_json::to_value(&event).expect("event should serialize");
        assert_eq!(value["type"], "tool_call");
        assert_eq!(value["metadata"]["tool_name"], "revenue_analysis");
        assert_eq!(value["agent"], "Revenue Analysis Agent");
    }

    /// qa-tag: fake-in-memory-critical-path
    #[test]
    fn in_memory_sink_captures_forwarded_events() {
        let sink = InMemoryEventSink::default();
        let mut recorder = EventRecorder::new();
        let event = recorder.record(1, "Triage Agent", "hi", EventDetail::message());
        sink.emit(event);

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].content, "hi");
    }
}
