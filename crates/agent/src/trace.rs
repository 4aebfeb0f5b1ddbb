use huddle_core::events::{EventDetail, EventSink};
use huddle_core::Conversation;

/// Appends to the conversation's trace under its current turn and forwards
/// the stored event to `sink`.
pub(crate) fn record(
    conversation: &mut Conversation,
    sink: &dyn EventSink,
    agent: &str,
    content: impl Into<String>,
    detail: EventDetail,
) {
    let turn = conversation.turns;
    let event = conversation.trace.record(turn, agent, content, detail);
    sink.emit(event);
}
