use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use huddle_core::errors::TurnError;
use huddle_core::events::{EventDetail, EventSink};
use huddle_core::{AnalysisContext, ContextDiff, Conversation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::registry::{AgentDefinition, AgentRegistry};
use crate::trace;

/// An opaque named capability invoked against the shared context.
///
/// Implementations may read and write any context field; the invoker works
/// out what changed afterwards.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn execute(&self, arguments: Value, context: &mut AnalysisContext) -> Result<Value>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            call_id: format!("call_{}", Uuid::new_v4().simple()),
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("agent `{agent}` is not permitted to call tool `{tool}`")]
    NotPermitted { agent: String, tool: String },
    #[error("tool `{0}` is not registered")]
    UnknownTool(String),
    #[error("tool `{tool}` failed: {message}")]
    ExecutionFailed { tool: String, message: String },
    #[error("tool batch abandoned at the turn deadline")]
    DeadlineReached,
}

impl ToolError {
    pub fn into_turn_error(self, budget_secs: u64) -> TurnError {
        match self {
            Self::NotPermitted { agent, tool } => TurnError::ToolNotPermitted { agent, tool },
            Self::UnknownTool(tool) => {
                TurnError::ToolExecutionFailed { tool, message: "tool is not registered".to_owned() }
            }
            Self::ExecutionFailed { tool, message } => {
                TurnError::ToolExecutionFailed { tool, message }
            }
            Self::DeadlineReached => TurnError::TurnTimeout { budget_secs },
        }
    }
}

/// Result of one executed call, after its context changes were committed.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolOutcome {
    pub call_id: String,
    pub tool_name: String,
    pub output: Result<Value, ToolError>,
    /// Fields this call actually changed in the shared context.
    pub changes: ContextDiff,
}

fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Authorizes and runs tool calls for an agent, recording the trace.
#[derive(Clone)]
pub struct ToolInvoker {
    registry: Arc<AgentRegistry>,
    sink: Arc<dyn EventSink>,
}

impl ToolInvoker {
    pub fn new(registry: Arc<AgentRegistry>, sink: Arc<dyn EventSink>) -> Self {
        Self { registry, sink }
    }

    pub async fn invoke(
        &self,
        agent: &AgentDefinition,
        call: ToolCallRequest,
        conversation: &mut Conversation,
    ) -> Result<ToolOutcome, ToolError> {
        let mut outcomes = self.invoke_batch(agent, vec![call], conversation, None).await?;
        outcomes.pop().ok_or(ToolError::DeadlineReached)
    }

    /// Runs a batch of calls requested in one model step.
    ///
    /// Every call is authorized before anything is recorded; one unauthorized
    /// call rejects the whole batch with no events. Otherwise all `tool_call`
    /// events are appended in request order, the calls run concurrently on
    /// snapshots of the context, and outputs plus context changes are applied
    /// in request order. Calls still running when `deadline` passes get a
    /// failed `tool_output` and contribute no context changes; calls that
    /// finished in time are committed as usual, then the batch reports
    /// [`ToolError::DeadlineReached`].
    pub async fn invoke_batch(
        &self,
        agent: &AgentDefinition,
        calls: Vec<ToolCallRequest>,
        conversation: &mut Conversation,
        deadline: Option<Instant>,
    ) -> Result<Vec<ToolOutcome>, ToolError> {
        let mut tools = Vec::with_capacity(calls.len());
        for call in &calls {
            if !agent.can_use_tool(&call.tool_name) {
                warn!(
                    event_name = "tool.not_permitted",
                    conversation_id = %conversation.id,
                    agent = %agent.name,
                    tool = %call.tool_name,
                    "tool call refused"
                );
                return Err(ToolError::NotPermitted {
                    agent: agent.name.clone(),
                    tool: call.tool_name.clone(),
                });
            }
            let tool = self
                .registry
                .tool(&call.tool_name)
                .ok_or_else(|| ToolError::UnknownTool(call.tool_name.clone()))?;
            tools.push(tool);
        }

        for call in &calls {
            info!(
                event_name = "tool.invoked",
                conversation_id = %conversation.id,
                agent = %agent.name,
                tool = %call.tool_name,
                call_id = %call.call_id,
                "tool call started"
            );
            trace::record(
                conversation,
                self.sink.as_ref(),
                &agent.name,
                format!("Calling {}", call.tool_name),
                EventDetail::ToolCall {
                    call_id: call.call_id.clone(),
                    tool_name: call.tool_name.clone(),
                    arguments: call.arguments.clone(),
                },
            );
        }

        let base = conversation.context.snapshot();
        let runs = calls.iter().zip(tools).map(|(call, tool)| {
            let mut scratch = base.clone();
            let arguments = call.arguments.clone();
            let base = &base;
            async move {
                let run = async {
                    let output = tool.execute(arguments, &mut scratch).await;
                    (output, scratch.diff_from(base))
                };
                match deadline {
                    Some(deadline) => timeout_at(deadline, run).await.ok(),
                    None => Some(run.await),
                }
            }
        });
        let results = join_all(runs).await;

        let mut outcomes = Vec::with_capacity(calls.len());
        let mut abandoned = false;
        for (call, result) in calls.into_iter().zip(results) {
            let Some((output, diff)) = result else {
                abandoned = true;
                warn!(
                    event_name = "tool.abandoned",
                    conversation_id = %conversation.id,
                    agent = %agent.name,
                    tool = %call.tool_name,
                    call_id = %call.call_id,
                    "tool call still running at the turn deadline"
                );
                self.record_output(
                    conversation,
                    agent,
                    &call,
                    "tool call abandoned: turn deadline reached".to_owned(),
                    Value::Null,
                    true,
                );
                continue;
            };
            let outcome = match output {
                Ok(value) => {
                    self.record_output(conversation, agent, &call, render(&value), value.clone(), false);
                    let changes = conversation.context.commit(&diff);
                    if !changes.is_empty() {
                        let fields = changes.keys().cloned().collect::<Vec<_>>().join(", ");
                        trace::record(
                            conversation,
                            self.sink.as_ref(),
                            &agent.name,
                            format!("Updated context: {fields}"),
                            EventDetail::ContextUpdate { changes: changes.clone() },
                        );
                    }
                    ToolOutcome { call_id: call.call_id, tool_name: call.tool_name, output: Ok(value), changes }
                }
                Err(error) => {
                    let message = format!("{error:#}");
                    warn!(
                        event_name = "tool.failed",
                        conversation_id = %conversation.id,
                        agent = %agent.name,
                        tool = %call.tool_name,
                        call_id = %call.call_id,
                        error = %message,
                        "tool call failed"
                    );
                    self.record_output(
                        conversation,
                        agent,
                        &call,
                        message.clone(),
                        Value::String(message.clone()),
                        true,
                    );
                    ToolOutcome {
                        call_id: call.call_id,
                        output: Err(ToolError::ExecutionFailed { tool: call.tool_name.clone(), message }),
                        tool_name: call.tool_name,
                        changes: ContextDiff::new(),
                    }
                }
            };
            outcomes.push(outcome);
        }

        if abandoned {
            return Err(ToolError::DeadlineReached);
        }
        Ok(outcomes)
    }

    fn record_output(
        &self,
        conversation: &mut Conversation,
        agent: &AgentDefinition,
        call: &ToolCallRequest,
        content: String,
        output: Value,
        failed: bool,
    ) {
        trace::record(
            conversation,
            self.sink.as_ref(),
            &agent.name,
            content,
            EventDetail::ToolOutput {
                call_id: call.call_id.clone(),
                tool_name: call.tool_name.clone(),
                output,
                failed,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use huddle_core::events::{EventDetail, EventKind, InMemoryEventSink};
    use huddle_core::{AnalysisContext, Conversation, ConversationId};
    use serde_json::{json, Value};
    use tokio::time::Instant;

    use super::{Tool, ToolCallRequest, ToolError, ToolInvoker};
    use crate::registry::{AgentDefinition, AgentRegistry};

    struct SetField {
        name: &'static str,
        field: &'static str,
        delay_ms: u64,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for SetField {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, arguments: Value, context: &mut AnalysisContext) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            context.set(self.field, arguments["value"].clone());
            Ok(json!({ "tool": self.name, "value": arguments["value"] }))
        }
    }

    struct Broken;

    #[async_trait]
    impl Tool for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn execute(&self, _arguments: Value, _context: &mut AnalysisContext) -> Result<Value> {
            Err(anyhow!("warehouse unreachable"))
        }
    }

    struct Fixture {
        invoker: ToolInvoker,
        registry: Arc<AgentRegistry>,
        calls: Arc<AtomicUsize>,
        conversation: Conversation,
    }

    fn fixture() -> Fixture {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = AgentRegistry::builder("Analyst")
            .agent(
                AgentDefinition::new("Analyst")
                    .with_tool("slow")
                    .with_tool("fast")
                    .with_tool("broken")
                    .with_handoff("Viewer"),
            )
            .agent(AgentDefinition::new("Viewer").with_tool("fast").with_handoff("Analyst"))
            .tool(SetField { name: "slow", field: "metrics", delay_ms: 40, calls: Arc::clone(&calls) })
            .tool(SetField { name: "fast", field: "game_id", delay_ms: 1, calls: Arc::clone(&calls) })
            .tool(Broken)
            .build()
            .expect("registry");
        let registry = Arc::new(registry);
        let invoker = ToolInvoker::new(Arc::clone(&registry), Arc::new(InMemoryEventSink::default()));
        let mut conversation = Conversation::start(ConversationId("c-1".to_owned()), "Analyst");
        conversation.begin_turn();
        Fixture { invoker, registry, calls, conversation }
    }

    #[tokio::test]
    async fn unpermitted_tool_never_runs_and_records_nothing() {
        let mut fixture = fixture();
        let viewer = fixture.registry.get("Viewer").expect("viewer").clone();

        let error = fixture
            .invoker
            .invoke(&viewer, ToolCallRequest::new("slow", json!({"value": 1})), &mut fixture.conversation)
            .await
            .expect_err("viewer may not call slow");

        assert!(matches!(error, ToolError::NotPermitted { ref tool, .. } if tool == "slow"));
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
        assert!(fixture.conversation.trace.is_empty());
    }

    #[tokio::test]
    async fn successful_call_records_call_output_and_context_update() {
        let mut fixture = fixture();
        let analyst = fixture.registry.get("Analyst").expect("analyst").clone();

        let outcome = fixture
            .invoker
            .invoke(
                &analyst,
                ToolCallRequest::new("fast", json!({"value": "GAME-1001"})),
                &mut fixture.conversation,
            )
            .await
            .expect("permitted");

        let kinds = fixture.conversation.trace.events().iter().map(|e| e.kind()).collect::<Vec<_>>();
        assert_eq!(kinds, vec![EventKind::ToolCall, EventKind::ToolOutput, EventKind::ContextUpdate]);
        assert_eq!(fixture.conversation.context.current().game_id(), Some("GAME-1001"));
        assert_eq!(outcome.changes.get("game_id"), Some(&json!("GAME-1001")));
    }

    #[tokio::test]
    async fn unchanged_context_emits_no_context_update() {
        let mut fixture = fixture();
        let analyst = fixture.registry.get("Analyst").expect("analyst").clone();
        fixture.conversation.context.commit(&[("game_id".to_owned(), json!("GAME-1001"))].into());

        fixture
            .invoker
            .invoke(
                &analyst,
                ToolCallRequest::new("fast", json!({"value": "GAME-1001"})),
                &mut fixture.conversation,
            )
            .await
            .expect("permitted");

        assert!(!fixture
            .conversation
            .trace
            .events()
            .iter()
            .any(|event| event.kind() == EventKind::ContextUpdate));
    }

    #[tokio::test]
    async fn execution_failure_is_reported_not_propagated() {
        let mut fixture = fixture();
        let analyst = fixture.registry.get("Analyst").expect("analyst").clone();

        let outcome = fixture
            .invoker
            .invoke(&analyst, ToolCallRequest::new("broken", json!({})), &mut fixture.conversation)
            .await
            .expect("failure is an outcome");

        assert!(matches!(outcome.output, Err(ToolError::ExecutionFailed { ref message, .. }) if message.contains("warehouse")));
        let last = fixture.conversation.trace.events().last().expect("tool_output");
        assert!(matches!(last.detail, EventDetail::ToolOutput { failed: true, .. }));
    }

    #[tokio::test]
    async fn parallel_batch_applies_results_in_request_order() {
        let mut fixture = fixture();
        let analyst = fixture.registry.get("Analyst").expect("analyst").clone();
        let calls = vec![
            ToolCallRequest::new("slow", json!({"value": ["dau"]})),
            ToolCallRequest::new("fast", json!({"value": "GAME-2002"})),
        ];
        let call_ids = calls.iter().map(|call| call.call_id.clone()).collect::<Vec<_>>();

        let outcomes = fixture
            .invoker
            .invoke_batch(&analyst, calls, &mut fixture.conversation, None)
            .await
            .expect("batch");

        assert_eq!(outcomes.iter().map(|o| o.call_id.clone()).collect::<Vec<_>>(), call_ids);
        let summary = fixture
            .conversation
            .trace
            .events()
            .iter()
            .map(|event| match &event.detail {
                EventDetail::ToolCall { tool_name, .. } => format!("call:{tool_name}"),
                EventDetail::ToolOutput { tool_name, .. } => format!("output:{tool_name}"),
                EventDetail::ContextUpdate { .. } => "update".to_owned(),
                other => format!("{:?}", other.kind()),
            })
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec!["call:slow", "call:fast", "output:slow", "update", "output:fast", "update"]
        );
        assert_eq!(fixture.conversation.context.current().metrics(), vec!["dau".to_owned()]);
    }

    #[tokio::test]
    async fn batch_with_one_unpermitted_call_is_rejected_whole() {
        let mut fixture = fixture();
        let viewer = fixture.registry.get("Viewer").expect("viewer").clone();
        let calls = vec![
            ToolCallRequest::new("fast", json!({"value": "GAME-1"})),
            ToolCallRequest::new("broken", json!({})),
        ];

        let result = fixture.invoker.invoke_batch(&viewer, calls, &mut fixture.conversation, None).await;

        assert!(result.is_err());
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
        assert!(fixture.conversation.trace.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_keeps_calls_that_finished_in_time() {
        let mut fixture = fixture();
        let analyst = fixture.registry.get("Analyst").expect("analyst").clone();
        let deadline = Instant::now() + Duration::from_millis(10);

        let error = fixture
            .invoker
            .invoke_batch(
                &analyst,
                vec![
                    ToolCallRequest::new("fast", json!({"value": "GAME-3003"})),
                    ToolCallRequest::new("slow", json!({"value": ["dau"]})),
                ],
                &mut fixture.conversation,
                Some(deadline),
            )
            .await
            .expect_err("slow tool outlives the deadline");

        assert_eq!(error, ToolError::DeadlineReached);
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 2);
        let outputs = fixture
            .conversation
            .trace
            .events()
            .iter()
            .filter_map(|event| match &event.detail {
                EventDetail::ToolOutput { tool_name, failed, .. } => Some((tool_name.clone(), *failed)),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(outputs, vec![("fast".to_owned(), false), ("slow".to_owned(), true)]);
        let context = fixture.conversation.context.current();
        assert_eq!(context.game_id(), Some("GAME-3003"));
        assert!(context.metrics().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_pairs_every_call_with_a_failed_output() {
        let mut fixture = fixture();
        let analyst = fixture.registry.get("Analyst").expect("analyst").clone();
        let deadline = Instant::now() + Duration::from_millis(10);

        let error = fixture
            .invoker
            .invoke_batch(
                &analyst,
                vec![ToolCallRequest::new("slow", json!({"value": ["dau"]}))],
                &mut fixture.conversation,
                Some(deadline),
            )
            .await
            .expect_err("slow tool outlives the deadline");

        assert_eq!(error, ToolError::DeadlineReached);
        let kinds = fixture.conversation.trace.events().iter().map(|e| e.kind()).collect::<Vec<_>>();
        assert_eq!(kinds, vec![EventKind::ToolCall, EventKind::ToolOutput]);
        assert!(fixture.conversation.context.current().is_empty());
    }
}
