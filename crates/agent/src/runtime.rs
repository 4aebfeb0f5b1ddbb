use std::sync::Arc;
use std::time::Duration;

use huddle_core::config::{RuntimeConfig, TurnLockPolicy};
use huddle_core::errors::{ErrorCode, TurnError, TurnFailure};
use huddle_core::events::{Event, EventDetail, EventSink, FailureNote, TracingEventSink};
use huddle_core::turn::{TurnMachine, TurnSignal};
use huddle_core::{AnalysisContext, Conversation, ConversationId, GuardrailVerdict, Role};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::guardrails::{GuardrailEngine, GuardrailInput};
use crate::handoff::{HandoffError, HandoffResolver};
use crate::llm::{HandoffSpec, ModelCapability, ModelReply, ModelRequest, ToolSpec, TurnStep};
use crate::registry::{AgentDefinition, AgentRegistry, AgentSummary};
use crate::store::{ConversationStore, InMemoryConversationStore, TurnGate};
use crate::tools::{ToolError, ToolInvoker};
use crate::trace;

pub const DEGRADED_MESSAGE: &str =
    "Sorry, I couldn't complete that analysis right now. Please try again later.";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineSettings {
    /// Model invocations allowed per turn.
    pub max_iterations: usize,
    /// Accepted handoffs allowed per turn.
    pub max_handoff_chain: usize,
    pub turn_timeout: Duration,
    /// Failed tool calls fed back to the model before the turn gives up.
    pub tool_failure_retries: u32,
    pub turn_lock: TurnLockPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

impl From<&RuntimeConfig> for EngineSettings {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            max_handoff_chain: config.max_handoff_chain,
            turn_timeout: Duration::from_secs(config.turn_timeout_secs),
            tool_failure_retries: config.tool_failure_retries,
            turn_lock: config.turn_lock,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    /// Empty starts a new conversation.
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub user_input: String,
}

impl TurnRequest {
    pub fn new(conversation_id: impl Into<String>, user_input: impl Into<String>) -> Self {
        Self { conversation_id: conversation_id.into(), user_input: user_input.into() }
    }

    pub fn start(user_input: impl Into<String>) -> Self {
        Self::new(String::new(), user_input)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMessage {
    pub content: String,
    pub agent: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResponse {
    pub conversation_id: ConversationId,
    pub current_agent: String,
    pub context: AnalysisContext,
    pub messages: Vec<OutputMessage>,
    /// Events recorded during this turn only.
    pub events: Vec<Event>,
    pub guardrails: Vec<GuardrailVerdict>,
    pub agents: Vec<AgentSummary>,
}

/// Caller side of a turn's cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

#[derive(Clone, Debug, Default)]
pub struct CancelSignal {
    receiver: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    pub fn never() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.receiver.as_ref().is_some_and(|receiver| *receiver.borrow())
    }
}

pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (sender, receiver) = watch::channel(false);
    (CancelHandle { sender }, CancelSignal { receiver: Some(receiver) })
}

/// Per-turn bookkeeping shared by the loop steps.
struct TurnRun<'a> {
    input: &'a str,
    machine: TurnMachine,
    deadline: Instant,
    budget_secs: u64,
    cancel: &'a CancelSignal,
    verdicts: Vec<GuardrailVerdict>,
    steps: Vec<TurnStep>,
    iterations: usize,
    hops: usize,
    tool_failures: u32,
}

/// Drives one turn at a time per conversation through guardrails, the model
/// capability, tools and handoffs, recording every step in the trace.
pub struct ConversationEngine {
    registry: Arc<AgentRegistry>,
    guardrails: GuardrailEngine,
    model: Arc<dyn ModelCapability>,
    store: Arc<dyn ConversationStore>,
    sink: Arc<dyn EventSink>,
    tools: ToolInvoker,
    handoffs: HandoffResolver,
    gate: TurnGate,
    settings: EngineSettings,
}

impl ConversationEngine {
    pub fn new(
        registry: Arc<AgentRegistry>,
        guardrails: GuardrailEngine,
        model: Arc<dyn ModelCapability>,
        settings: EngineSettings,
    ) -> Self {
        let sink: Arc<dyn EventSink> = Arc::new(TracingEventSink);
        Self {
            tools: ToolInvoker::new(Arc::clone(&registry), Arc::clone(&sink)),
            handoffs: HandoffResolver::new(
                Arc::clone(&registry),
                Arc::clone(&sink),
                settings.max_handoff_chain,
            ),
            gate: TurnGate::new(settings.turn_lock),
            store: Arc::new(InMemoryConversationStore::default()),
            registry,
            guardrails,
            model,
            sink,
            settings,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.tools = ToolInvoker::new(Arc::clone(&self.registry), Arc::clone(&sink));
        self.handoffs = HandoffResolver::new(
            Arc::clone(&self.registry),
            Arc::clone(&sink),
            self.settings.max_handoff_chain,
        );
        self.sink = sink;
        self
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub async fn conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, TurnFailure> {
        self.store
            .load(id)
            .await
            .map_err(|error| TurnError::from(error).into_failure(Some(id.clone())))
    }

    pub async fn handle_turn(&self, request: TurnRequest) -> Result<TurnResponse, TurnFailure> {
        self.handle_turn_with_cancel(request, CancelSignal::never()).await
    }

    pub async fn handle_turn_with_cancel(
        &self,
        request: TurnRequest,
        cancel: CancelSignal,
    ) -> Result<TurnResponse, TurnFailure> {
        let id = match request.conversation_id.trim() {
            "" => ConversationId::generate(),
            existing => ConversationId(existing.to_owned()),
        };
        let _permit = self.gate.acquire(&id).await.map_err(|error| {
            warn!(
                event_name = "turn.rejected",
                conversation_id = %id,
                "turn already in progress"
            );
            error.into_failure(Some(id.clone()))
        })?;

        let mut conversation = match self.store.load(&id).await {
            Ok(Some(conversation)) => conversation,
            Ok(None) => Conversation::start(id.clone(), self.registry.entry_agent().name.clone()),
            Err(error) => return Err(TurnError::from(error).into_failure(Some(id))),
        };

        let turn = conversation.begin_turn();
        let first_sequence = conversation.trace.next_sequence();
        let history_mark = conversation.history.len();
        info!(
            event_name = "turn.started",
            conversation_id = %id,
            agent = %conversation.active_agent,
            turn,
            "turn started"
        );

        let mut run = TurnRun {
            input: &request.user_input,
            machine: TurnMachine::new(),
            deadline: Instant::now() + self.settings.turn_timeout,
            budget_secs: self.settings.turn_timeout.as_secs(),
            cancel: &cancel,
            verdicts: Vec::new(),
            steps: Vec::new(),
            iterations: 0,
            hops: 0,
            tool_failures: 0,
        };
        let outcome = self.run_turn(&mut conversation, &mut run).await;

        if let Err(error) = outcome {
            let _ = run.machine.apply(TurnSignal::Aborted);
            return Err(self.fail_turn(conversation, error).await);
        }

        let messages = conversation.history[history_mark..]
            .iter()
            .filter(|entry| entry.role == Role::Assistant)
            .map(|entry| OutputMessage {
                content: entry.content.clone(),
                agent: entry.agent.clone().unwrap_or_default(),
            })
            .collect::<Vec<_>>();
        let response = TurnResponse {
            conversation_id: conversation.id.clone(),
            current_agent: conversation.active_agent.clone(),
            context: conversation.context.snapshot(),
            messages,
            events: conversation.trace.since(first_sequence).to_vec(),
            guardrails: run.verdicts,
            agents: self.registry.summaries(),
        };

        self.store
            .save(conversation)
            .await
            .map_err(|error| TurnError::from(error).into_failure(Some(id.clone())))?;

        info!(
            event_name = "turn.completed",
            conversation_id = %id,
            agent = %response.current_agent,
            turn,
            events = response.events.len(),
            "turn completed"
        );
        Ok(response)
    }

    async fn run_turn(
        &self,
        conversation: &mut Conversation,
        run: &mut TurnRun<'_>,
    ) -> Result<(), TurnError> {
        if run.input.trim().is_empty() {
            self.advance(conversation, run, TurnSignal::BootstrapRequested)?;
        } else {
            ensure_live(run)?;
            let agent = self.registry.get(&conversation.active_agent)?;
            let guardrail_input = GuardrailInput::new(run.input)
                .following(conversation.last_assistant_message().map(|entry| entry.content.clone()));
            conversation.push_user(run.input);

            let report = timeout_at(
                run.deadline,
                self.guardrails.evaluate(&guardrail_input, &agent.guardrails),
            )
            .await
            .map_err(|_| timed_out(run))?;
            run.verdicts = report.verdicts;

            if !report.passed {
                self.advance(conversation, run, TurnSignal::GuardrailsTripped)?;
                let tripped = run
                    .verdicts
                    .iter()
                    .filter(|verdict| !verdict.passed)
                    .map(|verdict| verdict.name.as_str())
                    .collect::<Vec<_>>()
                    .join(",");
                info!(
                    event_name = "turn.guardrail_tripped",
                    conversation_id = %conversation.id,
                    agent = %agent.name,
                    guardrails = %tripped,
                    "input refused by guardrails"
                );
                self.respond(
                    conversation,
                    &agent.name,
                    ErrorCode::GuardrailTripped.user_message(),
                    run.verdicts.clone(),
                    None,
                );
                self.advance(conversation, run, TurnSignal::RefusalSent)?;
                return Ok(());
            }
            self.advance(conversation, run, TurnSignal::GuardrailsPassed)?;
        }

        loop {
            ensure_live(run)?;
            if run.iterations >= self.settings.max_iterations {
                return Err(TurnError::TurnIterationLimitExceeded {
                    limit: self.settings.max_iterations,
                });
            }
            run.iterations += 1;

            let agent = self.registry.get(&conversation.active_agent)?;
            self.advance(conversation, run, TurnSignal::ModelInvoked)?;
            let request = self.model_request(conversation, agent, run);
            let reply = match timeout_at(run.deadline, self.model.respond(&request)).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(error)) => return Err(TurnError::ModelUnavailable(format!("{error:#}"))),
                Err(_) => return Err(timed_out(run)),
            };
            ensure_live(run)?;

            match reply {
                ModelReply::Message(text) => {
                    self.advance(conversation, run, TurnSignal::MessageProduced)?;
                    self.respond(conversation, &agent.name, text, run.verdicts.clone(), None);
                    self.advance(conversation, run, TurnSignal::ResponseRecorded)?;
                    return Ok(());
                }
                ModelReply::ToolCalls(calls) => {
                    self.advance(conversation, run, TurnSignal::ToolsRequested)?;
                    let outcomes = match self
                        .tools
                        .invoke_batch(agent, calls, conversation, Some(run.deadline))
                        .await
                    {
                        Ok(outcomes) => outcomes,
                        Err(error @ ToolError::NotPermitted { .. }) => {
                            self.advance(conversation, run, TurnSignal::ToolRefused)?;
                            let note = failure_note(ErrorCode::ToolNotPermitted, &error);
                            self.respond(
                                conversation,
                                &agent.name,
                                ErrorCode::ToolNotPermitted.user_message(),
                                run.verdicts.clone(),
                                Some(note),
                            );
                            self.advance(conversation, run, TurnSignal::ResponseRecorded)?;
                            return Ok(());
                        }
                        Err(error) => {
                            return Err(error.into_turn_error(run.budget_secs));
                        }
                    };

                    let mut last_failure = None;
                    for outcome in outcomes {
                        let step = match outcome.output {
                            Ok(output) => TurnStep::ToolResult {
                                agent: agent.name.clone(),
                                call_id: outcome.call_id,
                                tool_name: outcome.tool_name,
                                output,
                            },
                            Err(error) => {
                                run.tool_failures += 1;
                                let step = TurnStep::ToolFailed {
                                    agent: agent.name.clone(),
                                    call_id: outcome.call_id,
                                    tool_name: outcome.tool_name,
                                    message: error.to_string(),
                                };
                                last_failure = Some(error);
                                step
                            }
                        };
                        run.steps.push(step);
                    }

                    match last_failure {
                        Some(error) if run.tool_failures > self.settings.tool_failure_retries => {
                            self.advance(conversation, run, TurnSignal::ToolFailuresExhausted)?;
                            let note = failure_note(ErrorCode::ToolExecutionFailed, &error);
                            self.respond(
                                conversation,
                                &agent.name,
                                DEGRADED_MESSAGE,
                                run.verdicts.clone(),
                                Some(note),
                            );
                            self.advance(conversation, run, TurnSignal::ResponseRecorded)?;
                            return Ok(());
                        }
                        _ => self.advance(conversation, run, TurnSignal::ToolsCompleted)?,
                    }
                }
                ModelReply::Handoff { target, message } => {
                    self.advance(conversation, run, TurnSignal::HandoffRequested)?;
                    match self.handoffs.resolve(conversation, &agent.name, &target, run.hops) {
                        Ok(outcome) => {
                            run.hops += 1;
                            if let Some(text) = message {
                                self.respond(conversation, &agent.name, text, Vec::new(), None);
                            }
                            run.steps.push(TurnStep::HandedOff {
                                from: outcome.source,
                                to: outcome.target,
                            });
                            self.advance(conversation, run, TurnSignal::HandoffAccepted)?;
                        }
                        Err(error @ HandoffError::NotAllowed { .. }) => {
                            self.advance(conversation, run, TurnSignal::HandoffRejected)?;
                            let note = failure_note(ErrorCode::HandoffNotAllowed, &error);
                            let text = message.unwrap_or_else(|| {
                                ErrorCode::HandoffNotAllowed.user_message().to_owned()
                            });
                            self.respond(
                                conversation,
                                &agent.name,
                                text,
                                run.verdicts.clone(),
                                Some(note),
                            );
                            self.advance(conversation, run, TurnSignal::ResponseRecorded)?;
                            return Ok(());
                        }
                        Err(error) => return Err(error.into()),
                    }
                }
            }
        }
    }

    fn model_request(
        &self,
        conversation: &Conversation,
        agent: &AgentDefinition,
        run: &TurnRun<'_>,
    ) -> ModelRequest {
        ModelRequest {
            conversation_id: conversation.id.clone(),
            agent: agent.name.clone(),
            instructions: agent.instructions.clone(),
            tools: agent
                .tools
                .iter()
                .map(|name| ToolSpec {
                    name: name.clone(),
                    description: self
                        .registry
                        .tool(name)
                        .map(|tool| tool.description().to_owned())
                        .unwrap_or_default(),
                })
                .collect(),
            handoffs: agent
                .handoffs
                .iter()
                .map(|name| HandoffSpec {
                    name: name.clone(),
                    description: self
                        .registry
                        .get(name)
                        .map(|target| target.description.clone())
                        .unwrap_or_default(),
                })
                .collect(),
            context: conversation.context.snapshot(),
            input: run.input.to_owned(),
            history: conversation.history.clone(),
            steps: run.steps.clone(),
        }
    }

    fn advance(
        &self,
        conversation: &Conversation,
        run: &mut TurnRun<'_>,
        signal: TurnSignal,
    ) -> Result<(), TurnError> {
        let transition =
            run.machine.apply(signal).map_err(|error| TurnError::Internal(error.to_string()))?;
        debug!(
            event_name = "turn.state_transition",
            conversation_id = %conversation.id,
            agent = %conversation.active_agent,
            from = ?transition.from,
            to = ?transition.to,
            signal = ?transition.signal,
            "turn state advanced"
        );
        Ok(())
    }

    fn respond(
        &self,
        conversation: &mut Conversation,
        agent: &str,
        text: impl Into<String>,
        guardrails: Vec<GuardrailVerdict>,
        failure: Option<FailureNote>,
    ) {
        let text = text.into();
        conversation.push_assistant(agent, text.clone());
        trace::record(
            conversation,
            self.sink.as_ref(),
            agent,
            text,
            EventDetail::Message { guardrails, failure },
        );
    }

    /// Persists what the turn committed and converts `error` into a failure.
    ///
    /// Cancelled turns record nothing further; every other failure leaves a
    /// generic assistant message whose event keeps the full detail.
    async fn fail_turn(&self, mut conversation: Conversation, error: TurnError) -> TurnFailure {
        let code = error.code();
        warn!(
            event_name = "turn.failed",
            conversation_id = %conversation.id,
            agent = %conversation.active_agent,
            code = code.as_str(),
            error = %error,
            "turn failed"
        );

        if code != ErrorCode::TurnCancelled {
            let agent = conversation.active_agent.clone();
            let note = failure_note(code, &error);
            self.respond(&mut conversation, &agent, code.user_message(), Vec::new(), Some(note));
        }

        let id = conversation.id.clone();
        if let Err(save_error) = self.store.save(conversation).await {
            warn!(
                event_name = "turn.persist_failed",
                conversation_id = %id,
                error = %save_error,
                "could not persist failed turn"
            );
        }
        error.into_failure(Some(id))
    }
}

fn ensure_live(run: &TurnRun<'_>) -> Result<(), TurnError> {
    if run.cancel.is_cancelled() {
        return Err(TurnError::Cancelled);
    }
    if Instant::now() >= run.deadline {
        return Err(timed_out(run));
    }
    Ok(())
}

fn timed_out(run: &TurnRun<'_>) -> TurnError {
    TurnError::TurnTimeout { budget_secs: run.budget_secs }
}

fn failure_note(code: ErrorCode, error: &impl std::fmt::Display) -> FailureNote {
    FailureNote { code: code.as_str().to_owned(), detail: error.to_string() }
}
