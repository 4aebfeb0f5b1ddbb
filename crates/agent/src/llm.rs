use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use huddle_core::{AnalysisContext, ConversationId, HistoryEntry};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::guardrails::{mentions, words};
use crate::tools::ToolCallRequest;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HandoffSpec {
    pub name: String,
    pub description: String,
}

/// Something that already happened earlier in the current turn.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnStep {
    ToolResult { agent: String, call_id: String, tool_name: String, output: Value },
    ToolFailed { agent: String, call_id: String, tool_name: String, message: String },
    HandedOff { from: String, to: String },
}

/// Everything the model capability may read for one step.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModelRequest {
    pub conversation_id: ConversationId,
    pub agent: String,
    pub instructions: String,
    pub tools: Vec<ToolSpec>,
    pub handoffs: Vec<HandoffSpec>,
    pub context: AnalysisContext,
    pub input: String,
    pub history: Vec<HistoryEntry>,
    pub steps: Vec<TurnStep>,
}

impl ModelRequest {
    /// Steps taken since control last arrived at the requesting agent.
    pub fn own_steps(&self) -> &[TurnStep] {
        let start = self
            .steps
            .iter()
            .rposition(|step| matches!(step, TurnStep::HandedOff { .. }))
            .map_or(0, |position| position + 1);
        &self.steps[start..]
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ModelReply {
    Message(String),
    ToolCalls(Vec<ToolCallRequest>),
    Handoff { target: String, message: Option<String> },
}

impl ModelReply {
    pub fn message(text: impl Into<String>) -> Self {
        Self::Message(text.into())
    }

    pub fn tool(name: impl Into<String>, arguments: Value) -> Self {
        Self::ToolCalls(vec![ToolCallRequest::new(name, arguments)])
    }

    pub fn handoff(target: impl Into<String>) -> Self {
        Self::Handoff { target: target.into(), message: None }
    }
}

/// The opaque "ask the model" capability: one reply per step.
#[async_trait]
pub trait ModelCapability: Send + Sync {
    async fn respond(&self, request: &ModelRequest) -> Result<ModelReply>;
}

type Responder = Box<dyn Fn(&ModelRequest) -> ModelReply + Send + Sync>;

enum Script {
    Queue(VecDeque<ModelReply>),
    Function(Responder),
}

struct ScriptedState {
    script: Script,
    calls: Vec<ModelRequest>,
}

/// Deterministic model fake that records every request it receives.
pub struct ScriptedModel {
    state: Mutex<ScriptedState>,
    delay: Option<Duration>,
}

impl ScriptedModel {
    /// Replays `replies` in order and errors once they run out.
    pub fn new(replies: impl IntoIterator<Item = ModelReply>) -> Self {
        Self::with_script(Script::Queue(replies.into_iter().collect()))
    }

    pub fn from_fn<F>(respond: F) -> Self
    where
        F: Fn(&ModelRequest) -> ModelReply + Send + Sync + 'static,
    {
        Self::with_script(Script::Function(Box::new(respond)))
    }

    fn with_script(script: Script) -> Self {
        Self { state: Mutex::new(ScriptedState { script, calls: Vec::new() }), delay: None }
    }

    /// Sleeps before every reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn calls(&self) -> Vec<ModelRequest> {
        self.state.lock().await.calls.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.state.lock().await.calls.len()
    }
}

#[async_trait]
impl ModelCapability for ScriptedModel {
    async fn respond(&self, request: &ModelRequest) -> Result<ModelReply> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().await;
        state.calls.push(request.clone());
        match &mut state.script {
            Script::Queue(replies) => {
                replies.pop_front().ok_or_else(|| anyhow!("scripted model has no reply left"))
            }
            Script::Function(respond) => Ok(respond(request)),
        }
    }
}

/// Routes inputs to the agent owning a set of keywords.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeywordRoute {
    pub agent: String,
    pub keywords: Vec<String>,
}

impl KeywordRoute {
    pub fn new<I, S>(agent: impl Into<String>, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            agent: agent.into(),
            keywords: keywords.into_iter().map(|keyword| keyword.into().to_lowercase()).collect(),
        }
    }
}

/// Offline, deterministic model capability.
///
/// Picks the agent whose keywords the input mentions and hands off to it,
/// calls the current agent's first tool when the input is its own, and
/// summarizes tool output once a tool has answered.
#[derive(Clone, Debug, Default)]
pub struct KeywordModel {
    routes: Vec<KeywordRoute>,
    multi_domain_agent: Option<String>,
    home_agent: Option<String>,
}

impl KeywordModel {
    pub fn new(routes: Vec<KeywordRoute>) -> Self {
        Self { routes, multi_domain_agent: None, home_agent: None }
    }

    /// Agent that takes inputs spanning two or more routes.
    pub fn with_multi_domain_agent(mut self, agent: impl Into<String>) -> Self {
        self.multi_domain_agent = Some(agent.into());
        self
    }

    /// Agent to fall back to when the wanted agent is not directly reachable.
    pub fn with_home_agent(mut self, agent: impl Into<String>) -> Self {
        self.home_agent = Some(agent.into());
        self
    }

    fn wanted_agent(&self, input: &str) -> Option<&str> {
        let normalized = input.to_lowercase();
        let words = words(&normalized);
        let matched = self
            .routes
            .iter()
            .filter(|route| route.keywords.iter().any(|term| mentions(&normalized, &words, term)))
            .collect::<Vec<_>>();
        match matched.as_slice() {
            [] => None,
            [only] => Some(only.agent.as_str()),
            [first, ..] => self.multi_domain_agent.as_deref().or(Some(first.agent.as_str())),
        }
    }

    fn tool_arguments(input: &str) -> Value {
        let mut arguments = json!({ "query": input });
        if let Some(game_id) = extract_game_id(input) {
            arguments["game_id"] = json!(game_id);
        }
        if let Some(period) = extract_period(input) {
            arguments["period"] = json!(period);
        }
        if let Some(chart_type) = extract_chart_type(input) {
            arguments["chart_type"] = json!(chart_type);
        }
        arguments
    }
}

fn extract_game_id(input: &str) -> Option<String> {
    input
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '-'))
        .map(str::to_uppercase)
        .find(|token| {
            token
                .strip_prefix("GAME-")
                .is_some_and(|digits| !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()))
        })
}

fn extract_period(input: &str) -> Option<&'static str> {
    let normalized = input.to_lowercase();
    let words = words(&normalized);
    let has = |terms: &[&str]| terms.iter().any(|term| mentions(&normalized, &words, term));
    if has(&["today", "今天", "今日"]) {
        Some("1d")
    } else if has(&["week", "weekly", "本周", "上周", "一周"]) {
        Some("7d")
    } else if has(&["month", "monthly", "本月", "上月", "一个月"]) {
        Some("30d")
    } else {
        None
    }
}

fn extract_chart_type(input: &str) -> Option<&'static str> {
    let normalized = input.to_lowercase();
    let words = words(&normalized);
    let has = |terms: &[&str]| terms.iter().any(|term| mentions(&normalized, &words, term));
    if has(&["pie", "饼图"]) {
        Some("pie")
    } else if has(&["bar", "柱状图"]) {
        Some("bar")
    } else if has(&["line", "trend", "折线图", "趋势"]) {
        Some("line")
    } else {
        None
    }
}

fn summarize(output: &Value) -> String {
    match output.get("summary").and_then(Value::as_str) {
        Some(summary) => summary.to_owned(),
        None => match output {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        },
    }
}

#[async_trait]
impl ModelCapability for KeywordModel {
    async fn respond(&self, request: &ModelRequest) -> Result<ModelReply> {
        let own = request.own_steps();
        if !own.is_empty() {
            let lines = own
                .iter()
                .filter_map(|step| match step {
                    TurnStep::ToolResult { output, .. } => Some(summarize(output)),
                    TurnStep::ToolFailed { tool_name, .. } => {
                        Some(format!("The {tool_name} step could not be completed right now."))
                    }
                    TurnStep::HandedOff { .. } => None,
                })
                .collect::<Vec<_>>();
            return Ok(ModelReply::Message(lines.join("\n")));
        }

        if request.input.trim().is_empty() {
            return Ok(ModelReply::Message(format!(
                "Hello! This is the {}. What would you like to analyze?",
                request.agent
            )));
        }

        let can_reach = |name: &str| request.handoffs.iter().any(|handoff| handoff.name == name);
        match self.wanted_agent(&request.input) {
            Some(wanted) if wanted != request.agent && can_reach(wanted) => {
                Ok(ModelReply::handoff(wanted))
            }
            Some(wanted) if wanted != request.agent => match self.home_agent.as_deref() {
                Some(home) if home != request.agent && can_reach(home) => {
                    Ok(ModelReply::handoff(home))
                }
                _ => Ok(ModelReply::Message(format!(
                    "That question belongs to the {wanted}, which I can't reach from here."
                ))),
            },
            _ => match request.tools.first() {
                Some(tool) => {
                    Ok(ModelReply::tool(tool.name.clone(), Self::tool_arguments(&request.input)))
                }
                None => Ok(ModelReply::Message(format!(
                    "Could you tell me more about what you'd like the {} to look at?",
                    request.agent
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use huddle_core::{AnalysisContext, ConversationId};
    use serde_json::json;

    use super::{
        HandoffSpec, KeywordModel, KeywordRoute, ModelCapability, ModelReply, ModelRequest,
        ScriptedModel, ToolSpec, TurnStep,
    };

    fn request(agent: &str, input: &str, tools: &[&str], handoffs: &[&str]) -> ModelRequest {
        ModelRequest {
            conversation_id: ConversationId("c-1".to_owned()),
            agent: agent.to_owned(),
            instructions: String::new(),
            tools: tools
                .iter()
                .map(|name| ToolSpec { name: (*name).to_owned(), description: String::new() })
                .collect(),
            handoffs: handoffs
                .iter()
                .map(|name| HandoffSpec { name: (*name).to_owned(), description: String::new() })
                .collect(),
            context: AnalysisContext::new(),
            input: input.to_owned(),
            history: Vec::new(),
            steps: Vec::new(),
        }
    }

    fn model() -> KeywordModel {
        KeywordModel::new(vec![
            KeywordRoute::new("Revenue Analysis Agent", ["revenue", "收入"]),
            KeywordRoute::new("Retention Analysis Agent", ["retention", "churn", "留存"]),
        ])
        .with_multi_domain_agent("Orchestrator Agent")
        .with_home_agent("Triage Agent")
    }

    #[tokio::test]
    async fn scripted_model_replays_and_records() {
        let model = ScriptedModel::new([ModelReply::message("first")]);
        let reply = model.respond(&request("A", "hi", &[], &[])).await.expect("reply");

        assert_eq!(reply, ModelReply::message("first"));
        assert!(model.respond(&request("A", "hi", &[], &[])).await.is_err());
        assert_eq!(model.call_count().await, 2);
    }

    #[tokio::test]
    async fn keyword_model_hands_off_to_the_owning_agent() {
        let reply = model()
            .respond(&request(
                "Triage Agent",
                "How is revenue trending this week?",
                &[],
                &["Revenue Analysis Agent", "Retention Analysis Agent", "Orchestrator Agent"],
            ))
            .await
            .expect("reply");

        assert_eq!(reply, ModelReply::handoff("Revenue Analysis Agent"));
    }

    #[tokio::test]
    async fn keyword_model_sends_multi_domain_input_to_the_orchestrator() {
        let reply = model()
            .respond(&request(
                "Triage Agent",
                "compare revenue and churn",
                &[],
                &["Revenue Analysis Agent", "Orchestrator Agent"],
            ))
            .await
            .expect("reply");

        assert_eq!(reply, ModelReply::handoff("Orchestrator Agent"));
    }

    #[tokio::test]
    async fn owning_agent_calls_its_tool_then_summarizes() {
        let model = model();
        let mut request = request(
            "Revenue Analysis Agent",
            "revenue for game-1001 last week",
            &["revenue_analysis"],
            &["Triage Agent"],
        );

        let reply = model.respond(&request).await.expect("reply");
        let ModelReply::ToolCalls(calls) = reply else {
            panic!("expected a tool call");
        };
        assert_eq!(calls[0].tool_name, "revenue_analysis");
        assert_eq!(calls[0].arguments["game_id"], "GAME-1001");
        assert_eq!(calls[0].arguments["period"], "7d");

        request.steps.push(TurnStep::ToolResult {
            agent: "Revenue Analysis Agent".to_owned(),
            call_id: calls[0].call_id.clone(),
            tool_name: "revenue_analysis".to_owned(),
            output: json!({"summary": "Revenue analysis prepared for GAME-1001"}),
        });
        let reply = model.respond(&request).await.expect("reply");
        assert_eq!(reply, ModelReply::message("Revenue analysis prepared for GAME-1001"));
    }

    #[tokio::test]
    async fn unreachable_owner_routes_through_the_home_agent() {
        let reply = model()
            .respond(&request(
                "Revenue Analysis Agent",
                "what about retention",
                &["revenue_analysis"],
                &["Triage Agent"],
            ))
            .await
            .expect("reply");

        assert_eq!(reply, ModelReply::handoff("Triage Agent"));
    }

    #[test]
    fn own_steps_start_after_the_last_handoff() {
        let mut request = request("B", "x", &[], &[]);
        request.steps = vec![
            TurnStep::ToolFailed {
                agent: "A".to_owned(),
                call_id: "1".to_owned(),
                tool_name: "t".to_owned(),
                message: "m".to_owned(),
            },
            TurnStep::HandedOff { from: "A".to_owned(), to: "B".to_owned() },
        ];

        assert!(request.own_steps().is_empty());
    }
}
