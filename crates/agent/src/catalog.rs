//! The game-analytics agent team: a triage entry point, five specialists and
//! an orchestrator for questions spanning several domains.
//!
//! Tools here only tag the shared context and describe the analysis they were
//! asked for; the numbers come from whatever analytics backend a deployment
//! wires in behind the same tool names. The orchestrator reuses the specialist
//! tool instances registered for the specialist agents.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use huddle_core::domain::context::{ANALYSIS_TYPE, GAME_ID, METRICS, PLAYER_ID};
use huddle_core::errors::RegistryError;
use huddle_core::{AnalysisContext, TimeRange};
use serde_json::{json, Value};

use crate::guardrails::{mentions, words, JAILBREAK, RELEVANCE};
use crate::llm::{KeywordModel, KeywordRoute};
use crate::orchestrator::{OrchestrationRequest, Orchestrator, Specialist};
use crate::registry::{AgentDefinition, AgentRegistry};
use crate::tools::Tool;

pub const TRIAGE_AGENT: &str = "Triage Agent";
pub const PLAYER_BEHAVIOR_AGENT: &str = "Player Behavior Agent";
pub const PERFORMANCE_AGENT: &str = "Performance Analysis Agent";
pub const REVENUE_AGENT: &str = "Revenue Analysis Agent";
pub const RETENTION_AGENT: &str = "Retention Analysis Agent";
pub const VISUALIZATION_AGENT: &str = "Visualization Agent";
pub const ORCHESTRATOR_AGENT: &str = "Orchestrator Agent";

pub const DEFAULT_GAME_ID: &str = "default_game";

/// Name of the offline keyword-routing model in `[llm] model`.
pub const KEYWORD_MODEL: &str = "keyword-router";

struct ToolProfile {
    name: &'static str,
    description: &'static str,
    analysis_type: &'static str,
    metrics: &'static [&'static str],
    title: &'static str,
    default_period: Option<&'static str>,
    /// Chart kinds this tool renders, default first. Empty for non-chart tools.
    charts: &'static [&'static str],
    insight: &'static str,
}

static PLAYER_BEHAVIOR: ToolProfile = ToolProfile {
    name: "player_behavior_analysis",
    description: "Analyze player behavior patterns and preferences.",
    analysis_type: "player_behavior",
    metrics: &["player_segments", "engagement", "playtime"],
    title: "Player behavior analysis",
    default_period: None,
    charts: &[],
    insight: "Segment players and tailor features to each group.",
};

static PERFORMANCE: ToolProfile = ToolProfile {
    name: "performance_monitoring",
    description: "Monitor game performance metrics and server status.",
    analysis_type: "performance",
    metrics: &["crash_rate", "load_time", "uptime"],
    title: "Performance report",
    default_period: None,
    charts: &[],
    insight: "Keep watching crash rate and load time to catch regressions early.",
};

static REVENUE: ToolProfile = ToolProfile {
    name: "revenue_analysis",
    description: "Analyze game revenue data and monetization metrics.",
    analysis_type: "revenue",
    metrics: &["total_revenue", "conversion_rate", "arpu", "arppu"],
    title: "Revenue analysis",
    default_period: Some("current_month"),
    charts: &[],
    insight: "Work on payer conversion and revenue per user.",
};

static RETENTION: ToolProfile = ToolProfile {
    name: "retention_analysis",
    description: "Analyze player retention rates and churn risk.",
    analysis_type: "retention",
    metrics: &["retention_rate", "churn_risk"],
    title: "Retention analysis",
    default_period: None,
    charts: &[],
    insight: "Focus on early retention and lifecycle management for new players.",
};

static VISUALIZATION: ToolProfile = ToolProfile {
    name: "generate_visualization",
    description: "Generate data visualizations, charts and dashboards.",
    analysis_type: "visualization",
    metrics: &["chart"],
    title: "Visualization",
    default_period: None,
    charts: &["line", "bar", "pie"],
    insight: "",
};

/// A specialist tool that records what is being analyzed in the context.
struct AnalysisTool {
    profile: &'static ToolProfile,
}

#[async_trait]
impl Tool for AnalysisTool {
    fn name(&self) -> &str {
        self.profile.name
    }

    fn description(&self) -> &str {
        self.profile.description
    }

    async fn execute(&self, arguments: Value, context: &mut AnalysisContext) -> Result<Value> {
        let profile = self.profile;
        let chart = match profile.charts.first() {
            Some(default) => {
                let requested =
                    arguments.get("chart_type").and_then(Value::as_str).unwrap_or(*default);
                Some(chart_kind(requested).ok_or_else(|| {
                    anyhow!("unsupported chart type `{requested}`; supported: line, bar, pie")
                })?)
            }
            None => None,
        };

        if let Some(game_id) = arguments.get("game_id").and_then(Value::as_str) {
            context.set(GAME_ID, game_id);
        }
        if let Some(player_id) = arguments.get("player_id").and_then(Value::as_str) {
            context.set(PLAYER_ID, player_id);
        }
        context.set(ANALYSIS_TYPE, profile.analysis_type);

        let metrics = match chart {
            Some(chart) => vec![format!("chart:{chart}")],
            None => profile.metrics.iter().map(|metric| (*metric).to_owned()).collect::<Vec<_>>(),
        };
        context.set(METRICS, json!(metrics));

        let period = arguments
            .get("period")
            .and_then(Value::as_str)
            .or(profile.default_period);
        if let Some(period) = period {
            context.set_time_range(&TimeRange {
                start: None,
                end: None,
                period: Some(period.to_owned()),
            });
        }

        let game_id = context.game_id().unwrap_or(DEFAULT_GAME_ID).to_owned();
        let scope = match period {
            Some(period) => format!("{game_id}, {period}"),
            None => game_id.clone(),
        };
        let summary = format!("{} prepared for {scope}: {}.", profile.title, metrics.join(", "));
        Ok(json!({
            "analysis_type": profile.analysis_type,
            "game_id": game_id,
            "metrics": metrics,
            "period": period,
            "summary": summary,
        }))
    }
}

/// Accepts English and Chinese chart names.
fn chart_kind(requested: &str) -> Option<&'static str> {
    match requested.trim().to_lowercase().as_str() {
        "line" | "折线图" => Some("line"),
        "bar" | "柱状图" => Some("bar"),
        "pie" | "饼图" => Some("pie"),
        _ => None,
    }
}

/// Runs a cross-domain question across the specialists it touches.
struct OrchestrationTool {
    orchestrator: Arc<Orchestrator>,
}

#[async_trait]
impl Tool for OrchestrationTool {
    fn name(&self) -> &str {
        "orchestrate_multi_agent_analysis"
    }

    fn description(&self) -> &str {
        "Split a question into specialist sub-tasks, run them and synthesize one report."
    }

    async fn execute(&self, arguments: Value, context: &mut AnalysisContext) -> Result<Value> {
        let text = |key: &str| arguments.get(key).and_then(Value::as_str).map(str::to_owned);
        let request = OrchestrationRequest {
            query: text("user_query").or_else(|| text("query")).unwrap_or_default(),
            game_id: text("game_id").or_else(|| context.game_id().map(str::to_owned)),
            period: text("period"),
            chart_type: text("chart_type"),
            sequential: arguments
                .get("enable_parallel_execution")
                .and_then(Value::as_bool)
                .is_some_and(|parallel| !parallel),
        };

        let report = self.orchestrator.run(&request, context).await;

        context.set(ANALYSIS_TYPE, "multi_agent_orchestration");
        context.set(METRICS, json!(report.domains));
        if let Some(game_id) = &request.game_id {
            context.set(GAME_ID, game_id.as_str());
        }
        Ok(serde_json::to_value(report)?)
    }
}

/// Keyword tables used both for offline routing and orchestration planning.
pub fn domain_routes() -> Vec<KeywordRoute> {
    vec![
        KeywordRoute::new(
            PLAYER_BEHAVIOR_AGENT,
            ["玩家", "行为", "分群", "参与度", "活跃", "player", "players", "behavior", "engagement"],
        ),
        KeywordRoute::new(
            PERFORMANCE_AGENT,
            ["性能", "服务器", "延迟", "崩溃", "负载", "performance", "server", "latency", "crash"],
        ),
        KeywordRoute::new(
            REVENUE_AGENT,
            ["收入", "营收", "付费", "变现", "收益", "revenue", "monetization", "payment"],
        ),
        KeywordRoute::new(
            RETENTION_AGENT,
            ["留存", "流失", "回归", "生命周期", "retention", "churn", "lifecycle"],
        ),
        KeywordRoute::new(
            VISUALIZATION_AGENT,
            ["图表", "可视化", "仪表板", "报告", "chart", "visualization", "dashboard", "report"],
        ),
    ]
}

/// Offline model wired to this catalog's routing tables.
pub fn keyword_model() -> KeywordModel {
    KeywordModel::new(domain_routes())
        .with_multi_domain_agent(ORCHESTRATOR_AGENT)
        .with_home_agent(TRIAGE_AGENT)
}

/// The specialist tools, shared between their agents and the orchestrator.
fn specialists() -> Vec<Specialist> {
    let routes = domain_routes();
    [&PLAYER_BEHAVIOR, &PERFORMANCE, &REVENUE, &RETENTION, &VISUALIZATION]
        .into_iter()
        .zip(routes)
        .map(|(profile, route)| Specialist {
            domain: profile.analysis_type,
            label: profile.title,
            keywords: route.keywords,
            tool: Arc::new(AnalysisTool { profile }),
            insight: profile.insight,
        })
        .collect()
}

fn specialist(name: &str, description: &str, instructions: &str, tool: &str) -> AgentDefinition {
    AgentDefinition::new(name)
        .with_description(description)
        .with_instructions(instructions)
        .with_tool(tool)
        .with_handoff(TRIAGE_AGENT)
        .with_guardrail(RELEVANCE)
        .with_guardrail(JAILBREAK)
}

pub fn registry() -> Result<AgentRegistry, RegistryError> {
    let triage = AgentDefinition::new(TRIAGE_AGENT)
        .with_description("Analyzes incoming questions and routes them to the right specialist.")
        .with_instructions(
            "Work out which analytics domain the question belongs to. Route single-domain \
             questions to that specialist and cross-domain questions to the Orchestrator Agent.",
        )
        .with_handoff(PLAYER_BEHAVIOR_AGENT)
        .with_handoff(PERFORMANCE_AGENT)
        .with_handoff(REVENUE_AGENT)
        .with_handoff(RETENTION_AGENT)
        .with_handoff(VISUALIZATION_AGENT)
        .with_handoff(ORCHESTRATOR_AGENT)
        .with_guardrail(RELEVANCE)
        .with_guardrail(JAILBREAK);

    let player_behavior = specialist(
        PLAYER_BEHAVIOR_AGENT,
        "Analyzes player behavior patterns, segments and engagement.",
        "Use player_behavior_analysis to segment players and measure engagement. \
         Transfer back to the Triage Agent for anything else.",
        PLAYER_BEHAVIOR.name,
    )
    .with_entry_default(GAME_ID, DEFAULT_GAME_ID)
    .with_entry_default(ANALYSIS_TYPE, PLAYER_BEHAVIOR.analysis_type);

    let performance = specialist(
        PERFORMANCE_AGENT,
        "Monitors game performance and server metrics.",
        "Use performance_monitoring for crash rate, load time and uptime questions. \
         Transfer back to the Triage Agent for anything else.",
        PERFORMANCE.name,
    )
    .with_entry_default(GAME_ID, DEFAULT_GAME_ID)
    .with_entry_default(ANALYSIS_TYPE, PERFORMANCE.analysis_type);

    let revenue = specialist(
        REVENUE_AGENT,
        "Analyzes game revenue and monetization.",
        "Use revenue_analysis for revenue trends, conversion, ARPU and ARPPU. \
         Transfer back to the Triage Agent for anything else.",
        REVENUE.name,
    )
    .with_entry_default(GAME_ID, DEFAULT_GAME_ID)
    .with_entry_default(ANALYSIS_TYPE, REVENUE.analysis_type);

    let retention = specialist(
        RETENTION_AGENT,
        "Analyzes player retention and churn patterns.",
        "Use retention_analysis for cohort retention and churn risk. \
         Transfer back to the Triage Agent for anything else.",
        RETENTION.name,
    );

    let visualization = specialist(
        VISUALIZATION_AGENT,
        "Generates data visualizations and charts.",
        "Pick the chart that fits the question and call generate_visualization. \
         Transfer back to the Triage Agent for anything else.",
        VISUALIZATION.name,
    );

    let orchestrator = specialist(
        ORCHESTRATOR_AGENT,
        "Coordinates specialists for questions that span several domains.",
        "Break the question into specialist sub-tasks with orchestrate_multi_agent_analysis, \
         then present the synthesized report.",
        "orchestrate_multi_agent_analysis",
    );

    let specialists = specialists();
    let orchestration = OrchestrationTool {
        orchestrator: Arc::new(
            Orchestrator::new(specialists.clone())
                .with_summary_domain(VISUALIZATION.analysis_type),
        ),
    };

    specialists
        .into_iter()
        .fold(
            AgentRegistry::builder(TRIAGE_AGENT)
                .agent(triage)
                .agent(player_behavior)
                .agent(performance)
                .agent(revenue)
                .agent(retention)
                .agent(visualization)
                .agent(orchestrator),
            |builder, specialist| builder.shared_tool(specialist.tool),
        )
        .tool(orchestration)
        .known_guardrails([RELEVANCE, JAILBREAK])
        .build()
}
