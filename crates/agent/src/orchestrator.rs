//! Multi-domain analysis for questions that span several specialists.
//!
//! A question is classified by complexity, matched against specialist
//! domains, decomposed into sub-tasks grouped in stages, executed stage by
//! stage (tasks within a stage run concurrently), and folded into one report.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use huddle_core::AnalysisContext;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::guardrails::{mentions, words};
use crate::tools::Tool;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
    Comprehensive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One specialist answers alone.
    Direct,
    Parallel,
    /// Each task waits for the one before it and is skipped if it failed.
    Sequential,
    /// A parallel base stage followed by a deeper stage for the remaining domains.
    Hybrid,
}

/// Checked in order; the first tier with a matching cue wins.
const COMPLEXITY_CUES: &[(Complexity, &[&str])] = &[
    (Complexity::Simple, &["单个", "简单", "快速", "基本", "quick", "simple", "basic", "single"]),
    (
        Complexity::Moderate,
        &["比较", "对比", "分析", "详细", "compare", "comparison", "versus", "vs", "detailed"],
    ),
    (
        Complexity::Complex,
        &["深入", "全面", "综合", "多维度", "deep", "thorough", "holistic", "multidimensional"],
    ),
    (
        Complexity::Comprehensive,
        &["完整", "整体", "全方位", "系统性", "comprehensive", "complete", "overall", "everything"],
    ),
];

/// Number of domains analyzed in the first hybrid stage.
const HYBRID_BASE_WIDTH: usize = 3;

/// One specialist domain the orchestrator can delegate to.
#[derive(Clone)]
pub struct Specialist {
    pub domain: &'static str,
    pub label: &'static str,
    pub keywords: Vec<String>,
    pub tool: Arc<dyn Tool>,
    /// Recommendation added to the report when this domain produced a result.
    pub insight: &'static str,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SubTask {
    pub id: String,
    pub domain: &'static str,
    pub stage: usize,
    pub depends_on: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    pub complexity: Complexity,
    pub strategy: Strategy,
    pub domains: Vec<&'static str>,
    pub tasks: Vec<SubTask>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Failed,
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskResult {
    pub id: String,
    pub domain: &'static str,
    pub status: TaskStatus,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExecutionSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub success_rate: f64,
}

impl ExecutionSummary {
    fn from_results(results: &[TaskResult]) -> Self {
        let count = |status| results.iter().filter(|result| result.status == status).count();
        let total = results.len();
        let completed = count(TaskStatus::Completed);
        let success_rate =
            if total == 0 { 0.0 } else { completed as f64 * 100.0 / total as f64 };
        Self {
            total,
            completed,
            failed: count(TaskStatus::Failed),
            skipped: count(TaskStatus::Skipped),
            success_rate,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OrchestrationReport {
    pub query: String,
    pub complexity: Complexity,
    pub strategy: Strategy,
    pub domains: Vec<&'static str>,
    pub execution: ExecutionSummary,
    pub results: Vec<TaskResult>,
    pub insights: Vec<String>,
    /// Human-readable synthesis of everything above.
    pub summary: String,
}

/// Options a caller may pass alongside the question.
#[derive(Clone, Debug, Default)]
pub struct OrchestrationRequest {
    pub query: String,
    pub game_id: Option<String>,
    pub period: Option<String>,
    pub chart_type: Option<String>,
    /// Forces one-at-a-time execution.
    pub sequential: bool,
}

pub struct Orchestrator {
    specialists: Vec<Specialist>,
    summary_domain: Option<&'static str>,
}

impl Orchestrator {
    pub fn new(specialists: Vec<Specialist>) -> Self {
        Self { specialists, summary_domain: None }
    }

    /// Domain that renders the combined result once the other tasks are done.
    /// It is never picked as a fallback analysis domain.
    pub fn with_summary_domain(mut self, domain: &'static str) -> Self {
        self.summary_domain = Some(domain);
        self
    }

    fn specialist(&self, domain: &str) -> Option<&Specialist> {
        self.specialists.iter().find(|specialist| specialist.domain == domain)
    }

    pub fn plan(&self, query: &str, sequential: bool) -> ExecutionPlan {
        let normalized = query.to_lowercase();
        let tokens = words(&normalized);
        let matches = |terms: &[&str]| terms.iter().any(|term| mentions(&normalized, &tokens, term));

        let mut domains = self
            .specialists
            .iter()
            .filter(|specialist| {
                specialist.keywords.iter().any(|term| mentions(&normalized, &tokens, term))
            })
            .map(|specialist| specialist.domain)
            .collect::<Vec<_>>();
        if domains.is_empty() {
            domains = self
                .specialists
                .iter()
                .map(|specialist| specialist.domain)
                .filter(|domain| Some(*domain) != self.summary_domain)
                .collect();
        }

        let complexity = COMPLEXITY_CUES
            .iter()
            .find(|entry| matches(entry.1))
            .map(|entry| entry.0)
            .unwrap_or(match domains.len() {
                0 | 1 => Complexity::Simple,
                2 => Complexity::Moderate,
                3 => Complexity::Complex,
                _ => Complexity::Comprehensive,
            });

        let strategy = match complexity {
            _ if sequential => Strategy::Sequential,
            Complexity::Simple if domains.len() == 1 => Strategy::Direct,
            Complexity::Moderate | Complexity::Complex => Strategy::Parallel,
            _ => Strategy::Hybrid,
        };

        let tasks = self.decompose(&domains, complexity, strategy);
        ExecutionPlan { complexity, strategy, domains, tasks }
    }

    fn decompose(
        &self,
        domains: &[&'static str],
        complexity: Complexity,
        strategy: Strategy,
    ) -> Vec<SubTask> {
        let task = |index: usize, domain: &'static str, stage: usize, depends_on: Vec<String>| {
            SubTask { id: format!("{domain}-{}", index + 1), domain, stage, depends_on }
        };

        let mut tasks = match strategy {
            Strategy::Direct => {
                domains.first().map(|domain| task(0, *domain, 0, Vec::new())).into_iter().collect()
            }
            Strategy::Parallel => domains
                .iter()
                .enumerate()
                .map(|(index, domain)| task(index, *domain, 0, Vec::new()))
                .collect(),
            Strategy::Sequential => {
                let mut tasks: Vec<SubTask> = Vec::with_capacity(domains.len());
                for (index, domain) in domains.iter().enumerate() {
                    let depends_on = tasks.last().map(|prev| vec![prev.id.clone()]).unwrap_or_default();
                    tasks.push(task(index, *domain, index, depends_on));
                }
                tasks
            }
            Strategy::Hybrid => {
                let split = domains.len().min(HYBRID_BASE_WIDTH);
                let mut tasks = domains[..split]
                    .iter()
                    .enumerate()
                    .map(|(index, domain)| task(index, *domain, 0, Vec::new()))
                    .collect::<Vec<_>>();
                let base = tasks.iter().map(|task| task.id.clone()).collect::<Vec<_>>();
                tasks.extend(
                    domains[split..]
                        .iter()
                        .enumerate()
                        .map(|(offset, domain)| task(split + offset, *domain, 1, base.clone())),
                );
                tasks
            }
        };

        let wants_summary = tasks.len() > 1 || complexity != Complexity::Simple;
        if let Some(summary) = self.summary_domain.filter(|_| wants_summary) {
            let already_planned = tasks.iter().any(|task| task.domain == summary);
            if !already_planned && self.specialist(summary).is_some() {
                let stage = tasks.iter().map(|task| task.stage + 1).max().unwrap_or(0);
                let depends_on = tasks.iter().map(|task| task.id.clone()).collect();
                tasks.push(task(tasks.len(), summary, stage, depends_on));
            }
        }
        tasks
    }

    /// Runs `request` against clones of `context`; the caller's context is not touched.
    pub async fn run(
        &self,
        request: &OrchestrationRequest,
        context: &AnalysisContext,
    ) -> OrchestrationReport {
        let plan = self.plan(&request.query, request.sequential);
        info!(
            event_name = "orchestrator.planned",
            complexity = ?plan.complexity,
            strategy = ?plan.strategy,
            tasks = plan.tasks.len(),
            "multi-domain analysis planned"
        );

        let mut stages: BTreeMap<usize, Vec<&SubTask>> = BTreeMap::new();
        for task in &plan.tasks {
            stages.entry(task.stage).or_default().push(task);
        }

        let mut results: Vec<TaskResult> = Vec::with_capacity(plan.tasks.len());
        for stage in stages.into_values() {
            let completed = results
                .iter()
                .filter(|result| result.status == TaskStatus::Completed)
                .map(|result| result.id.as_str())
                .collect::<HashSet<_>>();
            let runs = stage.into_iter().map(|task| {
                let blocked = plan.strategy == Strategy::Sequential
                    && task.depends_on.iter().any(|id| !completed.contains(id.as_str()));
                async move {
                    if blocked {
                        return TaskResult {
                            id: task.id.clone(),
                            domain: task.domain,
                            status: TaskStatus::Skipped,
                            output: Value::Null,
                            error: Some("a task it depends on did not complete".to_owned()),
                        };
                    }
                    self.run_task(task, request, context).await
                }
            });
            let stage_results = join_all(runs).await;
            results.extend(stage_results);
        }

        let execution = ExecutionSummary::from_results(&results);
        let insights = self.insights(&results);
        let summary = self.synthesize(request, &plan, &execution, &results, &insights);
        info!(
            event_name = "orchestrator.completed",
            completed = execution.completed,
            total = execution.total,
            "multi-domain analysis finished"
        );

        OrchestrationReport {
            query: request.query.clone(),
            complexity: plan.complexity,
            strategy: plan.strategy,
            domains: plan.domains,
            execution,
            results,
            insights,
            summary,
        }
    }

    async fn run_task(
        &self,
        task: &SubTask,
        request: &OrchestrationRequest,
        context: &AnalysisContext,
    ) -> TaskResult {
        let Some(specialist) = self.specialist(task.domain) else {
            return TaskResult {
                id: task.id.clone(),
                domain: task.domain,
                status: TaskStatus::Failed,
                output: Value::Null,
                error: Some(format!("no specialist handles `{}`", task.domain)),
            };
        };

        let mut arguments = json!({ "query": request.query });
        if let Some(game_id) = &request.game_id {
            arguments["game_id"] = json!(game_id);
        }
        if let Some(period) = &request.period {
            arguments["period"] = json!(period);
        }
        if let Some(chart_type) = &request.chart_type {
            arguments["chart_type"] = json!(chart_type);
        }

        let mut scratch = context.clone();
        match specialist.tool.execute(arguments, &mut scratch).await {
            Ok(output) => TaskResult {
                id: task.id.clone(),
                domain: task.domain,
                status: TaskStatus::Completed,
                output,
                error: None,
            },
            Err(error) => {
                warn!(
                    event_name = "orchestrator.task_failed",
                    task = %task.id,
                    error = %error,
                    "orchestrated sub-task failed"
                );
                TaskResult {
                    id: task.id.clone(),
                    domain: task.domain,
                    status: TaskStatus::Failed,
                    output: Value::Null,
                    error: Some(format!("{error:#}")),
                }
            }
        }
    }

    fn insights(&self, results: &[TaskResult]) -> Vec<String> {
        let mut covered = Vec::new();
        for result in results.iter().filter(|result| result.status == TaskStatus::Completed) {
            if !covered.contains(&result.domain) {
                covered.push(result.domain);
            }
        }

        let mut insights = covered
            .iter()
            .filter_map(|domain| self.specialist(domain))
            .map(|specialist| specialist.insight)
            .filter(|insight| !insight.is_empty())
            .map(str::to_owned)
            .collect::<Vec<_>>();
        if covered.len() > 2 {
            insights.push("Track these areas together on one dashboard.".to_owned());
        }
        insights
    }

    fn synthesize(
        &self,
        request: &OrchestrationRequest,
        plan: &ExecutionPlan,
        execution: &ExecutionSummary,
        results: &[TaskResult],
        insights: &[String],
    ) -> String {
        let mut lines = vec![
            format!("Multi-domain analysis: {}", request.query),
            format!(
                "{} of {} sub-tasks completed ({:.0}%), {:?} strategy.",
                execution.completed,
                execution.total,
                execution.success_rate,
                plan.strategy
            ),
        ];
        for result in results {
            let label = self.specialist(result.domain).map_or(result.domain, |s| s.label);
            let detail = match result.status {
                TaskStatus::Completed => match result.output.get("summary").and_then(Value::as_str) {
                    Some(summary) => summary.to_owned(),
                    None => result.output.to_string(),
                },
                TaskStatus::Failed | TaskStatus::Skipped => format!(
                    "not available ({})",
                    result.error.as_deref().unwrap_or("no result")
                ),
            };
            lines.push(format!("- {label}: {detail}"));
        }
        if !insights.is_empty() {
            lines.push("Recommendations:".to_owned());
            lines.extend(insights.iter().map(|insight| format!("- {insight}")));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use huddle_core::AnalysisContext;
    use serde_json::{json, Value};

    use super::{
        Complexity, Orchestrator, OrchestrationRequest, Specialist, Strategy, TaskStatus,
    };
    use crate::tools::Tool;

    struct Domain {
        name: &'static str,
        fail: bool,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for Domain {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, arguments: Value, context: &mut AnalysisContext) -> Result<Value> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            context.set("analysis_type", self.name);
            if self.fail {
                return Err(anyhow!("{} backend unavailable", self.name));
            }
            Ok(json!({ "summary": format!("{} ok for {}", self.name, arguments["query"]) }))
        }
    }

    struct Fixture {
        orchestrator: Orchestrator,
        peak: Arc<AtomicUsize>,
    }

    fn fixture(failing: &[&str]) -> Fixture {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let specialist = |domain: &'static str, keywords: &[&str]| Specialist {
            domain,
            label: domain,
            keywords: keywords.iter().map(|keyword| (*keyword).to_owned()).collect(),
            tool: Arc::new(Domain {
                name: domain,
                fail: failing.contains(&domain),
                running: Arc::clone(&running),
                peak: Arc::clone(&peak),
            }),
            insight: "watch this",
        };
        let orchestrator = Orchestrator::new(vec![
            specialist("player_behavior", &["player", "engagement"]),
            specialist("performance", &["performance", "crash"]),
            specialist("revenue", &["revenue"]),
            specialist("retention", &["retention", "churn"]),
            specialist("visualization", &["chart", "dashboard"]),
        ])
        .with_summary_domain("visualization");
        Fixture { orchestrator, peak }
    }

    fn request(query: &str) -> OrchestrationRequest {
        OrchestrationRequest { query: query.to_owned(), ..OrchestrationRequest::default() }
    }

    #[test]
    fn single_domain_question_goes_direct() {
        let plan = fixture(&[]).orchestrator.plan("revenue for GAME-1001", false);

        assert_eq!(plan.complexity, Complexity::Simple);
        assert_eq!(plan.strategy, Strategy::Direct);
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].domain, "revenue");
    }

    #[test]
    fn two_domains_run_in_parallel_then_visualize() {
        let plan = fixture(&[]).orchestrator.plan("revenue and churn this month", false);

        assert_eq!(plan.complexity, Complexity::Moderate);
        assert_eq!(plan.strategy, Strategy::Parallel);
        let stages = plan.tasks.iter().map(|task| (task.domain, task.stage)).collect::<Vec<_>>();
        assert_eq!(stages, vec![("revenue", 0), ("retention", 0), ("visualization", 1)]);
        assert_eq!(plan.tasks[2].depends_on, vec!["revenue-1", "retention-2"]);
    }

    #[tokio::test]
    async fn broad_question_fans_out_across_every_domain() {
        let fixture = fixture(&[]);
        let report = fixture
            .orchestrator
            .run(&request("give me an overall health check of the game"), &AnalysisContext::new())
            .await;

        assert_eq!(report.complexity, Complexity::Comprehensive);
        assert_eq!(report.strategy, Strategy::Hybrid);
        assert_eq!(report.domains, vec!["player_behavior", "performance", "revenue", "retention"]);
        let domains = report.results.iter().map(|result| result.domain).collect::<Vec<_>>();
        assert_eq!(
            domains,
            vec!["player_behavior", "performance", "revenue", "retention", "visualization"]
        );
        assert_eq!(report.execution.completed, 5);
        assert_eq!(report.execution.success_rate, 100.0);
        assert_eq!(fixture.peak.load(Ordering::SeqCst), 3);
        assert!(report.summary.contains("5 of 5 sub-tasks completed"));
        assert!(report.insights.iter().any(|insight| insight.contains("dashboard")));
    }

    #[tokio::test]
    async fn failed_domain_is_reported_without_sinking_the_rest() {
        let report = fixture(&["revenue"])
            .orchestrator
            .run(&request("compare revenue with retention"), &AnalysisContext::new())
            .await;

        let statuses =
            report.results.iter().map(|result| (result.domain, result.status)).collect::<Vec<_>>();
        assert_eq!(
            statuses,
            vec![
                ("revenue", TaskStatus::Failed),
                ("retention", TaskStatus::Completed),
                ("visualization", TaskStatus::Completed),
            ]
        );
        assert_eq!(report.execution.failed, 1);
        assert!(report.summary.contains("revenue backend unavailable"));
    }

    #[tokio::test]
    async fn sequential_run_skips_tasks_after_a_failure() {
        let fixture = fixture(&["performance"]);
        let report = fixture
            .orchestrator
            .run(
                &OrchestrationRequest {
                    sequential: true,
                    ..request("crash rate, revenue and churn")
                },
                &AnalysisContext::new(),
            )
            .await;

        assert_eq!(report.strategy, Strategy::Sequential);
        let statuses = report.results.iter().map(|result| result.status).collect::<Vec<_>>();
        assert_eq!(
            statuses,
            vec![
                TaskStatus::Failed,
                TaskStatus::Skipped,
                TaskStatus::Skipped,
                TaskStatus::Skipped,
            ]
        );
        assert_eq!(fixture.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn caller_context_is_left_alone() {
        let context = AnalysisContext::new();
        fixture(&[]).orchestrator.run(&request("revenue and churn"), &context).await;

        assert!(context.is_empty());
    }
}
