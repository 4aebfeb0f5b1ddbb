use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Instant;

use huddle_agent::{catalog, AgentRegistry, ConversationEngine, GuardrailEngine, TurnRequest};
use huddle_core::config::AppConfig;
use huddle_core::ErrorCode;
use serde::Serialize;

use crate::commands::{async_runtime, build_engine, load_config, CommandResult};

const PROBE_QUESTION: &str = "show revenue for GAME-1001 over the last 7 days";
const PROBE_OFF_TOPIC: &str = "write a poem about strawberries";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct ValidateCheck {
    name: &'static str,
    status: CheckStatus,
    elapsed_ms: u64,
    message: String,
}

#[derive(Debug, Serialize)]
struct ValidateReport {
    command: &'static str,
    status: CheckStatus,
    summary: String,
    total_elapsed_ms: u64,
    checks: Vec<ValidateCheck>,
}

pub fn run(config_path: Option<PathBuf>) -> CommandResult {
    let started = Instant::now();
    let mut checks = Vec::new();

    let check_started = Instant::now();
    let config = match load_config(config_path) {
        Ok(config) => {
            checks.push(passed(
                "config_validation",
                check_started,
                "configuration loaded and validated",
            ));
            config
        }
        Err(error) => {
            checks.push(failed("config_validation", check_started, error.message));
            checks.extend(
                ["registry_validation", "guardrail_coverage", "routing_probe", "refusal_probe"]
                    .map(skipped),
            );
            return finalize_report(checks, started);
        }
    };

    let check_started = Instant::now();
    let registry = match catalog::registry() {
        Ok(registry) => {
            checks.push(passed(
                "registry_validation",
                check_started,
                format!(
                    "{} agents reachable from `{}`",
                    registry.summaries().len(),
                    registry.entry_agent().name
                ),
            ));
            registry
        }
        Err(error) => {
            checks.push(failed("registry_validation", check_started, error.to_string()));
            checks.extend(["guardrail_coverage", "routing_probe", "refusal_probe"].map(skipped));
            return finalize_report(checks, started);
        }
    };

    checks.push(check_guardrail_coverage(&config, &registry));

    let check_started = Instant::now();
    let engine = match build_engine(&config) {
        Ok(engine) => engine,
        Err(error) => {
            checks.push(failed("routing_probe", check_started, error.message));
            checks.push(skipped("refusal_probe"));
            return finalize_report(checks, started);
        }
    };
    let runtime = match async_runtime("validate") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    checks.push(runtime.block_on(routing_probe(&engine)));
    checks.push(runtime.block_on(refusal_probe(&engine)));

    finalize_report(checks, started)
}

fn check_guardrail_coverage(config: &AppConfig, registry: &AgentRegistry) -> ValidateCheck {
    let started = Instant::now();
    let engine = GuardrailEngine::with_defaults(&config.guardrails);
    let registered = engine.ids().collect::<BTreeSet<_>>();
    let missing = registry
        .agents()
        .flat_map(|agent| agent.guardrails.iter().map(String::as_str))
        .filter(|id| !registered.contains(id))
        .collect::<BTreeSet<_>>();

    if missing.is_empty() {
        passed("guardrail_coverage", started, "every referenced guardrail is registered")
    } else {
        let missing = missing.into_iter().collect::<Vec<_>>().join(", ");
        failed("guardrail_coverage", started, format!("unregistered guardrails: {missing}"))
    }
}

async fn routing_probe(engine: &ConversationEngine) -> ValidateCheck {
    let started = Instant::now();
    match engine.handle_turn(TurnRequest::start(PROBE_QUESTION)).await {
        Ok(response) if response.current_agent == catalog::REVENUE_AGENT => passed(
            "routing_probe",
            started,
            format!("routed to `{}` with {} events", response.current_agent, response.events.len()),
        ),
        Ok(response) => failed(
            "routing_probe",
            started,
            format!("expected `{}`, ended at `{}`", catalog::REVENUE_AGENT, response.current_agent),
        ),
        Err(failure) => {
            failed("routing_probe", started, format!("{}: {}", failure.code.as_str(), failure.detail))
        }
    }
}

async fn refusal_probe(engine: &ConversationEngine) -> ValidateCheck {
    let started = Instant::now();
    let refusal = ErrorCode::GuardrailTripped.user_message();
    match engine.handle_turn(TurnRequest::start(PROBE_OFF_TOPIC)).await {
        Ok(response) if response.messages.iter().any(|message| message.content == refusal) => {
            passed("refusal_probe", started, "off-topic input was refused")
        }
        Ok(_) => failed("refusal_probe", started, "off-topic input was answered"),
        Err(failure) => {
            failed("refusal_probe", started, format!("{}: {}", failure.code.as_str(), failure.detail))
        }
    }
}

fn passed(name: &'static str, started: Instant, message: impl Into<String>) -> ValidateCheck {
    ValidateCheck {
        name,
        status: CheckStatus::Pass,
        elapsed_ms: started.elapsed().as_millis() as u64,
        message: message.into(),
    }
}

fn failed(name: &'static str, started: Instant, message: impl Into<String>) -> ValidateCheck {
    ValidateCheck {
        name,
        status: CheckStatus::Fail,
        elapsed_ms: started.elapsed().as_millis() as u64,
        message: message.into(),
    }
}

fn skipped(name: &'static str) -> ValidateCheck {
    ValidateCheck {
        name,
        status: CheckStatus::Skipped,
        elapsed_ms: 0,
        message: "skipped due previous failure".to_string(),
    }
}

fn finalize_report(checks: Vec<ValidateCheck>, started: Instant) -> CommandResult {
    let total_elapsed_ms = started.elapsed().as_millis() as u64;
    let passed = checks.iter().filter(|check| check.status == CheckStatus::Pass).count();
    let total = checks.len();
    let failed = checks.iter().any(|check| check.status == CheckStatus::Fail);

    let report = ValidateReport {
        command: "validate",
        status: if failed { CheckStatus::Fail } else { CheckStatus::Pass },
        summary: format!("validate: {passed}/{total} checks passed in {total_elapsed_ms}ms"),
        total_elapsed_ms,
        checks,
    };

    let human = report.summary.clone();
    let machine = serde_json::to_string(&report).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"validate\",\"status\":\"fail\",\"summary\":\"serialization failed\",\"error\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    });

    CommandResult { exit_code: if failed { 6 } else { 0 }, output: format!("{human}\n{machine}") }
}
