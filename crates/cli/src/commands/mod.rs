pub mod agents;
pub mod chat;
pub mod config;
pub mod validate;

use std::path::PathBuf;
use std::sync::Arc;

use huddle_agent::{catalog, ConversationEngine, EngineSettings, GuardrailEngine, ModelCapability};
use huddle_core::config::{AppConfig, LoadOptions};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::success_with(command, message, None)
    }

    pub fn success_with(command: &str, message: impl Into<String>, data: Option<Value>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            data,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            data: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

pub(crate) fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, CommandResultError> {
    let require_file = config_path.is_some();
    AppConfig::load(LoadOptions { config_path, require_file, ..LoadOptions::default() }).map_err(
        |error| CommandResultError {
            error_class: "config_validation",
            message: format!("configuration issue: {error}"),
            exit_code: 2,
        },
    )
}

/// Wires the catalog agents, guardrails and the configured offline model into an engine.
pub(crate) fn build_engine(config: &AppConfig) -> Result<ConversationEngine, CommandResultError> {
    let model: Arc<dyn ModelCapability> = match config.llm.model.as_str() {
        catalog::KEYWORD_MODEL => Arc::new(catalog::keyword_model()),
        other => {
            return Err(CommandResultError {
                error_class: "llm_model_unsupported",
                message: format!(
                    "llm model `{other}` is not available; offline models: {}",
                    catalog::KEYWORD_MODEL
                ),
                exit_code: 3,
            })
        }
    };

    let registry = catalog::registry().map_err(|error| CommandResultError {
        error_class: "registry_validation",
        message: error.to_string(),
        exit_code: 4,
    })?;
    info!(
        event_name = "engine.built",
        provider = ?config.llm.provider,
        model = %config.llm.model,
        agents = registry.summaries().len(),
        "conversation engine ready"
    );

    Ok(ConversationEngine::new(
        Arc::new(registry),
        GuardrailEngine::with_defaults(&config.guardrails),
        model,
        EngineSettings::from(&config.runtime),
    ))
}

pub(crate) fn async_runtime(command: &str) -> Result<tokio::runtime::Runtime, CommandResult> {
    tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
        CommandResult::failure(
            command,
            "runtime_init",
            format!("failed to initialize async runtime: {error}"),
            3,
        )
    })
}

#[derive(Debug)]
pub(crate) struct CommandResultError {
    pub error_class: &'static str,
    pub message: String,
    pub exit_code: u8,
}

impl CommandResultError {
    pub fn into_result(self, command: &str) -> CommandResult {
        CommandResult::failure(command, self.error_class, self.message, self.exit_code)
    }
}
