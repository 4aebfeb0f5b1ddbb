use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use huddle_core::config::AppConfig;
use toml::Value;

use crate::commands::load_config;

pub fn run(config_path: Option<PathBuf>) -> String {
    let config = match load_config(config_path.clone()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {}", error.message),
    };

    let config_file_path = config_path.or_else(detect_config_path);
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for entry in effective_values(&config) {
        let source = field_source(
            entry.key,
            entry.env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(entry.key, &entry.value, source));
    }

    lines.join("\n")
}

fn effective_values(config: &AppConfig) -> Vec<EffectiveValue> {
    vec![
        field("llm.provider", format!("{:?}", config.llm.provider), &["HUDDLE_LLM_PROVIDER"]),
        field("llm.model", config.llm.model.clone(), &["HUDDLE_LLM_MODEL"]),
        field(
            "runtime.max_iterations",
            config.runtime.max_iterations.to_string(),
            &["HUDDLE_RUNTIME_MAX_ITERATIONS"],
        ),
        field(
            "runtime.max_handoff_chain",
            config.runtime.max_handoff_chain.to_string(),
            &["HUDDLE_RUNTIME_MAX_HANDOFF_CHAIN"],
        ),
        field(
            "runtime.turn_timeout_secs",
            config.runtime.turn_timeout_secs.to_string(),
            &["HUDDLE_RUNTIME_TURN_TIMEOUT_SECS"],
        ),
        field(
            "runtime.tool_failure_retries",
            config.runtime.tool_failure_retries.to_string(),
            &["HUDDLE_RUNTIME_TOOL_FAILURE_RETRIES"],
        ),
        field(
            "runtime.turn_lock",
            format!("{:?}", config.runtime.turn_lock),
            &["HUDDLE_RUNTIME_TURN_LOCK"],
        ),
        field(
            "guardrails.short_input_max_chars",
            config.guardrails.short_input_max_chars.to_string(),
            &["HUDDLE_GUARDRAILS_SHORT_INPUT_MAX_CHARS"],
        ),
        field(
            "guardrails.extra_domain_keywords",
            format!("[{}]", config.guardrails.extra_domain_keywords.join(", ")),
            &["HUDDLE_GUARDRAILS_EXTRA_DOMAIN_KEYWORDS"],
        ),
        field(
            "logging.level",
            config.logging.level.clone(),
            &["HUDDLE_LOGGING_LEVEL", "HUDDLE_LOG_LEVEL"],
        ),
        field(
            "logging.format",
            format!("{:?}", config.logging.format),
            &["HUDDLE_LOGGING_FORMAT", "HUDDLE_LOG_FORMAT"],
        ),
    ]
}

struct EffectiveValue {
    key: &'static str,
    value: String,
    env_keys: &'static [&'static str],
}

fn field(key: &'static str, value: String, env_keys: &'static [&'static str]) -> EffectiveValue {
    EffectiveValue { key, value, env_keys }
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("huddle.toml"), PathBuf::from("config/huddle.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}
