use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub runtime: RuntimeConfig,
    pub guardrails: GuardrailConfig,
    pub logging: LoggingConfig,
}

/// Which model capability answers agent steps.
#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub model: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub max_iterations: usize,
    pub max_handoff_chain: usize,
    pub turn_timeout_secs: u64,
    pub tool_failure_retries: u32,
    pub turn_lock: TurnLockPolicy,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardrailConfig {
    pub short_input_max_chars: usize,
    pub extra_domain_keywords: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    /// Deterministic in-process models; no network access.
    Offline,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

/// What a turn does when another turn of the same conversation is in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnLockPolicy {
    Wait,
    Reject,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub max_iterations: Option<usize>,
    pub max_handoff_chain: Option<usize>,
    pub turn_timeout_secs: Option<u64>,
    pub turn_lock: Option<TurnLockPolicy>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_handoff_chain: 2,
            turn_timeout_secs: 60,
            tool_failure_retries: 1,
            turn_lock: TurnLockPolicy::Wait,
        }
    }
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self { short_input_max_chars: 24, extra_domain_keywords: Vec::new() }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig { provider: LlmProvider::Offline, model: "keyword-router".to_string() },
            runtime: RuntimeConfig::default(),
            guardrails: GuardrailConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "offline" => Ok(Self::Offline),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected offline)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl std::str::FromStr for TurnLockPolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "wait" => Ok(Self::Wait),
            "reject" => Ok(Self::Reject),
            other => Err(ConfigError::Validation(format!(
                "unsupported turn lock policy `{other}` (expected wait|reject)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("huddle.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
        }

        if let Some(runtime) = patch.runtime {
            if let Some(max_iterations) = runtime.max_iterations {
                self.runtime.max_iterations = max_iterations;
            }
            if let Some(max_handoff_chain) = runtime.max_handoff_chain {
                self.runtime.max_handoff_chain = max_handoff_chain;
            }
            if let Some(turn_timeout_secs) = runtime.turn_timeout_secs {
                self.runtime.turn_timeout_secs = turn_timeout_secs;
            }
            if let Some(tool_failure_retries) = runtime.tool_failure_retries {
                self.runtime.tool_failure_retries = tool_failure_retries;
            }
            if let Some(turn_lock) = runtime.turn_lock {
                self.runtime.turn_lock = turn_lock;
            }
        }

        if let Some(guardrails) = patch.guardrails {
            if let Some(short_input_max_chars) = guardrails.short_input_max_chars {
                self.guardrails.short_input_max_chars = short_input_max_chars;
            }
            if let Some(extra_domain_keywords) = guardrails.extra_domain_keywords {
                self.guardrails.extra_domain_keywords = extra_domain_keywords;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("HUDDLE_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("HUDDLE_LLM_MODEL") {
            self.llm.model = value;
        }

        if let Some(value) = read_env("HUDDLE_RUNTIME_MAX_ITERATIONS") {
            self.runtime.max_iterations = parse_usize("HUDDLE_RUNTIME_MAX_ITERATIONS", &value)?;
        }
        if let Some(value) = read_env("HUDDLE_RUNTIME_MAX_HANDOFF_CHAIN") {
            self.runtime.max_handoff_chain =
                parse_usize("HUDDLE_RUNTIME_MAX_HANDOFF_CHAIN", &value)?;
        }
        if let Some(value) = read_env("HUDDLE_RUNTIME_TURN_TIMEOUT_SECS") {
            self.runtime.turn_timeout_secs =
                parse_u64("HUDDLE_RUNTIME_TURN_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("HUDDLE_RUNTIME_TOOL_FAILURE_RETRIES") {
            self.runtime.tool_failure_retries =
                parse_u32("HUDDLE_RUNTIME_TOOL_FAILURE_RETRIES", &value)?;
        }
        if let Some(value) = read_env("HUDDLE_RUNTIME_TURN_LOCK") {
            self.runtime.turn_lock = value.parse()?;
        }

        if let Some(value) = read_env("HUDDLE_GUARDRAILS_SHORT_INPUT_MAX_CHARS") {
            self.guardrails.short_input_max_chars =
                parse_usize("HUDDLE_GUARDRAILS_SHORT_INPUT_MAX_CHARS", &value)?;
        }
        if let Some(value) = read_env("HUDDLE_GUARDRAILS_EXTRA_DOMAIN_KEYWORDS") {
            self.guardrails.extra_domain_keywords = value
                .split(',')
                .map(str::trim)
                .filter(|keyword| !keyword.is_empty())
                .map(str::to_owned)
                .collect();
        }

        let log_level = read_env("HUDDLE_LOGGING_LEVEL").or_else(|| read_env("HUDDLE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("HUDDLE_LOGGING_FORMAT").or_else(|| read_env("HUDDLE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(max_iterations) = overrides.max_iterations {
            self.runtime.max_iterations = max_iterations;
        }
        if let Some(max_handoff_chain) = overrides.max_handoff_chain {
            self.runtime.max_handoff_chain = max_handoff_chain;
        }
        if let Some(turn_timeout_secs) = overrides.turn_timeout_secs {
            self.runtime.turn_timeout_secs = turn_timeout_secs;
        }
        if let Some(turn_lock) = overrides.turn_lock {
            self.runtime.turn_lock = turn_lock;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_llm(&self.llm)?;
        validate_runtime(&self.runtime)?;
        validate_guardrails(&self.guardrails)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("huddle.toml"), PathBuf::from("config/huddle.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be blank".to_string()));
    }

    Ok(())
}

fn validate_runtime(runtime: &RuntimeConfig) -> Result<(), ConfigError> {
    if runtime.max_iterations == 0 || runtime.max_iterations > 100 {
        return Err(ConfigError::Validation(
            "runtime.max_iterations must be in range 1..=100".to_string(),
        ));
    }

    if runtime.max_handoff_chain == 0 || runtime.max_handoff_chain > 8 {
        return Err(ConfigError::Validation(
            "runtime.max_handoff_chain must be in range 1..=8".to_string(),
        ));
    }

    if runtime.turn_timeout_secs == 0 || runtime.turn_timeout_secs > 900 {
        return Err(ConfigError::Validation(
            "runtime.turn_timeout_secs must be in range 1..=900".to_string(),
        ));
    }

    Ok(())
}

fn validate_guardrails(guardrails: &GuardrailConfig) -> Result<(), ConfigError> {
    if guardrails.short_input_max_chars > 200 {
        return Err(ConfigError::Validation(
            "guardrails.short_input_max_chars must be at most 200".to_string(),
        ));
    }

    if guardrails.extra_domain_keywords.iter().any(|keyword| keyword.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "guardrails.extra_domain_keywords must not contain blank entries".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    llm: Option<LlmPatch>,
    runtime: Option<RuntimePatch>,
    guardrails: Option<GuardrailPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RuntimePatch {
    max_iterations: Option<usize>,
    max_handoff_chain: Option<usize>,
    turn_timeout_secs: Option<u64>,
    tool_failure_retries: Option<u32>,
    turn_lock: Option<TurnLockPolicy>,
}

#[derive(Debug, Default, Deserialize)]
struct GuardrailPatch {
    short_input_max_chars: Option<usize>,
    extra_domain_keywords: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use tempfile::TempDir;

    use super::{
        AppConfig, ConfigError, ConfigOverrides, LlmProvider, LoadOptions, LogFormat,
        TurnLockPolicy,
    };

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_match_documented_runtime_bounds() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.runtime.max_iterations == 10, "default iteration limit should be 10")?;
        ensure(config.runtime.max_handoff_chain == 2, "default handoff chain should be 2")?;
        ensure(config.runtime.tool_failure_retries == 1, "default tool retries should be 1")?;
        ensure(
            config.runtime.turn_lock == TurnLockPolicy::Wait,
            "default lock policy should wait",
        )?;
        ensure(config.llm.provider == LlmProvider::Offline, "default provider should be offline")
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_HUDDLE_MODEL", "keyword-router");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("huddle.toml");
            fs::write(
                &path,
                r#"
[llm]
provider = "offline"
model = "${TEST_HUDDLE_MODEL}"

[guardrails]
extra_domain_keywords = ["${TEST_HUDDLE_MODEL}-tier"]
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.llm.model == "keyword-router", "model should be interpolated from env")?;
            ensure(
                config.guardrails.extra_domain_keywords == vec!["keyword-router-tier".to_string()],
                "interpolation should work inside arrays",
            )?;
            Ok(())
        })();

        clear_vars(&["TEST_HUDDLE_MODEL"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("HUDDLE_LOG_LEVEL", "warn");
        env::set_var("HUDDLE_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["HUDDLE_LOG_LEVEL", "HUDDLE_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("HUDDLE_RUNTIME_MAX_ITERATIONS", "6");
        env::set_var("HUDDLE_RUNTIME_TURN_LOCK", "reject");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("huddle.toml");
            fs::write(
                &path,
                r#"
[runtime]
max_iterations = 4
max_handoff_chain = 3
turn_timeout_secs = 15

[guardrails]
extra_domain_keywords = ["leaderboard"]

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    log_level: Some("debug".to_string()),
                    turn_timeout_secs: Some(20),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.runtime.max_iterations == 6, "env iteration limit should beat file")?;
            ensure(config.runtime.max_handoff_chain == 3, "file handoff chain should beat default")?;
            ensure(config.runtime.turn_timeout_secs == 20, "override timeout should win")?;
            ensure(config.runtime.turn_lock == TurnLockPolicy::Reject, "env lock policy applies")?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.guardrails.extra_domain_keywords == vec!["leaderboard".to_string()],
                "extra keywords should load from the file",
            )?;
            Ok(())
        })();

        clear_vars(&["HUDDLE_RUNTIME_MAX_ITERATIONS", "HUDDLE_RUNTIME_TURN_LOCK"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("HUDDLE_RUNTIME_MAX_HANDOFF_CHAIN", "0");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("runtime.max_handoff_chain")
            );
            ensure(has_message, "validation failure should mention runtime.max_handoff_chain")
        })();

        clear_vars(&["HUDDLE_RUNTIME_MAX_HANDOFF_CHAIN"]);
        result
    }

    #[test]
    fn unknown_provider_and_blank_model_are_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("HUDDLE_LLM_PROVIDER", "anthropic");
        let provider = AppConfig::load(LoadOptions::default());
        clear_vars(&["HUDDLE_LLM_PROVIDER"]);

        ensure(
            matches!(provider, Err(ConfigError::Validation(ref message)) if message.contains("anthropic")),
            "hosted providers should fail validation",
        )?;
        let blank = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                llm_model: Some("  ".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        });
        ensure(
            matches!(blank, Err(ConfigError::Validation(ref message)) if message.contains("llm.model")),
            "blank model should fail validation",
        )
    }
}
