use huddle_agent::catalog;
use serde_json::json;

use crate::commands::CommandResult;

pub fn run() -> CommandResult {
    let registry = match catalog::registry() {
        Ok(registry) => registry,
        Err(error) => {
            return CommandResult::failure("agents", "registry_validation", error.to_string(), 4);
        }
    };

    let summaries = registry.summaries();
    let tools = registry.tool_names().collect::<Vec<_>>();
    let message = format!(
        "{} agents, entry agent `{}`",
        summaries.len(),
        registry.entry_agent().name
    );

    CommandResult::success_with(
        "agents",
        message,
        Some(json!({
            "entry_agent": registry.entry_agent().name,
            "agents": summaries,
            "tools": tools,
        })),
    )
}
