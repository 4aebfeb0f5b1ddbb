use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use huddle_agent::{ConversationEngine, TurnRequest, TurnResponse};
use huddle_core::TurnFailure;
use serde_json::json;
use tracing::info;

use crate::commands::{async_runtime, build_engine, load_config, CommandResult};

#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub config_path: Option<PathBuf>,
    /// Scripted inputs. Empty means read lines from stdin.
    pub messages: Vec<String>,
}

pub fn run(options: ChatOptions) -> CommandResult {
    let config = match load_config(options.config_path.clone()) {
        Ok(config) => config,
        Err(error) => return error.into_result("chat"),
    };
    let engine = match build_engine(&config) {
        Ok(engine) => engine,
        Err(error) => return error.into_result("chat"),
    };
    let runtime = match async_runtime("chat") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    if options.messages.is_empty() {
        return runtime.block_on(interactive(&engine));
    }
    runtime.block_on(scripted(&engine, options.messages))
}

/// All scripted inputs share one conversation; the first turn creates it.
async fn scripted(engine: &ConversationEngine, messages: Vec<String>) -> CommandResult {
    let mut conversation_id = String::new();
    let mut turns = Vec::with_capacity(messages.len());

    for input in messages {
        match engine.handle_turn(TurnRequest::new(conversation_id.clone(), input)).await {
            Ok(response) => {
                conversation_id = response.conversation_id.as_str().to_owned();
                turns.push(response);
            }
            Err(failure) => return turn_failure(failure),
        }
    }

    let current_agent = turns.last().map(|turn| turn.current_agent.clone()).unwrap_or_default();
    CommandResult::success_with(
        "chat",
        format!("{} turn(s) completed", turns.len()),
        Some(json!({
            "conversation_id": conversation_id,
            "current_agent": current_agent,
            "turns": turns,
        })),
    )
}

async fn interactive(engine: &ConversationEngine) -> CommandResult {
    let mut completed = 0usize;
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    // An empty first request bootstraps the conversation and prints the greeting.
    let conversation_id = match engine.handle_turn(TurnRequest::start("")).await {
        Ok(response) => {
            print_response(&mut stdout, &response);
            response.conversation_id.as_str().to_owned()
        }
        Err(failure) => return turn_failure(failure),
    };
    info!(
        event_name = "chat.session_started",
        conversation_id = %conversation_id,
        "chat session started"
    );

    for line in stdin.lock().lines() {
        let input = match line {
            Ok(input) => input,
            Err(error) => {
                return CommandResult::failure("chat", "stdin", error.to_string(), 5);
            }
        };
        let input = input.trim();
        if input.is_empty() {
            continue;
        }
        if matches!(input, "/quit" | "/exit") {
            break;
        }

        match engine.handle_turn(TurnRequest::new(conversation_id.clone(), input)).await {
            Ok(response) => {
                completed += 1;
                print_response(&mut stdout, &response);
            }
            Err(failure) => {
                let _ = writeln!(stdout, "[error:{}] {}", failure.code.as_str(), failure.message);
            }
        }
    }

    CommandResult::success_with(
        "chat",
        format!("{completed} turn(s) completed"),
        Some(json!({ "conversation_id": conversation_id })),
    )
}

fn print_response(out: &mut impl Write, response: &TurnResponse) {
    for message in &response.messages {
        let _ = writeln!(out, "[{}] {}", message.agent, message.content);
    }
    let _ = out.flush();
}

fn turn_failure(failure: TurnFailure) -> CommandResult {
    CommandResult::failure("chat", failure.code.as_str(), failure.message, 6)
}
