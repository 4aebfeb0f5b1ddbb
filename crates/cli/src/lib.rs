pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use huddle_core::config::{AppConfig, LoadOptions, LogFormat};

#[derive(Debug, Parser)]
#[command(
    name = "huddle",
    about = "Huddle multi-agent conversation runtime",
    long_about = "Chat with the analytics agent catalog, inspect agents and configuration, and validate the runtime offline.",
    after_help = "Examples:\n  huddle chat\n  huddle chat -m \"show revenue for GAME-1001\" -m \"what about churn\"\n  huddle agents\n  huddle validate"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to a huddle.toml config file")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(
        about = "Run one conversation, from stdin or from --message arguments",
        long_about = "Run one conversation, from stdin or from --message arguments. Conversations live in memory and end with the process."
    )]
    Chat {
        #[arg(short, long = "message", help = "Scripted user input; repeat for several turns")]
        messages: Vec<String>,
    },
    #[command(about = "List registered agents, their tools and handoff targets")]
    Agents,
    #[command(about = "Validate config, the agent registry, and run offline routing probes")]
    Validate,
    #[command(
        about = "Inspect effective configuration values with source attribution"
    )]
    Config,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.config.clone());

    let result = match cli.command {
        Command::Chat { messages } => {
            commands::chat::run(commands::chat::ChatOptions { config_path: cli.config, messages })
        }
        Command::Agents => commands::agents::run(),
        Command::Validate => commands::validate::run(cli.config),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run(cli.config) }
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_logging(config_path: Option<PathBuf>) {
    use tracing::Level;

    // Commands report config errors themselves; fall back to defaults here.
    let config = AppConfig::load(LoadOptions { config_path, ..LoadOptions::default() })
        .unwrap_or_default();
    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(log_level)
        .with_writer(std::io::stderr);

    match config.logging.format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Json => builder.json().init(),
    }
}
