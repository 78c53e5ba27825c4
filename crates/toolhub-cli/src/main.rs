//! # toolhub-cli
//!
//! Command-line interface for Toolhub.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use toolhub_catalog::{CallerContext, DetailLevel};
use toolhub_core::Config;

mod commands;
mod hub;

/// Toolhub - one catalog over many MCP tool servers
#[derive(Parser)]
#[command(name = "toolhub")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Access token
    #[arg(long, env = "TOOLHUB_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,

    /// Project scope
    #[arg(long, env = "TOOLHUB_PROJECT", global = true)]
    project: Option<String>,

    /// Configuration file (defaults to the layered config)
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Print raw JSON responses
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn caller(&self) -> CallerContext {
        CallerContext {
            token: self.token.clone(),
            project: self.project.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Search for tools by keyword
    Discover {
        /// Keywords describing the task
        #[arg(required = true)]
        keywords: Vec<String>,
        /// Extra words about the surrounding task
        #[arg(long)]
        context: Option<String>,
        /// Maximum results
        #[arg(short = 'n', long)]
        max_results: Option<usize>,
        /// Detail level (minimal, summary, full)
        #[arg(short, long, value_parser = parse_detail)]
        detail: Option<DetailLevel>,
        /// Restrict to a category
        #[arg(long)]
        category: Option<String>,
    },
    /// Call a tool by its key
    Execute {
        /// Tool key from discover
        tool_key: String,
        /// Arguments as a JSON object
        #[arg(short, long)]
        args: Option<String>,
    },
    /// Summarize reachable servers and tools
    Capabilities {
        /// Server id or name
        #[arg(long)]
        server: Option<String>,
        /// Restrict to a category
        #[arg(long)]
        category: Option<String>,
    },
    /// Answer line-delimited JSON requests on stdin
    Serve,
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Connect every server and report its state
    Doctor,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Validate the configuration
    Validate,
}

fn parse_detail(s: &str) -> Result<DetailLevel, String> {
    serde_json::from_value(serde_json::Value::String(s.to_lowercase()))
        .map_err(|_| format!("invalid detail level '{}' (minimal, summary, full)", s))
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load_from_file(path),
        None => Config::load(),
    }?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries responses
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let caller = cli.caller();

    match cli.command {
        Commands::Config { action } => {
            let config = load_config(cli.config.as_deref())?;
            commands::config::handle(action, &config)
        }
        Commands::Doctor => {
            let config = load_config(cli.config.as_deref())?;
            commands::doctor::run(&config).await
        }
        command => {
            let config = Config::load_validated(cli.config.as_deref())
                .map_err(|e| anyhow::anyhow!(toolhub_core::error::format_error_with_suggestion(&e)))?;
            let hub = hub::Hub::start(&config).await?;

            let outcome = match command {
                Commands::Discover {
                    keywords,
                    context,
                    max_results,
                    detail,
                    category,
                } => {
                    commands::catalog::discover(&hub, &caller, keywords, context, max_results, detail, category, cli.json)
                        .await
                }
                Commands::Execute { tool_key, args } => {
                    commands::catalog::execute(&hub, &caller, tool_key, args, cli.json).await
                }
                Commands::Capabilities { server, category } => {
                    commands::catalog::capabilities(&hub, &caller, server, category, cli.json).await
                }
                Commands::Serve => commands::serve::run(&hub, &caller).await,
                Commands::Config { .. } | Commands::Doctor => Ok(ExitCode::SUCCESS),
            };

            hub.shutdown().await;
            outcome
        }
    }
}
