//! Durable Task MCP server CLI
//!
//! `serve` speaks MCP on stdin/stdout; the remaining subcommands run one
//! operation and print JSON.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use durabletask_gateway::prelude::{CancellationToken, ConnectionString};
use durabletask_mcp::{LogFormat, ServerConfig, StdioTransport, app};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "durabletask-mcp")]
#[command(about = "Durable Task Scheduler Model Context Protocol server", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to a TOML config file
    #[arg(long, env = "DURABLETASK_MCP_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the MCP server with stdio transport (default)
    Serve,

    /// List the tools the server exposes
    Tools,

    /// List schedulers and task hubs of a subscription
    ListSchedulers {
        #[arg(long)]
        subscription_id: String,
    },

    /// List orchestration instances of a task hub
    ListInstances {
        /// `Endpoint=...;TaskHub=...;Authentication=...`
        #[arg(long, env = "DURABLETASK_CONNECTION_STRING", conflicts_with_all = ["task_hub", "endpoint"])]
        connection_string: Option<String>,

        #[arg(long, requires = "endpoint")]
        task_hub: Option<String>,

        #[arg(long, requires = "task_hub")]
        endpoint: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ServerConfig::load_with_env(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    init_tracing(&config);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            tracing::info!("Starting Durable Task MCP server in stdio mode");
            let gateway = app::build_gateway(&config)?;
            let server = app::build_server(&config, gateway).await?;
            tokio::select! {
                result = server.serve(StdioTransport::stdio()) => result?,
                _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted, shutting down"),
            }
        }
        Commands::Tools => {
            let gateway = app::build_gateway(&config)?;
            let server = app::build_server(&config, gateway).await?;
            for tool in server.registry().list().await {
                println!("{:<20} {}", tool.name, tool.description.unwrap_or_default());
            }
        }
        Commands::ListSchedulers { subscription_id } => {
            let gateway = app::build_gateway(&config)?;
            let cancel = cancel_on_ctrl_c();
            let schedulers = gateway.list_schedulers(&subscription_id, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&schedulers)?);
        }
        Commands::ListInstances {
            connection_string,
            task_hub,
            endpoint,
        } => {
            let (gateway, task_hub, endpoint) = match (connection_string, task_hub, endpoint) {
                (Some(raw), _, _) => {
                    let parsed: ConnectionString = raw.parse().context("invalid connection string")?;
                    let gateway = app::build_gateway_with(&config, parsed.authentication)?;
                    (gateway, parsed.task_hub, parsed.endpoint.to_string())
                }
                (None, Some(task_hub), Some(endpoint)) => (app::build_gateway(&config)?, task_hub, endpoint),
                _ => anyhow::bail!("pass --connection-string, or both --task-hub and --endpoint"),
            };
            let cancel = cancel_on_ctrl_c();
            let instances = gateway.list_instances(&task_hub, &endpoint, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&instances)?);
        }
    }

    Ok(())
}

/// Logs go to stderr; stdout carries the protocol.
fn init_tracing(config: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    cancel
}
